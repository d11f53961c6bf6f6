// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::error::PoolError;
use std::ops::Range;

/// Splits `n_tasks` indices into contiguous ranges, one per batch
///
/// Batch sizes differ by at most one and earlier batches take the remainder.
/// When there are fewer tasks than batches, every task gets its own batch.
pub fn batch_ranges(n_batches: usize, n_tasks: usize) -> Result<Vec<Range<usize>>, PoolError> {
    if n_batches == 0 || n_tasks == 0 {
        return Err(PoolError::InvalidBatch { n_batches, n_tasks });
    }

    let n_batches = n_batches.min(n_tasks);
    let base_size = n_tasks / n_batches;
    let remainder = n_tasks % n_batches;

    let mut start = 0;
    let ranges = (0..n_batches)
        .map(|i| {
            let size = if i < remainder { base_size + 1 } else { base_size };
            let range = start..start + size;
            start += size;
            range
        })
        .collect();
    Ok(ranges)
}

/// Moves `tasks` into contiguous batches sized by [`batch_ranges`]
pub fn batch_tasks<T>(n_batches: usize, tasks: Vec<T>) -> Result<Vec<Vec<T>>, PoolError> {
    let ranges = batch_ranges(n_batches, tasks.len())?;
    let mut tasks = tasks.into_iter();
    Ok(ranges
        .into_iter()
        .map(|range| tasks.by_ref().take(range.len()).collect())
        .collect())
}
