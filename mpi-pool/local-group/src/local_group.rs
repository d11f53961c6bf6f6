// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::group_error::GroupError;
use crate::local_communicator::{AbortSignal, LocalCommunicator};
use futures::FutureExt;
use mpi_pool_core::Rank;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tracing::{debug, error};

/// Code a group is aborted with when one of its ranks panics
pub const PANIC_ABORT_CODE: i32 = 101;

/// Fixed-size group of ranks running as tokio tasks in this process
pub struct LocalGroup;

impl LocalGroup {
    /// Connected communicators for ranks `0..size`, indexed by rank
    pub fn communicators<M: Send + 'static>(size: usize) -> Vec<LocalCommunicator<M>> {
        LocalCommunicator::group(size, AbortSignal::default())
    }

    /// Runs `program` once per rank, each on its own tokio task, and returns
    /// the outputs indexed by rank
    ///
    /// A panicking rank aborts the group so no peer waits on it forever.
    pub async fn run<M, O, F, Fut>(size: usize, program: F) -> Result<Vec<O>, GroupError>
    where
        M: Send + 'static,
        O: Send + 'static,
        F: Fn(LocalCommunicator<M>) -> Fut,
        Fut: Future<Output = O> + Send + 'static,
    {
        let abort = AbortSignal::default();
        debug!("Starting local group of {} ranks", size);

        let handles: Vec<_> = LocalCommunicator::group(size, abort.clone())
            .into_iter()
            .enumerate()
            .map(|(rank, comm)| {
                let rank_program = AssertUnwindSafe(program(comm)).catch_unwind();
                let abort = abort.clone();
                tokio::spawn(async move {
                    rank_program.await.map_err(|_| {
                        error!("Rank {} panicked, aborting the group", rank);
                        abort.abort(PANIC_ABORT_CODE);
                        rank
                    })
                })
            })
            .collect();

        let mut outputs = Vec::with_capacity(size);
        let mut panicked: Option<Rank> = None;
        for (rank, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(Ok(output)) => outputs.push(output),
                _ => {
                    panicked.get_or_insert(rank);
                }
            }
        }

        if let Some(rank) = panicked {
            return Err(GroupError::RankPanicked { rank });
        }
        if let Some(code) = abort.code() {
            return Err(GroupError::Aborted { code });
        }
        Ok(outputs)
    }
}
