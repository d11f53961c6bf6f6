// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::batch::batch_tasks;
use crate::dispatcher::MapOptions;
use crate::error::PoolError;
use crate::message::TaskFn;
use async_trait::async_trait;

/// Trait for the pools a caller can hand its tasks to
/// Different implementations for message-passing groups and local serial runs
#[async_trait]
pub trait TaskPool: Send {
    /// Number of workers tasks are spread across
    fn size(&self) -> usize;

    /// Applies `function` to every task, calling `callback` with each result
    /// on the calling side; results come back in task order
    async fn map_with<T, R, F>(
        &mut self,
        function: &TaskFn<T, R>,
        tasks: Vec<T>,
        options: MapOptions,
        callback: F,
    ) -> Result<Option<Vec<R>>, PoolError>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: FnMut(&R) + Send;

    /// Tell all the workers to quit
    fn close(&mut self);

    async fn map<T, R>(&mut self, function: &TaskFn<T, R>, tasks: Vec<T>) -> Result<Vec<R>, PoolError>
    where
        T: Send + 'static,
        R: Send + 'static,
    {
        let results = self
            .map_with(function, tasks, MapOptions::default(), |_: &R| {})
            .await?;
        Ok(results.unwrap_or_default())
    }

    /// Sends one contiguous batch of tasks per worker instead of one task at a time
    async fn batched_map<T, R>(
        &mut self,
        function: &TaskFn<Vec<T>, R>,
        tasks: Vec<T>,
    ) -> Result<Vec<R>, PoolError>
    where
        T: Send + 'static,
        R: Send + 'static,
    {
        let results = self
            .batched_map_with(function, tasks, MapOptions::default(), |_: &R| {})
            .await?;
        Ok(results.unwrap_or_default())
    }

    /// `batched_map` with the options and callback of `map_with`
    ///
    /// An empty input sends nothing. A pool without workers runs one batch.
    async fn batched_map_with<T, R, F>(
        &mut self,
        function: &TaskFn<Vec<T>, R>,
        tasks: Vec<T>,
        options: MapOptions,
        callback: F,
    ) -> Result<Option<Vec<R>>, PoolError>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: FnMut(&R) + Send,
    {
        if tasks.is_empty() {
            return Ok(options.return_results.then(Vec::new));
        }
        let batches = batch_tasks(self.size().max(1), tasks)?;
        self.map_with(function, batches, options, callback).await
    }
}
