// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::communicator::MASTER_RANK;
use crate::dispatcher::MapOptions;
use crate::error::PoolError;
use crate::message::TaskFn;
use crate::task_pool::TaskPool;
use async_trait::async_trait;

/// Pool that applies the function to each task in turn on the calling task
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialPool;

impl SerialPool {
    pub fn new() -> Self {
        Self
    }

    pub fn is_enabled() -> bool {
        true
    }

    pub fn run<T, R, F>(
        &mut self,
        function: &TaskFn<T, R>,
        tasks: Vec<T>,
        options: MapOptions,
        mut callback: F,
    ) -> Result<Option<Vec<R>>, PoolError>
    where
        F: FnMut(&R),
    {
        let mut results = Vec::with_capacity(if options.return_results { tasks.len() } else { 0 });
        for (task_id, task) in tasks.into_iter().enumerate() {
            let value = function(task).map_err(|e| PoolError::WorkerExecution {
                rank: MASTER_RANK,
                task_id,
                message: e.to_string(),
            })?;
            callback(&value);
            if options.return_results {
                results.push(value);
            }
        }
        Ok(options.return_results.then_some(results))
    }
}

#[async_trait]
impl TaskPool for SerialPool {
    fn size(&self) -> usize {
        0
    }

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
        F: FnMut(&R) + Send,
    {
        self.run(function, tasks, options, callback)
    }

    fn close(&mut self) {}
}
