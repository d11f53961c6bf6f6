// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::communicator::{Communicator, Rank};
use crate::error::PoolError;
use crate::message::{Message, TaskFn, WorkerFunction, CONTROL_TAG};
use std::any::Any;
use std::sync::Arc;
use tracing::debug;

/// Master-side record of the function installed on the workers
/// Pushes a new function only when the requested one is a different `Arc`
#[derive(Default)]
pub struct FunctionDistributor {
    installed: Option<Box<dyn Any + Send + Sync>>,
    broadcasts: usize,
}

impl FunctionDistributor {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when `function` is the very `Arc` last pushed to the workers
    pub fn is_installed<T: 'static, R: 'static>(&self, function: &TaskFn<T, R>) -> bool {
        self.installed
            .as_ref()
            .and_then(|installed| installed.downcast_ref::<TaskFn<T, R>>())
            .is_some_and(|installed| Arc::ptr_eq(installed, function))
    }

    /// Number of broadcasts performed so far
    pub fn broadcasts(&self) -> usize {
        self.broadcasts
    }

    /// Makes sure every worker runs `function`
    /// Returns true when a broadcast was needed
    pub fn ensure_installed<C, T, R>(
        &mut self,
        comm: &C,
        workers: &[Rank],
        function: &TaskFn<T, R>,
    ) -> Result<bool, PoolError>
    where
        C: Communicator<Message>,
        T: Send + 'static,
        R: Send + 'static,
    {
        if self.is_installed(function) {
            return Ok(false);
        }

        let erased = WorkerFunction::erase(function.clone());
        debug!("Broadcasting {:?} to {} workers", erased, workers.len());
        for &worker in workers {
            comm.send(
                Message::FunctionUpdate(erased.clone()),
                worker,
                CONTROL_TAG,
            )?;
        }

        self.installed = Some(Box::new(function.clone()));
        self.broadcasts += 1;
        Ok(true)
    }
}
