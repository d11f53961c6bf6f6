// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::communicator::Communicator;
use crate::dispatcher::MapOptions;
use crate::error::PoolError;
use crate::message::{Message, TaskFn};
use crate::pool::{MpiPool, Role};
use crate::serial_pool::SerialPool;
use crate::task_pool::TaskPool;
use async_trait::async_trait;
use tracing::info;

/// Whichever pool `choose_pool` settled on
pub enum AnyPool<C: Communicator<Message>> {
    Mpi(MpiPool<C>),
    Serial(SerialPool),
}

impl<C: Communicator<Message>> AnyPool<C> {
    pub fn is_serial(&self) -> bool {
        matches!(self, AnyPool::Serial(_))
    }
}

/// Picks a pool from the command line: the message-passing one when a
/// communicator is given, a serial one otherwise
///
/// Asking for a message-passing pool in a group without workers is a
/// configuration error. On ranks other than the master this serves tasks
/// until the pool is closed and returns `Role::Worker`.
pub async fn choose_pool<C: Communicator<Message>>(
    comm: Option<C>,
) -> Result<Role<AnyPool<C>>, PoolError> {
    let Some(comm) = comm else {
        info!("Running serial");
        return Ok(Role::Master(AnyPool::Serial(SerialPool::new())));
    };

    if !MpiPool::is_enabled(&comm) {
        return Err(PoolError::Configuration { size: comm.size() });
    }

    Ok(match MpiPool::new(comm).await? {
        Role::Master(pool) => {
            info!("Running with MPI on {} workers", pool.size());
            Role::Master(AnyPool::Mpi(pool))
        }
        Role::Worker(exit) => Role::Worker(exit),
    })
}

#[async_trait]
impl<C: Communicator<Message>> TaskPool for AnyPool<C> {
    fn size(&self) -> usize {
        match self {
            AnyPool::Mpi(pool) => pool.size(),
            AnyPool::Serial(pool) => pool.size(),
        }
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
        match self {
            AnyPool::Mpi(pool) => pool.map_with(function, tasks, options, callback).await,
            AnyPool::Serial(pool) => pool.map_with(function, tasks, options, callback).await,
        }
    }

    fn close(&mut self) {
        match self {
            AnyPool::Mpi(pool) => pool.close(),
            AnyPool::Serial(pool) => pool.close(),
        }
    }
}
