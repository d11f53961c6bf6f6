// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::communicator::{ChannelError, Communicator, Rank, MASTER_RANK};
use crate::dispatcher::{Dispatcher, InFlight, MapOptions};
use crate::error::PoolError;
use crate::function_distribution::FunctionDistributor;
use crate::message::{Message, TaskFn, CONTROL_TAG};
use crate::task_pool::TaskPool;
use crate::worker_loop::WorkerLoop;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::io::Write;
use tracing::{debug, error, warn};

/// What a process became when the pool was built
#[derive(Debug)]
pub enum Role<M> {
    /// Rank 0, holding the pool
    Master(M),
    /// Any other rank, once the master closed it
    Worker(WorkerExit),
}

impl<M> Role<M> {
    pub fn is_master(&self) -> bool {
        matches!(self, Role::Master(_))
    }

    pub fn into_master(self) -> Option<M> {
        match self {
            Role::Master(master) => Some(master),
            Role::Worker(_) => None,
        }
    }
}

/// How a worker rank left its loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    pub rank: Rank,
    pub tasks_completed: usize,
}

/// Master side of a group where rank 0 hands tasks to every other rank
///
/// Dropping the pool closes it. A `map` future may be dropped before it
/// completes; its outstanding replies are drained by the next call.
pub struct MpiPool<C: Communicator<Message>> {
    comm: C,
    workers: Vec<Rank>,
    distributor: FunctionDistributor,
    in_flight: InFlight,
    closed: bool,
}

impl<C: Communicator<Message>> MpiPool<C> {
    /// A pool needs at least one worker besides the master
    pub fn is_enabled(comm: &C) -> bool {
        comm.size() > 1
    }

    /// Builds the pool on the master; on every other rank serves tasks until
    /// closed and reports how the worker exited
    ///
    /// A worker whose task fails aborts the whole group.
    pub async fn new(mut comm: C) -> Result<Role<Self>, PoolError> {
        let size = comm.size();
        if size < 2 {
            return Err(PoolError::Configuration { size });
        }

        if comm.rank() != MASTER_RANK {
            return serve(&mut comm).await.map(Role::Worker);
        }

        let workers: Vec<Rank> = (0..size).filter(|&rank| rank != MASTER_RANK).collect();
        debug!("MPI pool ready on {} workers", workers.len());
        Ok(Role::Master(Self {
            comm,
            workers,
            distributor: FunctionDistributor::new(),
            in_flight: InFlight::new(),
            closed: false,
        }))
    }

    pub fn rank(&self) -> Rank {
        self.comm.rank()
    }

    pub fn workers(&self) -> &[Rank] {
        &self.workers
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Number of times a new function had to be pushed to the workers
    pub fn function_broadcasts(&self) -> usize {
        self.distributor.broadcasts()
    }

    /// Tasks sent by a `map` that was dropped before its replies came back
    ///
    /// The next `map` waits for and discards those replies before sending
    /// anything.
    pub fn unfinished_tasks(&self) -> usize {
        self.in_flight.len()
    }
}

impl<C: Communicator<Message>> Drop for MpiPool<C> {
    fn drop(&mut self) {
        self.close();
    }
}

/// `map`, `batched_map` and their `_with` variants come from `TaskPool`
#[async_trait]
impl<C: Communicator<Message>> TaskPool for MpiPool<C> {
    /// Number of workers
    fn size(&self) -> usize {
        self.workers.len()
    }

    /// Evaluates `function` on every task across the workers
    ///
    /// `callback` runs on the master as each result arrives. Results come back
    /// in task order, or `None` when `options.return_results` is false.
    async fn map_with<T, R, F>(
        &mut self,
        function: &TaskFn<T, R>,
        tasks: Vec<T>,
        options: MapOptions,
        mut callback: F,
    ) -> Result<Option<Vec<R>>, PoolError>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: FnMut(&R) + Send,
    {
        if self.closed {
            return Err(PoolError::ProtocolMisuse("pool is closed".to_string()));
        }

        self.distributor
            .ensure_installed(&self.comm, &self.workers, function)?;
        Dispatcher::new(&mut self.comm, &self.workers)
            .run(&mut self.in_flight, tasks, options, &mut callback)
            .await
    }

    /// Tell all the workers to quit
    ///
    /// Safe to call more than once. A worker that cannot be reached is
    /// logged and skipped.
    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if !self.in_flight.is_empty() {
            warn!(
                "Closing with {} tasks of an interrupted map still running",
                self.in_flight.len()
            );
        }
        for &worker in &self.workers {
            if let Err(e) = self.comm.send(Message::Close, worker, CONTROL_TAG) {
                warn!("Could not close worker {}: {}", worker, e);
            }
        }
        debug!("Closed {} workers", self.workers.len());
    }
}

/// Runs the worker loop of a non-master rank
async fn serve<C: Communicator<Message>>(comm: &mut C) -> Result<WorkerExit, PoolError> {
    let rank = comm.rank();
    let outcome = match WorkerLoop::new(&mut *comm) {
        Ok(mut worker) => worker.run().await,
        Err(e) => Err(e),
    };

    match outcome {
        Ok(tasks_completed) => Ok(WorkerExit {
            rank,
            tasks_completed,
        }),
        Err(PoolError::Channel(ChannelError::Aborted { code })) => {
            debug!("Worker {} stopping, group aborted with code {}", rank, code);
            Err(PoolError::Channel(ChannelError::Aborted { code }))
        }
        Err(PoolError::Channel(ChannelError::Disconnected { rank: MASTER_RANK })) => {
            warn!("Worker {} stopping, the master is gone", rank);
            Err(PoolError::Channel(ChannelError::Disconnected { rank: MASTER_RANK }))
        }
        Err(e) => {
            error!("Worker {} failed, aborting the group: {}", rank, e);
            let _ = std::io::stdout().flush();
            let _ = std::io::stderr().flush();
            comm.abort(1);
            Err(e)
        }
    }
}

/// Builds a pool, runs `program` with it on the master and closes it on
/// every exit path
///
/// Workers serve until closed and return `Role::Worker`.
pub async fn with_pool<C, O, F>(comm: C, program: F) -> Result<Role<O>, PoolError>
where
    C: Communicator<Message>,
    F: for<'p> FnOnce(&'p mut MpiPool<C>) -> BoxFuture<'p, Result<O, PoolError>>,
{
    match MpiPool::new(comm).await? {
        Role::Worker(exit) => Ok(Role::Worker(exit)),
        Role::Master(mut pool) => {
            let outcome = program(&mut pool).await;
            pool.close();
            outcome.map(Role::Master)
        }
    }
}
