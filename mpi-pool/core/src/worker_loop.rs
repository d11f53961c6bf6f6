// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::communicator::{Communicator, Rank, Source, TagSelector, MASTER_RANK};
use crate::error::PoolError;
use crate::message::{Message, TaskId, WorkerFunction};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Blocked on receive
    Idle,
    /// Running the installed function on a task
    Executing { task_id: TaskId },
    /// Close received, the loop is over
    Closed,
}

/// Receive / execute / reply cycle of a worker rank
pub struct WorkerLoop<'a, C> {
    comm: &'a mut C,
    rank: Rank,
    function: Option<WorkerFunction>,
    state: WorkerState,
    tasks_completed: usize,
}

impl<'a, C: Communicator<Message>> WorkerLoop<'a, C> {
    /// Entering the loop from the master rank is a programming error
    pub fn new(comm: &'a mut C) -> Result<Self, PoolError> {
        let rank = comm.rank();
        if rank == MASTER_RANK {
            return Err(PoolError::ProtocolMisuse(
                "the worker loop cannot run on the master rank".to_string(),
            ));
        }
        Ok(Self {
            comm,
            rank,
            function: None,
            state: WorkerState::Idle,
            tasks_completed: 0,
        })
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Serves the master until a close message arrives
    /// Returns the number of tasks this worker completed
    pub async fn run(&mut self) -> Result<usize, PoolError> {
        while self.state != WorkerState::Closed {
            trace!("Worker {} waiting for task", self.rank);
            let (message, status) = self
                .comm
                .recv(Source::Rank(MASTER_RANK), TagSelector::Any)
                .await?;
            self.handle(message, status.tag)?;
        }
        Ok(self.tasks_completed)
    }

    fn handle(&mut self, message: Message, tag: TaskId) -> Result<(), PoolError> {
        match message {
            Message::FunctionUpdate(function) => {
                debug!("Worker {} installed {:?}", self.rank, function);
                self.function = Some(function);
            }
            Message::Task(payload) => {
                self.state = WorkerState::Executing { task_id: tag };
                let function = self.function.as_ref().ok_or_else(|| {
                    PoolError::ProtocolMisuse(format!(
                        "worker {} received task {} before any function",
                        self.rank, tag
                    ))
                })?;
                trace!("Worker {} got task with tag {}", self.rank, tag);

                let value = match catch_unwind(AssertUnwindSafe(|| function.call(payload))) {
                    Ok(Ok(value)) => value,
                    Ok(Err(e)) => return Err(self.execution_error(tag, e.to_string())),
                    Err(panic) => return Err(self.execution_error(tag, panic_message(&*panic))),
                };

                trace!("Worker {} sending answer with tag {}", self.rank, tag);
                self.comm.send(Message::Reply(value), MASTER_RANK, tag)?;
                self.tasks_completed += 1;
                self.state = WorkerState::Idle;
            }
            Message::Close => {
                debug!("Worker {} told to quit work", self.rank);
                self.state = WorkerState::Closed;
            }
            Message::Reply(_) => {
                return Err(PoolError::ProtocolMisuse(format!(
                    "worker {} received a reply with tag {}",
                    self.rank, tag
                )));
            }
        }
        Ok(())
    }

    fn execution_error(&self, task_id: TaskId, message: String) -> PoolError {
        PoolError::WorkerExecution {
            rank: self.rank,
            task_id,
            message,
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}
