// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::communicator::{ChannelError, Rank};
use crate::message::TaskId;

/// Error returned by a task function
pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The group is too small to hold a master and at least one worker
    Configuration { size: usize },

    /// The task function failed on a worker; the whole group is aborted
    WorkerExecution {
        rank: Rank,
        task_id: TaskId,
        message: String,
    },

    /// Transport failure while sending or receiving
    Channel(ChannelError),

    /// The pool was driven in a way its protocol does not allow
    ProtocolMisuse(String),

    /// Batching asked for zero batches or was given zero tasks
    InvalidBatch { n_batches: usize, n_tasks: usize },
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::Configuration { size } => write!(
                f,
                "Tried to create a pool, but there was only {} process available. Need at least two",
                size
            ),
            PoolError::WorkerExecution {
                rank,
                task_id,
                message,
            } => write!(
                f,
                "Worker {} failed on task {}: {}",
                rank, task_id, message
            ),
            PoolError::Channel(e) => write!(f, "Channel error: {}", e),
            PoolError::ProtocolMisuse(msg) => write!(f, "Protocol misuse: {}", msg),
            PoolError::InvalidBatch { n_batches, n_tasks } => write!(
                f,
                "Cannot split {} tasks into {} batches, both must be > 0",
                n_tasks, n_batches
            ),
        }
    }
}

impl std::error::Error for PoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PoolError::Channel(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ChannelError> for PoolError {
    fn from(e: ChannelError) -> Self {
        PoolError::Channel(e)
    }
}
