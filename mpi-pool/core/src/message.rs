// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::communicator::{Rank, Tag};
use crate::error::TaskError;
use std::any::Any;
use std::sync::Arc;

/// 0-based position of a task in the submitted sequence
pub type TaskId = usize;

/// Tag used for messages that do not belong to a task
pub const CONTROL_TAG: Tag = 0;

/// Type-erased task argument or result as it travels between ranks
pub type Payload = Box<dyn Any + Send>;

/// Function applied by workers to every task
/// Identity (`Arc::ptr_eq`) decides whether workers need to be updated
pub type TaskFn<T, R> = Arc<dyn Fn(T) -> Result<R, TaskError> + Send + Sync>;

/// Wraps a closure into a [`TaskFn`]
pub fn task_fn<T, R, F>(f: F) -> TaskFn<T, R>
where
    F: Fn(T) -> Result<R, TaskError> + Send + Sync + 'static,
{
    Arc::new(f)
}

type ErasedFn = dyn Fn(Payload) -> Result<Payload, TaskError> + Send + Sync;

/// Task function as installed on a worker
#[derive(Clone)]
pub struct WorkerFunction {
    inner: Arc<ErasedFn>,
}

impl WorkerFunction {
    pub fn erase<T, R>(f: TaskFn<T, R>) -> Self
    where
        T: Send + 'static,
        R: Send + 'static,
    {
        let inner = move |payload: Payload| -> Result<Payload, TaskError> {
            let task = payload.downcast::<T>().map_err(|_| {
                format!(
                    "task payload is not a {}",
                    std::any::type_name::<T>()
                )
            })?;
            let result = f(*task)?;
            Ok(Box::new(result) as Payload)
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn call(&self, payload: Payload) -> Result<Payload, TaskError> {
        (self.inner)(payload)
    }
}

impl std::fmt::Debug for WorkerFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WorkerFunction({:p})", Arc::as_ptr(&self.inner))
    }
}

/// Message types exchanged between the master and its workers
pub enum Message {
    /// Replaces the function the receiving worker applies to tasks
    FunctionUpdate(WorkerFunction),
    /// Task argument; the tag carries its TaskId
    Task(Payload),
    /// Poison pill telling the worker to leave its loop
    Close,
    /// Result of a task, sent back to the master with the task's tag
    Reply(Payload),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::FunctionUpdate(_) => "function-update",
            Message::Task(_) => "task",
            Message::Close => "close",
            Message::Reply(_) => "reply",
        }
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::FunctionUpdate(func) => write!(f, "FunctionUpdate({:?})", func),
            _ => write!(f, "{}", self.kind()),
        }
    }
}

/// A reply matched to the task that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRecord<R> {
    pub task_id: TaskId,
    pub value: R,
    pub source: Rank,
}
