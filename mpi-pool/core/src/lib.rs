// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

mod communicator;
pub use communicator::{
    ChannelError, Communicator, Rank, Source, Status, Tag, TagSelector, MASTER_RANK,
};

mod error;
pub use error::{PoolError, TaskError};

mod message;
pub use message::{
    task_fn, Message, Payload, ResultRecord, TaskFn, TaskId, WorkerFunction, CONTROL_TAG,
};

mod worker_loop;
pub use worker_loop::{WorkerLoop, WorkerState};

mod function_distribution;
pub use function_distribution::FunctionDistributor;

mod dispatcher;
pub use dispatcher::{DispatchPolicy, Dispatcher, InFlight, MapOptions};

pub mod batch;
pub use batch::{batch_ranges, batch_tasks};

mod task_pool;
pub use task_pool::TaskPool;

mod pool;
pub use pool::{with_pool, MpiPool, Role, WorkerExit};

mod serial_pool;
pub use serial_pool::SerialPool;

mod any_pool;
pub use any_pool::{choose_pool, AnyPool};

#[cfg(test)]
mod scripted_communicator;
