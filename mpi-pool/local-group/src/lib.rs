// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

mod local_communicator;
pub use local_communicator::LocalCommunicator;

mod local_group;
pub use local_group::{LocalGroup, PANIC_ABORT_CODE};

mod group_error;
pub use group_error::GroupError;
