// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use mpi_pool_core::Rank;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupError {
    /// A rank aborted the group
    Aborted { code: i32 },

    /// A rank's program panicked
    RankPanicked { rank: Rank },
}

impl std::fmt::Display for GroupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GroupError::Aborted { code } => write!(f, "Group aborted with code {}", code),
            GroupError::RankPanicked { rank } => write!(f, "Rank {} panicked", rank),
        }
    }
}

impl std::error::Error for GroupError {}
