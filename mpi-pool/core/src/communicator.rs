// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use async_trait::async_trait;

/// Identity of a process within a fixed-size group
pub type Rank = usize;

/// Integer attached to every message; carries the TaskId for tasks and replies
pub type Tag = usize;

/// Rank 0 is the master by convention
pub const MASTER_RANK: Rank = 0;

/// Which sender a receive or probe accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Any,
    Rank(Rank),
}

impl Source {
    pub fn matches(&self, rank: Rank) -> bool {
        match self {
            Source::Any => true,
            Source::Rank(r) => *r == rank,
        }
    }
}

/// Which tag a receive or probe accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagSelector {
    Any,
    Tag(Tag),
}

impl TagSelector {
    pub fn matches(&self, tag: Tag) -> bool {
        match self {
            TagSelector::Any => true,
            TagSelector::Tag(t) => *t == tag,
        }
    }
}

/// Envelope metadata of a received or probed message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub source: Rank,
    pub tag: Tag,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The group was aborted by one of its members
    Aborted { code: i32 },

    /// Destination outside of the group
    InvalidRank { rank: Rank, size: usize },

    /// The peer is gone and can no longer receive
    Disconnected { rank: Rank },
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::Aborted { code } => write!(f, "Group aborted with code {}", code),
            ChannelError::InvalidRank { rank, size } => {
                write!(f, "Rank {} is outside of a group of size {}", rank, size)
            }
            ChannelError::Disconnected { rank } => write!(f, "Rank {} is disconnected", rank),
        }
    }
}

impl std::error::Error for ChannelError {}

/// Trait for abstracting the rank-addressed message passing the pool runs on
/// Different implementations for in-process groups, MPI bindings, sockets, etc.
///
/// Messages between two fixed endpoints must be delivered in send order.
#[async_trait]
pub trait Communicator<M: Send + 'static>: Send {
    /// Rank of the calling process
    fn rank(&self) -> Rank;

    /// Number of processes in the group, master included
    fn size(&self) -> usize;

    /// Queue a message for `dest`
    /// Returns once the message sits in the destination's ordered queue
    fn send(&self, message: M, dest: Rank, tag: Tag) -> Result<(), ChannelError>;

    /// Block until a matching message arrives and take it
    async fn recv(&mut self, source: Source, tag: TagSelector)
        -> Result<(M, Status), ChannelError>;

    /// Check for a matching message without blocking or consuming it
    fn try_probe(&mut self, source: Source, tag: TagSelector)
        -> Result<Option<Status>, ChannelError>;

    /// Block until a matching message is ready, without consuming it
    async fn probe(&mut self, source: Source, tag: TagSelector) -> Result<Status, ChannelError>;

    /// Terminate every process of the group
    fn abort(&self, error_code: i32);
}
