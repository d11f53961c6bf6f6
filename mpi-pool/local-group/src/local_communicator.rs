// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use async_trait::async_trait;
use mpi_pool_core::{ChannelError, Communicator, Rank, Source, Status, Tag, TagSelector};
use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

type Envelope<M> = (M, Status);

/// Group-wide abort flag with the code of the first abort
#[derive(Clone, Default)]
pub(crate) struct AbortSignal {
    token: CancellationToken,
    code: Arc<OnceLock<i32>>,
}

impl AbortSignal {
    pub(crate) fn abort(&self, code: i32) {
        let _ = self.code.set(code);
        self.token.cancel();
    }

    pub(crate) fn code(&self) -> Option<i32> {
        if self.token.is_cancelled() {
            self.code.get().copied()
        } else {
            None
        }
    }

    fn check(&self) -> Result<(), ChannelError> {
        match self.code() {
            Some(code) => Err(ChannelError::Aborted { code }),
            None => Ok(()),
        }
    }

    fn error(&self) -> ChannelError {
        ChannelError::Aborted {
            code: self.code().unwrap_or(1),
        }
    }
}

/// One rank of an in-process group
///
/// Every rank owns an unbounded mailbox; messages between two ranks arrive in
/// send order. Messages that do not match a receive wait in `pending` until
/// one does.
pub struct LocalCommunicator<M> {
    rank: Rank,
    mailboxes: Arc<Vec<mpsc::UnboundedSender<Envelope<M>>>>,
    inbox: mpsc::UnboundedReceiver<Envelope<M>>,
    pending: VecDeque<Envelope<M>>,
    abort: AbortSignal,
}

impl<M: Send + 'static> LocalCommunicator<M> {
    /// Wires `size` ranks to each other
    pub(crate) fn group(size: usize, abort: AbortSignal) -> Vec<Self> {
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..size).map(|_| mpsc::unbounded_channel()).unzip();
        let mailboxes = Arc::new(senders);

        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| Self {
                rank,
                mailboxes: mailboxes.clone(),
                inbox,
                pending: VecDeque::new(),
                abort: abort.clone(),
            })
            .collect()
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.code().is_some()
    }

    /// Moves everything already delivered into `pending`
    fn drain_inbox(&mut self) {
        while let Ok(envelope) = self.inbox.try_recv() {
            self.pending.push_back(envelope);
        }
    }

    fn take_pending(&mut self, source: Source, tag: TagSelector) -> Option<Envelope<M>> {
        let index = self.find_pending(source, tag)?;
        self.pending.remove(index)
    }

    fn find_pending(&self, source: Source, tag: TagSelector) -> Option<usize> {
        self.pending
            .iter()
            .position(|(_, status)| source.matches(status.source) && tag.matches(status.tag))
    }

    /// Waits for the next delivery, or the group abort
    async fn next_delivery(&mut self) -> Result<Envelope<M>, ChannelError> {
        tokio::select! {
            biased;
            _ = self.abort.token.cancelled() => Err(self.abort.error()),
            envelope = self.inbox.recv() => {
                envelope.ok_or(ChannelError::Disconnected { rank: self.rank })
            }
        }
    }
}

#[async_trait]
impl<M: Send + 'static> Communicator<M> for LocalCommunicator<M> {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.mailboxes.len()
    }

    fn send(&self, message: M, dest: Rank, tag: Tag) -> Result<(), ChannelError> {
        self.abort.check()?;
        let mailbox = self.mailboxes.get(dest).ok_or(ChannelError::InvalidRank {
            rank: dest,
            size: self.mailboxes.len(),
        })?;

        let status = Status {
            source: self.rank,
            tag,
        };
        mailbox
            .send((message, status))
            .map_err(|_| ChannelError::Disconnected { rank: dest })?;
        trace!("Rank {} sent tag {} to rank {}", self.rank, tag, dest);
        Ok(())
    }

    async fn recv(
        &mut self,
        source: Source,
        tag: TagSelector,
    ) -> Result<(M, Status), ChannelError> {
        self.abort.check()?;
        if let Some(envelope) = self.take_pending(source, tag) {
            return Ok(envelope);
        }

        loop {
            let envelope = self.next_delivery().await?;
            if source.matches(envelope.1.source) && tag.matches(envelope.1.tag) {
                return Ok(envelope);
            }
            self.pending.push_back(envelope);
        }
    }

    fn try_probe(
        &mut self,
        source: Source,
        tag: TagSelector,
    ) -> Result<Option<Status>, ChannelError> {
        self.abort.check()?;
        self.drain_inbox();
        Ok(self
            .find_pending(source, tag)
            .map(|index| self.pending[index].1))
    }

    async fn probe(&mut self, source: Source, tag: TagSelector) -> Result<Status, ChannelError> {
        self.abort.check()?;
        loop {
            if let Some(index) = self.find_pending(source, tag) {
                return Ok(self.pending[index].1);
            }
            let envelope = self.next_delivery().await?;
            self.pending.push_back(envelope);
        }
    }

    fn abort(&self, error_code: i32) {
        warn!("Rank {} aborting the group with code {}", self.rank, error_code);
        self.abort.abort(error_code);
    }
}
