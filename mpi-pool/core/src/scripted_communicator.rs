// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::communicator::{
    ChannelError, Communicator, Rank, Source, Status, Tag, TagSelector, MASTER_RANK,
};
use crate::message::Message;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

/// Replays a fixed inbox and records everything sent
///
/// On the master side it can also stand in for slow workers: tasks complete
/// in the order given to `completing`, each reply carrying its own tag as a
/// `usize`. Completions only show up to the blocking calls, never to the
/// non-blocking one, and only once the task was actually sent. When
/// `stalling`, a blocking call with nothing to deliver never returns instead
/// of failing.
pub(crate) struct ScriptedCommunicator {
    rank: Rank,
    size: usize,
    inbox: VecDeque<(Message, Status)>,
    completions: VecDeque<Tag>,
    sent: Mutex<Vec<(Message, Rank, Tag)>>,
    unreachable: Vec<Rank>,
    aborted: Mutex<Option<i32>>,
    in_flight: Mutex<(usize, usize)>,
    stalling: bool,
}

impl ScriptedCommunicator {
    /// Master rank of a group of `size` with nothing to receive
    pub(crate) fn master(size: usize) -> Self {
        Self {
            rank: MASTER_RANK,
            size,
            inbox: VecDeque::new(),
            completions: VecDeque::new(),
            sent: Mutex::new(Vec::new()),
            unreachable: Vec::new(),
            aborted: Mutex::new(None),
            in_flight: Mutex::new((0, 0)),
            stalling: false,
        }
    }

    /// Worker `rank` that will receive `inbox` from the master, in order
    pub(crate) fn from_master(rank: Rank, inbox: Vec<(Message, Tag)>) -> Self {
        let inbox = inbox
            .into_iter()
            .map(|(m, tag)| {
                (
                    m,
                    Status {
                        source: MASTER_RANK,
                        tag,
                    },
                )
            })
            .collect();
        Self {
            rank,
            size: rank + 1,
            inbox,
            ..Self::master(2)
        }
    }

    /// Tasks finish in this order of tags
    pub(crate) fn completing(mut self, order: &[Tag]) -> Self {
        self.completions = order.iter().copied().collect();
        self
    }

    /// More tasks finish, after the ones already scripted
    pub(crate) fn complete(&mut self, order: &[Tag]) {
        self.completions.extend(order.iter().copied());
    }

    pub(crate) fn stalling(mut self) -> Self {
        self.stalling = true;
        self
    }

    /// Messages already waiting for the master, as if sent by `status.source`
    pub(crate) fn with_waiting(mut self, messages: Vec<(Message, Status)>) -> Self {
        self.inbox.extend(messages);
        self
    }

    /// Sends to these ranks fail as if the peer had exited
    pub(crate) fn with_unreachable(mut self, ranks: &[Rank]) -> Self {
        self.unreachable = ranks.to_vec();
        self
    }

    pub(crate) fn sent(&self) -> MutexGuard<'_, Vec<(Message, Rank, Tag)>> {
        self.sent.lock().unwrap()
    }

    /// (message kind, destination) of every send, in order
    pub(crate) fn sent_kinds(&self) -> Vec<(&'static str, Rank)> {
        self.sent()
            .iter()
            .map(|(m, dest, _)| (m.kind(), *dest))
            .collect()
    }

    /// (destination, tag) of every task sent, in order
    pub(crate) fn sent_tasks(&self) -> Vec<(Rank, Tag)> {
        self.sent()
            .iter()
            .filter(|(m, _, _)| matches!(m, Message::Task(_)))
            .map(|(_, dest, tag)| (*dest, *tag))
            .collect()
    }

    /// Highest number of scripted tasks outstanding at once
    pub(crate) fn max_in_flight(&self) -> usize {
        self.in_flight.lock().unwrap().1
    }

    pub(crate) fn replies(&self) -> Vec<(f64, Tag)> {
        self.sent()
            .iter()
            .map(|(m, dest, tag)| {
                assert_eq!(*dest, MASTER_RANK);
                match m {
                    Message::Reply(p) => (*p.downcast_ref::<f64>().unwrap(), *tag),
                    other => panic!("Expected Reply, got {:?}", other),
                }
            })
            .collect()
    }

    pub(crate) fn unread(&self) -> usize {
        self.inbox.len()
    }

    pub(crate) fn aborted(&self) -> Option<i32> {
        *self.aborted.lock().unwrap()
    }

    fn waiting(&self, source: Source, tag: TagSelector) -> Option<usize> {
        self.inbox
            .iter()
            .position(|(_, s)| source.matches(s.source) && tag.matches(s.tag))
    }

    /// Next completion, if its task was sent and it matches
    fn next_completion(&self, source: Source, tag: TagSelector) -> Option<Status> {
        let &next = self.completions.front()?;
        let worker = self
            .sent()
            .iter()
            .find(|(m, _, t)| matches!(m, Message::Task(_)) && *t == next)
            .map(|(_, dest, _)| *dest)?;
        (source.matches(worker) && tag.matches(next)).then_some(Status {
            source: worker,
            tag: next,
        })
    }

    fn disconnected(&self) -> ChannelError {
        ChannelError::Disconnected { rank: MASTER_RANK }
    }
}

#[async_trait]
impl Communicator<Message> for ScriptedCommunicator {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn send(&self, message: Message, dest: Rank, tag: Tag) -> Result<(), ChannelError> {
        if self.unreachable.contains(&dest) {
            return Err(ChannelError::Disconnected { rank: dest });
        }
        if matches!(message, Message::Task(_)) && self.completions.contains(&tag) {
            let mut in_flight = self.in_flight.lock().unwrap();
            in_flight.0 += 1;
            in_flight.1 = in_flight.1.max(in_flight.0);
        }
        self.sent.lock().unwrap().push((message, dest, tag));
        Ok(())
    }

    async fn recv(
        &mut self,
        source: Source,
        tag: TagSelector,
    ) -> Result<(Message, Status), ChannelError> {
        if let Some(index) = self.waiting(source, tag) {
            return self.inbox.remove(index).ok_or_else(|| self.disconnected());
        }

        match self.next_completion(source, tag) {
            Some(status) => {
                self.completions.pop_front();
                let mut in_flight = self.in_flight.lock().unwrap();
                in_flight.0 = in_flight.0.saturating_sub(1);
                Ok((Message::Reply(Box::new(status.tag)), status))
            }
            None if self.stalling => std::future::pending().await,
            None => Err(self.disconnected()),
        }
    }

    fn try_probe(
        &mut self,
        source: Source,
        tag: TagSelector,
    ) -> Result<Option<Status>, ChannelError> {
        Ok(self.waiting(source, tag).map(|index| self.inbox[index].1))
    }

    async fn probe(&mut self, source: Source, tag: TagSelector) -> Result<Status, ChannelError> {
        match self.waiting(source, tag) {
            Some(index) => Ok(self.inbox[index].1),
            None => match self.next_completion(source, tag) {
                Some(status) => Ok(status),
                None if self.stalling => std::future::pending().await,
                None => Err(self.disconnected()),
            },
        }
    }

    fn abort(&self, error_code: i32) {
        *self.aborted.lock().unwrap() = Some(error_code);
    }
}
