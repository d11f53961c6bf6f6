// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::communicator::{Communicator, Rank, Source, Status, TagSelector};
use crate::error::PoolError;
use crate::message::{Message, Payload, ResultRecord, TaskId};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, trace};

/// Knobs of a single `map` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapOptions {
    /// Re-feed workers as they free up instead of fixed round-robin slices
    pub load_balance: bool,
    /// Keep the ordered results; when false only the callback sees them
    pub return_results: bool,
}

impl Default for MapOptions {
    fn default() -> Self {
        Self {
            load_balance: true,
            return_results: true,
        }
    }
}

impl MapOptions {
    pub fn load_balance(mut self, load_balance: bool) -> Self {
        self.load_balance = load_balance;
        self
    }

    pub fn return_results(mut self, return_results: bool) -> Self {
        self.return_results = return_results;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPolicy {
    /// TaskId `i` goes to the `i mod workers`-th worker, all sent up front
    Static,
    /// Idle workers are fed one task at a time until nothing is left
    Dynamic,
}

impl DispatchPolicy {
    pub fn select(load_balance: bool, task_count: usize, worker_count: usize) -> Self {
        if !load_balance || task_count <= worker_count {
            DispatchPolicy::Static
        } else {
            DispatchPolicy::Dynamic
        }
    }
}

/// Tasks sent but not yet answered, and the worker holding each
///
/// Owned by the pool so that it outlives a `map` call dropped halfway.
pub type InFlight = BTreeMap<TaskId, Rank>;

/// Master-side bookkeeping of one `map` call
struct PoolState<'a, T, R> {
    pending: usize,
    idle_workers: BTreeSet<Rank>,
    remaining: VecDeque<(TaskId, T)>,
    in_flight: &'a mut InFlight,
    results: Vec<Option<R>>,
    return_results: bool,
}

impl<'a, T, R: 'static> PoolState<'a, T, R> {
    fn new(
        tasks: Vec<T>,
        workers: &[Rank],
        return_results: bool,
        in_flight: &'a mut InFlight,
    ) -> Self {
        let task_count = tasks.len();
        let results = if return_results {
            (0..task_count).map(|_| None).collect()
        } else {
            Vec::new()
        };
        Self {
            pending: task_count,
            idle_workers: workers.iter().copied().collect(),
            remaining: tasks.into_iter().enumerate().collect(),
            in_flight,
            results,
            return_results,
        }
    }

    /// Matches a reply with its in-flight task and frees the worker
    fn accept(&mut self, status: Status, message: Message) -> Result<ResultRecord<R>, PoolError> {
        let payload = match message {
            Message::Reply(payload) => payload,
            other => {
                return Err(PoolError::ProtocolMisuse(format!(
                    "master received {} from worker {}",
                    other.kind(),
                    status.source
                )))
            }
        };

        let task_id = status.tag;
        match self.in_flight.get(&task_id).copied() {
            Some(worker) if worker == status.source => {
                self.in_flight.remove(&task_id);
            }
            Some(worker) => {
                return Err(PoolError::ProtocolMisuse(format!(
                    "task {} was sent to worker {} but answered by worker {}",
                    task_id, worker, status.source
                )))
            }
            None => {
                return Err(PoolError::ProtocolMisuse(format!(
                    "worker {} answered task {} which is not in flight",
                    status.source, task_id
                )))
            }
        }

        let value = downcast_reply::<R>(payload, task_id)?;
        self.idle_workers.insert(status.source);
        self.pending -= 1;
        Ok(ResultRecord {
            task_id,
            value,
            source: status.source,
        })
    }

    fn store(&mut self, record: ResultRecord<R>) {
        if self.return_results {
            self.results[record.task_id] = Some(record.value);
        }
    }

    fn into_results(self) -> Result<Option<Vec<R>>, PoolError> {
        if !self.return_results {
            return Ok(None);
        }
        self.results
            .into_iter()
            .enumerate()
            .map(|(task_id, r)| {
                r.ok_or_else(|| {
                    PoolError::ProtocolMisuse(format!("task {} has no result", task_id))
                })
            })
            .collect::<Result<Vec<R>, PoolError>>()
            .map(Some)
    }
}

fn downcast_reply<R: 'static>(payload: Payload, task_id: TaskId) -> Result<R, PoolError> {
    payload.downcast::<R>().map(|value| *value).map_err(|_| {
        PoolError::ProtocolMisuse(format!(
            "reply to task {} is not a {}",
            task_id,
            std::any::type_name::<R>()
        ))
    })
}

/// Assigns tasks to workers and reassembles their results in input order
pub struct Dispatcher<'a, C> {
    comm: &'a mut C,
    workers: &'a [Rank],
}

impl<'a, C: Communicator<Message>> Dispatcher<'a, C> {
    pub fn new(comm: &'a mut C, workers: &'a [Rank]) -> Self {
        Self { comm, workers }
    }

    /// Runs every task to completion
    /// Returns `None` when `options.return_results` is false
    ///
    /// Replies still owed by an earlier call that was dropped before it
    /// finished are awaited and discarded first, so TaskIds can restart at 0.
    pub async fn run<T, R>(
        self,
        in_flight: &mut InFlight,
        tasks: Vec<T>,
        options: MapOptions,
        callback: &mut (dyn FnMut(&R) + Send),
    ) -> Result<Option<Vec<R>>, PoolError>
    where
        T: Send + 'static,
        R: Send + 'static,
    {
        if self.workers.is_empty() {
            return Err(PoolError::ProtocolMisuse(
                "no workers to dispatch to".to_string(),
            ));
        }

        drain_stale(&mut *self.comm, in_flight).await?;

        let policy = DispatchPolicy::select(options.load_balance, tasks.len(), self.workers.len());
        debug!(
            "Dispatching {} tasks to {} workers ({:?})",
            tasks.len(),
            self.workers.len(),
            policy
        );

        let mut state = PoolState::new(tasks, self.workers, options.return_results, in_flight);
        match policy {
            DispatchPolicy::Static => self.run_static(&mut state, callback).await?,
            DispatchPolicy::Dynamic => self.run_dynamic(&mut state, callback).await?,
        }
        state.into_results()
    }

    async fn run_static<T, R>(
        self,
        state: &mut PoolState<'_, T, R>,
        callback: &mut (dyn FnMut(&R) + Send),
    ) -> Result<(), PoolError>
    where
        T: Send + 'static,
        R: Send + 'static,
    {
        while let Some((task_id, task)) = state.remaining.pop_front() {
            let worker = self.workers[task_id % self.workers.len()];
            self.send_task(state, worker, task_id, task)?;
        }

        while state.pending > 0 {
            let (message, status) = self.comm.recv(Source::Any, TagSelector::Any).await?;
            self.collect(state, status, message, callback)?;
        }
        Ok(())
    }

    async fn run_dynamic<T, R>(
        self,
        state: &mut PoolState<'_, T, R>,
        callback: &mut (dyn FnMut(&R) + Send),
    ) -> Result<(), PoolError>
    where
        T: Send + 'static,
        R: Send + 'static,
    {
        while state.pending > 0 {
            if !state.idle_workers.is_empty() && !state.remaining.is_empty() {
                if let (Some(worker), Some((task_id, task))) =
                    (state.idle_workers.pop_first(), state.remaining.pop_front())
                {
                    self.send_task(state, worker, task_id, task)?;
                }
            }

            // Keep dispatching while an idle worker can still take something
            let can_dispatch = !state.idle_workers.is_empty() && !state.remaining.is_empty();
            let status = if can_dispatch {
                match self.comm.try_probe(Source::Any, TagSelector::Any)? {
                    Some(status) => status,
                    None => continue,
                }
            } else {
                self.comm.probe(Source::Any, TagSelector::Any).await?
            };

            let (message, status) = self
                .comm
                .recv(Source::Rank(status.source), TagSelector::Tag(status.tag))
                .await?;
            self.collect(state, status, message, callback)?;
        }
        Ok(())
    }

    fn send_task<T, R>(
        &self,
        state: &mut PoolState<'_, T, R>,
        worker: Rank,
        task_id: TaskId,
        task: T,
    ) -> Result<(), PoolError>
    where
        T: Send + 'static,
    {
        trace!("Sent task {} to worker {}", task_id, worker);
        self.comm.send(Message::Task(Box::new(task)), worker, task_id)?;
        state.idle_workers.remove(&worker);
        state.in_flight.insert(task_id, worker);
        Ok(())
    }

    fn collect<T, R: 'static>(
        &self,
        state: &mut PoolState<'_, T, R>,
        status: Status,
        message: Message,
        callback: &mut (dyn FnMut(&R) + Send),
    ) -> Result<(), PoolError> {
        let record = state.accept(status, message)?;
        trace!(
            "Master received from worker {} with tag {}",
            record.source,
            record.task_id
        );
        callback(&record.value);
        state.store(record);
        Ok(())
    }
}

/// Receives and drops the reply of every task left in `in_flight`
async fn drain_stale<C: Communicator<Message>>(
    comm: &mut C,
    in_flight: &mut InFlight,
) -> Result<(), PoolError> {
    if !in_flight.is_empty() {
        debug!("Waiting for {} replies of an interrupted map", in_flight.len());
    }
    while let Some((&task_id, &worker)) = in_flight.first_key_value() {
        let (message, _) = comm
            .recv(Source::Rank(worker), TagSelector::Tag(task_id))
            .await?;
        if !matches!(message, Message::Reply(_)) {
            return Err(PoolError::ProtocolMisuse(format!(
                "master received {} from worker {}",
                message.kind(),
                worker
            )));
        }
        in_flight.remove(&task_id);
        trace!("Discarded stale reply of worker {} to task {}", worker, task_id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communicator::Tag;
    use crate::scripted_communicator::ScriptedCommunicator;

    #[test]
    fn test_policy_static_when_load_balance_disabled() {
        assert_eq!(DispatchPolicy::select(false, 100, 3), DispatchPolicy::Static);
    }

    #[test]
    fn test_policy_static_when_tasks_fit_in_workers() {
        assert_eq!(DispatchPolicy::select(true, 3, 3), DispatchPolicy::Static);
        assert_eq!(DispatchPolicy::select(true, 0, 3), DispatchPolicy::Static);
    }

    #[test]
    fn test_policy_dynamic_for_larger_batches() {
        assert_eq!(DispatchPolicy::select(true, 4, 3), DispatchPolicy::Dynamic);
    }

    #[test]
    fn test_map_options_builder() {
        let options = MapOptions::default()
            .load_balance(false)
            .return_results(false);

        assert!(!options.load_balance);
        assert!(!options.return_results);
        assert_eq!(
            MapOptions::default(),
            MapOptions {
                load_balance: true,
                return_results: true
            }
        );
    }

    fn reply(value: f64) -> Message {
        Message::Reply(Box::new(value))
    }

    #[test]
    fn test_safety_reply_frees_worker_and_fills_slot() {
        let mut in_flight = InFlight::new();
        let mut state = PoolState::<f64, f64>::new(vec![1.0, 2.0], &[1, 2], true, &mut in_flight);
        state.in_flight.insert(1, 2);
        state.idle_workers.remove(&2);

        let record = state
            .accept(Status { source: 2, tag: 1 }, reply(4.0))
            .unwrap();
        state.store(record);

        assert_eq!(state.pending, 1);
        assert!(state.idle_workers.contains(&2));
        assert_eq!(state.results, vec![None, Some(4.0)]);
    }

    #[test]
    fn test_safety_duplicate_reply_rejected() {
        let mut in_flight = InFlight::new();
        let mut state = PoolState::<f64, f64>::new(vec![1.0], &[1], true, &mut in_flight);
        state.in_flight.insert(0, 1);

        state
            .accept(Status { source: 1, tag: 0 }, reply(1.0))
            .unwrap();
        let err = state
            .accept(Status { source: 1, tag: 0 }, reply(1.0))
            .unwrap_err();

        assert!(matches!(err, PoolError::ProtocolMisuse(_)));
    }

    #[test]
    fn test_safety_reply_from_wrong_worker_rejected() {
        let mut in_flight = InFlight::new();
        let mut state = PoolState::<f64, f64>::new(vec![1.0], &[1, 2], true, &mut in_flight);
        state.in_flight.insert(0, 1);

        let err = state
            .accept(Status { source: 2, tag: 0 }, reply(1.0))
            .unwrap_err();

        assert!(matches!(err, PoolError::ProtocolMisuse(_)));
        assert_eq!(state.pending, 1);
    }

    #[test]
    fn test_safety_reply_of_wrong_type_rejected() {
        let mut in_flight = InFlight::new();
        let mut state = PoolState::<f64, String>::new(vec![1.0], &[1], true, &mut in_flight);
        state.in_flight.insert(0, 1);

        let err = state
            .accept(Status { source: 1, tag: 0 }, reply(1.0))
            .unwrap_err();

        assert!(matches!(err, PoolError::ProtocolMisuse(_)));
    }

    #[test]
    fn test_safety_missing_result_is_reported() {
        let mut in_flight = InFlight::new();
        let state = PoolState::<f64, f64>::new(vec![1.0], &[1], true, &mut in_flight);

        assert!(matches!(
            state.into_results(),
            Err(PoolError::ProtocolMisuse(_))
        ));
    }

    #[test]
    fn test_liveness_results_dropped_when_not_returned() {
        let mut in_flight = InFlight::new();
        let mut state = PoolState::<f64, f64>::new(vec![1.0], &[1], false, &mut in_flight);
        state.in_flight.insert(0, 1);

        let record = state
            .accept(Status { source: 1, tag: 0 }, reply(1.0))
            .unwrap();
        state.store(record);

        assert_eq!(state.into_results().unwrap(), None);
    }

    async fn dispatch(
        comm: &mut ScriptedCommunicator,
        in_flight: &mut InFlight,
        tasks: usize,
        options: MapOptions,
    ) -> Result<Option<Vec<usize>>, PoolError> {
        let workers: Vec<Rank> = (1..comm.size()).collect();
        let mut seen = Vec::new();
        let results = Dispatcher::new(comm, &workers)
            .run(
                in_flight,
                (0..tasks).map(|t| t as f64).collect::<Vec<f64>>(),
                options,
                &mut |r: &usize| seen.push(*r),
            )
            .await;
        assert!(results.is_err() || seen.len() == tasks);
        results
    }

    #[tokio::test]
    async fn test_liveness_static_dispatch_goes_round_robin() {
        let order: Vec<Tag> = (0..7).rev().collect();
        let mut comm = ScriptedCommunicator::master(4).completing(&order);
        let mut in_flight = InFlight::new();

        let results = dispatch(
            &mut comm,
            &mut in_flight,
            7,
            MapOptions::default().load_balance(false),
        )
        .await
        .unwrap();

        assert_eq!(
            comm.sent_tasks(),
            vec![(1, 0), (2, 1), (3, 2), (1, 3), (2, 4), (3, 5), (1, 6)]
        );
        assert_eq!(results, Some((0..7).collect()));
        assert!(in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_liveness_dynamic_dispatch_feeds_the_worker_that_answered() {
        let mut comm = ScriptedCommunicator::master(4).completing(&[1, 0, 2, 3, 4]);
        let mut in_flight = InFlight::new();

        let results = dispatch(&mut comm, &mut in_flight, 5, MapOptions::default())
            .await
            .unwrap();

        // One task per worker first, then task 3 to the first worker back (2)
        // and task 4 to the next one (1)
        assert_eq!(
            comm.sent_tasks(),
            vec![(1, 0), (2, 1), (3, 2), (2, 3), (1, 4)]
        );
        assert_eq!(comm.max_in_flight(), 3);
        assert_eq!(results, Some((0..5).collect()));
    }

    #[tokio::test]
    async fn test_safety_dynamic_dispatch_never_exceeds_one_task_per_worker() {
        let order: Vec<Tag> = (0..12).collect();
        let mut comm = ScriptedCommunicator::master(3).completing(&order);
        let mut in_flight = InFlight::new();

        dispatch(&mut comm, &mut in_flight, 12, MapOptions::default())
            .await
            .unwrap();

        assert_eq!(comm.max_in_flight(), 2);
        assert_eq!(comm.sent_tasks().len(), 12);
    }

    #[tokio::test]
    async fn test_safety_stale_replies_drained_before_next_map() {
        let stale = |source, tag| {
            (
                Message::Reply(Box::new(99_usize)),
                Status { source, tag },
            )
        };
        let mut comm = ScriptedCommunicator::master(3)
            .with_waiting(vec![stale(2, 1), stale(1, 0)])
            .completing(&[1, 0]);
        let mut in_flight = InFlight::from([(0, 1), (1, 2)]);

        let results = dispatch(&mut comm, &mut in_flight, 2, MapOptions::default())
            .await
            .unwrap();

        assert_eq!(results, Some(vec![0, 1]));
        assert_eq!(comm.unread(), 0);
        assert!(in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_safety_interrupted_map_keeps_its_tasks_in_flight() {
        let mut comm = ScriptedCommunicator::master(3);
        let mut in_flight = InFlight::new();

        // Nobody answers: the first receive fails after both tasks went out
        let err = dispatch(&mut comm, &mut in_flight, 2, MapOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, PoolError::Channel(_)));
        assert_eq!(in_flight, InFlight::from([(0, 1), (1, 2)]));
    }
}
