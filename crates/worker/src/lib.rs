// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The worker schedules invocations: it starts their tasks, suspends and resumes them,
//! retries failed attempts, serializes exclusive handlers per key and delivers completions
//! from timers, callees and external signals.

mod input_command;
mod invocation_task;
mod key_locks;
mod quota;
mod registry;

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, trace, warn};

use waypoint_context::{
    Context, ContextOptions, ContextParams, InvocationOutcome, InvocationRuntime, LiveJournal,
};
use waypoint_storage::{Storage, StorageError};
use waypoint_timer_queue::TimerQueue;
use waypoint_tracing_instrumentation::invocation_span;
use waypoint_types::config::{Configuration, WorkerOptions};
use waypoint_types::errors::{IdDecodeError, InvocationError, codes};
use waypoint_types::identifiers::{AwakeableIdentifier, EntryIndex, InvocationId, ServiceId};
use waypoint_types::invocation::{
    InvocationMetadata, InvocationRequest, InvocationStatus, InvocationTarget, ResponseResult,
    ResponseSink,
};
use waypoint_types::journal::{Entry, EntryResult, Journal, JournalEntry, JournalRecord};
use waypoint_types::time::MillisSinceEpoch;

use crate::input_command::{InputCommand, Reply};
use crate::invocation_task::{InvocationTask, InvocationTaskOutput, RunningInvocation};
use crate::key_locks::KeyLocks;
use crate::quota::ConcurrencyQuota;

pub use input_command::WorkerHandle;
pub use registry::Registry;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("worker is shut down")]
    Shutdown,
    #[error("invalid awakeable id: {0}")]
    InvalidAwakeableId(#[from] IdDecodeError),
}

impl Error {
    fn invocation_not_found(invocation_id: InvocationId) -> Self {
        Error::NotFound(format!("invocation {invocation_id}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TimerEvent {
    /// Start time of a scheduled invocation.
    Start(InvocationId),
    /// End of the back-off before the next attempt.
    Retry(InvocationId),
    /// Wake up time of a sleep entry.
    Sleep {
        invocation_id: InvocationId,
        entry_index: EntryIndex,
    },
    /// End of the retention of a terminal invocation.
    Purge(InvocationId),
}

pub struct Worker {
    input_tx: mpsc::Sender<InputCommand>,
    inner: WorkerInner,
}

impl Worker {
    pub fn new(options: &WorkerOptions, storage: Arc<dyn Storage>, registry: Registry) -> Self {
        let (input_tx, input_rx) = mpsc::channel(options.internal_queue_length.max(1));
        let (invocation_tasks_tx, invocation_tasks_rx) = mpsc::unbounded_channel();

        let inner = WorkerInner {
            options: options.clone(),
            context_options: ContextOptions::from(options),
            storage,
            registry,
            runtime: Arc::new(WorkerHandle::new(input_tx.clone())),
            input_rx,
            invocation_tasks_tx,
            invocation_tasks_rx,
            invocation_tasks: JoinSet::new(),
            running: HashMap::new(),
            ready: VecDeque::new(),
            timers: TimerQueue::new(),
            registered_sleeps: HashSet::new(),
            quota: ConcurrencyQuota::new(
                options.concurrent_invocations_limit.map(|limit| limit.get()),
            ),
            key_locks: KeyLocks::default(),
            attach_waiters: HashMap::new(),
            next_inbox_seq: 0,
            next_attempt: 0,
        };

        Self { input_tx, inner }
    }

    /// Creates a worker on top of the storage backend selected by the configuration.
    pub async fn from_configuration(
        configuration: &Configuration,
        registry: Registry,
    ) -> Result<Self, Error> {
        let storage = waypoint_storage::open(&configuration.storage).await?;
        Ok(Self::new(&configuration.worker, storage, registry))
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle::new(self.input_tx.clone())
    }

    /// Recovers the stored invocations, then schedules until `shutdown` is cancelled.
    ///
    /// Invocation tasks still running at shutdown are aborted without recording anything, as
    /// if the process had crashed. They resume from their journal on the next start.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), Error> {
        let Worker {
            inner: mut worker, ..
        } = self;

        worker.recover().await?;

        debug!("Running the worker");
        while worker.step(&shutdown).await {}

        debug!(
            "Shutting down the worker, aborting {} invocation tasks",
            worker.running.len()
        );
        worker.invocation_tasks.shutdown().await;
        Ok(())
    }
}

struct WorkerInner {
    options: WorkerOptions,
    context_options: ContextOptions,
    storage: Arc<dyn Storage>,
    registry: Registry,
    runtime: Arc<dyn InvocationRuntime>,

    input_rx: mpsc::Receiver<InputCommand>,
    invocation_tasks_tx: mpsc::UnboundedSender<InvocationTaskOutput>,
    invocation_tasks_rx: mpsc::UnboundedReceiver<InvocationTaskOutput>,
    invocation_tasks: JoinSet<()>,

    running: HashMap<InvocationId, RunningInvocation>,
    /// Running invocations waiting for a free concurrency slot.
    ready: VecDeque<InvocationId>,
    timers: TimerQueue<TimerEvent>,
    registered_sleeps: HashSet<(InvocationId, EntryIndex)>,
    quota: ConcurrencyQuota,
    key_locks: KeyLocks,
    attach_waiters: HashMap<InvocationId, Vec<Reply<ResponseResult>>>,

    next_inbox_seq: u64,
    next_attempt: u64,
}

impl WorkerInner {
    async fn step(&mut self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => return false,
            Some(command) = self.input_rx.recv() => {
                self.handle_command(command).await;
            },
            Some(output) = self.invocation_tasks_rx.recv() => {
                let invocation_id = output.invocation_id;
                if let Err(err) = self.handle_task_output(output).await {
                    warn!(%invocation_id, "Failed to process the outcome of an invocation attempt: {err}");
                }
            },
            timer = self.timers.await_timer() => {
                let event = timer.into_inner();
                if let Err(err) = self.handle_timer(event.clone()).await {
                    warn!("Failed to process timer {event:?}: {err}");
                }
            },
            Some(result) = self.invocation_tasks.join_next() => {
                if let Err(err) = result {
                    if err.is_panic() {
                        std::panic::resume_unwind(err.into_panic());
                    }
                }
            },
        }
        true
    }

    async fn handle_command(&mut self, command: InputCommand) {
        match command {
            InputCommand::Invoke {
                request,
                internal,
                reply,
            } => {
                let _ = reply.send(self.handle_invoke(request, internal).await);
            }
            InputCommand::Attach {
                invocation_id,
                reply,
            } => self.handle_attach(invocation_id, reply).await,
            InputCommand::CompleteAwakeable {
                awakeable_id,
                result,
                reply,
            } => {
                let _ = reply.send(self.handle_complete_awakeable(awakeable_id, result).await);
            }
            InputCommand::Cancel {
                invocation_id,
                reply,
            } => {
                let _ = reply.send(self.handle_cancel(invocation_id).await);
            }
            InputCommand::Status {
                invocation_id,
                reply,
            } => {
                let result = self.storage.get_invocation(&invocation_id).await;
                let _ = reply.send(match result {
                    Ok(Some(metadata)) => Ok(metadata),
                    Ok(None) => Err(Error::invocation_not_found(invocation_id)),
                    Err(err) => Err(err.into()),
                });
            }
            InputCommand::RegisterTimer {
                invocation_id,
                entry_index,
                wake_up_time,
            } => self.register_sleep(invocation_id, entry_index, wake_up_time),
        }
    }

    // --- Invocation lifecycle

    async fn handle_invoke(
        &mut self,
        request: InvocationRequest,
        internal: bool,
    ) -> Result<InvocationId, Error> {
        let invocation_id = request.invocation_id;

        if let Some(mut metadata) = self.storage.get_invocation(&invocation_id).await? {
            trace!(%invocation_id, "Invocation already exists");
            if let Some(sink) = request.response_sink {
                if let Some(outcome) = metadata.outcome.clone() {
                    self.send_response(&sink, outcome).await?;
                } else if !metadata.response_sinks.contains(&sink) {
                    metadata.response_sinks.push(sink);
                    self.storage.put_invocation(&metadata).await?;
                }
            }
            return Ok(invocation_id);
        }

        let target = match self.registry.resolve(&request.target) {
            Ok((target, _)) => target,
            Err(err) if internal => {
                warn!(%invocation_id, "Rejecting invocation of {}: {err}", request.target);
                if let Some(sink) = &request.response_sink {
                    self.send_response(sink, ResponseResult::Failure(err)).await?;
                }
                return Ok(invocation_id);
            }
            Err(err) if err.code() == codes::NOT_FOUND => {
                return Err(Error::NotFound(request.target.to_string()));
            }
            Err(err) => return Err(Error::InvalidRequest(err.message().to_owned())),
        };

        let mut metadata = InvocationMetadata::from_request(
            InvocationRequest { target, ..request },
            self.next_inbox_seq,
        );
        self.next_inbox_seq += 1;

        match metadata.execution_time {
            Some(execution_time) if execution_time > MillisSinceEpoch::now() => {
                debug!(%invocation_id, "Scheduling invocation of {} at {execution_time}", metadata.target);
                metadata.transition(InvocationStatus::Scheduled);
                self.storage.put_invocation(&metadata).await?;
                self.timers
                    .sleep_until(execution_time, TimerEvent::Start(invocation_id));
            }
            _ => self.admit(metadata).await?,
        }

        Ok(invocation_id)
    }

    /// Runs the invocation, or puts it in the inbox of its key if the key is locked.
    async fn admit(&mut self, mut metadata: InvocationMetadata) -> Result<(), Error> {
        let invocation_id = metadata.invocation_id;
        if let Some(service_id) = exclusive_key(&metadata.target) {
            if !self.key_locks.try_lock(&service_id, invocation_id) {
                debug!(%invocation_id, "Key {service_id} is locked, inboxing invocation");
                metadata.transition(InvocationStatus::Inboxed);
                self.storage.put_invocation(&metadata).await?;
                self.key_locks.enqueue(service_id, invocation_id);
                return Ok(());
            }
        }

        metadata.transition(InvocationStatus::Running);
        self.storage.put_invocation(&metadata).await?;
        self.start(metadata);
        Ok(())
    }

    /// Moves a suspended or inboxed invocation back to running.
    async fn resume(&mut self, mut metadata: InvocationMetadata) -> Result<(), Error> {
        debug!(invocation_id = %metadata.invocation_id, "Resuming invocation");
        metadata.transition(InvocationStatus::Running);
        self.storage.put_invocation(&metadata).await?;
        self.start(metadata);
        Ok(())
    }

    fn start(&mut self, metadata: InvocationMetadata) {
        let invocation_id = metadata.invocation_id;
        if self.running.contains_key(&invocation_id) {
            return;
        }
        if !self.quota.is_slot_available() {
            trace!(%invocation_id, "No concurrency slot available, queueing invocation");
            if !self.ready.contains(&invocation_id) {
                self.ready.push_back(invocation_id);
            }
            return;
        }
        self.spawn(metadata);
    }

    async fn start_ready(&mut self) -> Result<(), Error> {
        while self.quota.is_slot_available() {
            let Some(invocation_id) = self.ready.pop_front() else {
                break;
            };
            if let Some(metadata) = self.storage.get_invocation(&invocation_id).await? {
                if metadata.status == InvocationStatus::Running
                    && metadata.next_retry_at.is_none()
                {
                    self.start(metadata);
                }
            }
        }
        Ok(())
    }

    fn spawn(&mut self, metadata: InvocationMetadata) {
        let invocation_id = metadata.invocation_id;
        let journal = Arc::new(LiveJournal::new());
        let cancellation = CancellationToken::new();
        if metadata.cancel_requested {
            cancellation.cancel();
        }

        let ctx = Context::new(ContextParams {
            invocation_id,
            target: metadata.target.clone(),
            storage: Arc::clone(&self.storage),
            runtime: Arc::clone(&self.runtime),
            journal: Arc::clone(&journal),
            cancellation: cancellation.clone(),
            options: self.context_options.clone(),
        });

        self.next_attempt += 1;
        let attempt = self.next_attempt;
        let span = invocation_span!(id = invocation_id, target = metadata.target);
        let task = InvocationTask {
            invocation_id,
            attempt,
            handler: self
                .registry
                .resolve(&metadata.target)
                .map(|(_, handler)| handler),
            ctx,
            argument: metadata.argument,
            output_tx: self.invocation_tasks_tx.clone(),
        };

        self.invocation_tasks.spawn(task.run().instrument(span));
        self.quota.reserve_slot();
        self.running.insert(
            invocation_id,
            RunningInvocation {
                attempt,
                journal,
                cancellation,
            },
        );
    }

    async fn handle_task_output(&mut self, output: InvocationTaskOutput) -> Result<(), Error> {
        let invocation_id = output.invocation_id;
        match self.running.get(&invocation_id) {
            Some(running) if running.attempt == output.attempt => {}
            _ => {
                trace!(%invocation_id, "Ignoring outcome of a stale attempt");
                return Ok(());
            }
        }
        self.running.remove(&invocation_id);
        self.quota.unreserve_slot();

        let result = match output.outcome {
            InvocationOutcome::Completed(outcome) => {
                self.complete_invocation(invocation_id, outcome).await
            }
            InvocationOutcome::Suspended(waiting_on) => {
                self.suspend(invocation_id, waiting_on).await
            }
            InvocationOutcome::Retry(err) => {
                self.schedule_retry(invocation_id, err.to_invocation_error())
                    .await
            }
        };
        self.start_ready().await?;
        result
    }

    async fn suspend(
        &mut self,
        invocation_id: InvocationId,
        waiting_on: BTreeSet<EntryIndex>,
    ) -> Result<(), Error> {
        let Some(mut metadata) = self.storage.get_invocation(&invocation_id).await? else {
            return Ok(());
        };

        // a completion may have landed after the task gave up waiting
        let journal = self.read_journal(&invocation_id).await?;
        if metadata.cancel_requested || any_completed(&journal, &waiting_on) {
            debug!(%invocation_id, "Awaited entry already completed, not suspending");
            self.start(metadata);
            return Ok(());
        }

        debug!(%invocation_id, "Suspending invocation waiting on {waiting_on:?}");
        metadata.transition(InvocationStatus::Suspended { waiting_on });
        self.storage.put_invocation(&metadata).await?;
        Ok(())
    }

    async fn schedule_retry(
        &mut self,
        invocation_id: InvocationId,
        error: InvocationError,
    ) -> Result<(), Error> {
        let Some(mut metadata) = self.storage.get_invocation(&invocation_id).await? else {
            return Ok(());
        };

        let mut retry_iter = self.options.invocation_retry_policy.iter();
        retry_iter.fast_forward(metadata.retry_count as usize);
        match retry_iter.next() {
            Some(delay) => {
                let retry_at = MillisSinceEpoch::after(delay);
                metadata.retry_count += 1;
                metadata.next_retry_at = Some(retry_at);
                self.storage.put_invocation(&metadata).await?;
                warn!(
                    %invocation_id,
                    "Invocation attempt {} failed, retrying in {delay:?}: {error}",
                    metadata.retry_count
                );
                self.timers
                    .sleep_until(retry_at, TimerEvent::Retry(invocation_id));
                Ok(())
            }
            None => {
                warn!(%invocation_id, "Invocation exhausted its retries: {error}");
                let error = InvocationError::new(
                    codes::RETRIES_EXHAUSTED,
                    format!(
                        "invocation failed after {} attempts: {}",
                        metadata.retry_count + 1,
                        error.message()
                    ),
                );
                self.complete_invocation(invocation_id, ResponseResult::Failure(error))
                    .await
            }
        }
    }

    async fn complete_invocation(
        &mut self,
        invocation_id: InvocationId,
        outcome: ResponseResult,
    ) -> Result<(), Error> {
        let Some(mut metadata) = self.storage.get_invocation(&invocation_id).await? else {
            return Ok(());
        };
        if metadata.status.is_terminal() {
            return Ok(());
        }

        let service_id = exclusive_key(&metadata.target);
        if let (Some(service_id), InvocationStatus::Inboxed) = (&service_id, &metadata.status) {
            self.key_locks.remove_from_inbox(service_id, invocation_id);
        }

        metadata.complete(outcome.clone());
        self.storage.put_invocation(&metadata).await?;
        match &outcome {
            ResponseResult::Success(_) => info!(%invocation_id, "Invocation completed"),
            ResponseResult::Failure(err) => info!(%invocation_id, "Invocation failed: {err}"),
        }

        for sink in &metadata.response_sinks {
            self.send_response(sink, outcome.clone()).await?;
        }
        for waiter in self.attach_waiters.remove(&invocation_id).unwrap_or_default() {
            let _ = waiter.send(Ok(outcome.clone()));
        }

        self.registered_sleeps.retain(|(id, _)| *id != invocation_id);
        self.timers.retain(|event| match event {
            TimerEvent::Sleep {
                invocation_id: id, ..
            }
            | TimerEvent::Retry(id)
            | TimerEvent::Start(id) => *id != invocation_id,
            TimerEvent::Purge(_) => true,
        });
        self.timers.sleep_until(
            MillisSinceEpoch::after(self.options.completion_retention()),
            TimerEvent::Purge(invocation_id),
        );

        if let Some(service_id) = service_id {
            if let Some(next) = self.key_locks.release(&service_id, invocation_id) {
                self.start_inboxed(next).await?;
            }
        }
        Ok(())
    }

    async fn start_inboxed(&mut self, invocation_id: InvocationId) -> Result<(), Error> {
        match self.storage.get_invocation(&invocation_id).await? {
            Some(metadata) if metadata.status == InvocationStatus::Inboxed => {
                self.resume(metadata).await
            }
            _ => Ok(()),
        }
    }

    // --- Completions

    async fn send_response(&mut self, sink: &ResponseSink, outcome: ResponseResult) -> Result<(), Error> {
        match sink {
            ResponseSink::Journal {
                caller,
                entry_index,
            } => {
                let result = match outcome {
                    ResponseResult::Success(value) => EntryResult::Success(value),
                    ResponseResult::Failure(err) => EntryResult::Failure(err),
                };
                self.deliver_completion(*caller, *entry_index, result).await
            }
        }
    }

    /// Records the completion of a journal entry and wakes up its invocation. Only the first
    /// completion of an entry counts.
    async fn deliver_completion(
        &mut self,
        invocation_id: InvocationId,
        entry_index: EntryIndex,
        result: EntryResult,
    ) -> Result<(), Error> {
        let Some(metadata) = self.storage.get_invocation(&invocation_id).await? else {
            debug!(%invocation_id, "Dropping completion of entry {entry_index} for unknown invocation");
            return Ok(());
        };
        if metadata.status.is_terminal() {
            return Ok(());
        }

        let journal = self.read_journal(&invocation_id).await?;
        if journal
            .get(entry_index)
            .is_some_and(JournalEntry::is_completed)
        {
            trace!(%invocation_id, "Entry {entry_index} is already completed");
            return Ok(());
        }

        self.storage
            .append_journal(
                &invocation_id,
                &JournalRecord::Completion {
                    index: entry_index,
                    result: result.clone(),
                },
            )
            .await?;

        if let Some(running) = self.running.get(&invocation_id) {
            running.journal.deliver(entry_index, result);
        } else if let InvocationStatus::Suspended { waiting_on } = &metadata.status {
            if waiting_on.contains(&entry_index) {
                self.resume(metadata).await?;
            }
        }
        Ok(())
    }

    async fn handle_complete_awakeable(
        &mut self,
        awakeable_id: AwakeableIdentifier,
        result: EntryResult,
    ) -> Result<(), Error> {
        let (invocation_id, entry_index) = awakeable_id.into_inner();
        let Some(metadata) = self.storage.get_invocation(&invocation_id).await? else {
            return Err(Error::invocation_not_found(invocation_id));
        };

        let journal = self.read_journal(&invocation_id).await?;
        match journal.get(entry_index) {
            Some(JournalEntry {
                entry: Entry::Awakeable,
                result: existing,
            }) => {
                if existing.is_some() || metadata.status.is_terminal() {
                    debug!(%invocation_id, "Awakeable {awakeable_id} is already completed");
                    return Ok(());
                }
            }
            _ => return Err(Error::NotFound(format!("awakeable {awakeable_id}"))),
        }

        self.deliver_completion(invocation_id, entry_index, result)
            .await
    }

    async fn handle_attach(&mut self, invocation_id: InvocationId, reply: Reply<ResponseResult>) {
        let metadata = match self.storage.get_invocation(&invocation_id).await {
            Ok(Some(metadata)) => metadata,
            Ok(None) => {
                let _ = reply.send(Err(Error::invocation_not_found(invocation_id)));
                return;
            }
            Err(err) => {
                let _ = reply.send(Err(err.into()));
                return;
            }
        };

        match metadata.outcome {
            Some(outcome) => {
                let _ = reply.send(Ok(outcome));
            }
            None => self
                .attach_waiters
                .entry(invocation_id)
                .or_default()
                .push(reply),
        }
    }

    async fn handle_cancel(&mut self, invocation_id: InvocationId) -> Result<(), Error> {
        let Some(mut metadata) = self.storage.get_invocation(&invocation_id).await? else {
            return Err(Error::invocation_not_found(invocation_id));
        };

        match metadata.status {
            InvocationStatus::Completed | InvocationStatus::Failed => Ok(()),
            InvocationStatus::Scheduled | InvocationStatus::Inboxed => {
                debug!(%invocation_id, "Cancelling invocation before it started");
                self.complete_invocation(
                    invocation_id,
                    ResponseResult::Failure(InvocationError::new(codes::ABORTED, "cancelled")),
                )
                .await
            }
            InvocationStatus::Running | InvocationStatus::Suspended { .. } => {
                debug!(%invocation_id, "Cancelling invocation");
                if !metadata.cancel_requested {
                    metadata.cancel_requested = true;
                    self.storage.put_invocation(&metadata).await?;
                }
                if let Some(running) = self.running.get(&invocation_id) {
                    running.cancellation.cancel();
                } else if matches!(metadata.status, InvocationStatus::Suspended { .. }) {
                    self.resume(metadata).await?;
                }
                // otherwise the next attempt starts cancelled
                Ok(())
            }
        }
    }

    // --- Timers

    fn register_sleep(
        &mut self,
        invocation_id: InvocationId,
        entry_index: EntryIndex,
        wake_up_time: MillisSinceEpoch,
    ) {
        if self.registered_sleeps.insert((invocation_id, entry_index)) {
            trace!(%invocation_id, "Registering timer for entry {entry_index} at {wake_up_time}");
            self.timers.sleep_until(
                wake_up_time,
                TimerEvent::Sleep {
                    invocation_id,
                    entry_index,
                },
            );
        }
    }

    async fn handle_timer(&mut self, event: TimerEvent) -> Result<(), Error> {
        match event {
            TimerEvent::Start(invocation_id) => {
                if let Some(metadata) = self.storage.get_invocation(&invocation_id).await? {
                    if metadata.status == InvocationStatus::Scheduled {
                        self.admit(metadata).await?;
                    }
                }
            }
            TimerEvent::Retry(invocation_id) => {
                if let Some(mut metadata) = self.storage.get_invocation(&invocation_id).await? {
                    if metadata.status == InvocationStatus::Running
                        && metadata.next_retry_at.is_some()
                    {
                        metadata.next_retry_at = None;
                        self.storage.put_invocation(&metadata).await?;
                        self.start(metadata);
                    }
                }
            }
            TimerEvent::Sleep {
                invocation_id,
                entry_index,
            } => {
                self.registered_sleeps.remove(&(invocation_id, entry_index));
                self.deliver_completion(
                    invocation_id,
                    entry_index,
                    EntryResult::Success(Bytes::new()),
                )
                .await?;
            }
            TimerEvent::Purge(invocation_id) => {
                if let Some(metadata) = self.storage.get_invocation(&invocation_id).await? {
                    if metadata.status.is_terminal() {
                        debug!(%invocation_id, "Purging invocation");
                        self.storage.delete_journal(&invocation_id).await?;
                        self.storage.delete_invocation(&invocation_id).await?;
                    }
                }
            }
        }
        Ok(())
    }

    // --- Recovery

    async fn recover(&mut self) -> Result<(), Error> {
        let mut invocations = self.storage.scan_invocations().await?;
        invocations.sort_by_key(|metadata| metadata.inbox_seq);
        self.next_inbox_seq = invocations
            .last()
            .map(|metadata| metadata.inbox_seq + 1)
            .unwrap_or_default();

        let total = invocations.len();
        let mut to_start = Vec::new();
        for metadata in invocations {
            let invocation_id = metadata.invocation_id;
            let status = metadata.status.clone();
            match &status {
                InvocationStatus::Scheduled => self.timers.sleep_until(
                    metadata.execution_time.unwrap_or(MillisSinceEpoch::UNIX_EPOCH),
                    TimerEvent::Start(invocation_id),
                ),
                InvocationStatus::Inboxed => match exclusive_key(&metadata.target) {
                    Some(service_id) => self.key_locks.enqueue(service_id, invocation_id),
                    None => to_start.push(metadata),
                },
                InvocationStatus::Running | InvocationStatus::Suspended { .. } => {
                    if let Some(service_id) = exclusive_key(&metadata.target) {
                        self.key_locks.try_lock(&service_id, invocation_id);
                    }

                    let journal = self.read_journal(&invocation_id).await?;
                    for (entry_index, wake_up_time) in journal.pending_timers() {
                        self.register_sleep(invocation_id, entry_index, wake_up_time);
                    }

                    match (&status, metadata.next_retry_at) {
                        (InvocationStatus::Running, Some(retry_at)) => self
                            .timers
                            .sleep_until(retry_at, TimerEvent::Retry(invocation_id)),
                        (InvocationStatus::Suspended { waiting_on }, _)
                            if !metadata.cancel_requested
                                && !any_completed(&journal, waiting_on) => {}
                        _ => to_start.push(metadata),
                    }
                }
                InvocationStatus::Completed | InvocationStatus::Failed => {
                    let completed_at = metadata
                        .timestamps
                        .completed_transition_time
                        .unwrap_or(metadata.timestamps.modification_time);
                    let purge_at = MillisSinceEpoch::new(completed_at.as_u64().saturating_add(
                        u64::try_from(self.options.completion_retention().as_millis())
                            .unwrap_or(u64::MAX),
                    ));
                    self.timers
                        .sleep_until(purge_at, TimerEvent::Purge(invocation_id));
                }
            }
        }

        for service_id in self.key_locks.inboxed_keys() {
            if let Some(next) = self.key_locks.promote(&service_id) {
                if let Some(metadata) = self.storage.get_invocation(&next).await? {
                    to_start.push(metadata);
                }
            }
        }

        let resumed = to_start.len();
        for metadata in to_start {
            self.resume(metadata).await?;
        }
        info!("Recovered {total} invocations, resumed {resumed}");
        Ok(())
    }

    async fn read_journal(&self, invocation_id: &InvocationId) -> Result<Journal, Error> {
        Ok(self.storage.get_journal(invocation_id).await?)
    }
}

fn exclusive_key(target: &InvocationTarget) -> Option<ServiceId> {
    if target.requires_exclusive_access() {
        target.as_keyed_service_id()
    } else {
        None
    }
}

fn any_completed(journal: &Journal, entries: &BTreeSet<EntryIndex>) -> bool {
    entries
        .iter()
        .any(|index| journal.get(*index).is_some_and(JournalEntry::is_completed))
}
