// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::{BTreeMap, BTreeSet};
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use ulid::Ulid;

use waypoint_storage::Storage;
use waypoint_types::config::WorkerOptions;
use waypoint_types::identifiers::{EntryIndex, InvocationId};
use waypoint_types::invocation::InvocationTarget;
use waypoint_types::journal::{Entry, EntryHeader, EntryResult, JournalEntry, JournalRecord};
use waypoint_types::retries::RetryPolicy;

use crate::compensation::Compensation;
use crate::error::{CancelledError, HandlerError, ReplayMismatchError, SuspendedError};
use crate::live_journal::LiveJournal;
use crate::runtime::InvocationRuntime;

/// Knobs of the durable operations, usually derived from the [`WorkerOptions`].
#[derive(Debug, Clone)]
pub struct ContextOptions {
    pub step_retry_policy: RetryPolicy,
    pub compensation_retry_policy: RetryPolicy,
    pub suspension_timeout: Duration,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self::from(&WorkerOptions::default())
    }
}

impl From<&WorkerOptions> for ContextOptions {
    fn from(options: &WorkerOptions) -> Self {
        Self {
            step_retry_policy: options.step_retry_policy.clone(),
            compensation_retry_policy: options.compensation_retry_policy.clone(),
            suspension_timeout: options.suspension_timeout(),
        }
    }
}

/// Everything a [`Context`] is built from.
pub struct ContextParams {
    pub invocation_id: InvocationId,
    pub target: InvocationTarget,
    pub storage: Arc<dyn Storage>,
    pub runtime: Arc<dyn InvocationRuntime>,
    pub journal: Arc<LiveJournal>,
    pub cancellation: CancellationToken,
    pub options: ContextOptions,
}

/// Handle given to a handler to issue durable operations.
///
/// Every operation reserves the next journal index synchronously, when it is issued. During
/// replay the operation finds its outcome in the journal at that index and the side effect
/// is skipped. The handler must therefore issue its operations in a deterministic order.
#[derive(Clone)]
pub struct Context {
    pub(crate) inner: Arc<ContextInner>,
}

pub(crate) struct ContextInner {
    pub(crate) invocation_id: InvocationId,
    pub(crate) target: InvocationTarget,
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) runtime: Arc<dyn InvocationRuntime>,
    pub(crate) journal: Arc<LiveJournal>,
    pub(crate) cancellation: CancellationToken,
    pub(crate) options: ContextOptions,
    pub(crate) compensations: Mutex<Vec<Compensation>>,

    next_index: AtomicU32,
    // steps currently executing or backing off; suspension waits for them
    in_flight_steps: AtomicUsize,
    // entry index -> number of waiters
    waiting: Mutex<BTreeMap<EntryIndex, usize>>,
    suspended_on: Mutex<Option<BTreeSet<EntryIndex>>>,
    rng: Mutex<StdRng>,
}

impl Context {
    pub fn new(params: ContextParams) -> Self {
        let rng = StdRng::seed_from_u64(params.invocation_id.to_random_seed());
        Self {
            inner: Arc::new(ContextInner {
                invocation_id: params.invocation_id,
                target: params.target,
                storage: params.storage,
                runtime: params.runtime,
                journal: params.journal,
                cancellation: params.cancellation,
                options: params.options,
                compensations: Mutex::default(),
                next_index: AtomicU32::new(0),
                in_flight_steps: AtomicUsize::new(0),
                waiting: Mutex::default(),
                suspended_on: Mutex::default(),
                rng: Mutex::new(rng),
            }),
        }
    }

    pub fn invocation_id(&self) -> InvocationId {
        self.inner.invocation_id
    }

    pub fn target(&self) -> &InvocationTarget {
        &self.inner.target
    }

    /// Key of the virtual object this invocation runs on.
    pub fn key(&self) -> Option<&str> {
        self.inner.target.key().map(|key| &**key)
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancellation.is_cancelled()
    }

    /// Deterministic random number. The generator is seeded with the invocation id, so
    /// replays observe the same sequence.
    pub fn rand_u64(&self) -> u64 {
        self.inner.rng.lock().next_u64()
    }

    /// Deterministic ulid, drawn from the same generator as [`Context::rand_u64`].
    pub fn rand_ulid(&self) -> Ulid {
        let mut rng = self.inner.rng.lock();
        Ulid::from((rng.next_u64(), rng.next_u64()))
    }

    /// Entries the invocation was waiting on when it suspended, if it did.
    pub fn suspended_on(&self) -> Option<BTreeSet<EntryIndex>> {
        self.inner.suspended_on.lock().clone()
    }

    /// Loads the durable journal of the invocation into the live journal, so that the
    /// handler replays it.
    pub async fn load_journal(&self) -> Result<(), HandlerError> {
        let records = self
            .inner
            .storage
            .read_journal(&self.inner.invocation_id)
            .await?;
        trace!(
            "Loaded {} journal records for invocation {}",
            records.len(),
            self.inner.invocation_id
        );
        for record in records {
            self.inner.journal.apply(record);
        }
        Ok(())
    }

    pub(crate) fn reserve_index(&self) -> EntryIndex {
        self.inner.next_index.fetch_add(1, Ordering::SeqCst)
    }

    /// Looks up the journaled entry at `index`, failing if it doesn't match what the handler
    /// issues now. `None` means the operation runs live.
    pub(crate) fn replay(
        &self,
        index: EntryIndex,
        issued: &EntryHeader,
    ) -> Result<Option<JournalEntry>, HandlerError> {
        let Some(journaled) = self.inner.journal.entry(index) else {
            return Ok(None);
        };
        let journaled_header = journaled.entry.header();
        if journaled_header != *issued {
            return Err(ReplayMismatchError {
                index,
                journaled: journaled_header,
                issued: issued.clone(),
            }
            .into());
        }
        trace!(journal.index = index, "Replaying {issued}");
        Ok(Some(journaled))
    }

    pub(crate) async fn append_entry(
        &self,
        index: EntryIndex,
        entry: Entry,
    ) -> Result<(), HandlerError> {
        self.ensure_not_suspended()?;
        self.append(JournalRecord::Entry { index, entry }).await
    }

    pub(crate) async fn append_completion(
        &self,
        index: EntryIndex,
        result: EntryResult,
    ) -> Result<(), HandlerError> {
        self.append(JournalRecord::Completion { index, result })
            .await
    }

    async fn append(&self, record: JournalRecord) -> Result<(), HandlerError> {
        self.inner
            .storage
            .append_journal(&self.inner.invocation_id, &record)
            .await?;
        self.inner.journal.apply(record);
        Ok(())
    }

    pub(crate) fn ensure_not_suspended(&self) -> Result<(), HandlerError> {
        match self.suspended_on() {
            Some(waiting_on) => Err(SuspendedError { waiting_on }.into()),
            None => Ok(()),
        }
    }

    pub(crate) fn step_started(&self) -> InFlightStep {
        self.inner.in_flight_steps.fetch_add(1, Ordering::SeqCst);
        InFlightStep(Arc::clone(&self.inner))
    }

    /// Waits for the completion of the entry at `index`.
    ///
    /// Fails with [`CancelledError`] once the invocation is cancelled. If nothing happens for
    /// the suspension timeout while no step is executing, the whole invocation suspends: every
    /// waiter fails with [`SuspendedError`] and the scheduler resumes the invocation by replay
    /// once one of the awaited entries completes.
    pub(crate) async fn await_completion(
        &self,
        index: EntryIndex,
    ) -> Result<EntryResult, HandlerError> {
        let _waiting = Waiting::register(&self.inner, index);
        loop {
            let mut notified = pin!(self.inner.journal.notified());
            notified.as_mut().enable();

            if let Some(result) = self.inner.journal.result(index) {
                return Ok(result);
            }
            self.ensure_not_suspended()?;
            if self.inner.cancellation.is_cancelled() {
                return Err(CancelledError.into());
            }

            tokio::select! {
                _ = &mut notified => {},
                _ = self.inner.cancellation.cancelled() => {},
                _ = tokio::time::sleep(self.inner.options.suspension_timeout) => {
                    if self.inner.in_flight_steps.load(Ordering::SeqCst) == 0 {
                        self.suspend();
                    }
                }
            }
        }
    }

    fn suspend(&self) {
        let waiting_on: BTreeSet<_> = self.inner.waiting.lock().keys().copied().collect();
        {
            let mut suspended_on = self.inner.suspended_on.lock();
            if suspended_on.is_some() {
                return;
            }
            debug!(
                "Suspending invocation {} waiting on entries {:?}",
                self.inner.invocation_id, waiting_on
            );
            *suspended_on = Some(waiting_on);
        }
        self.inner.journal.wake_all();
    }
}

pub(crate) struct InFlightStep(Arc<ContextInner>);

impl Drop for InFlightStep {
    fn drop(&mut self) {
        self.0.in_flight_steps.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Waiting<'a> {
    inner: &'a ContextInner,
    index: EntryIndex,
}

impl<'a> Waiting<'a> {
    fn register(inner: &'a ContextInner, index: EntryIndex) -> Self {
        *inner.waiting.lock().entry(index).or_default() += 1;
        Self { inner, index }
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        let mut waiting = self.inner.waiting.lock();
        if let Some(count) = waiting.get_mut(&self.index) {
            *count -= 1;
            if *count == 0 {
                waiting.remove(&self.index);
            }
        }
    }
}
