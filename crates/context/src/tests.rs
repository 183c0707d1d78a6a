// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use googletest::prelude::*;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use test_log::test;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use waypoint_storage::{JournalTable, MemoryStorage, StateTable};
use waypoint_test_util::{eventually, from_json_bytes, json_bytes};
use waypoint_types::errors::{InvocationError, codes};
use waypoint_types::identifiers::{EntryIndex, InvocationId};
use waypoint_types::invocation::{
    HandlerType, InvocationRequest, InvocationTarget, ResponseResult, ResponseSink,
};
use waypoint_types::journal::{Entry, EntryResult, JournalRecord};
use waypoint_types::retries::RetryPolicy;
use waypoint_types::time::MillisSinceEpoch;

use crate::*;

#[derive(Default)]
struct MockRuntime {
    storage: MemoryStorage,
    journal: Mutex<Option<Arc<LiveJournal>>>,
    submitted: Mutex<Vec<InvocationRequest>>,
    cancelled: Mutex<Vec<InvocationId>>,
    timers: Mutex<Vec<EntryIndex>>,
}

#[async_trait]
impl InvocationRuntime for MockRuntime {
    async fn submit(&self, request: InvocationRequest) -> anyhow::Result<()> {
        self.submitted.lock().push(request);
        Ok(())
    }

    async fn cancel(&self, invocation_id: InvocationId) -> anyhow::Result<()> {
        self.cancelled.lock().push(invocation_id);
        Ok(())
    }

    async fn register_timer(
        &self,
        invocation_id: InvocationId,
        entry_index: EntryIndex,
        wake_up_time: MillisSinceEpoch,
    ) -> anyhow::Result<()> {
        self.timers.lock().push(entry_index);
        let storage = self.storage.clone();
        let journal = self.journal.lock().clone();
        tokio::spawn(async move {
            tokio::time::sleep(wake_up_time.remaining()).await;
            let result = EntryResult::Success(Bytes::new());
            storage
                .append_journal(
                    &invocation_id,
                    &JournalRecord::Completion {
                        index: entry_index,
                        result: result.clone(),
                    },
                )
                .await
                .unwrap();
            if let Some(journal) = journal {
                journal.deliver(entry_index, result);
            }
        });
        Ok(())
    }
}

struct TestInvocation {
    invocation_id: InvocationId,
    target: InvocationTarget,
    storage: MemoryStorage,
    runtime: Arc<MockRuntime>,
    options: ContextOptions,
}

struct Attempt {
    ctx: Context,
    journal: Arc<LiveJournal>,
    cancellation: CancellationToken,
}

impl Attempt {
    async fn run(self, handler: Arc<dyn Handler>) -> InvocationOutcome {
        self.run_with_input(handler, Bytes::new()).await
    }

    async fn run_with_input(self, handler: Arc<dyn Handler>, input: Bytes) -> InvocationOutcome {
        invoke(handler, self.ctx, input).await
    }
}

impl TestInvocation {
    fn new(target: InvocationTarget) -> Self {
        let runtime = Arc::new(MockRuntime::default());
        Self {
            invocation_id: InvocationId::mock_random(),
            target,
            storage: runtime.storage.clone(),
            runtime,
            options: ContextOptions {
                step_retry_policy: RetryPolicy::fixed_delay(Duration::from_millis(1), Some(3)),
                compensation_retry_policy: RetryPolicy::fixed_delay(
                    Duration::from_millis(1),
                    Some(3),
                ),
                suspension_timeout: Duration::from_secs(10),
            },
        }
    }

    fn service() -> Self {
        Self::new(InvocationTarget::service("Agent", "run"))
    }

    fn with_suspension_timeout(mut self, timeout: Duration) -> Self {
        self.options.suspension_timeout = timeout;
        self
    }

    /// A fresh execution of the invocation, as after a crash or a suspension.
    fn attempt(&self) -> Attempt {
        let journal = Arc::new(LiveJournal::new());
        *self.runtime.journal.lock() = Some(Arc::clone(&journal));
        let cancellation = CancellationToken::new();
        let ctx = Context::new(ContextParams {
            invocation_id: self.invocation_id,
            target: self.target.clone(),
            storage: Arc::new(self.storage.clone()),
            runtime: Arc::clone(&self.runtime) as Arc<dyn InvocationRuntime>,
            journal: Arc::clone(&journal),
            cancellation: cancellation.clone(),
            options: self.options.clone(),
        });
        Attempt {
            ctx,
            journal,
            cancellation,
        }
    }

    async fn records(&self) -> Vec<JournalRecord> {
        self.storage.read_journal(&self.invocation_id).await.unwrap()
    }

    async fn complete(
        &self,
        journal: Option<&Arc<LiveJournal>>,
        index: EntryIndex,
        result: EntryResult,
    ) {
        self.storage
            .append_journal(
                &self.invocation_id,
                &JournalRecord::Completion {
                    index,
                    result: result.clone(),
                },
            )
            .await
            .unwrap();
        if let Some(journal) = journal {
            journal.deliver(index, result);
        }
    }

    async fn wait_for_records(&self, count: usize) {
        let storage = self.storage.clone();
        let invocation_id = self.invocation_id;
        eventually("journal records", Duration::from_secs(5), move || {
            let storage = storage.clone();
            async move {
                let records = storage.read_journal(&invocation_id).await.unwrap();
                (records.len() >= count).then_some(())
            }
        })
        .await;
    }
}

fn success<T: DeserializeOwned>(outcome: InvocationOutcome) -> T {
    match outcome {
        InvocationOutcome::Completed(ResponseResult::Success(value)) => from_json_bytes(&value),
        other => panic!("expected a successful outcome, got {other:?}"),
    }
}

fn failure(outcome: InvocationOutcome) -> InvocationError {
    match outcome {
        InvocationOutcome::Completed(ResponseResult::Failure(err)) => err,
        other => panic!("expected a failed outcome, got {other:?}"),
    }
}

fn crashed() -> HandlerError {
    anyhow::anyhow!("process died").into()
}

#[test(tokio::test)]
async fn completed_steps_are_not_executed_again() {
    let invocation = TestInvocation::service();
    let executions = Arc::new(AtomicU32::new(0));
    let crash = Arc::new(AtomicBool::new(true));

    let handler: Arc<dyn Handler> = Arc::new(handler({
        let executions = Arc::clone(&executions);
        let crash = Arc::clone(&crash);
        move |ctx: Context, ()| {
            let executions = Arc::clone(&executions);
            let crash = Arc::clone(&crash);
            async move {
                let charged: u32 = ctx
                    .run("charge", move || {
                        let executions = Arc::clone(&executions);
                        async move {
                            Ok::<_, HandlerError>(executions.fetch_add(1, Ordering::SeqCst) + 1)
                        }
                    })
                    .await?;
                if crash.swap(false, Ordering::SeqCst) {
                    return Err(crashed());
                }
                Ok::<_, HandlerError>(charged)
            }
        }
    }));

    let outcome = invocation.attempt().run(Arc::clone(&handler)).await;
    assert!(matches!(outcome, InvocationOutcome::Retry(_)));

    let outcome = invocation.attempt().run(handler).await;
    assert_that!(success::<u32>(outcome), eq(1));
    assert_that!(executions.load(Ordering::SeqCst), eq(1));
}

#[test(tokio::test)]
async fn transient_step_failures_are_retried() {
    let invocation = TestInvocation::service();
    let attempts = Arc::new(AtomicU32::new(0));

    let handler: Arc<dyn Handler> = Arc::new(handler({
        let attempts = Arc::clone(&attempts);
        move |ctx: Context, ()| {
            let attempts = Arc::clone(&attempts);
            async move {
                let value: String = ctx
                    .run_with_policy(
                        "flaky",
                        RetryPolicy::fixed_delay(Duration::from_millis(1), Some(5)),
                        move || {
                            let attempts = Arc::clone(&attempts);
                            async move {
                                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                                    Err(HandlerError::from(anyhow::anyhow!("connection reset")))
                                } else {
                                    Ok("done".to_owned())
                                }
                            }
                        },
                    )
                    .await?;
                Ok::<_, HandlerError>(value)
            }
        }
    }));

    let outcome = invocation.attempt().run(handler).await;
    assert_that!(success::<String>(outcome), eq("done"));
    assert_that!(attempts.load(Ordering::SeqCst), eq(3));
    // a single entry and a single completion, whatever the number of attempts
    assert_that!(invocation.records().await.len(), eq(2));
}

#[test(tokio::test)]
async fn exhausted_step_retries_fail_the_step() {
    let invocation = TestInvocation::service();
    let attempts = Arc::new(AtomicU32::new(0));

    let handler: Arc<dyn Handler> = Arc::new(handler({
        let attempts = Arc::clone(&attempts);
        move |ctx: Context, ()| {
            let attempts = Arc::clone(&attempts);
            async move {
                ctx.run_with_policy(
                    "always-down",
                    RetryPolicy::fixed_delay(Duration::from_millis(1), Some(2)),
                    move || {
                        let attempts = Arc::clone(&attempts);
                        async move {
                            attempts.fetch_add(1, Ordering::SeqCst);
                            Err::<(), _>(HandlerError::from(anyhow::anyhow!("unavailable")))
                        }
                    },
                )
                .await?;
                Ok::<_, HandlerError>(())
            }
        }
    }));

    let err = failure(invocation.attempt().run(handler).await);
    assert_that!(err.code(), eq(codes::RETRIES_EXHAUSTED));
    assert_that!(attempts.load(Ordering::SeqCst), eq(3));
}

#[test(tokio::test)]
async fn terminal_step_failures_are_not_retried() {
    let invocation = TestInvocation::service();
    let attempts = Arc::new(AtomicU32::new(0));

    let handler: Arc<dyn Handler> = Arc::new(handler({
        let attempts = Arc::clone(&attempts);
        move |ctx: Context, ()| {
            let attempts = Arc::clone(&attempts);
            async move {
                ctx.run("validate", move || {
                    let attempts = Arc::clone(&attempts);
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(HandlerError::terminal(codes::BAD_REQUEST, "invalid card"))
                    }
                })
                .await?;
                Ok::<_, HandlerError>(())
            }
        }
    }));

    let err = failure(invocation.attempt().run(handler).await);
    assert_that!(err.code(), eq(codes::BAD_REQUEST));
    assert_that!(err.message(), eq("invalid card"));
    assert_that!(attempts.load(Ordering::SeqCst), eq(1));

    // the failure is journaled like a value
    let records = invocation.records().await;
    assert!(matches!(
        records.last(),
        Some(JournalRecord::Completion {
            index: 0,
            result: EntryResult::Failure(_)
        })
    ));
}

#[test(tokio::test)]
async fn diverging_replay_fails_with_journal_mismatch() {
    let invocation = TestInvocation::service();
    let executions = Arc::new(AtomicU32::new(0));

    let handler: Arc<dyn Handler> = Arc::new(handler({
        let executions = Arc::clone(&executions);
        move |ctx: Context, ()| {
            let first = executions.fetch_add(1, Ordering::SeqCst) == 0;
            async move {
                let name = if first { "reserve" } else { "charge" };
                ctx.run(name, || async { Ok::<_, HandlerError>(()) }).await?;
                if first {
                    return Err(crashed());
                }
                Ok::<_, HandlerError>(())
            }
        }
    }));

    let outcome = invocation.attempt().run(Arc::clone(&handler)).await;
    assert!(matches!(outcome, InvocationOutcome::Retry(_)));

    let err = failure(invocation.attempt().run(handler).await);
    assert_that!(err.code(), eq(codes::JOURNAL_MISMATCH));
    assert_that!(err.message(), contains_substring("Run(reserve)"));
}

#[test(tokio::test)]
async fn awakeable_is_completed_by_its_id() {
    let invocation = TestInvocation::service();
    let (id_tx, mut id_rx) = mpsc::unbounded_channel();

    let handler: Arc<dyn Handler> = Arc::new(handler(move |ctx: Context, ()| {
        let id_tx = id_tx.clone();
        async move {
            let (id, promise) = ctx.awakeable::<String>().await?;
            let _ = id_tx.send(id);
            let value = promise.await?;
            Ok::<_, HandlerError>(value)
        }
    }));

    let attempt = invocation.attempt();
    let journal = Arc::clone(&attempt.journal);
    let running = tokio::spawn(attempt.run(handler));

    let id = id_rx.recv().await.unwrap();
    assert_that!(id.invocation_id(), eq(invocation.invocation_id));
    invocation
        .complete(
            Some(&journal),
            id.entry_index(),
            EntryResult::Success(json_bytes(&"approved")),
        )
        .await;

    assert_that!(success::<String>(running.await.unwrap()), eq("approved"));
}

#[test(tokio::test)]
async fn rejected_awakeable_fails_terminally() {
    let invocation = TestInvocation::service();
    let (id_tx, mut id_rx) = mpsc::unbounded_channel();

    let handler: Arc<dyn Handler> = Arc::new(handler(move |ctx: Context, ()| {
        let id_tx = id_tx.clone();
        async move {
            let (id, promise) = ctx.awakeable::<String>().await?;
            let _ = id_tx.send(id);
            Ok::<_, HandlerError>(promise.await?)
        }
    }));

    let attempt = invocation.attempt();
    let journal = Arc::clone(&attempt.journal);
    let running = tokio::spawn(attempt.run(handler));

    let id = id_rx.recv().await.unwrap();
    invocation
        .complete(
            Some(&journal),
            id.entry_index(),
            EntryResult::Failure(InvocationError::new(codes::BAD_REQUEST, "rejected by reviewer")),
        )
        .await;

    let err = failure(running.await.unwrap());
    assert_that!(err.message(), eq("rejected by reviewer"));
}

#[test(tokio::test)]
async fn idle_invocation_suspends_and_resumes_by_replay() {
    let invocation = TestInvocation::service().with_suspension_timeout(Duration::from_millis(50));

    let handler: Arc<dyn Handler> = Arc::new(handler(|ctx: Context, ()| async move {
        let (_, promise) = ctx.awakeable::<u32>().await?;
        let value = promise.await?;
        Ok::<_, HandlerError>(value + 1)
    }));

    let outcome = invocation.attempt().run(Arc::clone(&handler)).await;
    let InvocationOutcome::Suspended(waiting_on) = outcome else {
        panic!("expected the invocation to suspend, got {outcome:?}");
    };
    assert_that!(waiting_on, eq(BTreeSet::from([0])));

    // resolved while no task runs the invocation
    invocation
        .complete(None, 0, EntryResult::Success(json_bytes(&41)))
        .await;

    let outcome = invocation.attempt().run(handler).await;
    assert_that!(success::<u32>(outcome), eq(42));
}

#[test(tokio::test)]
async fn executing_steps_prevent_suspension() {
    let invocation = TestInvocation::service().with_suspension_timeout(Duration::from_millis(30));

    let handler: Arc<dyn Handler> = Arc::new(handler(|ctx: Context, ()| async move {
        let (_, promise) = ctx.awakeable::<u32>().await?;
        let slow = ctx.run("slow", || async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            Ok::<_, HandlerError>(7)
        });
        let values = ctx.all(vec![promise, slow]).await?;
        Ok::<_, HandlerError>(values)
    }));

    let outcome = invocation.attempt().run(handler).await;
    let InvocationOutcome::Suspended(waiting_on) = outcome else {
        panic!("expected the invocation to suspend, got {outcome:?}");
    };
    assert_that!(waiting_on, eq(BTreeSet::from([0])));

    // the step finished before the invocation gave up its task
    let records = invocation.records().await;
    assert!(records.iter().any(|record| matches!(
        record,
        JournalRecord::Completion {
            index: 1,
            result: EntryResult::Success(_)
        }
    )));
}

#[test(tokio::test)]
async fn cancellation_runs_compensations() {
    let invocation = TestInvocation::service();
    let compensated = Arc::new(AtomicBool::new(false));

    let handler: Arc<dyn Handler> = Arc::new(handler({
        let compensated = Arc::clone(&compensated);
        move |ctx: Context, ()| {
            let compensated = Arc::clone(&compensated);
            async move {
                ctx.run("book-flight", || async { Ok::<_, HandlerError>(()) })
                    .await?;
                ctx.register_compensation("book-flight", move || {
                    let compensated = Arc::clone(&compensated);
                    async move {
                        compensated.store(true, Ordering::SeqCst);
                        Ok::<_, HandlerError>(())
                    }
                });
                let (_, approval) = ctx.awakeable::<()>().await?;
                approval.await?;
                Ok::<_, HandlerError>(())
            }
        }
    }));

    let attempt = invocation.attempt();
    let cancellation = attempt.cancellation.clone();
    let running = tokio::spawn(attempt.run(handler));

    // run entry, its completion and the awakeable entry
    invocation.wait_for_records(3).await;
    cancellation.cancel();

    let err = failure(running.await.unwrap());
    assert_that!(err.code(), eq(codes::ABORTED));
    assert_that!(compensated.load(Ordering::SeqCst), eq(true));

    let records = invocation.records().await;
    assert!(records.iter().any(|record| matches!(
        record,
        JournalRecord::Entry { entry: Entry::Run { name }, .. } if name == "compensate: book-flight"
    )));
}

#[test(tokio::test)]
async fn compensations_run_in_reverse_and_collect_failures() {
    let invocation = TestInvocation::service();
    let order = Arc::new(Mutex::new(Vec::new()));
    let registered = Arc::new(AtomicU32::new(0));

    let handler: Arc<dyn Handler> = Arc::new(handler({
        let order = Arc::clone(&order);
        let registered = Arc::clone(&registered);
        move |ctx: Context, ()| {
            let order = Arc::clone(&order);
            let registered = Arc::clone(&registered);
            async move {
                for name in ["reserve-hotel", "charge-card"] {
                    let order = Arc::clone(&order);
                    ctx.register_compensation(name, move || {
                        let order = Arc::clone(&order);
                        async move {
                            order.lock().push(name);
                            if name == "charge-card" {
                                Err(HandlerError::from(TerminalError::new("refund rejected")))
                            } else {
                                Ok(())
                            }
                        }
                    });
                }
                registered.store(ctx.pending_compensations() as u32, Ordering::SeqCst);
                Err::<(), _>(HandlerError::terminal(codes::BAD_REQUEST, "no seats left"))
            }
        }
    }));

    let err = failure(invocation.attempt().run(handler).await);
    assert_that!(err.code(), eq(codes::BAD_REQUEST));
    assert_that!(err.message(), eq("no seats left"));
    assert_that!(err.secondary().len(), eq(1));
    assert_that!(err.secondary()[0].message(), eq("refund rejected"));
    assert_that!(*order.lock(), eq(vec!["charge-card", "reserve-hotel"]));
    assert_that!(registered.load(Ordering::SeqCst), eq(2));
}

#[test(tokio::test)]
async fn any_journals_the_winner_and_aborts_losers() {
    let invocation = TestInvocation::service();
    let executions = Arc::new(AtomicU32::new(0));

    let handler: Arc<dyn Handler> = Arc::new(handler({
        let executions = Arc::clone(&executions);
        move |ctx: Context, ()| {
            let executions = Arc::clone(&executions);
            async move {
                let fast = ctx.run("fast-model", move || {
                    let executions = Arc::clone(&executions);
                    async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok::<_, HandlerError>(1)
                    }
                });
                let slow = ctx.run("slow-model", || async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok::<_, HandlerError>(2)
                });
                let (winner, value): (usize, u32) = ctx.any(vec![fast, slow]).await?;
                Ok::<_, HandlerError>((winner, value))
            }
        }
    }));

    let outcome = invocation.attempt().run(Arc::clone(&handler)).await;
    assert_that!(success::<(usize, u32)>(outcome), eq((0, 1)));

    let records = invocation.records().await;
    assert!(records.iter().any(|record| matches!(
        record,
        JournalRecord::Completion {
            index: 1,
            result: EntryResult::Aborted
        }
    )));
    assert!(records.iter().any(|record| matches!(
        record,
        JournalRecord::Entry {
            index: 2,
            entry: Entry::Combinator { winner: 0 }
        }
    )));

    // a replay observes the same winner without executing anything
    let outcome = invocation.attempt().run(handler).await;
    assert_that!(success::<(usize, u32)>(outcome), eq((0, 1)));
    assert_that!(executions.load(Ordering::SeqCst), eq(1));
}

#[test(tokio::test)]
async fn all_reports_first_failure_in_member_order() {
    let invocation = TestInvocation::service();

    let handler: Arc<dyn Handler> = Arc::new(handler(|ctx: Context, ()| async move {
        let ok = ctx.run("ok", || async { Ok::<_, HandlerError>(1) });
        let late = ctx.run("late", || async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Err::<u32, _>(HandlerError::from(TerminalError::new("late failed")))
        });
        let early = ctx.run("early", || async {
            Err::<u32, _>(HandlerError::from(TerminalError::new("early failed")))
        });
        let values = ctx.all(vec![ok, late, early]).await?;
        Ok::<_, HandlerError>(values)
    }));

    let err = failure(invocation.attempt().run(handler).await);
    assert_that!(err.message(), eq("late failed"));
}

#[test(tokio::test)]
async fn select_timeout_returns_none_when_the_timer_wins() {
    let invocation = TestInvocation::service();

    let handler: Arc<dyn Handler> = Arc::new(handler(|ctx: Context, ()| async move {
        let (_, approval) = ctx.awakeable::<u32>().await?;
        let approved = ctx
            .select_timeout(approval, Duration::from_millis(20))
            .await?;
        Ok::<_, HandlerError>(approved)
    }));

    let outcome = invocation.attempt().run(handler).await;
    assert_that!(success::<Option<u32>>(outcome), none());
    assert_that!(*invocation.runtime.timers.lock(), eq(vec![1]));
}

#[test(tokio::test)]
async fn sleep_completes_through_the_timer() {
    let invocation = TestInvocation::service();

    let handler: Arc<dyn Handler> = Arc::new(handler(|ctx: Context, ()| async move {
        ctx.sleep(Duration::from_millis(20)).await?;
        Ok::<_, HandlerError>("woke up")
    }));

    let outcome = invocation.attempt().run(handler).await;
    assert_that!(success::<String>(outcome), eq("woke up"));

    let records = invocation.records().await;
    assert!(matches!(
        records.first(),
        Some(JournalRecord::Entry {
            index: 0,
            entry: Entry::Sleep { .. }
        })
    ));
}

#[test(tokio::test)]
async fn keyed_state_roundtrip() {
    let invocation = TestInvocation::new(InvocationTarget::virtual_object(
        "Counter",
        "alice",
        "add",
        HandlerType::Exclusive,
    ));

    let handler: Arc<dyn Handler> = Arc::new(handler(|ctx: Context, ()| async move {
        let before: Option<u32> = ctx.get("count").await?;
        ctx.set("count", &(before.unwrap_or(0) + 1)).await?;
        let after: Option<u32> = ctx.get("count").await?;
        ctx.clear("count").await?;
        let cleared: Option<u32> = ctx.get("count").await?;
        Ok::<_, HandlerError>((before, after, cleared))
    }));

    let outcome = invocation.attempt().run(handler).await;
    assert_that!(
        success::<(Option<u32>, Option<u32>, Option<u32>)>(outcome),
        eq((None, Some(1), None))
    );
}

#[test(tokio::test)]
async fn state_reads_are_replayed_from_the_journal() {
    let invocation = TestInvocation::new(InvocationTarget::virtual_object(
        "Counter",
        "bob",
        "read",
        HandlerType::Exclusive,
    ));
    let service_id = invocation.target.as_keyed_service_id().unwrap();
    invocation
        .storage
        .put_user_state(&service_id, "count", json_bytes(&1))
        .await
        .unwrap();
    let crash = Arc::new(AtomicBool::new(true));

    let handler: Arc<dyn Handler> = Arc::new(handler({
        let crash = Arc::clone(&crash);
        move |ctx: Context, ()| {
            let crash = Arc::clone(&crash);
            async move {
                let count: Option<u32> = ctx.get("count").await?;
                if crash.swap(false, Ordering::SeqCst) {
                    return Err(crashed());
                }
                Ok::<_, HandlerError>(count)
            }
        }
    }));

    let outcome = invocation.attempt().run(Arc::clone(&handler)).await;
    assert!(matches!(outcome, InvocationOutcome::Retry(_)));

    invocation
        .storage
        .put_user_state(&service_id, "count", json_bytes(&5))
        .await
        .unwrap();

    let outcome = invocation.attempt().run(handler).await;
    assert_that!(success::<Option<u32>>(outcome), some(eq(1)));
}

#[test(tokio::test)]
async fn shared_handlers_cannot_write_state() {
    let invocation = TestInvocation::new(InvocationTarget::virtual_object(
        "Counter",
        "carol",
        "peek",
        HandlerType::Shared,
    ));

    let handler: Arc<dyn Handler> = Arc::new(handler(|ctx: Context, ()| async move {
        ctx.set("count", &1).await?;
        Ok::<_, HandlerError>(())
    }));

    let err = failure(invocation.attempt().run(handler).await);
    assert_that!(err.code(), eq(codes::BAD_REQUEST));
}

#[test(tokio::test)]
async fn services_have_no_state() {
    let invocation = TestInvocation::service();

    let handler: Arc<dyn Handler> = Arc::new(handler(|ctx: Context, ()| async move {
        let value: Option<u32> = ctx.get("count").await?;
        Ok::<_, HandlerError>(value)
    }));

    let err = failure(invocation.attempt().run(handler).await);
    assert_that!(err.code(), eq(codes::BAD_REQUEST));
}

#[test(tokio::test)]
async fn call_waits_for_the_callee_outcome() {
    let invocation = TestInvocation::service();

    let handler: Arc<dyn Handler> = Arc::new(handler(|ctx: Context, ()| async move {
        let greeting: String = ctx
            .call(InvocationTarget::service("Greeter", "greet"), "bob")
            .await?;
        Ok::<_, HandlerError>(greeting)
    }));

    let attempt = invocation.attempt();
    let journal = Arc::clone(&attempt.journal);
    let running = tokio::spawn(attempt.run(handler));

    let runtime = Arc::clone(&invocation.runtime);
    let request = eventually("submitted call", Duration::from_secs(5), move || {
        let runtime = Arc::clone(&runtime);
        async move { runtime.submitted.lock().first().cloned() }
    })
    .await;
    assert_that!(
        request.response_sink,
        some(eq(ResponseSink::Journal {
            caller: invocation.invocation_id,
            entry_index: 0,
        }))
    );
    assert_that!(from_json_bytes::<String>(&request.argument), eq("bob"));

    invocation
        .complete(
            Some(&journal),
            0,
            EntryResult::Success(json_bytes(&"hello bob")),
        )
        .await;
    assert_that!(success::<String>(running.await.unwrap()), eq("hello bob"));
}

#[test(tokio::test)]
async fn send_is_submitted_once_across_replays() {
    let invocation = TestInvocation::service();
    let crash = Arc::new(AtomicBool::new(true));

    let handler: Arc<dyn Handler> = Arc::new(handler({
        let crash = Arc::clone(&crash);
        move |ctx: Context, ()| {
            let crash = Arc::clone(&crash);
            async move {
                let callee = ctx
                    .send(InvocationTarget::service("Mailer", "send"), "report ready")
                    .await?;
                if crash.swap(false, Ordering::SeqCst) {
                    return Err(crashed());
                }
                Ok::<_, HandlerError>(callee.to_string())
            }
        }
    }));

    let outcome = invocation.attempt().run(Arc::clone(&handler)).await;
    assert!(matches!(outcome, InvocationOutcome::Retry(_)));
    let callee = success::<String>(invocation.attempt().run(handler).await);

    let submitted = invocation.runtime.submitted.lock().clone();
    assert_that!(submitted.len(), eq(1));
    assert_that!(submitted[0].invocation_id.to_string(), eq(callee));
}

#[test(tokio::test)]
async fn randomness_is_stable_across_attempts() {
    let invocation = TestInvocation::service();

    let first = invocation.attempt().ctx;
    let second = invocation.attempt().ctx;

    assert_that!(first.rand_u64(), eq(second.rand_u64()));
    assert_that!(first.rand_ulid(), eq(second.rand_ulid()));
}

#[test(tokio::test)]
async fn undecodable_input_is_a_bad_request() {
    let invocation = TestInvocation::service();

    let handler: Arc<dyn Handler> = Arc::new(handler(|_ctx: Context, n: u32| async move {
        Ok::<_, HandlerError>(n * 2)
    }));

    let outcome = invocation
        .attempt()
        .run_with_input(handler, Bytes::from_static(b"not json"))
        .await;
    assert_that!(failure(outcome).code(), eq(codes::BAD_REQUEST));
}
