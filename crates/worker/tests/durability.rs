// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use googletest::prelude::*;
use test_log::test;
use tokio::sync::mpsc;

use waypoint_context::{Context, HandlerError, ServiceDefinition, handler};
use waypoint_storage::{JournalTable, StateTable};
use waypoint_test_util::json_bytes;
use waypoint_types::errors::codes;
use waypoint_types::identifiers::ServiceId;
use waypoint_types::invocation::{
    HandlerType, InvocationRequest, InvocationStatus, InvocationTarget,
};
use waypoint_types::journal::{Entry, EntryResult};
use waypoint_worker::Registry;

mod common;

use common::{TIMEOUT, TestEnv, failure, success};

fn request(target: InvocationTarget, argument: Bytes) -> InvocationRequest {
    InvocationRequest::new(target, argument)
}

#[test(tokio::test(flavor = "multi_thread"))]
async fn committed_step_runs_once_across_replays() {
    let charges = Arc::new(AtomicU32::new(0));
    let attempts = Arc::new(AtomicU32::new(0));

    let registry = Registry::new().with_service(ServiceDefinition::service("Payments").with_handler(
        "pay",
        handler({
            let charges = Arc::clone(&charges);
            let attempts = Arc::clone(&attempts);
            move |ctx: Context, amount: u32| {
                let charges = Arc::clone(&charges);
                let attempts = Arc::clone(&attempts);
                async move {
                    let receipt: String = ctx
                        .run("charge", move || {
                            let charges = Arc::clone(&charges);
                            async move {
                                charges.fetch_add(1, Ordering::SeqCst);
                                Ok::<_, HandlerError>(format!("receipt-{amount}"))
                            }
                        })
                        .await?;
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        return Err(anyhow::anyhow!("connection reset").into());
                    }
                    Ok::<_, HandlerError>(receipt)
                }
            }
        }),
    ));
    let env = TestEnv::start(registry);

    let invocation_id = env
        .handle
        .invoke(request(
            InvocationTarget::service("Payments", "pay"),
            json_bytes(&42),
        ))
        .await
        .unwrap();

    let receipt: String = success(env.outcome(invocation_id).await);
    assert_that!(receipt, eq("receipt-42"));
    assert_that!(charges.load(Ordering::SeqCst), eq(1));
    assert_that!(attempts.load(Ordering::SeqCst), eq(3));
    assert_that!(
        env.handle.status(invocation_id).await.unwrap().retry_count,
        eq(2)
    );
}

#[test(tokio::test(flavor = "multi_thread"))]
async fn all_waits_for_every_member_and_reports_the_failure() {
    let slow_finished = Arc::new(AtomicBool::new(false));

    let registry = Registry::new().with_service(
        ServiceDefinition::service("Research").with_handler(
            "gather",
            handler({
                let slow_finished = Arc::clone(&slow_finished);
                move |ctx: Context, ()| {
                    let slow_finished = Arc::clone(&slow_finished);
                    async move {
                        let first = ctx.run("first", || async { Ok::<_, HandlerError>(1u32) });
                        let second = ctx.run("second", || async {
                            Err::<u32, _>(HandlerError::terminal(codes::BAD_REQUEST, "source offline"))
                        });
                        let third = ctx.run("third", move || {
                            let slow_finished = Arc::clone(&slow_finished);
                            async move {
                                tokio::time::sleep(Duration::from_millis(50)).await;
                                slow_finished.store(true, Ordering::SeqCst);
                                Ok::<_, HandlerError>(3u32)
                            }
                        });
                        let values = ctx.all(vec![first, second, third]).await?;
                        Ok::<_, HandlerError>(values)
                    }
                }
            }),
        ),
    );
    let env = TestEnv::start(registry);

    let invocation_id = env
        .handle
        .invoke(request(
            InvocationTarget::service("Research", "gather"),
            Bytes::new(),
        ))
        .await
        .unwrap();

    let err = failure(env.outcome(invocation_id).await);
    assert_that!(err.code(), eq(codes::BAD_REQUEST));
    assert_that!(err.message(), eq("source offline"));
    assert!(slow_finished.load(Ordering::SeqCst));

    let journal = env.storage.get_journal(&invocation_id).await.unwrap();
    assert_that!(
        journal.get(2).and_then(|entry| entry.result.clone()),
        some(eq(EntryResult::Success(json_bytes(&3))))
    );
}

#[test(tokio::test(flavor = "multi_thread"))]
async fn any_returns_the_fastest_branch_and_aborts_the_other() {
    let slow_finished = Arc::new(AtomicBool::new(false));

    let registry = Registry::new().with_service(ServiceDefinition::service("Race").with_handler(
        "run",
        handler({
            let slow_finished = Arc::clone(&slow_finished);
            move |ctx: Context, ()| {
                let slow_finished = Arc::clone(&slow_finished);
                async move {
                    let fast = ctx.run("fast", || async {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok::<_, HandlerError>("fast".to_owned())
                    });
                    let slow = ctx.run("slow", move || {
                        let slow_finished = Arc::clone(&slow_finished);
                        async move {
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            slow_finished.store(true, Ordering::SeqCst);
                            Ok::<_, HandlerError>("slow".to_owned())
                        }
                    });
                    let (winner, value) = ctx.any(vec![fast, slow]).await?;
                    Ok::<_, HandlerError>((winner, value))
                }
            }
        }),
    ));
    let env = TestEnv::start(registry);

    let invocation_id = env
        .handle
        .invoke(request(InvocationTarget::service("Race", "run"), Bytes::new()))
        .await
        .unwrap();

    let (winner, value): (usize, String) = success(env.outcome(invocation_id).await);
    assert_that!(winner, eq(0));
    assert_that!(value, eq("fast"));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!slow_finished.load(Ordering::SeqCst));

    let journal = env.storage.get_journal(&invocation_id).await.unwrap();
    assert_that!(
        journal.get(1).and_then(|entry| entry.result.clone()),
        some(eq(EntryResult::Aborted))
    );
    assert_that!(
        journal.get(2).map(|entry| entry.entry.clone()),
        some(eq(Entry::Combinator { winner: 0 }))
    );
}

#[test(tokio::test(flavor = "multi_thread"))]
async fn failed_saga_rolls_back_in_reverse_order() {
    let undone = Arc::new(Mutex::new(Vec::new()));

    let registry = Registry::new().with_service(ServiceDefinition::service("Trips").with_handler(
        "book",
        handler({
            let undone = Arc::clone(&undone);
            move |ctx: Context, ()| {
                let undone = Arc::clone(&undone);
                async move {
                    for booking in ["flight", "hotel", "car"] {
                        let _: String = ctx
                            .run(format!("book {booking}"), move || async move {
                                Ok::<_, HandlerError>(format!("{booking}-1"))
                            })
                            .await?;
                        let undone = Arc::clone(&undone);
                        ctx.register_compensation(booking, move || {
                            let undone = Arc::clone(&undone);
                            async move {
                                undone.lock().unwrap().push(booking);
                                Ok::<_, HandlerError>(())
                            }
                        });
                    }
                    ctx.run("pay", || async {
                        Err::<(), _>(HandlerError::terminal(codes::BAD_REQUEST, "card declined"))
                    })
                    .await?;
                    Ok::<_, HandlerError>(())
                }
            }
        }),
    ));
    let env = TestEnv::start(registry);

    let invocation_id = env
        .handle
        .invoke(request(InvocationTarget::service("Trips", "book"), Bytes::new()))
        .await
        .unwrap();

    let err = failure(env.outcome(invocation_id).await);
    assert_that!(err.message(), eq("card declined"));
    assert!(err.secondary().is_empty());
    let undone = undone.lock().unwrap().clone();
    assert_that!(undone, elements_are![eq("car"), eq("hotel"), eq("flight")]);

    let journal = env.storage.get_journal(&invocation_id).await.unwrap();
    let compensations: Vec<_> = journal
        .iter()
        .filter_map(|(_, entry)| match &entry.entry {
            Entry::Run { name } if name.starts_with("compensate: ") => Some(name.to_string()),
            _ => None,
        })
        .collect();
    assert_that!(
        compensations,
        elements_are![
            eq("compensate: car"),
            eq("compensate: hotel"),
            eq("compensate: flight")
        ]
    );
}

#[test(tokio::test(flavor = "multi_thread"))]
async fn awakeable_resolution_survives_a_crash() {
    let charges = Arc::new(AtomicU32::new(0));
    let (published_tx, mut published_rx) = mpsc::unbounded_channel::<String>();

    let registry = Registry::new().with_service(
        ServiceDefinition::service("Approvals").with_handler(
            "request",
            handler({
                let charges = Arc::clone(&charges);
                move |ctx: Context, ()| {
                    let charges = Arc::clone(&charges);
                    let published_tx = published_tx.clone();
                    async move {
                        ctx.run("reserve", move || {
                            let charges = Arc::clone(&charges);
                            async move {
                                charges.fetch_add(1, Ordering::SeqCst);
                                Ok::<_, HandlerError>(())
                            }
                        })
                        .await?;

                        let (awakeable_id, approval) = ctx.awakeable::<String>().await?;
                        let awakeable_id = awakeable_id.to_string();
                        ctx.run("publish", move || {
                            let published_tx = published_tx.clone();
                            let awakeable_id = awakeable_id.clone();
                            async move {
                                let _ = published_tx.send(awakeable_id);
                                Ok::<_, HandlerError>(())
                            }
                        })
                        .await?;

                        let approval = approval.await?;
                        Ok::<_, HandlerError>(approval)
                    }
                }
            }),
        ),
    );
    let env = TestEnv::start(registry);

    let invocation_id = env
        .handle
        .invoke(request(
            InvocationTarget::service("Approvals", "request"),
            Bytes::new(),
        ))
        .await
        .unwrap();
    let awakeable_id = tokio::time::timeout(TIMEOUT, published_rx.recv())
        .await
        .unwrap()
        .unwrap();
    env.wait_for_status(invocation_id, |status| {
        matches!(status, InvocationStatus::Suspended { .. })
    })
    .await;

    let env = env.restart().await;
    env.handle
        .resolve_awakeable(&awakeable_id, json_bytes(&"approved"))
        .await
        .unwrap();
    // only the first resolution counts
    env.handle
        .resolve_awakeable(&awakeable_id, json_bytes(&"rejected"))
        .await
        .unwrap();

    let approval: String = success(env.outcome(invocation_id).await);
    assert_that!(approval, eq("approved"));
    assert_that!(charges.load(Ordering::SeqCst), eq(1));
    assert!(published_rx.try_recv().is_err());
}

#[test(tokio::test(flavor = "multi_thread"))]
async fn exclusive_handlers_run_one_at_a_time_per_key() {
    let active = Arc::new(AtomicUsize::new(0));
    let max_active = Arc::new(AtomicUsize::new(0));
    let (published_tx, mut published_rx) = mpsc::unbounded_channel::<String>();

    let registry = Registry::new().with_service(
        ServiceDefinition::virtual_object("Counter")
            .with_handler(
                "add",
                handler({
                    let active = Arc::clone(&active);
                    let max_active = Arc::clone(&max_active);
                    move |ctx: Context, ()| {
                        let active = Arc::clone(&active);
                        let max_active = Arc::clone(&max_active);
                        async move {
                            let count = ctx.get::<u32>("count").await?.unwrap_or_default();
                            ctx.run("work", move || {
                                let active = Arc::clone(&active);
                                let max_active = Arc::clone(&max_active);
                                async move {
                                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                                    max_active.fetch_max(now, Ordering::SeqCst);
                                    tokio::time::sleep(Duration::from_millis(20)).await;
                                    active.fetch_sub(1, Ordering::SeqCst);
                                    Ok::<_, HandlerError>(())
                                }
                            })
                            .await?;
                            ctx.set("count", &(count + 1)).await?;
                            Ok::<_, HandlerError>(count + 1)
                        }
                    }
                }),
            )
            .with_handler(
                "hold",
                handler(move |ctx: Context, ()| {
                    let published_tx = published_tx.clone();
                    async move {
                        let (awakeable_id, release) = ctx.awakeable::<()>().await?;
                        let awakeable_id = awakeable_id.to_string();
                        ctx.run("publish", move || {
                            let published_tx = published_tx.clone();
                            let awakeable_id = awakeable_id.clone();
                            async move {
                                let _ = published_tx.send(awakeable_id);
                                Ok::<_, HandlerError>(())
                            }
                        })
                        .await?;
                        release.await?;
                        Ok::<_, HandlerError>(())
                    }
                }),
            ),
    );
    let env = TestEnv::start(registry);
    let counter = |key: &str, handler_name: &str| {
        request(
            InvocationTarget::virtual_object("Counter", key, handler_name, HandlerType::Exclusive),
            Bytes::new(),
        )
    };

    let holder = env.handle.invoke(counter("a", "hold")).await.unwrap();
    let awakeable_id = tokio::time::timeout(TIMEOUT, published_rx.recv())
        .await
        .unwrap()
        .unwrap();

    let mut queued = Vec::new();
    for _ in 0..5 {
        queued.push(env.handle.invoke(counter("a", "add")).await.unwrap());
    }
    for invocation_id in &queued {
        assert_that!(env.status(*invocation_id).await, eq(InvocationStatus::Inboxed));
    }

    // other keys are not blocked
    let other = env.handle.invoke(counter("b", "add")).await.unwrap();
    let count: u32 = success(env.outcome(other).await);
    assert_that!(count, eq(1));

    env.handle
        .resolve_awakeable(&awakeable_id, json_bytes(&()))
        .await
        .unwrap();
    let () = success(env.outcome(holder).await);

    let mut counts = Vec::new();
    for invocation_id in queued {
        counts.push(success::<u32>(env.outcome(invocation_id).await));
    }
    assert_that!(counts, elements_are![eq(1), eq(2), eq(3), eq(4), eq(5)]);
    assert_that!(max_active.load(Ordering::SeqCst), eq(1));

    let stored = env
        .storage
        .get_user_state(&ServiceId::new("Counter", "a"), "count")
        .await
        .unwrap();
    assert_that!(stored, some(eq(json_bytes(&5))));
}

#[test(tokio::test(flavor = "multi_thread"))]
async fn interrupted_step_runs_again_after_a_crash() {
    let runs = Arc::new(AtomicU32::new(0));
    let (started_tx, mut started_rx) = mpsc::unbounded_channel::<u32>();

    let registry = Registry::new().with_service(ServiceDefinition::service("Payments").with_handler(
        "pay",
        handler({
            let runs = Arc::clone(&runs);
            move |ctx: Context, ()| {
                let runs = Arc::clone(&runs);
                let started_tx = started_tx.clone();
                async move {
                    let receipt: String = ctx
                        .run("charge", move || {
                            let runs = Arc::clone(&runs);
                            let started_tx = started_tx.clone();
                            async move {
                                let run = runs.fetch_add(1, Ordering::SeqCst) + 1;
                                let _ = started_tx.send(run);
                                if run == 1 {
                                    std::future::pending::<()>().await;
                                }
                                Ok::<_, HandlerError>(format!("receipt-{run}"))
                            }
                        })
                        .await?;
                    Ok::<_, HandlerError>(receipt)
                }
            }
        }),
    ));
    let env = TestEnv::start(registry);

    let invocation_id = env
        .handle
        .invoke(request(
            InvocationTarget::service("Payments", "pay"),
            Bytes::new(),
        ))
        .await
        .unwrap();
    let first = tokio::time::timeout(TIMEOUT, started_rx.recv())
        .await
        .unwrap();
    assert_that!(first, some(eq(1)));

    // the step is journaled but has no result yet
    let journal = env.storage.get_journal(&invocation_id).await.unwrap();
    assert_that!(
        journal.get(0).map(|entry| entry.entry.clone()),
        some(eq(Entry::Run {
            name: "charge".into()
        }))
    );
    assert_that!(journal.get(0).and_then(|entry| entry.result.clone()), none());

    let env = env.restart().await;

    let receipt: String = success(env.outcome(invocation_id).await);
    assert_that!(receipt, eq("receipt-2"));
    assert_that!(runs.load(Ordering::SeqCst), eq(2));

    let journal = env.storage.get_journal(&invocation_id).await.unwrap();
    assert_that!(journal.len(), eq(1));
    assert_that!(
        journal.get(0).and_then(|entry| entry.result.clone()),
        some(eq(EntryResult::Success(json_bytes(&"receipt-2"))))
    );
}

#[test(tokio::test(flavor = "multi_thread"))]
async fn compensation_drain_resumes_after_a_crash() {
    let hotel_runs = Arc::new(AtomicU32::new(0));
    let flight_runs = Arc::new(AtomicU32::new(0));
    let (started_tx, mut started_rx) = mpsc::unbounded_channel::<()>();

    let registry = Registry::new().with_service(ServiceDefinition::service("Trips").with_handler(
        "book",
        handler({
            let hotel_runs = Arc::clone(&hotel_runs);
            let flight_runs = Arc::clone(&flight_runs);
            move |ctx: Context, ()| {
                let hotel_runs = Arc::clone(&hotel_runs);
                let flight_runs = Arc::clone(&flight_runs);
                let started_tx = started_tx.clone();
                async move {
                    ctx.register_compensation("hotel", move || {
                        let hotel_runs = Arc::clone(&hotel_runs);
                        let started_tx = started_tx.clone();
                        async move {
                            if hotel_runs.fetch_add(1, Ordering::SeqCst) == 0 {
                                let _ = started_tx.send(());
                                std::future::pending::<()>().await;
                            }
                            Ok::<_, HandlerError>(())
                        }
                    });
                    ctx.register_compensation("flight", move || {
                        let flight_runs = Arc::clone(&flight_runs);
                        async move {
                            flight_runs.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, HandlerError>(())
                        }
                    });
                    ctx.run("pay", || async {
                        Err::<(), _>(HandlerError::terminal(codes::BAD_REQUEST, "card declined"))
                    })
                    .await?;
                    Ok::<_, HandlerError>(())
                }
            }
        }),
    ));
    let env = TestEnv::start(registry);

    let invocation_id = env
        .handle
        .invoke(request(InvocationTarget::service("Trips", "book"), Bytes::new()))
        .await
        .unwrap();
    tokio::time::timeout(TIMEOUT, started_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_that!(flight_runs.load(Ordering::SeqCst), eq(1));

    let env = env.restart().await;

    let err = failure(env.outcome(invocation_id).await);
    assert_that!(err.message(), eq("card declined"));
    assert!(err.secondary().is_empty());
    // the completed flight compensation is replayed, the interrupted hotel one runs again
    assert_that!(flight_runs.load(Ordering::SeqCst), eq(1));
    assert_that!(hotel_runs.load(Ordering::SeqCst), eq(2));
}

#[test(tokio::test(flavor = "multi_thread"))]
async fn key_locks_and_inboxes_are_recovered_on_restart() {
    let (published_tx, mut published_rx) = mpsc::unbounded_channel::<String>();

    let registry = Registry::new().with_service(
        ServiceDefinition::virtual_object("Queue")
            .with_handler(
                "push",
                handler(|ctx: Context, ()| async move {
                    let length = ctx.get::<u32>("length").await?.unwrap_or_default() + 1;
                    ctx.set("length", &length).await?;
                    Ok::<_, HandlerError>(length)
                }),
            )
            .with_handler(
                "hold",
                handler(move |ctx: Context, ()| {
                    let published_tx = published_tx.clone();
                    async move {
                        let (awakeable_id, release) = ctx.awakeable::<()>().await?;
                        let awakeable_id = awakeable_id.to_string();
                        ctx.run("publish", move || {
                            let published_tx = published_tx.clone();
                            let awakeable_id = awakeable_id.clone();
                            async move {
                                let _ = published_tx.send(awakeable_id);
                                Ok::<_, HandlerError>(())
                            }
                        })
                        .await?;
                        release.await?;
                        Ok::<_, HandlerError>(())
                    }
                }),
            ),
    );
    let env = TestEnv::start(registry);
    let queue = |handler_name: &str| {
        request(
            InvocationTarget::virtual_object("Queue", "jobs", handler_name, HandlerType::Exclusive),
            Bytes::new(),
        )
    };

    let holder = env.handle.invoke(queue("hold")).await.unwrap();
    let awakeable_id = tokio::time::timeout(TIMEOUT, published_rx.recv())
        .await
        .unwrap()
        .unwrap();
    let first = env.handle.invoke(queue("push")).await.unwrap();
    let second = env.handle.invoke(queue("push")).await.unwrap();
    assert_that!(env.status(first).await, eq(InvocationStatus::Inboxed));

    let env = env.restart().await;

    // the suspended holder still owns the key
    assert_that!(env.status(first).await, eq(InvocationStatus::Inboxed));
    assert_that!(env.status(second).await, eq(InvocationStatus::Inboxed));
    let third = env.handle.invoke(queue("push")).await.unwrap();
    assert_that!(env.status(third).await, eq(InvocationStatus::Inboxed));

    env.handle
        .resolve_awakeable(&awakeable_id, json_bytes(&()))
        .await
        .unwrap();
    let () = success(env.outcome(holder).await);

    let mut lengths = Vec::new();
    for invocation_id in [first, second, third] {
        lengths.push(success::<u32>(env.outcome(invocation_id).await));
    }
    assert_that!(lengths, elements_are![eq(1), eq(2), eq(3)]);
}
