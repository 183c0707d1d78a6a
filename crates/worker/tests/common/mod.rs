// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use waypoint_storage::{MemoryStorage, Storage};
use waypoint_test_util::eventually;
use waypoint_types::config::{WorkerOptions, WorkerOptionsBuilder};
use waypoint_types::errors::InvocationError;
use waypoint_types::identifiers::InvocationId;
use waypoint_types::invocation::{InvocationStatus, ResponseResult};
use waypoint_types::retries::RetryPolicy;
use waypoint_worker::{Error, Registry, Worker, WorkerHandle};

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn test_options() -> WorkerOptions {
    WorkerOptionsBuilder::default()
        .invocation_retry_policy(RetryPolicy::fixed_delay(Duration::from_millis(10), Some(5)))
        .step_retry_policy(RetryPolicy::fixed_delay(Duration::from_millis(5), Some(3)))
        .compensation_retry_policy(RetryPolicy::fixed_delay(Duration::from_millis(5), Some(3)))
        .suspension_timeout_duration(Duration::from_millis(100))
        .build()
        .unwrap()
}

/// A worker running in the background. Stopping it aborts its invocation tasks without
/// recording anything, like a crash of the process would.
pub struct TestEnv {
    pub handle: WorkerHandle,
    pub storage: Arc<dyn Storage>,
    registry: Registry,
    options: WorkerOptions,
    shutdown: CancellationToken,
    worker: JoinHandle<Result<(), Error>>,
}

impl TestEnv {
    pub fn start(registry: Registry) -> Self {
        Self::start_with(test_options(), Arc::new(MemoryStorage::new()), registry)
    }

    pub fn start_with(
        options: WorkerOptions,
        storage: Arc<dyn Storage>,
        registry: Registry,
    ) -> Self {
        let worker = Worker::new(&options, Arc::clone(&storage), registry.clone());
        let handle = worker.handle();
        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(worker.run(shutdown.clone()));
        Self {
            handle,
            storage,
            registry,
            options,
            shutdown,
            worker,
        }
    }

    pub async fn crash(self) -> (WorkerOptions, Arc<dyn Storage>, Registry) {
        self.shutdown.cancel();
        self.worker
            .await
            .expect("worker must not panic")
            .expect("worker must stop cleanly");
        (self.options, self.storage, self.registry)
    }

    /// Crashes the worker and starts a new one on the same storage.
    pub async fn restart(self) -> Self {
        let (options, storage, registry) = self.crash().await;
        Self::start_with(options, storage, registry)
    }

    pub async fn status(&self, invocation_id: InvocationId) -> InvocationStatus {
        self.handle
            .status(invocation_id)
            .await
            .expect("invocation must exist")
            .status
    }

    pub async fn wait_for_status(
        &self,
        invocation_id: InvocationId,
        expected: fn(&InvocationStatus) -> bool,
    ) -> InvocationStatus {
        eventually("invocation status", TIMEOUT, move || async move {
            let status = self.status(invocation_id).await;
            expected(&status).then_some(status)
        })
        .await
    }

    pub async fn outcome(&self, invocation_id: InvocationId) -> ResponseResult {
        tokio::time::timeout(TIMEOUT, self.handle.attach(invocation_id))
            .await
            .expect("invocation must complete in time")
            .expect("invocation must exist")
    }
}

pub fn success<T: DeserializeOwned>(outcome: ResponseResult) -> T {
    match outcome {
        ResponseResult::Success(value) => waypoint_test_util::from_json_bytes(&value),
        ResponseResult::Failure(err) => panic!("expected a success, got {err}"),
    }
}

pub fn failure(outcome: ResponseResult) -> InvocationError {
    match outcome {
        ResponseResult::Success(value) => panic!("expected a failure, got {value:?}"),
        ResponseResult::Failure(err) => err,
    }
}
