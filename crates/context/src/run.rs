// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::future::Future;

use bytes::Bytes;
use bytestring::ByteString;
use futures::FutureExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use waypoint_types::errors::{InvocationError, codes};
use waypoint_types::identifiers::EntryIndex;
use waypoint_types::journal::{Entry, EntryHeader, EntryResult, EntryType};
use waypoint_types::retries::RetryPolicy;

use crate::Context;
use crate::durable_future::{CancelHandle, DurableFuture, decode};
use crate::error::{CancelledError, ErrorKind, HandlerError, TerminalError};

enum StepOutcome<T> {
    Success(T),
    Failure(InvocationError),
    Aborted,
}

impl Context {
    /// Executes `operation` as a journaled step with the default step retry policy.
    ///
    /// Once the step outcome is journaled, the operation is never executed again: replays
    /// return the recorded value or failure. If the process crashes after the step started
    /// but before its outcome was journaled, the step runs again on recovery.
    pub fn run<T, F, Fut>(&self, name: impl Into<ByteString>, operation: F) -> DurableFuture<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, HandlerError>> + Send + 'static,
    {
        self.run_with_policy(name, self.inner.options.step_retry_policy.clone(), operation)
    }

    /// Like [`Context::run`], retrying transient failures according to `policy`. Terminal
    /// errors are never retried.
    pub fn run_with_policy<T, F, Fut>(
        &self,
        name: impl Into<ByteString>,
        policy: RetryPolicy,
        operation: F,
    ) -> DurableFuture<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, HandlerError>> + Send + 'static,
    {
        let token = self.inner.cancellation.child_token();
        let cancel = CancelHandle::Step(token.clone());
        self.step(name.into(), policy, token, cancel, operation)
    }

    /// Journaled step stopped only through `token`.
    pub(crate) fn step<T, F, Fut>(
        &self,
        name: ByteString,
        policy: RetryPolicy,
        token: CancellationToken,
        cancel: CancelHandle,
        mut operation: F,
    ) -> DurableFuture<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, HandlerError>> + Send + 'static,
    {
        let index = self.reserve_index();
        let ctx = self.clone();
        let fut = async move {
            let header = EntryHeader::new(EntryType::Run, name.clone());
            match ctx.replay(index, &header)? {
                Some(journaled) => {
                    if let Some(result) = journaled.result {
                        return decode(result);
                    }
                    debug!(
                        journal.index = index,
                        "Step '{name}' has no journaled outcome, executing it again"
                    );
                }
                None => {
                    ctx.append_entry(index, Entry::Run { name: name.clone() })
                        .await?
                }
            }

            let outcome = ctx
                .execute_step(&name, index, policy, &token, &mut operation)
                .await?;
            match outcome {
                StepOutcome::Success(value) => {
                    let serialized = Bytes::from(serde_json::to_vec(&value)?);
                    ctx.append_completion(index, EntryResult::Success(serialized))
                        .await?;
                    Ok(value)
                }
                StepOutcome::Failure(err) => {
                    ctx.append_completion(index, EntryResult::Failure(err.clone()))
                        .await?;
                    Err(TerminalError::from(err).into())
                }
                StepOutcome::Aborted => {
                    ctx.append_completion(index, EntryResult::Aborted).await?;
                    Err(CancelledError.into())
                }
            }
        };
        DurableFuture::new(index, cancel, fut.boxed())
    }

    async fn execute_step<T, F, Fut>(
        &self,
        name: &ByteString,
        index: EntryIndex,
        policy: RetryPolicy,
        token: &CancellationToken,
        operation: &mut F,
    ) -> Result<StepOutcome<T>, HandlerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, HandlerError>>,
    {
        self.ensure_not_suspended()?;
        let _in_flight = self.step_started();
        let mut retry_iter = policy.into_iter();

        loop {
            let attempt = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(StepOutcome::Aborted),
                result = operation() => result,
            };
            let err = match attempt {
                Ok(value) => return Ok(StepOutcome::Success(value)),
                Err(err) => err,
            };
            match err.kind() {
                ErrorKind::Terminal(failure) => {
                    debug!(journal.index = index, "Step '{name}' failed terminally: {failure}");
                    return Ok(StepOutcome::Failure(failure.clone()));
                }
                ErrorKind::Cancelled => return Ok(StepOutcome::Aborted),
                ErrorKind::ReplayMismatch(_) | ErrorKind::Suspended => return Err(err),
                ErrorKind::Transient => {}
            }

            match retry_iter.next() {
                Some(pause) => {
                    warn!(
                        journal.index = index,
                        "Step '{name}' failed, retrying in {}: {err:#}",
                        humantime::format_duration(pause)
                    );
                    tokio::select! {
                        _ = token.cancelled() => return Ok(StepOutcome::Aborted),
                        _ = tokio::time::sleep(pause) => {},
                    }
                }
                None => {
                    warn!(
                        journal.index = index,
                        "Step '{name}' failed after {} attempts: {err:#}",
                        retry_iter.attempts()
                    );
                    return Ok(StepOutcome::Failure(InvocationError::new(
                        codes::RETRIES_EXHAUSTED,
                        format!("step '{name}' exhausted its retries: {err:#}"),
                    )));
                }
            }
        }
    }
}
