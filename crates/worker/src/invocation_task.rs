// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

use waypoint_context::{Context, Handler, HandlerError, InvocationOutcome, LiveJournal, invoke};
use waypoint_types::errors::InvocationError;
use waypoint_types::identifiers::InvocationId;
use waypoint_types::invocation::ResponseResult;

/// Message sent by an invocation task once its attempt is over.
#[derive(Debug)]
pub(crate) struct InvocationTaskOutput {
    pub(crate) invocation_id: InvocationId,
    pub(crate) attempt: u64,
    pub(crate) outcome: InvocationOutcome,
}

/// Bookkeeping of an attempt which is currently executing.
#[derive(Debug)]
pub(crate) struct RunningInvocation {
    pub(crate) attempt: u64,
    pub(crate) journal: Arc<LiveJournal>,
    pub(crate) cancellation: CancellationToken,
}

/// Runs a single attempt of an invocation.
pub(crate) struct InvocationTask {
    pub(crate) invocation_id: InvocationId,
    pub(crate) attempt: u64,
    /// The handler, or why there is none.
    pub(crate) handler: Result<Arc<dyn Handler>, InvocationError>,
    pub(crate) ctx: Context,
    pub(crate) argument: Bytes,
    pub(crate) output_tx: mpsc::UnboundedSender<InvocationTaskOutput>,
}

impl InvocationTask {
    pub(crate) async fn run(self) {
        trace!(attempt = self.attempt, "Starting invocation attempt");
        let outcome = match self.handler {
            Ok(handler) => AssertUnwindSafe(invoke(handler, self.ctx, self.argument))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    let message = panic_message(panic.as_ref());
                    error!("Handler panicked: {message}");
                    InvocationOutcome::Retry(HandlerError::from(anyhow::anyhow!(
                        "handler panicked: {message}"
                    )))
                }),
            Err(err) => InvocationOutcome::Completed(ResponseResult::Failure(err)),
        };

        // the worker is gone if this fails
        let _ = self.output_tx.send(InvocationTaskOutput {
            invocation_id: self.invocation_id,
            attempt: self.attempt,
            outcome,
        });
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic payload>"
    }
}
