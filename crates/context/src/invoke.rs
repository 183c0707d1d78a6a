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

use bytes::Bytes;
use tracing::{debug, error, warn};

use waypoint_types::identifiers::EntryIndex;
use waypoint_types::invocation::ResponseResult;

use crate::Context;
use crate::error::{ErrorKind, HandlerError};
use crate::handler::Handler;

/// How a single execution attempt of an invocation ended.
#[derive(Debug)]
pub enum InvocationOutcome {
    /// The invocation reached its final result.
    Completed(ResponseResult),
    /// The invocation released its task and waits for one of these entries to complete.
    Suspended(BTreeSet<EntryIndex>),
    /// The attempt failed with a transient error, the invocation should be retried.
    Retry(HandlerError),
}

/// Executes one attempt of an invocation: loads the journal, runs the handler replaying the
/// journaled operations, and rolls back the registered compensations if the handler fails
/// terminally or is cancelled.
pub async fn invoke(
    handler: Arc<dyn Handler>,
    ctx: Context,
    argument: Bytes,
) -> InvocationOutcome {
    if let Err(err) = ctx.load_journal().await {
        return InvocationOutcome::Retry(err);
    }

    let result = handler.handle(ctx.clone(), argument).await;
    if let Some(waiting_on) = ctx.suspended_on() {
        return suspended(waiting_on);
    }

    let err = match result {
        Ok(output) => return InvocationOutcome::Completed(ResponseResult::Success(output)),
        Err(err) => err,
    };

    match err.kind() {
        ErrorKind::Terminal(_) | ErrorKind::Cancelled => {
            let failure = err.to_invocation_error();
            debug!("Invocation failed with {failure}, running compensations");
            match ctx.run_compensations().await {
                Ok(secondary) => InvocationOutcome::Completed(ResponseResult::Failure(
                    failure.with_secondary(secondary),
                )),
                Err(interruption) => interrupted(&ctx, interruption),
            }
        }
        _ => interrupted(&ctx, err),
    }
}

fn interrupted(ctx: &Context, err: HandlerError) -> InvocationOutcome {
    match err.kind() {
        ErrorKind::ReplayMismatch(mismatch) => {
            error!("Handler is not deterministic: {mismatch}");
            InvocationOutcome::Completed(ResponseResult::Failure(err.to_invocation_error()))
        }
        ErrorKind::Suspended => suspended(ctx.suspended_on().unwrap_or_default()),
        _ => {
            warn!("Invocation attempt failed: {err:#}");
            InvocationOutcome::Retry(err)
        }
    }
}

fn suspended(waiting_on: BTreeSet<EntryIndex>) -> InvocationOutcome {
    if waiting_on.is_empty() {
        // nothing could ever resume it
        return InvocationOutcome::Retry(HandlerError::from(anyhow::anyhow!(
            "invocation suspended without awaiting any entry"
        )));
    }
    InvocationOutcome::Suspended(waiting_on)
}
