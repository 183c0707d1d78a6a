// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fmt;
use std::future::Future;

use bytestring::ByteString;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use waypoint_types::errors::InvocationError;

use crate::Context;
use crate::durable_future::CancelHandle;
use crate::error::HandlerError;

type CompensationFn = Box<dyn FnMut() -> BoxFuture<'static, Result<(), HandlerError>> + Send>;

/// Undo action registered by a handler after a successful forward step.
pub(crate) struct Compensation {
    name: ByteString,
    action: CompensationFn,
}

impl fmt::Debug for Compensation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Compensation")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Registers an undo action, to run if the invocation ends with a terminal failure or is
    /// cancelled.
    ///
    /// Compensations run in reverse registration order, each as a journaled step named
    /// `compensate: <name>`. The registry lives in memory: a replay registers the same
    /// compensations again as the handler re-executes.
    pub fn register_compensation<F, Fut>(&self, name: impl Into<ByteString>, mut action: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.inner.compensations.lock().push(Compensation {
            name: name.into(),
            action: Box::new(move || action().boxed()),
        });
    }

    /// Compensations registered so far and not yet run.
    pub fn pending_compensations(&self) -> usize {
        self.inner.compensations.lock().len()
    }

    /// Runs the registered compensations, last registered first.
    ///
    /// A compensation failing terminally doesn't stop the others; its error is returned to be
    /// attached to the invocation failure. Compensations run regardless of the cancellation
    /// of the invocation.
    pub(crate) async fn run_compensations(&self) -> Result<Vec<InvocationError>, HandlerError> {
        let mut failures = Vec::new();
        debug!("Rolling back {} compensations", self.pending_compensations());
        loop {
            let next = self.inner.compensations.lock().pop();
            let Some(mut compensation) = next else {
                break;
            };
            let name = ByteString::from(format!("compensate: {}", compensation.name));
            info!("Running compensation '{}'", compensation.name);

            let step = self.step::<(), _, _>(
                name,
                self.inner.options.compensation_retry_policy.clone(),
                CancellationToken::new(),
                CancelHandle::Detach,
                move || (compensation.action)(),
            );
            match step.await {
                Ok(()) => {}
                Err(err) if err.is_terminal() => {
                    warn!("Compensation failed: {err}");
                    failures.push(err.to_invocation_error());
                }
                Err(err) => return Err(err),
            }
        }
        Ok(failures)
    }
}
