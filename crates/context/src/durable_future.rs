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
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use waypoint_types::identifiers::EntryIndex;
use waypoint_types::journal::EntryResult;

use crate::error::{CancelledError, HandlerError, TerminalError};

/// How a losing branch of [`Context::any`](crate::Context::any) is stopped.
#[derive(Debug, Clone, Default)]
pub(crate) enum CancelHandle {
    /// Nothing to stop, the branch is just dropped.
    #[default]
    Detach,
    /// An executing step, stopped through its token.
    Step(CancellationToken),
    /// A call, stopped by cancelling the callee invocation.
    Call,
}

/// The pending result of a journaled operation.
///
/// It can be awaited directly or handed to the combinators of the [`Context`](crate::Context).
#[must_use = "durable futures do nothing unless polled"]
pub struct DurableFuture<T> {
    index: EntryIndex,
    cancel: CancelHandle,
    fut: BoxFuture<'static, Result<T, HandlerError>>,
}

impl<T> DurableFuture<T> {
    pub(crate) fn new(
        index: EntryIndex,
        cancel: CancelHandle,
        fut: BoxFuture<'static, Result<T, HandlerError>>,
    ) -> Self {
        Self { index, cancel, fut }
    }

    /// Journal index of the operation.
    pub fn index(&self) -> EntryIndex {
        self.index
    }

    pub(crate) fn cancel_handle(&self) -> &CancelHandle {
        &self.cancel
    }

    pub fn map<U, F>(self, f: F) -> DurableFuture<U>
    where
        T: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let fut = self.fut;
        DurableFuture {
            index: self.index,
            cancel: self.cancel,
            fut: async move { fut.await.map(f) }.boxed(),
        }
    }
}

impl<T> Future for DurableFuture<T> {
    type Output = Result<T, HandlerError>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        self.get_mut().fut.as_mut().poll(cx)
    }
}

impl<T> fmt::Debug for DurableFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DurableFuture")
            .field("index", &self.index)
            .field("cancel", &self.cancel)
            .finish_non_exhaustive()
    }
}

/// Turns a journaled completion into the value seen by the handler.
pub(crate) fn decode<T: DeserializeOwned>(result: EntryResult) -> Result<T, HandlerError> {
    match result {
        EntryResult::Success(value) => Ok(serde_json::from_slice(&value)?),
        EntryResult::Failure(err) => Err(TerminalError::from(err).into()),
        EntryResult::Aborted => Err(CancelledError.into()),
    }
}
