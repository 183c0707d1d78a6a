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
use std::fmt;

use waypoint_types::errors::{InvocationError, InvocationErrorCode, codes};
use waypoint_types::identifiers::EntryIndex;
use waypoint_types::journal::EntryHeader;

/// Error returned by handlers and by every operation of the [`Context`](crate::Context).
///
/// Any error type converts into it with `?`. Unless it is one of the marker errors of this
/// module, it counts as transient: the failing step, or the whole invocation, is retried.
pub struct HandlerError(anyhow::Error);

impl<E: Into<anyhow::Error>> From<E> for HandlerError {
    fn from(value: E) -> Self {
        Self(value.into())
    }
}

impl fmt::Debug for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// How the runtime reacts to a [`HandlerError`].
#[derive(Debug)]
pub enum ErrorKind<'a> {
    /// Not retried, fails the step or the invocation.
    Terminal(&'a InvocationError),
    /// The invocation, or the branch, was cancelled.
    Cancelled,
    /// The handler diverged from its journal.
    ReplayMismatch(&'a ReplayMismatchError),
    /// The invocation gave up its task while waiting for a completion.
    Suspended,
    Transient,
}

impl HandlerError {
    pub fn terminal(code: impl Into<InvocationErrorCode>, message: impl Into<String>) -> Self {
        TerminalError::new_with_code(code, message).into()
    }

    pub fn kind(&self) -> ErrorKind<'_> {
        if let Some(terminal) = self.0.downcast_ref::<TerminalError>() {
            ErrorKind::Terminal(&terminal.0)
        } else if self.0.is::<CancelledError>() {
            ErrorKind::Cancelled
        } else if let Some(mismatch) = self.0.downcast_ref::<ReplayMismatchError>() {
            ErrorKind::ReplayMismatch(mismatch)
        } else if self.0.is::<SuspendedError>() {
            ErrorKind::Suspended
        } else {
            ErrorKind::Transient
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Terminal(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind(), ErrorKind::Cancelled)
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self.kind(), ErrorKind::Suspended)
    }

    /// The terminal value recorded for this error in the journal or in the invocation
    /// outcome.
    pub fn to_invocation_error(&self) -> InvocationError {
        match self.kind() {
            ErrorKind::Terminal(err) => err.clone(),
            ErrorKind::Cancelled => InvocationError::new(codes::ABORTED, "cancelled"),
            ErrorKind::ReplayMismatch(mismatch) => {
                InvocationError::new(codes::JOURNAL_MISMATCH, mismatch.to_string())
            }
            ErrorKind::Suspended => InvocationError::internal("suspended"),
            ErrorKind::Transient => InvocationError::internal(format!("{:#}", self.0)),
        }
    }

    pub fn into_inner(self) -> anyhow::Error {
        self.0
    }
}

/// Error which is never retried. The runtime records it as the outcome of the step or the
/// invocation it surfaces from.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct TerminalError(InvocationError);

impl TerminalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self::new_with_code(codes::INTERNAL, message)
    }

    pub fn new_with_code(code: impl Into<InvocationErrorCode>, message: impl Into<String>) -> Self {
        Self(InvocationError::new(code, message))
    }

    pub fn code(&self) -> InvocationErrorCode {
        self.0.code()
    }

    pub fn message(&self) -> &str {
        self.0.message()
    }

    pub fn into_inner(self) -> InvocationError {
        self.0
    }
}

impl From<InvocationError> for TerminalError {
    fn from(value: InvocationError) -> Self {
        Self(value)
    }
}

/// Raised by pending operations once the invocation, or the branch they belong to, is
/// cancelled.
#[derive(Debug, Clone, Copy, Default, thiserror::Error)]
#[error("cancelled")]
pub struct CancelledError;

/// The handler issued an operation that doesn't match what the journal recorded at the same
/// position, which means the handler code is not deterministic.
#[derive(Debug, Clone, thiserror::Error)]
#[error("journal mismatch at index {index}: journal has {journaled}, handler issued {issued}")]
pub struct ReplayMismatchError {
    pub index: EntryIndex,
    pub journaled: EntryHeader,
    pub issued: EntryHeader,
}

/// The invocation stopped waiting in memory for the given entries.
#[derive(Debug, Clone, Default, thiserror::Error)]
#[error("suspended waiting on entries {waiting_on:?}")]
pub struct SuspendedError {
    pub waiting_on: BTreeSet<EntryIndex>,
}
