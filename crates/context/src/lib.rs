// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The handler side of durable execution.
//!
//! A [`Context`] journals every operation issued by a handler and replays the journal when
//! the invocation is executed again, after a crash, a retry or a suspension. [`invoke`] runs
//! one execution attempt and reports how it ended to the scheduler.

mod awakeable;
mod calls;
mod combinators;
mod compensation;
mod context;
mod durable_future;
mod error;
mod handler;
mod invoke;
mod live_journal;
mod run;
mod runtime;
mod sleep;
mod state;

pub use context::{Context, ContextOptions, ContextParams};
pub use durable_future::DurableFuture;
pub use error::{
    CancelledError, ErrorKind, HandlerError, ReplayMismatchError, SuspendedError, TerminalError,
};
pub use handler::{
    Handler, HandlerDefinition, JsonHandler, RawHandler, ServiceDefinition, handler, raw_handler,
};
pub use invoke::{InvocationOutcome, invoke};
pub use live_journal::LiveJournal;
pub use runtime::InvocationRuntime;

#[cfg(test)]
mod tests;
