// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Agent patterns built on durable handlers.
//!
//! Model calls go through an [`InterceptorChain`], tools through a [`ToolRegistry`]; both end
//! up as journaled steps, so a crashed or suspended agent resumes without calling the model
//! again for the turns it already completed.

mod agent;
mod interceptor;
mod model;
pub mod services;
mod tools;
mod travel;

pub use agent::AgentLoop;
pub use interceptor::{
    DurableModelCalls, Interceptor, InterceptorChain, LoggingInterceptor, ModelFuture, Next,
};
pub use model::{
    Message, ModelClient, ModelRequest, ModelResponse, Role, ScriptedModel, ToolCall, ToolSpec,
};
pub use services::{Dependencies, services};
pub use tools::{PendingToolCall, ToolRegistry, collect_tool_results};
pub use travel::{InMemoryTravelAgency, ReservationKind, TravelAgency};
