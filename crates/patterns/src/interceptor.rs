// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Middleware around model calls.
//!
//! An [`InterceptorChain`] is an ordered list of [`Interceptor`]s fixed at construction. The
//! first interceptor sees the request first and the response last; each of them decides
//! whether and how to invoke the rest of the chain through [`Next`].

use std::sync::Arc;
use std::time::Duration;

use bytestring::ByteString;
use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{debug, info};

use waypoint_context::{Context, HandlerError};
use waypoint_types::retries::RetryPolicy;

use crate::model::{ModelClient, ModelRequest, ModelResponse};

pub type ModelFuture = BoxFuture<'static, Result<ModelResponse, HandlerError>>;

pub trait Interceptor: Send + Sync + 'static {
    fn intercept(&self, ctx: Context, request: ModelRequest, next: Next) -> ModelFuture;
}

/// Remainder of the chain after the current interceptor.
#[derive(Clone)]
pub struct Next {
    interceptors: Arc<[Arc<dyn Interceptor>]>,
    position: usize,
    model: Arc<dyn ModelClient>,
}

impl Next {
    pub fn run(self, ctx: Context, request: ModelRequest) -> ModelFuture {
        match self.interceptors.get(self.position).cloned() {
            Some(interceptor) => {
                let next = Next {
                    position: self.position + 1,
                    ..self
                };
                interceptor.intercept(ctx, request, next)
            }
            None => {
                let model = self.model;
                async move { model.complete(request).await.map_err(HandlerError::from) }.boxed()
            }
        }
    }
}

#[derive(Clone)]
pub struct InterceptorChain {
    interceptors: Arc<[Arc<dyn Interceptor>]>,
    model: Arc<dyn ModelClient>,
}

impl InterceptorChain {
    pub fn new(model: Arc<dyn ModelClient>, interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        Self {
            interceptors: interceptors.into(),
            model,
        }
    }

    /// Logs every call and journals it as a step retried at most three times.
    pub fn durable(model: Arc<dyn ModelClient>) -> Self {
        Self::new(
            model,
            vec![
                Arc::new(LoggingInterceptor),
                Arc::new(DurableModelCalls::default()),
            ],
        )
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn call(&self, ctx: &Context, request: ModelRequest) -> ModelFuture {
        Next {
            interceptors: Arc::clone(&self.interceptors),
            position: 0,
            model: Arc::clone(&self.model),
        }
        .run(ctx.clone(), request)
    }

    /// Sends a single user message and returns the text of the answer.
    pub fn prompt(
        &self,
        ctx: &Context,
        prompt: impl Into<String>,
    ) -> BoxFuture<'static, Result<String, HandlerError>> {
        self.call(ctx, ModelRequest::prompt(prompt))
            .map(|response| response.map(|response| response.content))
            .boxed()
    }
}

/// Runs the rest of the chain as a journaled step.
///
/// Interceptors placed after this one only execute while the step is live; replays return
/// the journaled response without reaching them.
#[derive(Debug, Clone)]
pub struct DurableModelCalls {
    step_name: ByteString,
    retry_policy: RetryPolicy,
}

impl DurableModelCalls {
    pub fn new(step_name: impl Into<ByteString>, retry_policy: RetryPolicy) -> Self {
        Self {
            step_name: step_name.into(),
            retry_policy,
        }
    }
}

impl Default for DurableModelCalls {
    fn default() -> Self {
        Self::new(
            "model call",
            RetryPolicy::exponential(
                Duration::from_millis(100),
                2.0,
                Some(3),
                Some(Duration::from_secs(2)),
            ),
        )
    }
}

impl Interceptor for DurableModelCalls {
    fn intercept(&self, ctx: Context, request: ModelRequest, next: Next) -> ModelFuture {
        let step_ctx = ctx.clone();
        ctx.run_with_policy(
            self.step_name.clone(),
            self.retry_policy.clone(),
            move || next.clone().run(step_ctx.clone(), request.clone()),
        )
        .boxed()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingInterceptor;

impl Interceptor for LoggingInterceptor {
    fn intercept(&self, ctx: Context, request: ModelRequest, next: Next) -> ModelFuture {
        info!(
            invocation.id = %ctx.invocation_id(),
            messages = request.messages.len(),
            tools = request.tools.len(),
            "Calling model"
        );
        let call = next.run(ctx, request);
        async move {
            let response = call.await;
            match &response {
                Ok(response) => debug!(tool_calls = response.tool_calls.len(), "Model answered"),
                Err(err) => debug!("Model call failed: {err}"),
            }
            response
        }
        .boxed()
    }
}
