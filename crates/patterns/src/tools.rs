// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::warn;

use waypoint_context::{Context, DurableFuture, HandlerError};
use waypoint_types::identifiers::EntryIndex;

use crate::model::{Message, ToolCall, ToolSpec};

type ToolFn = dyn Fn(Value) -> BoxFuture<'static, Result<Value, HandlerError>> + Send + Sync;

#[derive(Clone)]
struct Tool {
    description: String,
    function: Arc<ToolFn>,
}

/// Tools the model may request. Every execution is a journaled step named `tool: <name>`.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Tool>,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.tools.keys()).finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool<F, Fut>(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        function: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.tools.insert(
            name.into(),
            Tool {
                description: description.into(),
                function: Arc::new(move |arguments| function(arguments).boxed()),
            },
        );
        self
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools
            .iter()
            .map(|(name, tool)| ToolSpec {
                name: name.clone(),
                description: tool.description.clone(),
            })
            .collect()
    }

    /// Starts the tool requested by `call` without awaiting it.
    ///
    /// Unknown tools don't fail the invocation: the model is told about its mistake through
    /// the tool result instead.
    pub fn invoke(&self, ctx: &Context, call: &ToolCall) -> PendingToolCall {
        let future = match self.tools.get(&call.name) {
            Some(tool) => {
                let function = Arc::clone(&tool.function);
                let arguments = call.arguments.clone();
                ctx.run(format!("tool: {}", call.name), move || {
                    function(arguments.clone())
                })
            }
            None => {
                warn!("Model requested unknown tool '{}'", call.name);
                let message = Value::String(format!("tool '{}' does not exist", call.name));
                ctx.run(format!("tool: {}", call.name), move || {
                    let message = message.clone();
                    async move { Ok(message) }
                })
            }
        };

        PendingToolCall {
            tool_call_id: call.id.clone(),
            future,
        }
    }
}

/// A started tool execution, identified by the journal position of its step.
#[derive(Debug)]
pub struct PendingToolCall {
    pub tool_call_id: String,
    pub future: DurableFuture<Value>,
}

impl PendingToolCall {
    pub fn journal_index(&self) -> EntryIndex {
        self.future.index()
    }
}

/// Awaits `pending` together and turns their results into tool messages, in call order.
pub async fn collect_tool_results(
    ctx: &Context,
    pending: Vec<PendingToolCall>,
) -> Result<Vec<Message>, HandlerError> {
    let (ids, futures): (Vec<_>, Vec<_>) = pending
        .into_iter()
        .map(|call| (call.tool_call_id, call.future))
        .unzip();
    let results = ctx.all(futures).await?;
    Ok(ids
        .into_iter()
        .zip(results)
        .map(|(id, result)| {
            let content = match result {
                Value::String(text) => text,
                other => other.to_string(),
            };
            Message::tool_result(id, content)
        })
        .collect())
}
