// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use tracing::debug;

use waypoint_context::{Context, HandlerError};
use waypoint_types::errors::codes;

use crate::interceptor::InterceptorChain;
use crate::model::{Message, ModelRequest};
use crate::tools::{PendingToolCall, ToolRegistry, collect_tool_results};

/// Model and tool loop: the model is called until it answers without requesting tools.
///
/// Tools requested in the same turn execute concurrently.
#[derive(Clone)]
pub struct AgentLoop {
    chain: InterceptorChain,
    tools: ToolRegistry,
    max_turns: usize,
}

impl AgentLoop {
    pub const DEFAULT_MAX_TURNS: usize = 10;

    pub fn new(chain: InterceptorChain, tools: ToolRegistry) -> Self {
        Self {
            chain,
            tools,
            max_turns: Self::DEFAULT_MAX_TURNS,
        }
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns;
        self
    }

    /// Runs the loop on `messages`, appending every model answer and tool result to it.
    /// Returns the final answer.
    pub async fn run(
        &self,
        ctx: &Context,
        messages: &mut Vec<Message>,
    ) -> Result<String, HandlerError> {
        for turn in 0..self.max_turns {
            let request = ModelRequest {
                messages: messages.clone(),
                tools: self.tools.specs(),
            };
            let response = self.chain.call(ctx, request).await?;

            if response.tool_calls.is_empty() {
                messages.push(Message::assistant(response.content.clone()));
                return Ok(response.content);
            }

            debug!(turn, "Model requested {} tool calls", response.tool_calls.len());
            let pending: Vec<PendingToolCall> = response
                .tool_calls
                .iter()
                .map(|call| self.tools.invoke(ctx, call))
                .collect();
            for call in &pending {
                debug!(
                    journal.index = call.journal_index(),
                    "Tool call {} started",
                    call.tool_call_id
                );
            }
            messages.push(Message {
                tool_calls: response.tool_calls,
                ..Message::assistant(response.content)
            });
            messages.extend(collect_tool_results(ctx, pending).await?);
        }

        Err(HandlerError::terminal(
            codes::ABORTED,
            format!("agent gave no answer within {} turns", self.max_turns),
        ))
    }
}
