// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Provider independent model interface.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Set on tool results, the id of the tool call they answer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Set on assistant messages requesting tools.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::new(Role::Tool, content)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// Tool offered to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
}

impl ModelRequest {
    pub fn prompt(prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::user(prompt)],
            tools: Vec::new(),
        }
    }

    /// Content of the last user message.
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
            .map(|message| message.content.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl ModelResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            content: String::new(),
            tool_calls,
        }
    }
}

/// Language model backend. Errors are treated as transient.
#[async_trait]
pub trait ModelClient: Send + Sync + 'static {
    async fn complete(&self, request: ModelRequest) -> anyhow::Result<ModelResponse>;
}

struct Rule {
    contains: String,
    delay: Duration,
    responses: VecDeque<ModelResponse>,
}

/// [`ModelClient`] answering from a script, for tests and demos.
///
/// A request is answered by the first rule whose text occurs in the last user message. Rules
/// with several responses hand them out in order and repeat the last one. Requests matching
/// no rule are echoed back.
#[derive(Clone, Default)]
pub struct ScriptedModel {
    inner: Arc<Mutex<ScriptedModelInner>>,
}

#[derive(Default)]
struct ScriptedModelInner {
    rules: Vec<Rule>,
    failures: usize,
    requests: Vec<ModelRequest>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, contains: impl Into<String>, response: ModelResponse) -> Self {
        self.respond_after(contains, Duration::ZERO, vec![response])
    }

    pub fn respond_after(
        self,
        contains: impl Into<String>,
        delay: Duration,
        responses: Vec<ModelResponse>,
    ) -> Self {
        self.inner.lock().rules.push(Rule {
            contains: contains.into(),
            delay,
            responses: responses.into(),
        });
        self
    }

    /// Makes the next `count` requests fail.
    pub fn fail_next(&self, count: usize) {
        self.inner.lock().failures = count;
    }

    /// Every request received so far, failed ones included.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.inner.lock().requests.clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn complete(&self, request: ModelRequest) -> anyhow::Result<ModelResponse> {
        let (delay, response) = {
            let mut inner = self.inner.lock();
            inner.requests.push(request.clone());
            if inner.failures > 0 {
                inner.failures -= 1;
                anyhow::bail!("model provider unavailable");
            }

            let prompt = request.last_user_message().unwrap_or_default();
            match inner
                .rules
                .iter_mut()
                .find(|rule| prompt.contains(rule.contains.as_str()))
            {
                Some(rule) => {
                    let response = if rule.responses.len() > 1 {
                        rule.responses.pop_front()
                    } else {
                        rule.responses.front().cloned()
                    };
                    (rule.delay, response.unwrap_or_default())
                }
                None => (Duration::ZERO, ModelResponse::text(prompt)),
            }
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(response)
    }
}
