// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Conversational agent with tools, one conversation per key.

use waypoint_context::{Context, HandlerError, ServiceDefinition, handler};

use crate::agent::AgentLoop;
use crate::model::Message;
use crate::services::Dependencies;

pub const SERVICE: &str = "ToolAgent";

const HISTORY: &str = "history";

pub fn definition(deps: &Dependencies) -> ServiceDefinition {
    let agent = AgentLoop::new(deps.durable_chain(), deps.tools.clone());
    ServiceDefinition::virtual_object(SERVICE)
        .with_handler(
            "chat",
            handler(move |ctx: Context, message: String| {
                let agent = agent.clone();
                async move { chat(&ctx, &agent, message).await }
            }),
        )
        .with_shared_handler(
            "history",
            handler(|ctx: Context, (): ()| async move {
                Ok(ctx
                    .get::<Vec<Message>>(HISTORY)
                    .await?
                    .unwrap_or_default())
            }),
        )
}

async fn chat(ctx: &Context, agent: &AgentLoop, message: String) -> Result<String, HandlerError> {
    let mut history = ctx.get::<Vec<Message>>(HISTORY).await?.unwrap_or_default();
    history.push(Message::user(message));

    let answer = agent.run(ctx, &mut history).await?;
    ctx.set(HISTORY, &history).await?;
    Ok(answer)
}
