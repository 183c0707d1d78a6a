// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! An orchestrator splits a task into subtasks, which workers then execute concurrently.

use serde::{Deserialize, Serialize};
use tracing::info;

use waypoint_context::{Context, DurableFuture, HandlerError, ServiceDefinition, handler};

use crate::interceptor::InterceptorChain;
use crate::model::{Message, ModelRequest};
use crate::services::Dependencies;

pub const SERVICE: &str = "Orchestrator";

const ORCHESTRATOR: &str = "You break down text analysis into specific subtasks. \
    Answer with one line per subtask, formatted as '<task type>: <instructions for the worker>'.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerResult {
    pub task_type: String,
    pub result: String,
}

pub fn definition(deps: &Dependencies) -> ServiceDefinition {
    let chain = deps.logging_chain();
    ServiceDefinition::service(SERVICE).with_handler(
        "process_text",
        handler(move |ctx: Context, text: String| {
            let chain = chain.clone();
            async move { process_text(&ctx, &chain, text).await }
        }),
    )
}

async fn process_text(
    ctx: &Context,
    chain: &InterceptorChain,
    text: String,
) -> Result<Vec<WorkerResult>, HandlerError> {
    let breakdown = step(
        ctx,
        chain,
        "orchestrator_analysis".to_owned(),
        ModelRequest {
            messages: vec![
                Message::system(ORCHESTRATOR),
                Message::user(format!("Text to analyze: {text}")),
            ],
            tools: Vec::new(),
        },
    )
    .await?;
    let subtasks = parse_subtasks(&breakdown);
    info!("Orchestrator planned {} subtasks", subtasks.len());

    let workers = subtasks
        .iter()
        .map(|(task_type, instruction)| {
            step(
                ctx,
                chain,
                format!("worker_{}", task_type.to_lowercase().replace(' ', "_")),
                ModelRequest {
                    messages: vec![
                        Message::system(format!("You are a {task_type} specialist.")),
                        Message::user(format!("Task: {instruction}\nText to analyze: {text}")),
                    ],
                    tools: Vec::new(),
                },
            )
        })
        .collect();
    let results = ctx.all(workers).await?;

    Ok(subtasks
        .into_iter()
        .zip(results)
        .map(|((task_type, _), result)| WorkerResult { task_type, result })
        .collect())
}

fn step(
    ctx: &Context,
    chain: &InterceptorChain,
    name: String,
    request: ModelRequest,
) -> DurableFuture<String> {
    let chain = chain.clone();
    let step_ctx = ctx.clone();
    ctx.run(name, move || {
        let call = chain.call(&step_ctx, request.clone());
        async move { Ok(call.await?.content) }
    })
}

/// Parses `<task type>: <instructions>` lines. Lines without a colon are ignored, a repeated
/// task type replaces the earlier instructions.
fn parse_subtasks(breakdown: &str) -> Vec<(String, String)> {
    let mut subtasks: Vec<(String, String)> = Vec::new();
    for line in breakdown.lines() {
        let Some((task_type, instruction)) = line.split_once(':') else {
            continue;
        };
        let (task_type, instruction) = (task_type.trim(), instruction.trim());
        if task_type.is_empty() {
            continue;
        }
        match subtasks.iter_mut().find(|(existing, _)| existing == task_type) {
            Some(subtask) => subtask.1 = instruction.to_owned(),
            None => subtasks.push((task_type.to_owned(), instruction.to_owned())),
        }
    }
    subtasks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtasks_are_parsed_in_order() {
        let subtasks = parse_subtasks(
            "Here is the plan\nSentiment: judge the tone\n\nKey points: list facts: numbers too\nSentiment: be brief\n: nothing",
        );
        assert_eq!(
            subtasks,
            vec![
                ("Sentiment".to_owned(), "be brief".to_owned()),
                ("Key points".to_owned(), "list facts: numbers too".to_owned()),
            ]
        );
    }
}
