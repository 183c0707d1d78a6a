// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Generate and evaluate loop: a solution is revised until the evaluator accepts it.

use serde::{Deserialize, Serialize};
use tracing::info;

use waypoint_context::{Context, HandlerError, ServiceDefinition, handler};

use crate::interceptor::InterceptorChain;
use crate::model::{Message, ModelRequest};
use crate::services::Dependencies;

pub const SERVICE: &str = "EvaluatorOptimizer";

pub const DEFAULT_MAX_ITERATIONS: usize = 5;

// previous attempts shown to the generator
const ATTEMPTS_IN_CONTEXT: usize = 2;

const GENERATOR: &str = "Create a solution for the task. Return it eagerly, it will be reviewed.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task: String,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
}

fn default_max_iterations() -> usize {
    DEFAULT_MAX_ITERATIONS
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Refinement {
    pub solution: String,
    pub iterations: usize,
    /// Whether the evaluator accepted the solution before the iterations ran out.
    pub accepted: bool,
}

pub fn definition(deps: &Dependencies) -> ServiceDefinition {
    let chain = deps.logging_chain();
    ServiceDefinition::service(SERVICE).with_handler(
        "improve_until_good",
        handler(move |ctx: Context, task: Task| {
            let chain = chain.clone();
            async move { improve_until_good(&ctx, &chain, task).await }
        }),
    )
}

async fn improve_until_good(
    ctx: &Context,
    chain: &InterceptorChain,
    task: Task,
) -> Result<Refinement, HandlerError> {
    let mut attempts: Vec<String> = Vec::new();
    let mut solution = String::new();

    for iteration in 1..=task.max_iterations {
        let previous = &attempts[attempts.len().saturating_sub(ATTEMPTS_IN_CONTEXT)..];
        solution = ask(
            ctx,
            chain,
            format!("generate_v{iteration}"),
            ModelRequest {
                messages: vec![
                    Message::system(GENERATOR),
                    Message::user(generation_prompt(&task.task, previous)),
                ],
                tools: Vec::new(),
            },
        )
        .await?;

        let evaluation = ask(
            ctx,
            chain,
            format!("evaluate_v{iteration}"),
            ModelRequest::prompt(evaluation_prompt(&task.task, &solution)),
        )
        .await?;
        info!(iteration, "Evaluation: {}", evaluation.trim());

        if evaluation.trim_start().starts_with("PASS") {
            return Ok(Refinement {
                solution,
                iterations: iteration,
                accepted: true,
            });
        }
        attempts.push(solution.clone());
    }

    Ok(Refinement {
        solution,
        iterations: task.max_iterations,
        accepted: false,
    })
}

async fn ask(
    ctx: &Context,
    chain: &InterceptorChain,
    step: String,
    request: ModelRequest,
) -> Result<String, HandlerError> {
    let chain = chain.clone();
    let step_ctx = ctx.clone();
    ctx.run(step, move || {
        let call = chain.call(&step_ctx, request.clone());
        async move { Ok(call.await?.content) }
    })
    .await
}

fn generation_prompt(task: &str, previous: &[String]) -> String {
    if previous.is_empty() {
        return format!("Task: {task}");
    }
    let attempts: Vec<String> = previous.iter().map(|attempt| format!("- {attempt}")).collect();
    format!(
        "Previous attempts that need improvement:\n{}\nTask: {task}",
        attempts.join("\n")
    )
}

fn evaluation_prompt(task: &str, solution: &str) -> String {
    format!(
        "Evaluate this solution on correctness, efficiency and readability.\n\
         Reply with either 'PASS: <reason>' if it is correct and well implemented,\n\
         or 'IMPROVE: <issues to fix>' if it needs work.\n\
         Task: {task}\nSolution: {solution}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_prompt_lists_previous_attempts() {
        let previous = vec!["first".to_owned(), "second".to_owned()];
        assert_eq!(generation_prompt("sort", &[]), "Task: sort");
        assert_eq!(
            generation_prompt("sort", &previous),
            "Previous attempts that need improvement:\n- first\n- second\nTask: sort"
        );
    }
}
