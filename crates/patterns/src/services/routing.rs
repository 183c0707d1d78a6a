// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A model classifies the request, which is then handed to the matching specialist.

use waypoint_context::{Context, HandlerError, ServiceDefinition, handler};
use waypoint_types::errors::codes;
use waypoint_types::invocation::InvocationTarget;

use crate::interceptor::InterceptorChain;
use crate::services::Dependencies;

pub const SERVICE: &str = "Routing";
pub const SUPPORT_SERVICE: &str = "SupportAgents";

pub const CATEGORIES: [&str; 3] = ["billing", "account", "product"];

pub fn definition(deps: &Dependencies) -> ServiceDefinition {
    let chain = deps.durable_chain();
    ServiceDefinition::service(SERVICE).with_handler(
        "route",
        handler(move |ctx: Context, question: String| {
            let chain = chain.clone();
            async move { route(&ctx, &chain, question).await }
        }),
    )
}

/// One handler per category.
pub fn support_agents(deps: &Dependencies) -> ServiceDefinition {
    CATEGORIES
        .into_iter()
        .fold(ServiceDefinition::service(SUPPORT_SERVICE), |service, category| {
            let chain = deps.durable_chain();
            service.with_handler(
                category,
                handler(move |ctx: Context, question: String| {
                    let prompt = format!("As {category} specialist, answer: {question}");
                    chain.prompt(&ctx, prompt)
                }),
            )
        })
}

async fn route(
    ctx: &Context,
    chain: &InterceptorChain,
    question: String,
) -> Result<String, HandlerError> {
    let prompt = format!(
        "Classify the request into one of: {}. Answer with the category only.\nRequest: {question}",
        CATEGORIES.join(", ")
    );
    let category = chain.prompt(ctx, prompt).await?;
    let category = category.trim().to_lowercase();

    if !CATEGORIES.contains(&category.as_str()) {
        return Err(HandlerError::terminal(
            codes::BAD_REQUEST,
            format!("no specialist for category '{category}'"),
        ));
    }

    ctx.call(
        InvocationTarget::service(SUPPORT_SERVICE, category),
        &question,
    )
    .await
}
