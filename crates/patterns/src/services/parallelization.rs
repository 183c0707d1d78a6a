// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Independent analyses of the same text, executed concurrently.

use serde::{Deserialize, Serialize};

use waypoint_context::{Context, HandlerError, ServiceDefinition, handler};

use crate::interceptor::InterceptorChain;
use crate::model::ModelRequest;
use crate::services::Dependencies;

pub const SERVICE: &str = "ParallelAgents";

const ANALYSES: [(&str, &str); 3] = [
    ("sentiment", "Analyze the sentiment of this text:"),
    ("key points", "Extract the key points of this text:"),
    ("summary", "Summarize this text in one sentence:"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Analysis {
    pub sentiment: String,
    pub key_points: String,
    pub summary: String,
}

pub fn definition(deps: &Dependencies) -> ServiceDefinition {
    // each analysis is its own named step
    let chain = deps.logging_chain();
    ServiceDefinition::service(SERVICE).with_handler(
        "analyze",
        handler(move |ctx: Context, text: String| {
            let chain = chain.clone();
            async move { analyze(&ctx, &chain, text).await }
        }),
    )
}

async fn analyze(
    ctx: &Context,
    chain: &InterceptorChain,
    text: String,
) -> Result<Analysis, HandlerError> {
    let analyses = ANALYSES
        .iter()
        .map(|(name, instruction)| {
            let request = ModelRequest::prompt(format!("{instruction}\n{text}"));
            let chain = chain.clone();
            let step_ctx = ctx.clone();
            ctx.run(*name, move || {
                let request = request.clone();
                let call = chain.call(&step_ctx, request);
                async move { Ok(call.await?.content) }
            })
        })
        .collect();

    let mut results = ctx.all(analyses).await?.into_iter();
    let mut next = || results.next().unwrap_or_default();
    Ok(Analysis {
        sentiment: next(),
        key_points: next(),
        summary: next(),
    })
}
