// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Sequential model calls, each working on the output of the previous one.

use waypoint_context::{Context, HandlerError, ServiceDefinition, handler};

use crate::interceptor::InterceptorChain;
use crate::services::Dependencies;

pub const SERVICE: &str = "CallChaining";

const STEPS: [&str; 3] = [
    "Extract only the numerical values and their associated metrics from the text.",
    "Sort all lines in descending order by numerical value.",
    "Format the sorted data as a markdown table with columns 'Metric' and 'Value'.",
];

pub fn definition(deps: &Dependencies) -> ServiceDefinition {
    let chain = deps.durable_chain();
    ServiceDefinition::service(SERVICE).with_handler(
        "process",
        handler(move |ctx: Context, report: String| {
            let chain = chain.clone();
            async move { process(&ctx, &chain, report).await }
        }),
    )
}

async fn process(
    ctx: &Context,
    chain: &InterceptorChain,
    report: String,
) -> Result<String, HandlerError> {
    let mut result = report;
    for instruction in STEPS {
        result = chain
            .prompt(ctx, format!("{instruction}\nInput: {result}"))
            .await?;
    }
    Ok(result)
}
