// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Two agents answer the same question; the first answer wins and the other agent is
//! cancelled.

use serde::{Deserialize, Serialize};

use waypoint_context::{Context, HandlerError, ServiceDefinition, handler};
use waypoint_types::invocation::InvocationTarget;

use crate::services::Dependencies;

pub const SERVICE: &str = "RacingAgents";

const CONTENDERS: [&str; 2] = ["think_longer", "respond_quickly"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaceResult {
    pub winner: String,
    pub answer: String,
}

pub fn definition(deps: &Dependencies) -> ServiceDefinition {
    let thorough = deps.durable_chain();
    let quick = deps.durable_chain();
    ServiceDefinition::service(SERVICE)
        .with_handler("run", handler(race))
        .with_handler(
            "think_longer",
            handler(move |ctx: Context, question: String| {
                thorough.prompt(&ctx, format!("Analyze this thoroughly: {question}"))
            }),
        )
        .with_handler(
            "respond_quickly",
            handler(move |ctx: Context, question: String| {
                quick.prompt(&ctx, format!("Answer quickly: {question}"))
            }),
        )
}

async fn race(ctx: Context, question: String) -> Result<RaceResult, HandlerError> {
    let contenders = CONTENDERS
        .iter()
        .map(|contender| ctx.call(InvocationTarget::service(SERVICE, *contender), &question))
        .collect();

    let (position, answer) = ctx.any(contenders).await?;
    Ok(RaceResult {
        winner: CONTENDERS[position].to_owned(),
        answer,
    })
}
