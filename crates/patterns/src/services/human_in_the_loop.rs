// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Drafts are reviewed by a human until one is approved.
//!
//! Each draft gets a durable promise which the reviewer resolves with a [`Review`]. The
//! promise id is published in the keyed state of the writer, readable through the shared
//! `pending_review` handler. A review not given within the timeout ends the loop with the
//! last draft.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use waypoint_context::{Context, HandlerError, ServiceDefinition, handler};
use waypoint_types::errors::codes;
use waypoint_types::identifiers::AwakeableIdentifier;

use crate::interceptor::InterceptorChain;
use crate::services::Dependencies;

pub const SERVICE: &str = "HumanInTheLoop";

const PENDING_REVIEW: &str = "pending-review";
const MAX_ROUNDS: usize = 5;
const DEFAULT_REVIEW_TIMEOUT: Duration = Duration::from_secs(3 * 60 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentRequest {
    pub topic: String,
    #[serde(default)]
    pub review_timeout_millis: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingReview {
    pub awakeable_id: AwakeableIdentifier,
    pub draft: String,
    pub round: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub approved: bool,
    #[serde(default)]
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum ContentOutcome {
    Approved { content: String, rounds: usize },
    TimedOut { content: String, rounds: usize },
}

pub fn definition(deps: &Dependencies) -> ServiceDefinition {
    let chain = deps.durable_chain();
    ServiceDefinition::virtual_object(SERVICE)
        .with_handler(
            "write",
            handler(move |ctx: Context, request: ContentRequest| {
                let chain = chain.clone();
                async move { write(&ctx, &chain, request).await }
            }),
        )
        .with_shared_handler(
            "pending_review",
            handler(|ctx: Context, (): ()| async move {
                ctx.get::<PendingReview>(PENDING_REVIEW).await
            }),
        )
}

async fn write(
    ctx: &Context,
    chain: &InterceptorChain,
    request: ContentRequest,
) -> Result<ContentOutcome, HandlerError> {
    let timeout = request
        .review_timeout_millis
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_REVIEW_TIMEOUT);
    let mut feedback: Vec<String> = Vec::new();

    for round in 1..=MAX_ROUNDS {
        let mut prompt = format!("Write a short text about {}.", request.topic);
        if !feedback.is_empty() {
            prompt.push_str("\nTake this feedback into account:");
            for comment in &feedback {
                prompt.push_str("\n- ");
                prompt.push_str(comment);
            }
        }
        let draft = chain.prompt(ctx, prompt).await?;

        let (awakeable_id, review) = ctx.awakeable::<Review>().await?;
        ctx.set(
            PENDING_REVIEW,
            &PendingReview {
                awakeable_id,
                draft: draft.clone(),
                round,
            },
        )
        .await?;
        info!(round, "Waiting for review {awakeable_id}");

        let review = ctx.select_timeout(review, timeout).await?;
        ctx.clear(PENDING_REVIEW).await?;
        match review {
            None => {
                return Ok(ContentOutcome::TimedOut {
                    content: draft,
                    rounds: round,
                });
            }
            Some(review) if review.approved => {
                return Ok(ContentOutcome::Approved {
                    content: draft,
                    rounds: round,
                });
            }
            Some(review) => feedback.push(review.comment),
        }
    }

    Err(HandlerError::terminal(
        codes::ABORTED,
        format!("no draft approved after {MAX_ROUNDS} rounds"),
    ))
}
