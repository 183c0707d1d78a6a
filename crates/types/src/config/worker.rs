// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::retries::RetryPolicy;

/// # Worker options
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, derive_builder::Builder)]
#[builder(default)]
#[serde(rename_all = "kebab-case", default)]
pub struct WorkerOptions {
    /// # Invocation retry policy
    ///
    /// Retry policy for whole invocations failing with a retryable error. Each retry
    /// replays the journal, so committed steps are not executed again.
    pub invocation_retry_policy: RetryPolicy,

    /// # Step retry policy
    ///
    /// Default retry policy of `run` steps that don't specify their own.
    pub step_retry_policy: RetryPolicy,

    /// # Compensation retry policy
    ///
    /// Retry policy of each compensation step run while rolling back a failed invocation.
    pub compensation_retry_policy: RetryPolicy,

    /// # Suspension timeout
    ///
    /// Once an invocation has been waiting this long for a completion, with no step
    /// executing, it is suspended and its task is released. It is resumed by replaying the
    /// journal when one of the awaited entries completes.
    ///
    /// Can be configured using the [`humantime`](https://docs.rs/humantime/latest/humantime/fn.parse_duration.html) format.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    suspension_timeout: humantime::Duration,

    /// # Completion retention
    ///
    /// How long terminal invocations keep their outcome and journal before being purged.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    completion_retention: humantime::Duration,

    /// # Limit number of concurrent invocations
    ///
    /// Invocation tasks running at the same time. Unlimited if unset.
    pub concurrent_invocations_limit: Option<NonZeroUsize>,

    /// # Internal queue length
    ///
    /// Capacity of the command channel of the worker.
    pub internal_queue_length: usize,
}

impl WorkerOptions {
    pub fn suspension_timeout(&self) -> Duration {
        self.suspension_timeout.into()
    }

    pub fn completion_retention(&self) -> Duration {
        self.completion_retention.into()
    }
}

impl WorkerOptionsBuilder {
    pub fn suspension_timeout_duration(&mut self, timeout: Duration) -> &mut Self {
        self.suspension_timeout(timeout.into())
    }

    pub fn completion_retention_duration(&mut self, retention: Duration) -> &mut Self {
        self.completion_retention(retention.into())
    }
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            invocation_retry_policy: RetryPolicy::exponential(
                Duration::from_millis(50),
                2.0,
                Some(10),
                Some(Duration::from_secs(10)),
            ),
            step_retry_policy: RetryPolicy::exponential(
                Duration::from_millis(100),
                2.0,
                Some(5),
                Some(Duration::from_secs(5)),
            ),
            compensation_retry_policy: RetryPolicy::exponential(
                Duration::from_millis(100),
                2.0,
                Some(10),
                Some(Duration::from_secs(5)),
            ),
            suspension_timeout: Duration::from_secs(60).into(),
            completion_retention: Duration::from_secs(60 * 60).into(),
            concurrent_invocations_limit: None,
            internal_queue_length: 1024,
        }
    }
}
