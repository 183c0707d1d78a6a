// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Retry policies, used for single steps, compensations and whole invocations.

use std::borrow::Cow;
use std::cmp;
use std::num::NonZeroUsize;
use std::time::Duration;

use rand::Rng;
use serde_with::serde_as;

const DEFAULT_JITTER_MULTIPLIER: f32 = 0.3;

/// This struct represents the policy to execute retries.
///
/// The policy is consumed as an iterator of delays: every call to `next` after a failed
/// attempt yields the pause before the next attempt, or `None` when retries are exhausted.
///
/// ```rust
/// use std::time::Duration;
/// use waypoint_types::retries::RetryPolicy;
///
/// let retry_policy = RetryPolicy::fixed_delay(Duration::from_millis(100), Some(10));
/// let mut retry_iter = retry_policy.into_iter();
///
/// loop {
/// # let operation_succeeded = true;
///     if operation_succeeded {
///         break;
///     }
///     match retry_iter.next() {
///         Some(_pause) => { /* sleep, then try again */ }
///         None => break,
///     }
/// }
/// ```
#[serde_as]
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "kebab-case"
)]
pub enum RetryPolicy {
    /// No retries, the first failure is final.
    #[default]
    None,
    /// Retry with a fixed delay strategy.
    FixedDelay {
        /// Interval between retries, e.g. `100ms` or `5s`.
        #[serde_as(as = "serde_with::DisplayFromStr")]
        interval: humantime::Duration,
        /// Number of retries before giving up. Infinite retries if unset.
        max_attempts: Option<NonZeroUsize>,
    },
    /// Retry with an exponential strategy. The next retry is computed as
    /// `min(last_retry_interval * factor, max_interval)`.
    Exponential {
        #[serde_as(as = "serde_with::DisplayFromStr")]
        initial_interval: humantime::Duration,
        factor: f32,
        max_attempts: Option<NonZeroUsize>,
        #[serde_as(as = "Option<serde_with::DisplayFromStr>")]
        max_interval: Option<humantime::Duration>,
    },
}

fn non_zero(max_attempts: Option<usize>) -> Option<NonZeroUsize> {
    max_attempts.map(|m| NonZeroUsize::MIN.saturating_add(m.saturating_sub(1)))
}

impl RetryPolicy {
    /// `max_attempts` of zero is treated as a single retry.
    pub fn fixed_delay(interval: Duration, max_attempts: Option<usize>) -> Self {
        Self::FixedDelay {
            interval: interval.into(),
            max_attempts: non_zero(max_attempts),
        }
    }

    pub fn exponential(
        initial_interval: Duration,
        factor: f32,
        max_attempts: Option<usize>,
        max_interval: Option<Duration>,
    ) -> Self {
        Self::Exponential {
            initial_interval: initial_interval.into(),
            factor,
            max_attempts: non_zero(max_attempts),
            max_interval: max_interval.map(Into::into),
        }
    }

    pub fn max_attempts(&self) -> Option<NonZeroUsize> {
        match self {
            RetryPolicy::None => None,
            RetryPolicy::FixedDelay { max_attempts, .. }
            | RetryPolicy::Exponential { max_attempts, .. } => *max_attempts,
        }
    }

    /// Exponential factors must be finite and at least 1.0, otherwise the back-off
    /// would shrink or never grow past the first interval.
    pub fn has_valid_factor(&self) -> bool {
        match self {
            RetryPolicy::Exponential { factor, .. } => factor.is_finite() && *factor >= 1.0,
            _ => true,
        }
    }

    pub fn iter(&self) -> RetryIter<'_> {
        RetryIter {
            policy: Cow::Borrowed(self),
            attempts: 0,
            last_retry: None,
        }
    }
}

impl IntoIterator for RetryPolicy {
    type Item = Duration;
    type IntoIter = RetryIter<'static>;

    fn into_iter(self) -> Self::IntoIter {
        RetryIter {
            policy: Cow::Owned(self),
            attempts: 0,
            last_retry: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryIter<'a> {
    policy: Cow<'a, RetryPolicy>,
    attempts: usize,
    last_retry: Option<Duration>,
}

impl RetryIter<'_> {
    /// The number of retries handed out by this iterator so far.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Skips the first `attempts` delays, e.g. to resume the back-off of an invocation
    /// whose retry count was persisted.
    pub fn fast_forward(&mut self, attempts: usize) {
        for _ in 0..attempts {
            if self.next_delay().is_none() {
                break;
            }
        }
    }

    /// Peeks the next delay without adding jitter.
    pub fn peek_next(&self) -> Option<Duration> {
        self.clone().next_delay()
    }

    fn next_delay(&mut self) -> Option<Duration> {
        self.attempts += 1;
        match self.policy.as_ref() {
            RetryPolicy::None => None,
            RetryPolicy::FixedDelay {
                interval,
                max_attempts,
            } => {
                if max_attempts.is_some_and(|limit| self.attempts > limit.into()) {
                    None
                } else {
                    Some(**interval)
                }
            }
            RetryPolicy::Exponential {
                initial_interval,
                factor,
                max_attempts,
                max_interval,
            } => {
                if max_attempts.is_some_and(|limit| self.attempts > limit.into()) {
                    return None;
                }
                let new_retry = match self.last_retry {
                    Some(last_retry) => cmp::min(
                        scale(last_retry, *factor),
                        max_interval.map(Into::into).unwrap_or(Duration::MAX),
                    ),
                    None => **initial_interval,
                };
                self.last_retry = Some(new_retry);
                Some(new_retry)
            }
        }
    }
}

// Saturates at `Duration::MAX` instead of panicking on overflow.
fn scale(interval: Duration, factor: f32) -> Duration {
    Duration::try_from_secs_f64(interval.as_secs_f64() * f64::from(factor))
        .unwrap_or(Duration::MAX)
}

impl Iterator for RetryIter<'_> {
    type Item = Duration;

    /// adds up to 1/3 target duration as jitter
    fn next(&mut self) -> Option<Self::Item> {
        self.next_delay()
            .map(|delay| with_jitter(delay, DEFAULT_JITTER_MULTIPLIER))
    }
}

// Jitter is a random duration added to the desired target, it ranges from 3ms to
// (max_multiplier * duration) of the original requested delay. The +3ms floor keeps
// delays off round values, which tend to line up retries of unrelated invocations.
static MIN_JITTER: Duration = Duration::from_millis(3);

pub fn with_jitter(duration: Duration, max_multiplier: f32) -> Duration {
    let max_jitter = duration.mul_f32(max_multiplier);
    if max_jitter <= MIN_JITTER {
        duration.saturating_add(MIN_JITTER)
    } else {
        let jitter = rand::rng().random_range(MIN_JITTER..max_jitter);
        duration.saturating_add(jitter)
    }
}
