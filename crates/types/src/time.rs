// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fmt;
use std::fmt::Display;
use std::ops::Add;
use std::time::{Duration, SystemTime};

/// Milliseconds since the unix epoch
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct MillisSinceEpoch(u64);

impl MillisSinceEpoch {
    pub const UNIX_EPOCH: MillisSinceEpoch = MillisSinceEpoch::new(0);
    pub const MAX: MillisSinceEpoch = MillisSinceEpoch::new(u64::MAX);

    pub const fn new(millis_since_epoch: u64) -> Self {
        MillisSinceEpoch(millis_since_epoch)
    }

    pub fn now() -> Self {
        SystemTime::now().into()
    }

    /// Returns the timestamp `duration` after now, saturating at [`MillisSinceEpoch::MAX`].
    pub fn after(duration: Duration) -> Self {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        MillisSinceEpoch(Self::now().0.saturating_add(millis))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Time elapsed since this timestamp, zero if it lies in the future.
    pub fn elapsed(&self) -> Duration {
        let now = Self::now();
        Duration::from_millis(now.0.saturating_sub(self.0))
    }

    /// Time left until this timestamp, zero if it already passed.
    pub fn remaining(&self) -> Duration {
        let now = Self::now();
        Duration::from_millis(self.0.saturating_sub(now.0))
    }
}

impl From<u64> for MillisSinceEpoch {
    fn from(value: u64) -> Self {
        Self::new(value)
    }
}

impl From<SystemTime> for MillisSinceEpoch {
    fn from(value: SystemTime) -> Self {
        // Clocks set before the epoch are clamped rather than rejected.
        let millis = value
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        MillisSinceEpoch::new(millis)
    }
}

impl From<MillisSinceEpoch> for SystemTime {
    fn from(value: MillisSinceEpoch) -> Self {
        SystemTime::UNIX_EPOCH.add(Duration::from_millis(value.as_u64()))
    }
}

impl Display for MillisSinceEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ms since epoch", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn after_is_in_the_future() {
        let now = MillisSinceEpoch::now();
        let later = MillisSinceEpoch::after(Duration::from_secs(10));
        assert!(later > now);
        assert!(later.remaining() <= Duration::from_secs(10));
    }

    #[test]
    fn after_saturates() {
        assert_eq!(
            MillisSinceEpoch::after(Duration::MAX),
            MillisSinceEpoch::MAX
        );
    }

    #[test]
    fn past_timestamp_has_no_remaining_time() {
        assert_eq!(MillisSinceEpoch::UNIX_EPOCH.remaining(), Duration::ZERO);
    }
}
