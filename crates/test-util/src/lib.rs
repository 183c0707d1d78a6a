// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Useful test utilities for waypoint crates. Import them with:
//!
//! ```rust
//! use waypoint_test_util::{assert, assert_eq, assert_ne};
//! ```
//!
//! Note: You cannot import them with a glob import, as the compiler won't be able to distinguish our imports and the stdlib imports.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;

// A couple of useful re-exports
pub use assert2::{assert, check, let_assert};
pub use pretty_assertions::{assert_eq, assert_ne};

pub mod matchers;

/// Encodes a test payload the way typed handlers do.
pub fn json_bytes<T: serde::Serialize>(value: &T) -> Bytes {
    Bytes::from(serde_json::to_vec(value).expect("test payload must serialize"))
}

pub fn from_json_bytes<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> T {
    serde_json::from_slice(bytes).expect("test payload must deserialize")
}

/// Polls `check` every few milliseconds until it yields a value or `timeout` elapses.
///
/// Panics on timeout, naming `what` was awaited.
pub async fn eventually<T, F, Fut>(what: &str, timeout: Duration, mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let poll = async {
        loop {
            if let Some(value) = check().await {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    match tokio::time::timeout(timeout, poll).await {
        Ok(value) => value,
        Err(_) => panic!("timed out after {timeout:?} waiting for {what}"),
    }
}
