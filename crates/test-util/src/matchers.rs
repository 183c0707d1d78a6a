// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! This module contains a collection of matchers

pub use googletest::matchers::*;

pub use json::json_decoded;

mod json {
    use std::fmt::Debug;
    use std::marker::PhantomData;

    use bytes::Bytes;
    use googletest::matcher::{Matcher, MatcherResult};
    use serde::de::DeserializeOwned;

    struct JsonDecodeMatcher<InnerMatcher, T>(InnerMatcher, PhantomData<T>);

    impl<T: DeserializeOwned + Debug, InnerMatcher: Matcher<ActualT = T>> Matcher
        for JsonDecodeMatcher<InnerMatcher, T>
    {
        type ActualT = Bytes;

        fn matches(&self, actual: &Self::ActualT) -> MatcherResult {
            match serde_json::from_slice::<T>(actual) {
                Ok(value) => self.0.matches(&value),
                Err(_) => MatcherResult::NoMatch,
            }
        }

        fn describe(&self, matcher_result: MatcherResult) -> String {
            match matcher_result {
                MatcherResult::Match => {
                    format!(
                        "can be decoded from json which {}",
                        self.0.describe(MatcherResult::Match)
                    )
                }
                MatcherResult::NoMatch => "cannot be decoded from json".to_string(),
            }
        }
    }

    /// Decode a json payload before matching it.
    pub fn json_decoded<T: DeserializeOwned + Debug>(
        inner: impl Matcher<ActualT = T>,
    ) -> impl Matcher<ActualT = Bytes> {
        JsonDecodeMatcher(inner, PhantomData)
    }

}
