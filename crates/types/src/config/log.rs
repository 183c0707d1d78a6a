// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use serde::{Deserialize, Serialize};

/// # Log format
#[derive(Debug, Clone, Copy, Hash, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    /// Verbose multi-line output. Not recommended in production.
    #[default]
    Pretty,
    Compact,
    /// One json object per event, for log collectors.
    Json,
}

/// # Log options
#[derive(Debug, Clone, Serialize, Deserialize, derive_builder::Builder)]
#[builder(default)]
#[serde(rename_all = "kebab-case", default)]
pub struct LogOptions {
    /// # Log filter
    ///
    /// Log filter configuration. Can be overridden by the `RUST_LOG` environment variable.
    /// Check the [`RUST_LOG` documentation](https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/struct.EnvFilter.html) for more details how to configure it.
    pub filter: String,

    pub format: LogFormat,

    /// # Disable ANSI in log output
    pub disable_ansi_codes: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            filter: "warn,waypoint=info".to_owned(),
            format: LogFormat::default(),
            disable_ansi_codes: false,
        }
    }
}
