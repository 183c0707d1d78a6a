// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageBackend {
    /// Keeps everything in process memory. Nothing survives a restart of the process.
    #[default]
    Memory,
    /// One directory per table below `path`.
    File,
}

/// # Storage options
#[derive(Debug, Clone, Serialize, Deserialize, derive_builder::Builder)]
#[builder(default)]
#[serde(rename_all = "kebab-case", default)]
pub struct StorageOptions {
    pub backend: StorageBackend,

    /// # Storage directory
    ///
    /// Root directory of the file backend.
    pub path: PathBuf,

    /// # Sync journal appends
    ///
    /// Whether every journal append is flushed to disk before it is acknowledged.
    pub fsync: bool,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            path: PathBuf::from("waypoint-data"),
            fsync: true,
        }
    }
}
