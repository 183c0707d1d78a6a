// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

mod log;
mod storage;
mod worker;

pub use log::*;
pub use storage::*;
pub use worker::*;

use serde::{Deserialize, Serialize};

/// # Waypoint configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize, derive_builder::Builder)]
#[builder(default)]
#[serde(rename_all = "kebab-case", default)]
pub struct Configuration {
    pub worker: WorkerOptions,
    pub storage: StorageOptions,
    pub log: LogOptions,
}

impl Configuration {
    pub fn validate(&self) -> Result<(), InvalidConfigurationError> {
        if self.worker.suspension_timeout().is_zero() {
            return Err(InvalidConfigurationError::ZeroSuspensionTimeout);
        }
        if self.storage.backend == StorageBackend::File && self.storage.path.as_os_str().is_empty()
        {
            return Err(InvalidConfigurationError::MissingStoragePath);
        }
        for (name, policy) in [
            ("invocation-retry-policy", &self.worker.invocation_retry_policy),
            ("step-retry-policy", &self.worker.step_retry_policy),
            ("compensation-retry-policy", &self.worker.compensation_retry_policy),
        ] {
            if !policy.has_valid_factor() {
                return Err(InvalidConfigurationError::InvalidRetryFactor(name));
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InvalidConfigurationError {
    #[error("worker.suspension-timeout must be greater than zero")]
    ZeroSuspensionTimeout,
    #[error("storage.path is required for the file storage backend")]
    MissingStoragePath,
    #[error("worker.{0} factor must be finite and at least 1.0")]
    InvalidRetryFactor(&'static str),
}
