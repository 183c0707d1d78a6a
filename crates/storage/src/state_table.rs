// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use async_trait::async_trait;
use bytes::Bytes;

use waypoint_types::identifiers::ServiceId;

use crate::Result;

/// Keyed state of virtual objects.
#[async_trait]
pub trait StateTable: Send + Sync {
    async fn get_user_state(&self, service_id: &ServiceId, state_key: &str)
    -> Result<Option<Bytes>>;

    async fn put_user_state(
        &self,
        service_id: &ServiceId,
        state_key: &str,
        state_value: Bytes,
    ) -> Result<()>;

    async fn delete_user_state(&self, service_id: &ServiceId, state_key: &str) -> Result<()>;
}
