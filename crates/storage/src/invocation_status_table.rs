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

use waypoint_types::identifiers::InvocationId;
use waypoint_types::invocation::InvocationMetadata;

use crate::Result;

#[async_trait]
pub trait InvocationStatusTable: Send + Sync {
    /// Inserts or replaces the metadata of an invocation, atomically.
    async fn put_invocation(&self, metadata: &InvocationMetadata) -> Result<()>;

    async fn get_invocation(&self, invocation_id: &InvocationId)
    -> Result<Option<InvocationMetadata>>;

    /// Every invocation known to this table, in no particular order.
    async fn scan_invocations(&self) -> Result<Vec<InvocationMetadata>>;

    async fn delete_invocation(&self, invocation_id: &InvocationId) -> Result<()>;
}
