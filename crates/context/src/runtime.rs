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

use waypoint_types::identifiers::{EntryIndex, InvocationId};
use waypoint_types::invocation::InvocationRequest;
use waypoint_types::time::MillisSinceEpoch;

/// Services the scheduler provides to running invocations.
#[async_trait]
pub trait InvocationRuntime: Send + Sync + 'static {
    /// Starts a new invocation. Submitting an invocation id that is already known is a no-op,
    /// apart from registering its response sink.
    async fn submit(&self, request: InvocationRequest) -> anyhow::Result<()>;

    async fn cancel(&self, invocation_id: InvocationId) -> anyhow::Result<()>;

    /// Completes the sleep entry at `entry_index` once `wake_up_time` is reached.
    async fn register_timer(
        &self,
        invocation_id: InvocationId,
        entry_index: EntryIndex,
        wake_up_time: MillisSinceEpoch,
    ) -> anyhow::Result<()>;
}
