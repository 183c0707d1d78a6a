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
use waypoint_types::journal::{Journal, JournalRecord};

use crate::Result;

/// Append-only log of journal records, one per invocation.
#[async_trait]
pub trait JournalTable: Send + Sync {
    /// Appends `record` at the end of the journal. Once this returns, the record survives a
    /// crash of the process.
    async fn append_journal(&self, invocation_id: &InvocationId, record: &JournalRecord)
    -> Result<()>;

    /// All records of the journal in append order. Empty if the journal doesn't exist.
    async fn read_journal(&self, invocation_id: &InvocationId) -> Result<Vec<JournalRecord>>;

    async fn delete_journal(&self, invocation_id: &InvocationId) -> Result<()>;

    async fn get_journal(&self, invocation_id: &InvocationId) -> Result<Journal> {
        Ok(Journal::from_records(self.read_journal(invocation_id).await?))
    }
}
