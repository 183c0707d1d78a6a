// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use bytestring::ByteString;
use parking_lot::Mutex;

use waypoint_types::identifiers::{InvocationId, ServiceId};
use waypoint_types::invocation::InvocationMetadata;
use waypoint_types::journal::JournalRecord;

use crate::{InvocationStatusTable, JournalTable, Result, StateTable, StorageError};

#[derive(Debug, Default)]
struct Tables {
    journals: HashMap<InvocationId, Vec<JournalRecord>>,
    invocations: HashMap<InvocationId, InvocationMetadata>,
    state: HashMap<ServiceId, BTreeMap<ByteString, Bytes>>,
    failing_appends: usize,
}

/// In-memory backend.
///
/// Clones share the same tables, so a clone handed to a fresh worker behaves like the
/// storage of a restarted process.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<Tables>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` journal appends fail with a storage error.
    #[cfg(any(test, feature = "test-util"))]
    pub fn fail_next_appends(&self, count: usize) {
        self.inner.lock().failing_appends = count;
    }
}

#[async_trait]
impl JournalTable for MemoryStorage {
    async fn append_journal(
        &self,
        invocation_id: &InvocationId,
        record: &JournalRecord,
    ) -> Result<()> {
        let mut tables = self.inner.lock();
        if tables.failing_appends > 0 {
            tables.failing_appends -= 1;
            return Err(StorageError::Generic(anyhow::anyhow!(
                "injected append failure"
            )));
        }
        tables
            .journals
            .entry(*invocation_id)
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn read_journal(&self, invocation_id: &InvocationId) -> Result<Vec<JournalRecord>> {
        Ok(self
            .inner
            .lock()
            .journals
            .get(invocation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_journal(&self, invocation_id: &InvocationId) -> Result<()> {
        self.inner.lock().journals.remove(invocation_id);
        Ok(())
    }
}

#[async_trait]
impl InvocationStatusTable for MemoryStorage {
    async fn put_invocation(&self, metadata: &InvocationMetadata) -> Result<()> {
        self.inner
            .lock()
            .invocations
            .insert(metadata.invocation_id, metadata.clone());
        Ok(())
    }

    async fn get_invocation(
        &self,
        invocation_id: &InvocationId,
    ) -> Result<Option<InvocationMetadata>> {
        Ok(self.inner.lock().invocations.get(invocation_id).cloned())
    }

    async fn scan_invocations(&self) -> Result<Vec<InvocationMetadata>> {
        Ok(self.inner.lock().invocations.values().cloned().collect())
    }

    async fn delete_invocation(&self, invocation_id: &InvocationId) -> Result<()> {
        self.inner.lock().invocations.remove(invocation_id);
        Ok(())
    }
}

#[async_trait]
impl StateTable for MemoryStorage {
    async fn get_user_state(
        &self,
        service_id: &ServiceId,
        state_key: &str,
    ) -> Result<Option<Bytes>> {
        Ok(self
            .inner
            .lock()
            .state
            .get(service_id)
            .and_then(|entries| entries.get(state_key).cloned()))
    }

    async fn put_user_state(
        &self,
        service_id: &ServiceId,
        state_key: &str,
        state_value: Bytes,
    ) -> Result<()> {
        self.inner
            .lock()
            .state
            .entry(service_id.clone())
            .or_default()
            .insert(ByteString::from(state_key), state_value);
        Ok(())
    }

    async fn delete_user_state(&self, service_id: &ServiceId, state_key: &str) -> Result<()> {
        let mut tables = self.inner.lock();
        if let Some(entries) = tables.state.get_mut(service_id) {
            entries.remove(state_key);
            if entries.is_empty() {
                tables.state.remove(service_id);
            }
        }
        Ok(())
    }
}
