// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytes::Bytes;
use bytestring::ByteString;
use dashmap::DashMap;
use serde_with::serde_as;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use waypoint_types::identifiers::{InvocationId, ServiceId};
use waypoint_types::invocation::InvocationMetadata;
use waypoint_types::journal::JournalRecord;

use crate::{InvocationStatusTable, JournalTable, Result, StateTable, StorageError};

const JOURNALS_DIR: &str = "journals";
const INVOCATIONS_DIR: &str = "invocations";
const STATE_DIR: &str = "state";

#[derive(Debug, Default)]
struct JournalFile {
    /// Whether a torn tail left by a crash was already cut off.
    tail_checked: bool,
}

#[serde_as]
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct StateFile {
    service_id: Option<ServiceId>,
    #[serde_as(as = "BTreeMap<_, serde_with::base64::Base64>")]
    entries: BTreeMap<ByteString, Bytes>,
}

/// File backend.
///
/// ```text
/// <root>/journals/<invocation id>.jsonl   one json encoded record per line, append only
/// <root>/invocations/<invocation id>.json replaced atomically with tmp file + rename
/// <root>/state/<encoded service id>.json  all the state of one virtual object
/// ```
#[derive(Debug)]
pub struct FileStorage {
    root: PathBuf,
    fsync: bool,
    journals: DashMap<InvocationId, Arc<Mutex<JournalFile>>>,
    state_locks: DashMap<ServiceId, Arc<Mutex<()>>>,
}

impl FileStorage {
    pub async fn open(root: impl Into<PathBuf>, fsync: bool) -> Result<Self> {
        let root = root.into();
        for dir in [JOURNALS_DIR, INVOCATIONS_DIR, STATE_DIR] {
            fs::create_dir_all(root.join(dir)).await?;
        }
        debug!("Opened file storage at {}", root.display());
        Ok(Self {
            root,
            fsync,
            journals: DashMap::new(),
            state_locks: DashMap::new(),
        })
    }

    fn journal_path(&self, invocation_id: &InvocationId) -> PathBuf {
        self.root
            .join(JOURNALS_DIR)
            .join(format!("{invocation_id}.jsonl"))
    }

    fn invocation_path(&self, invocation_id: &InvocationId) -> PathBuf {
        self.root
            .join(INVOCATIONS_DIR)
            .join(format!("{invocation_id}.json"))
    }

    fn state_path(&self, service_id: &ServiceId) -> PathBuf {
        let encoded = URL_SAFE_NO_PAD.encode(format!(
            "{}\0{}",
            service_id.service_name, service_id.key
        ));
        self.root.join(STATE_DIR).join(format!("{encoded}.json"))
    }

    fn journal_lock(&self, invocation_id: &InvocationId) -> Arc<Mutex<JournalFile>> {
        Arc::clone(self.journals.entry(*invocation_id).or_default().value())
    }

    fn state_lock(&self, service_id: &ServiceId) -> Arc<Mutex<()>> {
        Arc::clone(self.state_locks.entry(service_id.clone()).or_default().value())
    }

    /// Drops the lock of `service_id` once nobody else holds or waits for it.
    fn release_state_lock(&self, service_id: &ServiceId, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.state_locks
            .remove_if(service_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    #[cfg(test)]
    pub(crate) fn state_lock_count(&self) -> usize {
        self.state_locks.len()
    }

    /// Writes `contents` to `path` so that readers see either the old or the new file.
    async fn write_atomically(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let tmp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(contents).await?;
        if self.fsync {
            file.sync_all().await?;
        } else {
            file.flush().await?;
        }
        drop(file);
        fs::rename(&tmp_path, path).await?;
        Ok(())
    }

    async fn read_state_file(&self, service_id: &ServiceId) -> Result<StateFile> {
        match fs::read(self.state_path(service_id)).await {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(StateFile::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_state_file(&self, service_id: &ServiceId, state: StateFile) -> Result<()> {
        let path = self.state_path(service_id);
        if state.entries.is_empty() {
            return remove_if_exists(&path).await;
        }
        let state = StateFile {
            service_id: Some(service_id.clone()),
            ..state
        };
        self.write_atomically(&path, &serde_json::to_vec(&state)?)
            .await
    }
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Cuts off a trailing record that was only partially written before a crash. Without this,
/// the next append would be glued to the torn bytes.
async fn truncate_torn_tail(path: &Path) -> Result<()> {
    let raw = match fs::read(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    if raw.is_empty() || raw.ends_with(b"\n") {
        return Ok(());
    }
    let keep = raw
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|pos| pos + 1)
        .unwrap_or(0);
    warn!(
        "Dropping {} bytes of a torn journal record at the end of {}",
        raw.len() - keep,
        path.display()
    );
    let file = fs::OpenOptions::new().write(true).open(path).await?;
    file.set_len(keep as u64).await?;
    file.sync_all().await?;
    Ok(())
}

#[async_trait]
impl JournalTable for FileStorage {
    async fn append_journal(
        &self,
        invocation_id: &InvocationId,
        record: &JournalRecord,
    ) -> Result<()> {
        let path = self.journal_path(invocation_id);
        let lock = self.journal_lock(invocation_id);
        let mut journal_file = lock.lock().await;

        if !journal_file.tail_checked {
            truncate_torn_tail(&path).await?;
            journal_file.tail_checked = true;
        }

        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;
        if self.fsync {
            file.sync_data().await?;
        } else {
            file.flush().await?;
        }
        Ok(())
    }

    async fn read_journal(&self, invocation_id: &InvocationId) -> Result<Vec<JournalRecord>> {
        let path = self.journal_path(invocation_id);
        let lock = self.journal_lock(invocation_id);
        let _guard = lock.lock().await;

        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let complete = raw.ends_with('\n');
        let lines: Vec<&str> = raw.lines().collect();
        let mut records = Vec::with_capacity(lines.len());
        for (idx, line) in lines.iter().enumerate() {
            match serde_json::from_str::<JournalRecord>(line) {
                Ok(record) => records.push(record),
                Err(err) if idx + 1 == lines.len() && !complete => {
                    warn!(
                        %invocation_id,
                        "Ignoring torn journal record at the end of the journal: {err}"
                    );
                }
                Err(err) => {
                    return Err(StorageError::DataIntegrityError(format!(
                        "corrupted record {idx} in journal of {invocation_id}: {err}"
                    )));
                }
            }
        }
        Ok(records)
    }

    async fn delete_journal(&self, invocation_id: &InvocationId) -> Result<()> {
        let path = self.journal_path(invocation_id);
        let lock = self.journal_lock(invocation_id);
        {
            let _guard = lock.lock().await;
            remove_if_exists(&path).await?;
        }
        self.journals.remove(invocation_id);
        Ok(())
    }
}

#[async_trait]
impl InvocationStatusTable for FileStorage {
    async fn put_invocation(&self, metadata: &InvocationMetadata) -> Result<()> {
        let path = self.invocation_path(&metadata.invocation_id);
        self.write_atomically(&path, &serde_json::to_vec(metadata)?)
            .await
    }

    async fn get_invocation(
        &self,
        invocation_id: &InvocationId,
    ) -> Result<Option<InvocationMetadata>> {
        match fs::read(self.invocation_path(invocation_id)).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn scan_invocations(&self) -> Result<Vec<InvocationMetadata>> {
        let mut invocations = Vec::new();
        let mut dir = fs::read_dir(self.root.join(INVOCATIONS_DIR)).await?;
        while let Some(dir_entry) = dir.next_entry().await? {
            let path = dir_entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let raw = fs::read(&path).await?;
            invocations.push(serde_json::from_slice(&raw)?);
        }
        Ok(invocations)
    }

    async fn delete_invocation(&self, invocation_id: &InvocationId) -> Result<()> {
        remove_if_exists(&self.invocation_path(invocation_id)).await
    }
}

#[async_trait]
impl StateTable for FileStorage {
    async fn get_user_state(
        &self,
        service_id: &ServiceId,
        state_key: &str,
    ) -> Result<Option<Bytes>> {
        let lock = self.state_lock(service_id);
        let result = {
            let _guard = lock.lock().await;
            self.read_state_file(service_id)
                .await
                .map(|state| state.entries.get(state_key).cloned())
        };
        self.release_state_lock(service_id, lock);
        result
    }

    async fn put_user_state(
        &self,
        service_id: &ServiceId,
        state_key: &str,
        state_value: Bytes,
    ) -> Result<()> {
        let lock = self.state_lock(service_id);
        let result = {
            let _guard = lock.lock().await;
            match self.read_state_file(service_id).await {
                Ok(mut state) => {
                    state
                        .entries
                        .insert(ByteString::from(state_key), state_value);
                    self.write_state_file(service_id, state).await
                }
                Err(err) => Err(err),
            }
        };
        self.release_state_lock(service_id, lock);
        result
    }

    async fn delete_user_state(&self, service_id: &ServiceId, state_key: &str) -> Result<()> {
        let lock = self.state_lock(service_id);
        let result = {
            let _guard = lock.lock().await;
            match self.read_state_file(service_id).await {
                Ok(mut state) => {
                    if state.entries.remove(state_key).is_some() {
                        self.write_state_file(service_id, state).await
                    } else {
                        Ok(())
                    }
                }
                Err(err) => Err(err),
            }
        };
        self.release_state_lock(service_id, lock);
        result
    }
}
