// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! This module defines the journal model.
//!
//! The journal of an invocation is an append-only sequence of [`JournalRecord`]s. An entry is
//! recorded when the operation is issued; its outcome is appended later as a separate
//! completion record pointing back at the entry index. Nothing is ever rewritten, so the
//! folded [`Journal`] view is a pure function of the record sequence.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use bytestring::ByteString;
use serde_with::serde_as;

use crate::errors::InvocationError;
use crate::identifiers::{EntryIndex, InvocationId};
use crate::invocation::InvocationTarget;
use crate::time::MillisSinceEpoch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr)]
pub enum EntryType {
    Run,
    Awakeable,
    Call,
    OneWayCall,
    Sleep,
    GetState,
    SetState,
    ClearState,
    Combinator,
}

impl EntryType {
    /// Whether entries of this type are complete as soon as they are journaled.
    pub fn is_completed_on_append(&self) -> bool {
        matches!(
            self,
            EntryType::OneWayCall
                | EntryType::GetState
                | EntryType::SetState
                | EntryType::ClearState
                | EntryType::Combinator
        )
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Entry {
    Run {
        name: ByteString,
    },
    Awakeable,
    Call {
        target: InvocationTarget,
        callee: InvocationId,
    },
    OneWayCall {
        target: InvocationTarget,
        callee: InvocationId,
    },
    Sleep {
        #[serde(default)]
        name: ByteString,
        wake_up_time: MillisSinceEpoch,
    },
    GetState {
        key: ByteString,
        #[serde_as(as = "Option<serde_with::base64::Base64>")]
        value: Option<Bytes>,
    },
    SetState {
        key: ByteString,
    },
    ClearState {
        key: ByteString,
    },
    /// Outcome of a race between the entries of a parallel set.
    Combinator {
        winner: EntryIndex,
    },
}

impl Entry {
    pub fn ty(&self) -> EntryType {
        match self {
            Entry::Run { .. } => EntryType::Run,
            Entry::Awakeable => EntryType::Awakeable,
            Entry::Call { .. } => EntryType::Call,
            Entry::OneWayCall { .. } => EntryType::OneWayCall,
            Entry::Sleep { .. } => EntryType::Sleep,
            Entry::GetState { .. } => EntryType::GetState,
            Entry::SetState { .. } => EntryType::SetState,
            Entry::ClearState { .. } => EntryType::ClearState,
            Entry::Combinator { .. } => EntryType::Combinator,
        }
    }

    /// The stable key of this entry, which must match between the original execution and
    /// every replay of the same invocation.
    pub fn header(&self) -> EntryHeader {
        let name = match self {
            Entry::Run { name } | Entry::Sleep { name, .. } => name.clone(),
            Entry::Call { target, .. } | Entry::OneWayCall { target, .. } => {
                ByteString::from(target.to_string())
            }
            Entry::GetState { key, .. }
            | Entry::SetState { key }
            | Entry::ClearState { key } => key.clone(),
            Entry::Awakeable | Entry::Combinator { .. } => ByteString::new(),
        };
        EntryHeader {
            ty: self.ty(),
            name,
        }
    }
}

/// Type and name of an entry, used to detect diverging replays.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryHeader {
    pub ty: EntryType,
    pub name: ByteString,
}

impl EntryHeader {
    pub fn new(ty: EntryType, name: impl Into<ByteString>) -> Self {
        Self {
            ty,
            name: name.into(),
        }
    }
}

impl fmt::Display for EntryHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}", self.ty)
        } else {
            write!(f, "{}({})", self.ty, self.name)
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum EntryResult {
    Success(#[serde_as(as = "serde_with::base64::Base64")] Bytes),
    Failure(InvocationError),
    /// The operation was cancelled before it produced a result.
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "record", rename_all = "kebab-case")]
pub enum JournalRecord {
    Entry { index: EntryIndex, entry: Entry },
    Completion { index: EntryIndex, result: EntryResult },
}

impl JournalRecord {
    pub fn index(&self) -> EntryIndex {
        match self {
            JournalRecord::Entry { index, .. } | JournalRecord::Completion { index, .. } => {
                *index
            }
        }
    }
}

/// A journal entry together with its completion state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub entry: Entry,
    pub result: Option<EntryResult>,
}

impl JournalEntry {
    pub fn is_completed(&self) -> bool {
        self.result.is_some() || self.entry.ty().is_completed_on_append()
    }
}

/// Folded view over the records of one invocation journal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Journal {
    entries: BTreeMap<EntryIndex, JournalEntry>,
    /// Completions whose entry record was not (yet) observed.
    orphan_completions: BTreeMap<EntryIndex, EntryResult>,
}

impl Journal {
    pub fn from_records(records: impl IntoIterator<Item = JournalRecord>) -> Self {
        let mut journal = Journal::default();
        for record in records {
            journal.apply(record);
        }
        journal
    }

    /// Applies one record. Only the first completion of an entry counts; later ones are
    /// ignored, which makes delivering the same completion twice harmless.
    pub fn apply(&mut self, record: JournalRecord) {
        match record {
            JournalRecord::Entry { index, entry } => {
                let result = self.orphan_completions.remove(&index);
                self.entries
                    .entry(index)
                    .or_insert(JournalEntry { entry, result });
            }
            JournalRecord::Completion { index, result } => match self.entries.get_mut(&index) {
                Some(journal_entry) => {
                    if journal_entry.result.is_none() {
                        journal_entry.result = Some(result);
                    }
                }
                None => {
                    self.orphan_completions.entry(index).or_insert(result);
                }
            },
        }
    }

    pub fn get(&self, index: EntryIndex) -> Option<&JournalEntry> {
        self.entries.get(&index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One past the highest journaled entry index.
    pub fn next_index(&self) -> EntryIndex {
        self.entries
            .last_key_value()
            .map(|(idx, _)| idx + 1)
            .unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntryIndex, &JournalEntry)> {
        self.entries.iter().map(|(idx, e)| (*idx, e))
    }

    /// Sleep entries still waiting for their timer to fire.
    pub fn pending_timers(&self) -> impl Iterator<Item = (EntryIndex, MillisSinceEpoch)> + '_ {
        self.iter().filter_map(|(idx, e)| match &e.entry {
            Entry::Sleep { wake_up_time, .. } if e.result.is_none() => Some((idx, *wake_up_time)),
            _ => None,
        })
    }
}
