// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;

use waypoint_types::identifiers::EntryIndex;
use waypoint_types::journal::{EntryResult, Journal, JournalEntry, JournalRecord};

/// In-memory journal of a running invocation.
///
/// The invocation task applies the records it appends; the scheduler delivers the
/// completions it appends on behalf of the invocation (promise resolutions, call results,
/// fired timers). Waiters are woken on every change.
#[derive(Debug, Default)]
pub struct LiveJournal {
    journal: Mutex<Journal>,
    notify: Notify,
}

impl LiveJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&self, record: JournalRecord) {
        self.journal.lock().apply(record);
        self.notify.notify_waiters();
    }

    pub fn deliver(&self, index: EntryIndex, result: EntryResult) {
        self.apply(JournalRecord::Completion { index, result });
    }

    pub(crate) fn entry(&self, index: EntryIndex) -> Option<JournalEntry> {
        self.journal.lock().get(index).cloned()
    }

    pub(crate) fn result(&self, index: EntryIndex) -> Option<EntryResult> {
        self.journal
            .lock()
            .get(index)
            .and_then(|entry| entry.result.clone())
    }

    pub(crate) fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    pub(crate) fn wake_all(&self) {
        self.notify.notify_waiters();
    }
}
