// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::{HashMap, VecDeque};

use waypoint_types::identifiers::{InvocationId, ServiceId};

/// Exclusive locks on virtual object keys, and the invocations queued behind each lock.
#[derive(Debug, Default)]
pub(crate) struct KeyLocks {
    holders: HashMap<ServiceId, InvocationId>,
    inboxes: HashMap<ServiceId, VecDeque<InvocationId>>,
}

impl KeyLocks {
    /// Acquires the lock of `service_id` for `invocation_id`. Succeeds as well if the
    /// invocation already holds it.
    pub(crate) fn try_lock(&mut self, service_id: &ServiceId, invocation_id: InvocationId) -> bool {
        match self.holders.get(service_id) {
            Some(holder) => *holder == invocation_id,
            None => {
                self.holders.insert(service_id.clone(), invocation_id);
                true
            }
        }
    }

    pub(crate) fn enqueue(&mut self, service_id: ServiceId, invocation_id: InvocationId) {
        self.inboxes
            .entry(service_id)
            .or_default()
            .push_back(invocation_id);
    }

    pub(crate) fn remove_from_inbox(
        &mut self,
        service_id: &ServiceId,
        invocation_id: InvocationId,
    ) -> bool {
        let Some(inbox) = self.inboxes.get_mut(service_id) else {
            return false;
        };
        let len = inbox.len();
        inbox.retain(|id| *id != invocation_id);
        let removed = inbox.len() != len;
        if inbox.is_empty() {
            self.inboxes.remove(service_id);
        }
        removed
    }

    /// Releases the lock held by `invocation_id` and hands it over to the head of the inbox,
    /// which is returned.
    pub(crate) fn release(
        &mut self,
        service_id: &ServiceId,
        invocation_id: InvocationId,
    ) -> Option<InvocationId> {
        if self.holders.get(service_id) != Some(&invocation_id) {
            return None;
        }
        self.holders.remove(service_id);
        self.promote(service_id)
    }

    /// Locks `service_id` for the head of its inbox, if the lock is free.
    pub(crate) fn promote(&mut self, service_id: &ServiceId) -> Option<InvocationId> {
        if self.holders.contains_key(service_id) {
            return None;
        }
        let inbox = self.inboxes.get_mut(service_id)?;
        let next = inbox.pop_front();
        if inbox.is_empty() {
            self.inboxes.remove(service_id);
        }
        if let Some(next) = next {
            self.holders.insert(service_id.clone(), next);
        }
        next
    }

    pub(crate) fn inboxed_keys(&self) -> Vec<ServiceId> {
        self.inboxes.keys().cloned().collect()
    }

    #[cfg(test)]
    pub(crate) fn holder(&self, service_id: &ServiceId) -> Option<InvocationId> {
        self.holders.get(service_id).copied()
    }
}
