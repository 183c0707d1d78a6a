// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

#[derive(Debug)]
pub(super) enum ConcurrencyQuota {
    Unlimited,
    Limited { available_slots: usize },
}

impl ConcurrencyQuota {
    pub(super) fn new(quota: Option<usize>) -> Self {
        match quota {
            Some(available_slots) => Self::Limited { available_slots },
            None => Self::Unlimited,
        }
    }

    pub(super) fn is_slot_available(&self) -> bool {
        match self {
            Self::Unlimited => true,
            Self::Limited { available_slots } => *available_slots > 0,
        }
    }

    pub(super) fn unreserve_slot(&mut self) {
        match self {
            Self::Unlimited => {}
            Self::Limited { available_slots } => *available_slots += 1,
        }
    }

    pub(super) fn reserve_slot(&mut self) {
        debug_assert!(self.is_slot_available());
        match self {
            Self::Unlimited => {}
            Self::Limited { available_slots } => {
                *available_slots = available_slots.saturating_sub(1)
            }
        }
    }
}
