// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Reservation backend used by the booking saga.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use waypoint_context::{HandlerError, TerminalError};
use waypoint_types::errors::codes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReservationKind {
    Hotel,
    Flight,
    Car,
}

impl fmt::Display for ReservationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReservationKind::Hotel => f.write_str("hotel"),
            ReservationKind::Flight => f.write_str("flight"),
            ReservationKind::Car => f.write_str("car"),
        }
    }
}

/// Both operations must be idempotent per trip: the saga retries them and may cancel a
/// reservation that never went through.
#[async_trait]
pub trait TravelAgency: Send + Sync + 'static {
    /// Returns the confirmation number.
    async fn reserve(
        &self,
        kind: ReservationKind,
        trip_id: &str,
        item: &str,
    ) -> Result<String, HandlerError>;

    async fn cancel(&self, kind: ReservationKind, trip_id: &str) -> Result<(), HandlerError>;
}

/// In memory [`TravelAgency`]. Items marked unavailable are refused with a terminal error.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTravelAgency {
    inner: Arc<Mutex<AgencyState>>,
}

#[derive(Debug, Default)]
struct AgencyState {
    unavailable: BTreeSet<String>,
    reservations: BTreeMap<(String, ReservationKind), String>,
    cancellations: Vec<(String, ReservationKind)>,
}

impl InMemoryTravelAgency {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_unavailable(&self, item: impl Into<String>) {
        self.inner.lock().unavailable.insert(item.into());
    }

    /// Items currently reserved for `trip_id`.
    pub fn reservations(&self, trip_id: &str) -> Vec<(ReservationKind, String)> {
        self.inner
            .lock()
            .reservations
            .iter()
            .filter(|((trip, _), _)| trip == trip_id)
            .map(|((_, kind), item)| (*kind, item.clone()))
            .collect()
    }

    /// Cancellation requests received for `trip_id`, in order.
    pub fn cancellations(&self, trip_id: &str) -> Vec<ReservationKind> {
        self.inner
            .lock()
            .cancellations
            .iter()
            .filter(|(trip, _)| trip == trip_id)
            .map(|(_, kind)| *kind)
            .collect()
    }
}

#[async_trait]
impl TravelAgency for InMemoryTravelAgency {
    async fn reserve(
        &self,
        kind: ReservationKind,
        trip_id: &str,
        item: &str,
    ) -> Result<String, HandlerError> {
        let mut state = self.inner.lock();
        if state.unavailable.contains(item) {
            return Err(TerminalError::new_with_code(
                codes::ABORTED,
                format!("{kind} {item} is not available"),
            )
            .into());
        }
        state
            .reservations
            .insert((trip_id.to_owned(), kind), item.to_owned());
        Ok(format!("{kind}-{trip_id}"))
    }

    async fn cancel(&self, kind: ReservationKind, trip_id: &str) -> Result<(), HandlerError> {
        let mut state = self.inner.lock();
        state.reservations.remove(&(trip_id.to_owned(), kind));
        state.cancellations.push((trip_id.to_owned(), kind));
        Ok(())
    }
}
