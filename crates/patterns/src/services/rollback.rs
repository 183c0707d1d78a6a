// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Trip booking saga: reservations made before a failing one are cancelled again.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use waypoint_context::{Context, HandlerError, ServiceDefinition, handler};

use crate::services::Dependencies;
use crate::travel::{ReservationKind, TravelAgency};

pub const SERVICE: &str = "BookingWithRollback";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripRequest {
    pub trip_id: String,
    pub hotel: String,
    pub flight: String,
    #[serde(default)]
    pub car: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Itinerary {
    pub trip_id: String,
    pub confirmations: Vec<String>,
}

pub fn definition(deps: &Dependencies) -> ServiceDefinition {
    let travel = Arc::clone(&deps.travel);
    ServiceDefinition::service(SERVICE).with_handler(
        "book",
        handler(move |ctx: Context, trip: TripRequest| {
            let travel = Arc::clone(&travel);
            async move { book(&ctx, travel, trip).await }
        }),
    )
}

async fn book(
    ctx: &Context,
    travel: Arc<dyn TravelAgency>,
    trip: TripRequest,
) -> Result<Itinerary, HandlerError> {
    let mut reservations = vec![
        (ReservationKind::Hotel, trip.hotel),
        (ReservationKind::Flight, trip.flight),
    ];
    reservations.extend(trip.car.map(|car| (ReservationKind::Car, car)));

    let mut confirmations = Vec::with_capacity(reservations.len());
    for (kind, item) in reservations {
        // registered first: the reservation may go through even if its step fails
        let agency = Arc::clone(&travel);
        let trip_id = trip.trip_id.clone();
        ctx.register_compensation(format!("cancel {kind}"), move || {
            let agency = Arc::clone(&agency);
            let trip_id = trip_id.clone();
            async move { agency.cancel(kind, &trip_id).await }
        });

        let agency = Arc::clone(&travel);
        let trip_id = trip.trip_id.clone();
        let confirmation = ctx
            .run(format!("reserve {kind}"), move || {
                let agency = Arc::clone(&agency);
                let trip_id = trip_id.clone();
                let item = item.clone();
                async move { agency.reserve(kind, &trip_id, &item).await }
            })
            .await?;
        confirmations.push(confirmation);
    }

    Ok(Itinerary {
        trip_id: trip.trip_id,
        confirmations,
    })
}
