//! Snapshot builders for tests.
//!
//! Builders always produce snapshots that pass validation: statuses that need
//! a driver or an opening odometer reading get one unless the test sets it.

use chrono::Utc;
use uuid::Uuid;

use crate::core::{Accessorial, Location, LoadSource, Revision};
use crate::load::{Load, LoadStatus};
use crate::trip::{Trip, TripStatus};

#[derive(Debug, Clone)]
pub struct LoadBuilder {
    load: Load,
}

impl Default for LoadBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBuilder {
    /// A draft internal load owned by a fresh owner id.
    pub fn new() -> Self {
        Self {
            load: Load {
                id: Uuid::new_v4(),
                owner_id: Uuid::new_v4(),
                status: LoadStatus::Draft,
                pickup: Location::at("Dock 4, Joliet IL", 41.525, -88.081),
                delivery: Location::at("Warehouse B, Columbus OH", 39.961, -82.998),
                assigned_driver_id: None,
                trip_id: None,
                requested_by: None,
                rate_cents: 185_000,
                accessorials: Vec::new(),
                source: LoadSource::Internal,
                deleted: false,
                revision: Revision::INITIAL,
                updated_at: Utc::now(),
            },
        }
    }

    pub fn id(mut self, id: Uuid) -> Self {
        self.load.id = id;
        self
    }

    pub fn owner(mut self, owner_id: Uuid) -> Self {
        self.load.owner_id = owner_id;
        self
    }

    pub fn status(mut self, status: LoadStatus) -> Self {
        self.load.status = status;
        self.load.deleted = status == LoadStatus::Deleted;
        self
    }

    /// Binds a driver; a load still before assignment becomes `assigned`.
    pub fn assigned_to(mut self, driver_id: Uuid) -> Self {
        self.load.assigned_driver_id = Some(driver_id);
        if matches!(
            self.load.status,
            LoadStatus::Draft | LoadStatus::Posted | LoadStatus::Requested
        ) {
            self.load.status = LoadStatus::Assigned;
        }
        self
    }

    pub fn on_trip(mut self, trip_id: Uuid) -> Self {
        self.load.trip_id = Some(trip_id);
        self
    }

    pub fn requested_by(mut self, requester: Uuid) -> Self {
        self.load.requested_by = Some(requester);
        self
    }

    pub fn source(mut self, source: LoadSource) -> Self {
        self.load.source = source;
        self
    }

    pub fn rate_cents(mut self, rate_cents: i64) -> Self {
        self.load.rate_cents = rate_cents;
        self
    }

    pub fn accessorial(mut self, description: impl Into<String>, amount_cents: i64) -> Self {
        self.load.accessorials.push(Accessorial {
            description: description.into(),
            amount_cents,
        });
        self
    }

    pub fn revision(mut self, revision: Revision) -> Self {
        self.load.revision = revision;
        self
    }

    pub fn build(mut self) -> Load {
        let needs_driver = matches!(
            self.load.status,
            LoadStatus::Assigned | LoadStatus::InTransit | LoadStatus::Delivered
        );
        if needs_driver && self.load.assigned_driver_id.is_none() {
            self.load.assigned_driver_id = Some(Uuid::new_v4());
        }
        self.load
    }
}

#[derive(Debug, Clone)]
pub struct TripBuilder {
    trip: Trip,
}

impl Default for TripBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TripBuilder {
    /// A planned trip with fresh owner and driver ids and no readings.
    pub fn new() -> Self {
        Self {
            trip: Trip {
                id: Uuid::new_v4(),
                owner_id: Uuid::new_v4(),
                driver_id: Uuid::new_v4(),
                status: TripStatus::Planned,
                odometer_start: None,
                odometer_start_photo: None,
                odometer_end: None,
                odometer_end_photo: None,
                settlement_id: None,
                revision: Revision::INITIAL,
                updated_at: Utc::now(),
            },
        }
    }

    pub fn id(mut self, id: Uuid) -> Self {
        self.trip.id = id;
        self
    }

    pub fn owner(mut self, owner_id: Uuid) -> Self {
        self.trip.owner_id = owner_id;
        self
    }

    pub fn driver(mut self, driver_id: Uuid) -> Self {
        self.trip.driver_id = driver_id;
        self
    }

    pub fn status(mut self, status: TripStatus) -> Self {
        self.trip.status = status;
        self
    }

    /// Active, with the given opening reading.
    pub fn active(mut self, odometer_start: i64, photo: impl Into<String>) -> Self {
        self.trip.status = TripStatus::Active;
        self.trip.odometer_start = Some(odometer_start);
        self.trip.odometer_start_photo = Some(photo.into());
        self
    }

    /// Completed, with the given closing reading. Call after [`Self::active`].
    pub fn completed(mut self, odometer_end: i64, photo: impl Into<String>) -> Self {
        self.trip.status = TripStatus::Completed;
        self.trip.odometer_end = Some(odometer_end);
        self.trip.odometer_end_photo = Some(photo.into());
        self
    }

    pub fn settlement(mut self, settlement_id: Uuid) -> Self {
        self.trip.settlement_id = Some(settlement_id);
        self
    }

    pub fn revision(mut self, revision: Revision) -> Self {
        self.trip.revision = revision;
        self
    }

    pub fn build(mut self) -> Trip {
        let started = matches!(self.trip.status, TripStatus::Active | TripStatus::Completed);
        if started && self.trip.odometer_start.is_none() {
            self.trip.odometer_start = Some(0);
        }
        if started && self.trip.odometer_start_photo.is_none() {
            self.trip.odometer_start_photo = Some("odometer-start.jpg".to_string());
        }
        if self.trip.status == TripStatus::Completed {
            let start = self.trip.odometer_start.unwrap_or_default();
            self.trip.odometer_end.get_or_insert(start);
            self.trip
                .odometer_end_photo
                .get_or_insert_with(|| "odometer-end.jpg".to_string());
        }
        self.trip
    }
}
