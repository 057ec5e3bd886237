//! Trip lifecycle.
//!
//! ```text
//! planned ──start──► active ──complete──► completed
//!    │                 │
//!    └────cancel───────┴──────────────► cancelled
//! ```
//!
//! Start needs the opening odometer reading and its photo; complete needs the
//! closing reading (never below the opening one) and its photo.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::core::{present, Edge, EntityKind, Field, Revision};
use crate::effects::{self, Stamp};
use crate::error::{LifecycleError, Rejection};
use crate::machine::{reject, Accepted, Lifecycle, Machine, Outcome, Proposal};
use crate::policy::{Grant, Parties, Policy};

lifecycle_status! {
    /// Status of a trip.
    pub enum TripStatus {
        Planned => "planned",
        Active => "active",
        Completed => "completed",
        Cancelled => "cancelled",
    }
    terminal: [Completed, Cancelled]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripEdge {
    Start,
    Complete,
    Cancel,
}

const DRIVER_ONLY: &[Grant] = &[Grant::driver()];
const OWNER_ONLY: &[Grant] = &[Grant::owner()];

impl TripEdge {
    pub const fn between(from: TripStatus, to: TripStatus) -> Option<TripEdge> {
        use TripStatus::*;
        match (from, to) {
            (Planned, Active) => Some(TripEdge::Start),
            (Active, Completed) => Some(TripEdge::Complete),
            (Planned | Active, Cancelled) => Some(TripEdge::Cancel),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            TripEdge::Start => "start",
            TripEdge::Complete => "complete",
            TripEdge::Cancel => "cancel",
        }
    }

    pub(crate) const fn grants(self) -> &'static [Grant] {
        match self {
            TripEdge::Start | TripEdge::Complete => DRIVER_ONLY,
            TripEdge::Cancel => OWNER_ONLY,
        }
    }
}

/// Snapshot of a trip as read from storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trip {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub driver_id: Uuid,
    pub status: TripStatus,
    pub odometer_start: Option<i64>,
    pub odometer_start_photo: Option<String>,
    pub odometer_end: Option<i64>,
    pub odometer_end_photo: Option<String>,
    pub settlement_id: Option<Uuid>,
    pub revision: Revision,
    pub updated_at: DateTime<Utc>,
}

impl Trip {
    /// Distance driven, once both readings exist.
    pub fn distance(&self) -> Option<i64> {
        self.odometer_end?.checked_sub(self.odometer_start?)
    }

    pub(crate) fn validate(&self) -> Result<(), LifecycleError> {
        let entity = self.entity_ref();
        if self.id.is_nil() {
            return Err(LifecycleError::malformed(entity, "nil id"));
        }
        if self.owner_id.is_nil() || self.driver_id.is_nil() {
            return Err(LifecycleError::malformed(entity, "nil owner or driver"));
        }
        for (field, reading) in [
            ("odometer_start", self.odometer_start),
            ("odometer_end", self.odometer_end),
        ] {
            if let Some(value) = reading.filter(|value| *value < 0) {
                return Err(LifecycleError::malformed(
                    entity,
                    format!("negative {field} reading {value}"),
                ));
            }
        }
        let started = matches!(self.status, TripStatus::Active | TripStatus::Completed);
        if started
            && (self.odometer_start.is_none()
                || present(self.odometer_start_photo.as_deref()).is_none())
        {
            return Err(LifecycleError::malformed(
                entity,
                format!("{} trip without an opening odometer reading", self.status),
            ));
        }
        if self.status == TripStatus::Completed
            && (self.odometer_end.is_none()
                || present(self.odometer_end_photo.as_deref()).is_none())
        {
            return Err(LifecycleError::malformed(
                entity,
                "completed trip without a closing odometer reading",
            ));
        }
        Ok(())
    }
}

impl Lifecycle for Trip {
    type Status = TripStatus;
    type Evidence = TripEvidence;

    const KIND: EntityKind = EntityKind::Trip;

    fn id(&self) -> Uuid {
        self.id
    }

    fn status(&self) -> TripStatus {
        self.status
    }

    fn revision(&self) -> Revision {
        self.revision
    }
}

/// Odometer readings and photo references captured by the driver app.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TripEvidence {
    pub odometer_start: Option<i64>,
    pub odometer_start_photo: Option<String>,
    pub odometer_end: Option<i64>,
    pub odometer_end_photo: Option<String>,
}

impl TripEvidence {
    pub fn start(reading: i64, photo: impl Into<String>) -> Self {
        Self {
            odometer_start: Some(reading),
            odometer_start_photo: Some(photo.into()),
            ..Self::default()
        }
    }

    pub fn end(reading: i64, photo: impl Into<String>) -> Self {
        Self {
            odometer_end: Some(reading),
            odometer_end_photo: Some(photo.into()),
            ..Self::default()
        }
    }
}

/// Evidence wins over the snapshot; blank photos fall through to the snapshot.
fn merged_photo<'a>(evidence: Option<&'a str>, snapshot: Option<&'a str>) -> Option<&'a str> {
    present(evidence).or_else(|| present(snapshot))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TripMachine {
    policy: Policy,
}

impl TripMachine {
    pub fn new(policy: Policy) -> Self {
        Self { policy }
    }
}

impl Machine for TripMachine {
    type Entity = Trip;
    type Context = ();

    fn decide(
        &self,
        trip: &Trip,
        proposal: &Proposal<Trip>,
        _context: &(),
    ) -> Result<Outcome<Trip>, LifecycleError> {
        trip.validate()?;

        let from = trip.status;
        let to = proposal.target;
        let actor = &proposal.actor;
        let evidence = &proposal.evidence;

        if from.is_terminal() {
            debug!(trip = %trip.id, %from, %to, "rejected: terminal");
            reject!(Rejection::TerminalState {
                entity: EntityKind::Trip,
                status: from.into(),
            });
        }

        let Some(edge) = TripEdge::between(from, to) else {
            debug!(trip = %trip.id, %from, %to, "rejected: not an edge");
            reject!(Rejection::InvalidTransition {
                entity: EntityKind::Trip,
                from: from.into(),
                to: to.into(),
            });
        };

        let parties = Parties {
            owner_id: trip.owner_id,
            driver_id: Some(trip.driver_id),
        };
        let Some(role) = self.policy.authorize(actor, edge.grants(), parties) else {
            debug!(trip = %trip.id, edge = edge.as_str(), actor = %actor.id, "rejected: unauthorized");
            reject!(Rejection::Unauthorized {
                edge: Edge::Trip(edge),
                actor_id: actor.id,
                roles: actor.roles.to_vec(),
            });
        };

        let mut next = trip.clone();
        match edge {
            TripEdge::Start => {
                // Photo first: no photo means missing evidence whatever else was sent.
                let Some(photo) = merged_photo(
                    evidence.odometer_start_photo.as_deref(),
                    trip.odometer_start_photo.as_deref(),
                ) else {
                    reject!(Rejection::MissingEvidence {
                        edge: Edge::Trip(edge),
                        field: Field::OdometerStartPhoto,
                    });
                };
                let Some(reading) = evidence.odometer_start.or(trip.odometer_start) else {
                    reject!(Rejection::MissingEvidence {
                        edge: Edge::Trip(edge),
                        field: Field::OdometerStart,
                    });
                };
                if reading < 0 {
                    reject!(Rejection::InvalidValue {
                        edge: Edge::Trip(edge),
                        field: Field::OdometerStart,
                        detail: format!("reading {reading} is negative"),
                    });
                }
                next.odometer_start = Some(reading);
                next.odometer_start_photo = Some(photo.to_string());
            }
            TripEdge::Complete => {
                let Some(end) = evidence.odometer_end.or(trip.odometer_end) else {
                    reject!(Rejection::MissingEvidence {
                        edge: Edge::Trip(edge),
                        field: Field::OdometerEnd,
                    });
                };
                // validate() guarantees an active trip has its opening reading.
                let start = trip.odometer_start.unwrap_or_default();
                if end < start {
                    reject!(Rejection::InvalidValue {
                        edge: Edge::Trip(edge),
                        field: Field::OdometerEnd,
                        detail: format!("end reading {end} is below start reading {start}"),
                    });
                }
                let Some(photo) = merged_photo(
                    evidence.odometer_end_photo.as_deref(),
                    trip.odometer_end_photo.as_deref(),
                ) else {
                    reject!(Rejection::MissingEvidence {
                        edge: Edge::Trip(edge),
                        field: Field::OdometerEndPhoto,
                    });
                };
                next.odometer_end = Some(end);
                next.odometer_end_photo = Some(photo.to_string());
            }
            TripEdge::Cancel => {}
        }

        next.status = to;
        next.revision = trip.revision.next();
        next.updated_at = proposal.at;

        let stamp = Stamp {
            edge: Edge::Trip(edge),
            actor,
            role,
            note: proposal.note.as_deref(),
            at: proposal.at,
        };
        let side_effects = effects::for_trip(&stamp, trip, &next);
        debug!(trip = %trip.id, %from, %to, role = role.as_str(), "accepted");

        Ok(Outcome::Accepted(Accepted {
            edge: Edge::Trip(edge),
            from,
            to,
            expected_revision: trip.revision,
            trip_guard: None,
            next,
            side_effects,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Actor;
    use crate::testing::TripBuilder;
    use crate::{NotificationEvent, RecalculationTrigger, RejectionReason};

    fn propose(trip: &Trip, target: TripStatus, actor: Actor, evidence: TripEvidence) -> Outcome<Trip> {
        TripMachine::default()
            .decide(trip, &Proposal::new(target, actor).with_evidence(evidence), &())
            .unwrap()
    }

    #[test]
    fn start_merges_evidence_into_snapshot() {
        let trip = TripBuilder::new().build();
        let outcome = propose(
            &trip,
            TripStatus::Active,
            Actor::driver(trip.driver_id),
            TripEvidence::start(52_000, "odo-start.jpg"),
        );
        let accepted = outcome.accepted().unwrap();
        assert_eq!(accepted.next.odometer_start, Some(52_000));
        assert_eq!(accepted.next.odometer_start_photo.as_deref(), Some("odo-start.jpg"));
        assert_eq!(
            accepted.side_effects.notifications[0].event,
            NotificationEvent::TripStarted
        );
    }

    #[test]
    fn start_uses_readings_already_on_snapshot() {
        let mut trip = TripBuilder::new().build();
        trip.odometer_start = Some(10);
        trip.odometer_start_photo = Some("earlier.jpg".into());
        let outcome = propose(&trip, TripStatus::Active, Actor::driver(trip.driver_id), TripEvidence::default());
        assert!(outcome.is_accepted());
    }

    #[test]
    fn negative_start_reading_is_invalid() {
        let trip = TripBuilder::new().build();
        let outcome = propose(
            &trip,
            TripStatus::Active,
            Actor::driver(trip.driver_id),
            TripEvidence::start(-5, "odo.jpg"),
        );
        assert_eq!(outcome.rejection().map(Rejection::reason), Some(RejectionReason::InvalidValue));
    }

    #[test]
    fn complete_requires_end_photo() {
        let trip = TripBuilder::new().active(1_000, "odo.jpg").build();
        let evidence = TripEvidence {
            odometer_end: Some(1_200),
            ..TripEvidence::default()
        };
        let outcome = propose(&trip, TripStatus::Completed, Actor::driver(trip.driver_id), evidence);
        assert_eq!(
            outcome.rejection(),
            Some(&Rejection::MissingEvidence {
                edge: Edge::Trip(TripEdge::Complete),
                field: Field::OdometerEndPhoto,
            })
        );
    }

    #[test]
    fn complete_triggers_settlement_with_reference() {
        let settlement = Uuid::new_v4();
        let mut trip = TripBuilder::new().active(1_000, "odo.jpg").build();
        trip.settlement_id = Some(settlement);
        let outcome = propose(
            &trip,
            TripStatus::Completed,
            Actor::driver(trip.driver_id),
            TripEvidence::end(1_000, "odo-end.jpg"),
        );
        let accepted = outcome.accepted().unwrap();
        assert_eq!(accepted.next.distance(), Some(0));
        assert_eq!(
            accepted.side_effects.recalculations.as_slice(),
            &[RecalculationTrigger::TripSettlement {
                trip_id: trip.id,
                settlement_id: Some(settlement),
            }]
        );
        assert_eq!(accepted.side_effects.notifications[0].payload["distance"], 0);
    }

    #[test]
    fn only_owner_cancels() {
        let trip = TripBuilder::new().build();
        let by_driver = propose(&trip, TripStatus::Cancelled, Actor::driver(trip.driver_id), TripEvidence::default());
        assert_eq!(by_driver.rejection().map(Rejection::reason), Some(RejectionReason::Unauthorized));

        let by_owner = propose(&trip, TripStatus::Cancelled, Actor::owner(trip.owner_id), TripEvidence::default());
        let accepted = by_owner.accepted().unwrap();
        assert!(accepted.side_effects.recalculations.is_empty());
        assert_eq!(
            accepted.side_effects.notifications[0].recipient.user_id,
            Some(trip.driver_id)
        );
    }

    #[test]
    fn active_trip_without_opening_reading_is_malformed() {
        let mut trip = TripBuilder::new().active(1_000, "odo.jpg").build();
        trip.odometer_start_photo = None;
        let result = TripMachine::default().decide(
            &trip,
            &Proposal::new(TripStatus::Cancelled, Actor::owner(trip.owner_id)),
            &(),
        );
        assert!(matches!(result, Err(LifecycleError::MalformedSnapshot { .. })));
    }

    #[test]
    fn negative_snapshot_reading_is_malformed() {
        let trip = TripBuilder::new().active(-1, "odo.jpg").build();
        let result = TripMachine::default().decide(
            &trip,
            &Proposal::new(TripStatus::Completed, Actor::driver(trip.driver_id))
                .with_evidence(TripEvidence::end(i64::MAX, "end.jpg")),
            &(),
        );
        assert!(matches!(result, Err(LifecycleError::MalformedSnapshot { .. })));
    }

    #[test]
    fn widest_legal_reading_gap_does_not_overflow() {
        let trip = TripBuilder::new().active(0, "odo.jpg").build();
        let outcome = propose(
            &trip,
            TripStatus::Completed,
            Actor::driver(trip.driver_id),
            TripEvidence::end(i64::MAX, "end.jpg"),
        );
        let accepted = outcome.accepted().unwrap();
        assert_eq!(accepted.next.distance(), Some(i64::MAX));
        assert_eq!(accepted.side_effects.notifications[0].payload["distance"], i64::MAX);
    }

    #[test]
    fn history_entry_records_actor_role_and_note() {
        let trip = TripBuilder::new().build();
        let proposal = Proposal::new(TripStatus::Active, Actor::driver(trip.driver_id))
            .with_evidence(TripEvidence::start(7, "odo.jpg"))
            .with_note("left the yard");
        let outcome = TripMachine::default().decide(&trip, &proposal, &()).unwrap();
        let entry = &outcome.accepted().unwrap().side_effects.history_entry;
        assert_eq!(entry.actor_role, crate::Role::Driver);
        assert_eq!(entry.note.as_deref(), Some("left the yard"));
        assert_eq!(entry.revision, trip.revision.next());
        assert_eq!(entry.recorded_at, proposal.at);
    }
}
