//! Load lifecycle.
//!
//! ```text
//! draft ──publish──► posted ──request──► requested ──accept──► assigned
//!                      ▲                     │                    │
//!                      └──────reject─────────┘                 pickup
//!                                                                 ▼
//!                                 delivered ◄──deliver──── in_transit
//!
//! any non-terminal (except delivered) ──cancel──► cancelled
//! any state, cancelled included       ──delete──► deleted
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::core::{
    present, Accessorial, Actor, Edge, EntityKind, EntityRef, Field, Location, LoadSource,
    Revision, Role,
};
use crate::effects::{self, Stamp};
use crate::error::{LifecycleError, Rejection};
use crate::machine::{reject, Accepted, Lifecycle, Machine, Outcome, Proposal, TripGuard};
use crate::policy::{Grant, Parties, Policy};
use crate::trip::{Trip, TripStatus};

lifecycle_status! {
    /// Status of a load.
    pub enum LoadStatus {
        Draft => "draft",
        Posted => "posted",
        Requested => "requested",
        Assigned => "assigned",
        InTransit => "in_transit",
        Delivered => "delivered",
        Cancelled => "cancelled",
        /// Soft-deleted. Never leaves this state.
        Deleted => "deleted",
    }
    terminal: [Cancelled, Deleted]
}

/// Named edges of the load graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadEdge {
    Publish,
    Request,
    Accept,
    Reject,
    Pickup,
    Deliver,
    Cancel,
    Delete,
}

const OWNER_ONLY: &[Grant] = &[Grant::owner()];
const REQUESTERS: &[Grant] = &[Grant::any(Role::Company), Grant::any(Role::Carrier)];
const DRIVER_OR_OWNER: &[Grant] = &[Grant::driver(), Grant::owner()];

impl LoadEdge {
    /// The transition table. `None` means the pair is not an edge.
    pub const fn between(from: LoadStatus, to: LoadStatus) -> Option<LoadEdge> {
        use LoadStatus::*;
        match (from, to) {
            (Draft, Posted) => Some(LoadEdge::Publish),
            (Posted, Requested) => Some(LoadEdge::Request),
            (Requested, Assigned) => Some(LoadEdge::Accept),
            (Requested, Posted) => Some(LoadEdge::Reject),
            (Assigned, InTransit) => Some(LoadEdge::Pickup),
            (InTransit, Delivered) => Some(LoadEdge::Deliver),
            (Draft | Posted | Requested | Assigned | InTransit, Cancelled) => {
                Some(LoadEdge::Cancel)
            }
            (_, Deleted) if !matches!(from, Deleted) => Some(LoadEdge::Delete),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            LoadEdge::Publish => "publish",
            LoadEdge::Request => "request",
            LoadEdge::Accept => "accept",
            LoadEdge::Reject => "reject",
            LoadEdge::Pickup => "pickup",
            LoadEdge::Deliver => "deliver",
            LoadEdge::Cancel => "cancel",
            LoadEdge::Delete => "delete",
        }
    }

    pub(crate) const fn grants(self) -> &'static [Grant] {
        match self {
            LoadEdge::Publish
            | LoadEdge::Accept
            | LoadEdge::Reject
            | LoadEdge::Cancel
            | LoadEdge::Delete => OWNER_ONLY,
            LoadEdge::Request => REQUESTERS,
            LoadEdge::Pickup | LoadEdge::Deliver => DRIVER_OR_OWNER,
        }
    }
}

/// Snapshot of a load as read from storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Load {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub status: LoadStatus,
    pub pickup: Location,
    pub delivery: Location,
    pub assigned_driver_id: Option<Uuid>,
    pub trip_id: Option<Uuid>,
    /// Company or carrier whose request is pending or was accepted.
    pub requested_by: Option<Uuid>,
    pub rate_cents: i64,
    pub accessorials: Vec<Accessorial>,
    pub source: LoadSource,
    pub deleted: bool,
    pub revision: Revision,
    pub updated_at: DateTime<Utc>,
}

impl Load {
    /// Line-haul rate plus accessorials, or `None` when the sum overflows.
    pub fn total_cents(&self) -> Option<i64> {
        self.accessorials
            .iter()
            .try_fold(self.rate_cents, |total, a| total.checked_add(a.amount_cents))
    }

    /// The soft-delete flag wins over whatever status column was stored.
    pub fn effective_status(&self) -> LoadStatus {
        if self.deleted {
            LoadStatus::Deleted
        } else {
            self.status
        }
    }

    fn validate(&self) -> Result<(), LifecycleError> {
        let entity = self.entity_ref();
        if self.id.is_nil() {
            return Err(LifecycleError::malformed(entity, "nil id"));
        }
        if self.owner_id.is_nil() {
            return Err(LifecycleError::malformed(entity, "nil owner_id"));
        }
        if self.total_cents().is_none() {
            return Err(LifecycleError::malformed(
                entity,
                "rate plus accessorials overflows",
            ));
        }
        let needs_driver = matches!(
            self.status,
            LoadStatus::Assigned | LoadStatus::InTransit | LoadStatus::Delivered
        );
        if needs_driver && self.assigned_driver_id.is_none() {
            return Err(LifecycleError::malformed(
                entity,
                format!("{} load without an assigned driver", self.status),
            ));
        }
        Ok(())
    }
}

impl Lifecycle for Load {
    type Status = LoadStatus;
    type Evidence = LoadEvidence;

    const KIND: EntityKind = EntityKind::Load;

    fn id(&self) -> Uuid {
        self.id
    }

    fn status(&self) -> LoadStatus {
        self.effective_status()
    }

    fn revision(&self) -> Revision {
        self.revision
    }
}

/// Proof supplied with a load transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadEvidence {
    /// Driver bound on accept. Falls back to the load's current assignment.
    pub driver_id: Option<Uuid>,
    /// Bill-of-lading photo reference, for pickup.
    pub pickup_photo: Option<String>,
    /// Proof-of-delivery photo reference, for delivery.
    pub delivery_photo: Option<String>,
}

impl LoadEvidence {
    pub fn driver(driver_id: Uuid) -> Self {
        Self {
            driver_id: Some(driver_id),
            ..Self::default()
        }
    }

    pub fn pickup_photo(photo: impl Into<String>) -> Self {
        Self {
            pickup_photo: Some(photo.into()),
            ..Self::default()
        }
    }

    pub fn delivery_photo(photo: impl Into<String>) -> Self {
        Self {
            delivery_photo: Some(photo.into()),
            ..Self::default()
        }
    }
}

/// What the load machine needs to know about the owning trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadContext {
    pub trip: Option<TripView>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TripView {
    pub id: Uuid,
    pub status: TripStatus,
    pub revision: Revision,
}

impl TripView {
    fn guard(&self) -> TripGuard {
        TripGuard {
            trip_id: self.id,
            revision: self.revision,
        }
    }
}

impl LoadContext {
    pub fn with_trip(trip: Option<&Trip>) -> Self {
        Self {
            trip: trip.map(|t| TripView {
                id: t.id,
                status: t.status,
                revision: t.revision,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LoadMachine {
    policy: Policy,
}

impl LoadMachine {
    pub fn new(policy: Policy) -> Self {
        Self { policy }
    }

    /// Resolves the owning trip's status for edges that depend on it.
    fn owning_trip(load: &Load, context: &LoadContext) -> Result<Option<TripView>, LifecycleError> {
        match (load.trip_id, context.trip) {
            (None, None) => Ok(None),
            (Some(trip_id), None) => Err(LifecycleError::MissingTripContext {
                load_id: load.id,
                trip_id,
            }),
            (expected, Some(view)) if expected != Some(view.id) => {
                Err(LifecycleError::TripContextMismatch {
                    load_id: load.id,
                    expected,
                    supplied: view.id,
                })
            }
            (_, Some(view)) => Ok(Some(view)),
        }
    }

    fn require_photo(
        required: bool,
        photo: Option<&str>,
        edge: LoadEdge,
        field: Field,
    ) -> Option<Rejection> {
        if required && present(photo).is_none() {
            return Some(Rejection::MissingEvidence {
                edge: Edge::Load(edge),
                field,
            });
        }
        None
    }

    /// Attach an assigned load to a planned or active trip.
    ///
    /// Leaves the load status alone; the accepted outcome carries the
    /// `trip_id` write, a history entry and a `LoadPlanned` notification.
    pub fn plan_on_trip(
        &self,
        load: &Load,
        trip: &Trip,
        actor: &Actor,
        at: DateTime<Utc>,
        note: Option<&str>,
    ) -> Result<Outcome<Load>, LifecycleError> {
        load.validate()?;
        trip.validate()?;

        let edge = Edge::PlanOnTrip;
        let status = load.effective_status();
        if status.is_terminal() {
            reject!(Rejection::TerminalState {
                entity: EntityKind::Load,
                status: status.into(),
            });
        }
        if trip.status.is_terminal() {
            reject!(Rejection::TerminalState {
                entity: EntityKind::Trip,
                status: trip.status.into(),
            });
        }
        if status != LoadStatus::Assigned {
            reject!(Rejection::InvalidValue {
                edge,
                field: Field::Status,
                detail: format!("load must be assigned, it is {status}"),
            });
        }

        let authorized_on_load = self.policy.authorize(
            actor,
            OWNER_ONLY,
            Parties {
                owner_id: load.owner_id,
                driver_id: load.assigned_driver_id,
            },
        );
        let authorized_on_trip = self.policy.authorize(
            actor,
            OWNER_ONLY,
            Parties {
                owner_id: trip.owner_id,
                driver_id: Some(trip.driver_id),
            },
        );
        let role = match (authorized_on_load, authorized_on_trip) {
            (Some(role), Some(_)) => role,
            _ => reject!(Rejection::Unauthorized {
                edge,
                actor_id: actor.id,
                roles: actor.roles.to_vec(),
            }),
        };

        match load.trip_id {
            Some(current) if current == trip.id => reject!(Rejection::InvalidValue {
                edge,
                field: Field::TripId,
                detail: format!("load is already planned on trip {current}"),
            }),
            Some(current) => reject!(Rejection::InvalidValue {
                edge,
                field: Field::TripId,
                detail: format!("load is planned on another trip ({current})"),
            }),
            None => {}
        }
        if load.assigned_driver_id != Some(trip.driver_id) {
            reject!(Rejection::InvalidValue {
                edge,
                field: Field::DriverId,
                detail: "load driver differs from trip driver".to_string(),
            });
        }

        let mut next = load.clone();
        next.trip_id = Some(trip.id);
        next.revision = load.revision.next();
        next.updated_at = at;

        let stamp = Stamp {
            edge,
            actor,
            role,
            note,
            at,
        };
        let side_effects = effects::for_load(&stamp, load, &next);
        debug!(load = %load.id, trip = %trip.id, "load planned on trip");

        Ok(Outcome::Accepted(Accepted {
            edge,
            from: status,
            to: status,
            expected_revision: load.revision,
            trip_guard: Some(TripGuard {
                trip_id: trip.id,
                revision: trip.revision,
            }),
            next,
            side_effects,
        }))
    }
}

impl Machine for LoadMachine {
    type Entity = Load;
    type Context = LoadContext;

    fn decide(
        &self,
        load: &Load,
        proposal: &Proposal<Load>,
        context: &LoadContext,
    ) -> Result<Outcome<Load>, LifecycleError> {
        load.validate()?;

        let from = load.effective_status();
        let to = proposal.target;
        let actor = &proposal.actor;
        let evidence = &proposal.evidence;

        // Soft-delete is still open from cancelled.
        let reopens_terminal = from == LoadStatus::Cancelled && to == LoadStatus::Deleted;
        if from.is_terminal() && !reopens_terminal {
            debug!(load = %load.id, %from, %to, "rejected: terminal");
            reject!(Rejection::TerminalState {
                entity: EntityKind::Load,
                status: from.into(),
            });
        }

        let Some(edge) = LoadEdge::between(from, to) else {
            debug!(load = %load.id, %from, %to, "rejected: not an edge");
            reject!(Rejection::InvalidTransition {
                entity: EntityKind::Load,
                from: from.into(),
                to: to.into(),
            });
        };

        let parties = Parties {
            owner_id: load.owner_id,
            driver_id: load.assigned_driver_id,
        };
        let Some(role) = self.policy.authorize(actor, edge.grants(), parties) else {
            debug!(load = %load.id, edge = edge.as_str(), actor = %actor.id, "rejected: unauthorized");
            reject!(Rejection::Unauthorized {
                edge: Edge::Load(edge),
                actor_id: actor.id,
                roles: actor.roles.to_vec(),
            });
        };

        let mut next = load.clone();
        let mut trip_guard = None;
        match edge {
            LoadEdge::Publish | LoadEdge::Cancel => {}
            LoadEdge::Request => next.requested_by = Some(actor.id),
            LoadEdge::Accept => {
                let Some(driver_id) = evidence.driver_id.or(load.assigned_driver_id) else {
                    reject!(Rejection::MissingEvidence {
                        edge: Edge::Load(edge),
                        field: Field::DriverId,
                    });
                };
                if driver_id.is_nil() {
                    reject!(Rejection::InvalidValue {
                        edge: Edge::Load(edge),
                        field: Field::DriverId,
                        detail: "nil driver id".to_string(),
                    });
                }
                next.assigned_driver_id = Some(driver_id);
            }
            LoadEdge::Reject => next.requested_by = None,
            LoadEdge::Pickup | LoadEdge::Deliver => {
                // Resolved before evidence: a missing trip context is always an error.
                let owning_trip = Self::owning_trip(load, context)?;
                let (required, photo, field) = if edge == LoadEdge::Pickup {
                    (
                        self.policy.require_pickup_photo,
                        evidence.pickup_photo.as_deref(),
                        Field::PickupPhoto,
                    )
                } else {
                    (
                        self.policy.require_delivery_photo,
                        evidence.delivery_photo.as_deref(),
                        Field::DeliveryPhoto,
                    )
                };
                if let Some(rejection) = Self::require_photo(required, photo, edge, field) {
                    reject!(rejection);
                }
                if let Some(trip) = owning_trip {
                    if trip.status != TripStatus::Active {
                        reject!(Rejection::TripNotActive {
                            edge: Edge::Load(edge),
                            trip_id: trip.id,
                            status: trip.status,
                        });
                    }
                    trip_guard = Some(trip.guard());
                }
            }
            LoadEdge::Delete => next.deleted = true,
        }

        next.status = to;
        next.revision = load.revision.next();
        next.updated_at = proposal.at;

        let stamp = Stamp {
            edge: Edge::Load(edge),
            actor,
            role,
            note: proposal.note.as_deref(),
            at: proposal.at,
        };
        let side_effects = effects::for_load(&stamp, load, &next);
        debug!(load = %load.id, %from, %to, role = role.as_str(), "accepted");

        Ok(Outcome::Accepted(Accepted {
            edge: Edge::Load(edge),
            from,
            to,
            expected_revision: load.revision,
            trip_guard,
            next,
            side_effects,
        }))
    }
}

impl From<&Load> for EntityRef {
    fn from(load: &Load) -> Self {
        EntityRef::load(load.id)
    }
}
