//! Side effects an accepted transition must carry into its commit.
//!
//! The engine decides *which* effects fire; it never performs them. The store
//! writes the history entry and the outbox messages in the same transaction as
//! the status, and the [`Relay`](crate::Relay) delivers the outbox later.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use smallvec::SmallVec;
use uuid::Uuid;

use crate::core::{Actor, Edge, EntityRef, EntityStatus, LoadSource, Revision, Role};
use crate::load::{Load, LoadEdge};
use crate::machine::Lifecycle;
use crate::outbox::OutboxMessage;
use crate::trip::{Trip, TripEdge};

/// Append-only audit record of one accepted transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    pub entity: EntityRef,
    pub edge: Edge,
    pub previous_status: EntityStatus,
    pub new_status: EntityStatus,
    pub actor_id: Uuid,
    /// The role that authorized the edge.
    pub actor_role: Role,
    /// Revision the entity moves to.
    pub revision: Revision,
    pub recorded_at: DateTime<Utc>,
    pub note: Option<String>,
}

/// Who should hear about a transition. `user_id: None` addresses every holder
/// of the role (marketplace broadcasts).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Recipient {
    pub role: Role,
    pub user_id: Option<Uuid>,
}

impl Recipient {
    pub const fn user(role: Role, user_id: Uuid) -> Self {
        Self {
            role,
            user_id: Some(user_id),
        }
    }

    pub const fn broadcast(role: Role) -> Self {
        Self {
            role,
            user_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationEvent {
    LoadPosted,
    LoadRequested,
    LoadAssigned,
    RequestAccepted,
    RequestRejected,
    LoadPlanned,
    LoadPickedUp,
    LoadDelivered,
    LoadCancelled,
    TripStarted,
    TripCompleted,
    TripCancelled,
}

impl NotificationEvent {
    pub const fn as_str(self) -> &'static str {
        match self {
            NotificationEvent::LoadPosted => "load_posted",
            NotificationEvent::LoadRequested => "load_requested",
            NotificationEvent::LoadAssigned => "load_assigned",
            NotificationEvent::RequestAccepted => "request_accepted",
            NotificationEvent::RequestRejected => "request_rejected",
            NotificationEvent::LoadPlanned => "load_planned",
            NotificationEvent::LoadPickedUp => "load_picked_up",
            NotificationEvent::LoadDelivered => "load_delivered",
            NotificationEvent::LoadCancelled => "load_cancelled",
            NotificationEvent::TripStarted => "trip_started",
            NotificationEvent::TripCompleted => "trip_completed",
            NotificationEvent::TripCancelled => "trip_cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationTrigger {
    pub recipient: Recipient,
    pub event: NotificationEvent,
    pub entity: EntityRef,
    pub payload: serde_json::Value,
}

/// Request for the financial collaborator to recompute something.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecalculationTrigger {
    /// Invoice/receivable for a delivered load.
    LoadReceivable { load_id: Uuid },
    /// Driver settlement for a trip.
    TripSettlement {
        trip_id: Uuid,
        settlement_id: Option<Uuid>,
    },
}

/// Everything a commit must carry besides the new snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideEffects {
    pub history_entry: StatusHistoryEntry,
    pub notifications: SmallVec<[NotificationTrigger; 2]>,
    pub recalculations: SmallVec<[RecalculationTrigger; 2]>,
}

/// One effect in application order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Effect<'a> {
    History(&'a StatusHistoryEntry),
    Notify(&'a NotificationTrigger),
    Recalculate(&'a RecalculationTrigger),
}

impl SideEffects {
    fn new(history_entry: StatusHistoryEntry) -> Self {
        Self {
            history_entry,
            notifications: SmallVec::new(),
            recalculations: SmallVec::new(),
        }
    }

    fn notify(&mut self, recipient: Recipient, event: NotificationEvent, payload: &serde_json::Value) {
        self.notifications.push(NotificationTrigger {
            recipient,
            event,
            entity: self.history_entry.entity,
            payload: payload.clone(),
        });
    }

    /// History first, then notifications, then recalculations.
    pub fn ordered(&self) -> impl Iterator<Item = Effect<'_>> {
        std::iter::once(Effect::History(&self.history_entry))
            .chain(self.notifications.iter().map(Effect::Notify))
            .chain(self.recalculations.iter().map(Effect::Recalculate))
    }

    /// The deliverable part of the effects, as written to the outbox.
    pub fn outbox_messages(&self) -> Vec<OutboxMessage> {
        self.notifications
            .iter()
            .cloned()
            .map(OutboxMessage::Notification)
            .chain(
                self.recalculations
                    .iter()
                    .copied()
                    .map(OutboxMessage::Recalculation),
            )
            .collect()
    }

    pub fn has_recalculations(&self) -> bool {
        !self.recalculations.is_empty()
    }
}

/// Inputs shared by both effect computations.
pub(crate) struct Stamp<'a> {
    pub edge: Edge,
    pub actor: &'a Actor,
    pub role: Role,
    pub note: Option<&'a str>,
    pub at: DateTime<Utc>,
}

impl Stamp<'_> {
    fn entry(
        &self,
        entity: EntityRef,
        previous_status: EntityStatus,
        new_status: EntityStatus,
        revision: Revision,
    ) -> StatusHistoryEntry {
        StatusHistoryEntry {
            entity,
            edge: self.edge,
            previous_status,
            new_status,
            actor_id: self.actor.id,
            actor_role: self.role,
            revision,
            recorded_at: self.at,
            note: self.note.map(str::to_string),
        }
    }
}

pub(crate) fn for_load(stamp: &Stamp<'_>, before: &Load, after: &Load) -> SideEffects {
    let entry = stamp.entry(
        after.entity_ref(),
        before.status.into(),
        after.status.into(),
        after.revision,
    );
    let mut effects = SideEffects::new(entry);
    let payload = json!({
        "load_id": after.id,
        "from": before.status,
        "to": after.status,
        "pickup": after.pickup.label,
        "delivery": after.delivery.label,
        "driver_id": after.assigned_driver_id,
        "trip_id": after.trip_id,
        "total_cents": after.total_cents(),
    });
    let owner = Recipient::user(Role::Owner, after.owner_id);

    match stamp.edge {
        Edge::Load(LoadEdge::Publish) => {
            if after.source == LoadSource::Marketplace {
                effects.notify(
                    Recipient::broadcast(Role::Company),
                    NotificationEvent::LoadPosted,
                    &payload,
                );
            }
        }
        Edge::Load(LoadEdge::Request) => {
            effects.notify(owner, NotificationEvent::LoadRequested, &payload);
        }
        Edge::Load(LoadEdge::Accept) => {
            if let Some(driver_id) = after.assigned_driver_id {
                effects.notify(
                    Recipient::user(Role::Driver, driver_id),
                    NotificationEvent::LoadAssigned,
                    &payload,
                );
            }
            if let Some(requester) = before.requested_by {
                effects.notify(
                    Recipient::user(Role::Company, requester),
                    NotificationEvent::RequestAccepted,
                    &payload,
                );
            }
        }
        Edge::Load(LoadEdge::Reject) => {
            if let Some(requester) = before.requested_by {
                effects.notify(
                    Recipient::user(Role::Company, requester),
                    NotificationEvent::RequestRejected,
                    &payload,
                );
            }
        }
        Edge::Load(LoadEdge::Pickup) => {
            effects.notify(owner, NotificationEvent::LoadPickedUp, &payload);
        }
        Edge::Load(LoadEdge::Deliver) => {
            effects.notify(owner, NotificationEvent::LoadDelivered, &payload);
            effects
                .recalculations
                .push(RecalculationTrigger::LoadReceivable { load_id: after.id });
            if let Some(trip_id) = after.trip_id {
                effects.recalculations.push(RecalculationTrigger::TripSettlement {
                    trip_id,
                    settlement_id: None,
                });
            }
        }
        Edge::Load(LoadEdge::Cancel) => {
            if let Some(driver_id) = before.assigned_driver_id {
                effects.notify(
                    Recipient::user(Role::Driver, driver_id),
                    NotificationEvent::LoadCancelled,
                    &payload,
                );
            }
            if let Some(requester) = before.requested_by {
                effects.notify(
                    Recipient::user(Role::Company, requester),
                    NotificationEvent::LoadCancelled,
                    &payload,
                );
            }
            if let Some(trip_id) = before.trip_id {
                effects.recalculations.push(RecalculationTrigger::TripSettlement {
                    trip_id,
                    settlement_id: None,
                });
            }
        }
        Edge::Load(LoadEdge::Delete) => {}
        Edge::PlanOnTrip => {
            if let Some(driver_id) = after.assigned_driver_id {
                effects.notify(
                    Recipient::user(Role::Driver, driver_id),
                    NotificationEvent::LoadPlanned,
                    &payload,
                );
            }
        }
        Edge::Trip(_) => {}
    }

    effects
}

pub(crate) fn for_trip(stamp: &Stamp<'_>, before: &Trip, after: &Trip) -> SideEffects {
    let entry = stamp.entry(
        after.entity_ref(),
        before.status.into(),
        after.status.into(),
        after.revision,
    );
    let mut effects = SideEffects::new(entry);
    let distance = after.distance();
    let payload = json!({
        "trip_id": after.id,
        "from": before.status,
        "to": after.status,
        "driver_id": after.driver_id,
        "odometer_start": after.odometer_start,
        "odometer_end": after.odometer_end,
        "distance": distance,
    });

    match stamp.edge {
        Edge::Trip(TripEdge::Start) => {
            effects.notify(
                Recipient::user(Role::Owner, after.owner_id),
                NotificationEvent::TripStarted,
                &payload,
            );
        }
        Edge::Trip(TripEdge::Complete) => {
            effects.notify(
                Recipient::user(Role::Owner, after.owner_id),
                NotificationEvent::TripCompleted,
                &payload,
            );
            effects.recalculations.push(RecalculationTrigger::TripSettlement {
                trip_id: after.id,
                settlement_id: after.settlement_id,
            });
        }
        Edge::Trip(TripEdge::Cancel) => {
            effects.notify(
                Recipient::user(Role::Driver, after.driver_id),
                NotificationEvent::TripCancelled,
                &payload,
            );
        }
        Edge::Load(_) | Edge::PlanOnTrip => {}
    }

    effects
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load::LoadStatus;

    fn entry() -> StatusHistoryEntry {
        StatusHistoryEntry {
            entity: EntityRef::load(Uuid::new_v4()),
            edge: Edge::Load(LoadEdge::Deliver),
            previous_status: LoadStatus::InTransit.into(),
            new_status: LoadStatus::Delivered.into(),
            actor_id: Uuid::new_v4(),
            actor_role: Role::Driver,
            revision: Revision(5),
            recorded_at: Utc::now(),
            note: None,
        }
    }

    #[test]
    fn ordered_puts_history_first_and_recalculations_last() {
        let mut effects = SideEffects::new(entry());
        effects.notify(
            Recipient::broadcast(Role::Owner),
            NotificationEvent::LoadDelivered,
            &json!({}),
        );
        effects
            .recalculations
            .push(RecalculationTrigger::LoadReceivable { load_id: Uuid::nil() });

        let kinds: Vec<&str> = effects
            .ordered()
            .map(|effect| match effect {
                Effect::History(_) => "history",
                Effect::Notify(_) => "notify",
                Effect::Recalculate(_) => "recalculate",
            })
            .collect();
        assert_eq!(kinds, vec!["history", "notify", "recalculate"]);
    }

    #[test]
    fn outbox_messages_skip_history() {
        let mut effects = SideEffects::new(entry());
        assert!(effects.outbox_messages().is_empty());

        effects
            .recalculations
            .push(RecalculationTrigger::LoadReceivable { load_id: Uuid::nil() });
        let messages = effects.outbox_messages();
        assert_eq!(messages.len(), 1);
        assert!(matches!(messages[0], OutboxMessage::Recalculation(_)));
    }

    #[test]
    fn notification_inherits_entity_from_history() {
        let mut effects = SideEffects::new(entry());
        effects.notify(
            Recipient::user(Role::Owner, Uuid::nil()),
            NotificationEvent::LoadDelivered,
            &json!({"k": 1}),
        );
        assert_eq!(effects.notifications[0].entity, effects.history_entry.entity);
        assert_eq!(effects.notifications[0].payload["k"], 1);
    }
}
