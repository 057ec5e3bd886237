//! Rejections, programmer errors and their classification.
//!
//! Expected domain outcomes are [`Rejection`] values returned inside
//! [`Outcome`](crate::Outcome). A malformed snapshot is a caller bug and comes
//! back as [`LifecycleError`] instead, so the two never get confused.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::core::{Edge, EntityKind, EntityRef, EntityStatus, Field, Revision, Role};
use crate::trip::TripStatus;

/// Why a proposed transition was refused.
///
/// Each variant names the edge or field that was violated, which is all a UI
/// layer needs to phrase a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Rejection {
    #[error("{entity} cannot move from {from} to {to}")]
    InvalidTransition {
        entity: EntityKind,
        from: EntityStatus,
        to: EntityStatus,
    },

    #[error("{edge} requires {field}")]
    MissingEvidence { edge: Edge, field: Field },

    #[error("{edge}: {field} is invalid: {detail}")]
    InvalidValue {
        edge: Edge,
        field: Field,
        detail: String,
    },

    #[error("actor {actor_id} ({}) may not perform {edge}", display_roles(.roles))]
    Unauthorized {
        edge: Edge,
        actor_id: Uuid,
        roles: Vec<Role>,
    },

    #[error("{entity} is {status} and accepts no further transitions")]
    TerminalState {
        entity: EntityKind,
        status: EntityStatus,
    },

    #[error("{edge} requires trip {trip_id} to be active, it is {status}")]
    TripNotActive {
        edge: Edge,
        trip_id: Uuid,
        status: TripStatus,
    },

    #[error("{entity} changed since it was read (expected {expected}, found {actual})")]
    ConcurrentModification {
        entity: EntityRef,
        expected: Revision,
        actual: Revision,
    },
}

fn display_roles(roles: &[Role]) -> String {
    if roles.is_empty() {
        return "no roles".to_string();
    }
    roles
        .iter()
        .map(|r| r.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Fieldless mirror of [`Rejection`], handy for matching and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    InvalidTransition,
    MissingEvidence,
    InvalidValue,
    Unauthorized,
    TerminalState,
    TripNotActive,
    ConcurrentModification,
}

impl RejectionReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            RejectionReason::InvalidTransition => "invalid_transition",
            RejectionReason::MissingEvidence => "missing_evidence",
            RejectionReason::InvalidValue => "invalid_value",
            RejectionReason::Unauthorized => "unauthorized",
            RejectionReason::TerminalState => "terminal_state",
            RejectionReason::TripNotActive => "trip_not_active",
            RejectionReason::ConcurrentModification => "concurrent_modification",
        }
    }
}

impl Rejection {
    pub fn reason(&self) -> RejectionReason {
        match self {
            Rejection::InvalidTransition { .. } => RejectionReason::InvalidTransition,
            Rejection::MissingEvidence { .. } => RejectionReason::MissingEvidence,
            Rejection::InvalidValue { .. } => RejectionReason::InvalidValue,
            Rejection::Unauthorized { .. } => RejectionReason::Unauthorized,
            Rejection::TerminalState { .. } => RejectionReason::TerminalState,
            Rejection::TripNotActive { .. } => RejectionReason::TripNotActive,
            Rejection::ConcurrentModification { .. } => RejectionReason::ConcurrentModification,
        }
    }

    /// The field at fault, when the rejection is about a field.
    pub fn field(&self) -> Option<Field> {
        match self {
            Rejection::MissingEvidence { field, .. } | Rejection::InvalidValue { field, .. } => {
                Some(*field)
            }
            _ => None,
        }
    }
}

/// Coarse category safe to expose to end users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionCategory {
    /// The entity is not in a state that allows this; refresh and retry.
    Conflict,
    /// The actor lacks permission.
    Forbidden,
    /// Required evidence is missing or wrong.
    Validation,
}

/// Maps a rejection onto something a UI can show without leaking internals.
pub trait Categorizable {
    fn category(&self) -> RejectionCategory;
    fn user_message(&self) -> String;
}

impl Categorizable for Rejection {
    fn category(&self) -> RejectionCategory {
        match self {
            Rejection::Unauthorized { .. } => RejectionCategory::Forbidden,
            Rejection::MissingEvidence { .. } | Rejection::InvalidValue { .. } => {
                RejectionCategory::Validation
            }
            Rejection::InvalidTransition { .. }
            | Rejection::TerminalState { .. }
            | Rejection::TripNotActive { .. }
            | Rejection::ConcurrentModification { .. } => RejectionCategory::Conflict,
        }
    }

    fn user_message(&self) -> String {
        match self {
            Rejection::InvalidTransition { entity, from, to } => {
                format!("This {entity} is {from} and cannot be marked {to}.")
            }
            Rejection::MissingEvidence { field, .. } => match field {
                Field::OdometerStartPhoto | Field::OdometerEndPhoto => {
                    "Please attach a photo of the odometer.".to_string()
                }
                Field::OdometerStart | Field::OdometerEnd => {
                    "Please enter the odometer reading.".to_string()
                }
                Field::PickupPhoto => "Please attach the signed bill of lading.".to_string(),
                Field::DeliveryPhoto => "Please attach the proof of delivery.".to_string(),
                Field::DriverId => "Please choose a driver for this load.".to_string(),
                Field::TripId | Field::Status => format!("Missing {field}."),
            },
            Rejection::InvalidValue { field, detail, .. } => format!("Invalid {field}: {detail}."),
            Rejection::Unauthorized { .. } => "You are not allowed to do that.".to_string(),
            Rejection::TerminalState { entity, status } => {
                format!("This {entity} is already {status}.")
            }
            Rejection::TripNotActive { .. } => "Start the trip first.".to_string(),
            Rejection::ConcurrentModification { entity, .. } => format!(
                "This {} was changed by someone else. Refresh and try again.",
                entity.kind
            ),
        }
    }
}

/// Caller bugs: snapshots that could never have been produced by a valid
/// sequence of transitions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("malformed {entity} snapshot: {problem}")]
    MalformedSnapshot { entity: EntityRef, problem: String },

    #[error("load {load_id} is planned on trip {trip_id} but no trip snapshot was supplied")]
    MissingTripContext { load_id: Uuid, trip_id: Uuid },

    #[error("trip snapshot {supplied} does not belong to load {load_id} (expected {expected:?})")]
    TripContextMismatch {
        load_id: Uuid,
        expected: Option<Uuid>,
        supplied: Uuid,
    },
}

impl LifecycleError {
    pub(crate) fn malformed(entity: EntityRef, problem: impl Into<String>) -> Self {
        LifecycleError::MalformedSnapshot {
            entity,
            problem: problem.into(),
        }
    }
}

/// A stored status string that names no known status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {type_name} value {value:?}")]
pub struct ParseStatusError {
    pub type_name: &'static str,
    pub value: String,
}

impl ParseStatusError {
    pub fn new(type_name: &'static str, value: &str) -> Self {
        Self {
            type_name,
            value: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load::{LoadEdge, LoadStatus};

    #[test]
    fn reasons_map_to_categories() {
        let forbidden = Rejection::Unauthorized {
            edge: Edge::Load(LoadEdge::Publish),
            actor_id: Uuid::nil(),
            roles: vec![Role::Driver],
        };
        assert_eq!(forbidden.category(), RejectionCategory::Forbidden);
        assert_eq!(forbidden.reason(), RejectionReason::Unauthorized);

        let terminal = Rejection::TerminalState {
            entity: EntityKind::Load,
            status: LoadStatus::Deleted.into(),
        };
        assert_eq!(terminal.category(), RejectionCategory::Conflict);
        assert_eq!(terminal.user_message(), "This load is already deleted.");
    }

    #[test]
    fn unauthorized_message_lists_roles() {
        let rejection = Rejection::Unauthorized {
            edge: Edge::Load(LoadEdge::Publish),
            actor_id: Uuid::nil(),
            roles: vec![Role::Driver, Role::Carrier],
        };
        let text = rejection.to_string();
        assert!(text.contains("driver, carrier"), "{text}");
        assert!(text.contains("load.publish"), "{text}");
    }

    #[test]
    fn rejection_serializes_with_reason_tag() {
        let rejection = Rejection::MissingEvidence {
            edge: Edge::Load(LoadEdge::Deliver),
            field: Field::DeliveryPhoto,
        };
        let json = serde_json::to_value(&rejection).unwrap();
        assert_eq!(json["reason"], "missing_evidence");
        assert_eq!(json["field"], "delivery_photo");
        assert_eq!(rejection.field(), Some(Field::DeliveryPhoto));
    }

    #[test]
    fn parse_error_names_type_and_value() {
        let err = ParseStatusError::new("LoadStatus", "lost");
        assert_eq!(err.to_string(), "unknown LoadStatus value \"lost\"");
    }
}
