//! The decision contract shared by the load and trip machines.
//!
//! A machine is pure: given the snapshot a caller read and a proposed target
//! status, it either accepts (returning the next snapshot and the side effects
//! the commit must carry) or rejects with a typed [`Rejection`]. It never does
//! IO, never blocks, and holds no state between calls.

use chrono::{DateTime, Utc};
use std::fmt;
use uuid::Uuid;

use crate::core::{Actor, Edge, EntityKind, EntityRef, Revision};
use crate::effects::SideEffects;
use crate::error::{LifecycleError, Rejection};

/// An entity with a lifecycle: a snapshot type plus its status vocabulary.
pub trait Lifecycle: Clone + fmt::Debug + Send + Sync + 'static {
    type Status: Copy + Eq + fmt::Debug + fmt::Display + Send + Sync + Into<crate::EntityStatus>;
    type Evidence: Clone + Default + fmt::Debug + Send + Sync;

    const KIND: EntityKind;

    fn id(&self) -> Uuid;
    fn status(&self) -> Self::Status;
    fn revision(&self) -> Revision;

    fn entity_ref(&self) -> EntityRef {
        EntityRef {
            kind: Self::KIND,
            id: self.id(),
        }
    }
}

/// What a caller wants to happen to one entity.
#[derive(Debug, Clone)]
pub struct Proposal<E: Lifecycle> {
    pub target: E::Status,
    pub actor: Actor,
    pub evidence: E::Evidence,
    pub note: Option<String>,
    /// Timestamp stamped on the history entry. Callers pass it in so the
    /// decision stays deterministic.
    pub at: DateTime<Utc>,
}

impl<E: Lifecycle> Proposal<E> {
    pub fn new(target: E::Status, actor: Actor) -> Self {
        Self {
            target,
            actor,
            evidence: E::Evidence::default(),
            note: None,
            at: Utc::now(),
        }
    }

    pub fn with_evidence(mut self, evidence: E::Evidence) -> Self {
        self.evidence = evidence;
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.at = at;
        self
    }
}

/// A trip whose revision a load commit depends on.
///
/// Pickup, delivery and planning are decided against the owning trip's
/// status. The store re-checks the trip's revision inside the commit, so a
/// trip cancelled or completed after the read fails the commit instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TripGuard {
    pub trip_id: Uuid,
    pub revision: Revision,
}

impl TripGuard {
    pub fn entity(&self) -> EntityRef {
        EntityRef::trip(self.trip_id)
    }
}

/// An accepted transition, ready to be committed.
///
/// `next` is the full snapshot to write; the store must only write it while
/// the stored revision still equals `expected_revision` and, when `trip_guard`
/// is set, the guarded trip is still at its recorded revision.
#[derive(Debug, Clone, PartialEq)]
pub struct Accepted<E: Lifecycle> {
    pub edge: Edge,
    pub from: E::Status,
    pub to: E::Status,
    pub expected_revision: Revision,
    pub trip_guard: Option<TripGuard>,
    pub next: E,
    pub side_effects: SideEffects,
}

impl<E: Lifecycle> Accepted<E> {
    pub fn new_status(&self) -> E::Status {
        self.to
    }

    pub fn entity(&self) -> EntityRef {
        self.next.entity_ref()
    }
}

/// Result of proposing a transition. Both arms are expected outcomes.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<E: Lifecycle> {
    Accepted(Accepted<E>),
    Rejected(Rejection),
}

impl<E: Lifecycle> Outcome<E> {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Outcome::Accepted(_))
    }

    pub fn accepted(&self) -> Option<&Accepted<E>> {
        match self {
            Outcome::Accepted(accepted) => Some(accepted),
            Outcome::Rejected(_) => None,
        }
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Outcome::Accepted(_) => None,
            Outcome::Rejected(rejection) => Some(rejection),
        }
    }

    pub fn into_result(self) -> Result<Accepted<E>, Rejection> {
        match self {
            Outcome::Accepted(accepted) => Ok(accepted),
            Outcome::Rejected(rejection) => Err(rejection),
        }
    }
}

impl<E: Lifecycle> From<Rejection> for Outcome<E> {
    fn from(rejection: Rejection) -> Self {
        Outcome::Rejected(rejection)
    }
}

/// Pure decision logic for one entity type.
pub trait Machine: Send + Sync {
    type Entity: Lifecycle;
    /// Extra read-only facts the decision depends on (the owning trip for a
    /// load, nothing for a trip).
    type Context;

    fn decide(
        &self,
        snapshot: &Self::Entity,
        proposal: &Proposal<Self::Entity>,
        context: &Self::Context,
    ) -> Result<Outcome<Self::Entity>, LifecycleError>;
}

/// Early-return helper for rejection checks inside `decide`.
macro_rules! reject {
    ($rejection:expr) => {
        return Ok($crate::machine::Outcome::Rejected($rejection))
    };
}

pub(crate) use reject;
