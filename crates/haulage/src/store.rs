//! Persistence collaborator contract.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::core::{EntityRef, Revision};
use crate::effects::StatusHistoryEntry;
use crate::load::Load;
use crate::machine::Accepted;
use crate::trip::Trip;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(EntityRef),

    /// The compare-and-swap on revision lost: someone else committed first.
    #[error("{entity} changed concurrently: expected {expected}, found {actual}")]
    ConcurrentModification {
        entity: EntityRef,
        expected: Revision,
        actual: Revision,
    },

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Reads snapshots and commits accepted transitions.
///
/// `commit_*` must be one atomic, isolated operation: write `accepted.next`,
/// append `accepted.side_effects.history_entry`, and enqueue
/// `accepted.side_effects.outbox_messages()`, all only if the stored revision
/// still equals `accepted.expected_revision`. When `accepted.trip_guard` is
/// set, the guarded trip must also still be at its recorded revision, checked
/// in the same operation and held until the write lands. Otherwise nothing is
/// written and [`StoreError::ConcurrentModification`] is returned, naming
/// whichever entity moved.
#[async_trait]
pub trait LifecycleStore: Send + Sync {
    async fn fetch_load(&self, id: Uuid) -> Result<Load, StoreError>;

    async fn fetch_trip(&self, id: Uuid) -> Result<Trip, StoreError>;

    async fn commit_load(&self, accepted: &Accepted<Load>) -> Result<Revision, StoreError>;

    async fn commit_trip(&self, accepted: &Accepted<Trip>) -> Result<Revision, StoreError>;

    /// History of one entity, oldest first.
    async fn history(&self, entity: EntityRef) -> Result<Vec<StatusHistoryEntry>, StoreError>;
}
