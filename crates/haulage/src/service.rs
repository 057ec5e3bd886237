//! Read → decide → commit, for API handlers and server actions.
//!
//! The service is the only place the pure engine meets IO. It never retries a
//! lost race on its own: the caller gets `Rejected(ConcurrentModification)` and
//! decides whether to re-read and re-propose.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::{Actor, EntityRef, Revision};
use crate::effects::StatusHistoryEntry;
use crate::engine::LifecycleEngine;
use crate::error::{LifecycleError, Rejection};
use crate::load::Load;
use crate::machine::{Accepted, Lifecycle, Outcome, Proposal};
use crate::store::{LifecycleStore, StoreError};
use crate::trip::Trip;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("{0} not found")]
    NotFound(EntityRef),

    #[error("store failure: {0}")]
    Store(#[source] anyhow::Error),
}

impl From<StoreError> for ServiceError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(entity) => ServiceError::NotFound(entity),
            StoreError::Backend(source) => ServiceError::Store(source),
            // Reads never race; a conflict here means the store broke its contract.
            conflict @ StoreError::ConcurrentModification { .. } => {
                ServiceError::Store(anyhow::Error::new(conflict))
            }
        }
    }
}

pub struct LifecycleService {
    engine: LifecycleEngine,
    store: Arc<dyn LifecycleStore>,
}

impl LifecycleService {
    pub fn new(store: Arc<dyn LifecycleStore>) -> Self {
        Self {
            engine: LifecycleEngine::default(),
            store,
        }
    }

    pub fn with_engine(engine: LifecycleEngine, store: Arc<dyn LifecycleStore>) -> Self {
        Self { engine, store }
    }

    pub fn engine(&self) -> &LifecycleEngine {
        &self.engine
    }

    pub async fn transition_load(
        &self,
        load_id: Uuid,
        proposal: Proposal<Load>,
    ) -> Result<Outcome<Load>, ServiceError> {
        let load = self.store.fetch_load(load_id).await?;
        let trip = match load.trip_id {
            Some(trip_id) => Some(self.store.fetch_trip(trip_id).await?),
            None => None,
        };

        match self.engine.propose_load(&load, &proposal, trip.as_ref())? {
            Outcome::Accepted(accepted) => {
                let result = self.store.commit_load(&accepted).await;
                settle(accepted, result)
            }
            Outcome::Rejected(rejection) => Ok(rejected(load.entity_ref(), rejection)),
        }
    }

    pub async fn transition_trip(
        &self,
        trip_id: Uuid,
        proposal: Proposal<Trip>,
    ) -> Result<Outcome<Trip>, ServiceError> {
        let trip = self.store.fetch_trip(trip_id).await?;

        match self.engine.propose_trip(&trip, &proposal)? {
            Outcome::Accepted(accepted) => {
                let result = self.store.commit_trip(&accepted).await;
                settle(accepted, result)
            }
            Outcome::Rejected(rejection) => Ok(rejected(trip.entity_ref(), rejection)),
        }
    }

    pub async fn plan_load_on_trip(
        &self,
        load_id: Uuid,
        trip_id: Uuid,
        actor: Actor,
        note: Option<&str>,
    ) -> Result<Outcome<Load>, ServiceError> {
        let load = self.store.fetch_load(load_id).await?;
        let trip = self.store.fetch_trip(trip_id).await?;

        match self
            .engine
            .plan_load_on_trip(&load, &trip, &actor, Utc::now(), note)?
        {
            Outcome::Accepted(accepted) => {
                let result = self.store.commit_load(&accepted).await;
                settle(accepted, result)
            }
            Outcome::Rejected(rejection) => Ok(rejected(load.entity_ref(), rejection)),
        }
    }

    pub async fn history(&self, entity: EntityRef) -> Result<Vec<StatusHistoryEntry>, ServiceError> {
        Ok(self.store.history(entity).await?)
    }
}

fn rejected<E: Lifecycle>(entity: EntityRef, rejection: Rejection) -> Outcome<E> {
    info!(%entity, reason = rejection.reason().as_str(), "transition rejected");
    Outcome::Rejected(rejection)
}

/// Turns a commit result into the caller-facing outcome.
fn settle<E: Lifecycle>(
    accepted: Accepted<E>,
    committed: Result<Revision, StoreError>,
) -> Result<Outcome<E>, ServiceError> {
    match committed {
        Ok(revision) => {
            info!(
                entity = %accepted.entity(),
                edge = %accepted.edge,
                from = %accepted.from,
                to = %accepted.to,
                %revision,
                outbox = accepted.side_effects.outbox_messages().len(),
                "transition committed"
            );
            Ok(Outcome::Accepted(accepted))
        }
        Err(StoreError::ConcurrentModification {
            entity,
            expected,
            actual,
        }) => {
            warn!(%entity, %expected, %actual, "transition lost a concurrent race");
            Ok(Outcome::Rejected(Rejection::ConcurrentModification {
                entity,
                expected,
                actual,
            }))
        }
        Err(other) => Err(other.into()),
    }
}
