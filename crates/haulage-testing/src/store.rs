//! In-memory [`LifecycleStore`] and [`OutboxStore`].

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::one::Ref;
use dashmap::DashMap;
use tracing::{debug, error};
use uuid::Uuid;

use haulage::{
    retry_delay, Accepted, ClaimedMessage, EntityRef, FailureKind, Lifecycle, LifecycleStore,
    Load, OutboxMessage, OutboxStore, Revision, SideEffects, StatusHistoryEntry, StoreError,
    Trip, TripGuard, DEFAULT_MAX_ATTEMPTS,
};

/// Default claim lease, in seconds.
const DEFAULT_LEASE_SECS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxState {
    Pending,
    Claimed,
    Delivered,
    DeadLetter,
}

/// One outbox row, as the in-memory store keeps it.
#[derive(Debug, Clone)]
pub struct OutboxRecord {
    pub id: Uuid,
    pub seq: u64,
    pub message: OutboxMessage,
    pub state: OutboxState,
    pub attempts: i32,
    pub run_at: DateTime<Utc>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub last_error: Option<String>,
}

impl OutboxRecord {
    fn claimable(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            OutboxState::Pending => self.run_at <= now,
            OutboxState::Claimed => self.lease_expires_at.is_some_and(|lease| lease <= now),
            OutboxState::Delivered | OutboxState::DeadLetter => false,
        }
    }
}

/// Snapshots, history and outbox in concurrent maps.
///
/// A commit holds the entity's map entry for its whole duration, so the
/// revision check, history append, outbox enqueue and snapshot write are seen
/// together by anyone reading that entity. A guarded load commit also holds a
/// read on the trip entry, so the trip cannot commit in between. Locks are
/// always taken trip first, then load. The clock can be advanced to make
/// backed-off outbox records ready without sleeping.
pub struct InMemoryStore {
    loads: DashMap<Uuid, Load>,
    trips: DashMap<Uuid, Trip>,
    history: DashMap<EntityRef, Vec<StatusHistoryEntry>>,
    outbox: DashMap<Uuid, OutboxRecord>,
    seq: AtomicU64,
    clock_offset_ms: AtomicI64,
    max_attempts: i32,
    lease: Duration,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            loads: DashMap::new(),
            trips: DashMap::new(),
            history: DashMap::new(),
            outbox: DashMap::new(),
            seq: AtomicU64::new(0),
            clock_offset_ms: AtomicI64::new(0),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            lease: Duration::seconds(DEFAULT_LEASE_SECS),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn insert_load(&self, load: Load) -> Uuid {
        let id = load.id;
        self.loads.insert(id, load);
        id
    }

    pub fn insert_trip(&self, trip: Trip) -> Uuid {
        let id = trip.id;
        self.trips.insert(id, trip);
        id
    }

    pub fn load(&self, id: Uuid) -> Option<Load> {
        self.loads.get(&id).map(|load| load.clone())
    }

    pub fn trip(&self, id: Uuid) -> Option<Trip> {
        self.trips.get(&id).map(|trip| trip.clone())
    }

    /// The store's notion of now.
    pub fn now(&self) -> DateTime<Utc> {
        Utc::now() + Duration::milliseconds(self.clock_offset_ms.load(Ordering::SeqCst))
    }

    pub fn advance_clock(&self, by: Duration) {
        self.clock_offset_ms
            .fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }

    /// All outbox records in enqueue order.
    pub fn outbox_records(&self) -> Vec<OutboxRecord> {
        let mut records: Vec<OutboxRecord> =
            self.outbox.iter().map(|entry| entry.value().clone()).collect();
        records.sort_by_key(|record| record.seq);
        records
    }

    pub fn outbox_in(&self, state: OutboxState) -> Vec<OutboxRecord> {
        self.outbox_records()
            .into_iter()
            .filter(|record| record.state == state)
            .collect()
    }

    pub fn dead_letters(&self) -> Vec<OutboxRecord> {
        self.outbox_in(OutboxState::DeadLetter)
    }

    /// Total history entries across all entities.
    pub fn history_len(&self) -> usize {
        self.history.iter().map(|entry| entry.value().len()).sum()
    }

    fn enqueue(&self, effects: &SideEffects) {
        let now = self.now();
        for message in effects.outbox_messages() {
            let id = Uuid::new_v4();
            self.outbox.insert(
                id,
                OutboxRecord {
                    id,
                    seq: self.seq.fetch_add(1, Ordering::SeqCst),
                    message,
                    state: OutboxState::Pending,
                    attempts: 0,
                    run_at: now,
                    lease_expires_at: None,
                    worker_id: None,
                    last_error: None,
                },
            );
        }
    }

    /// Checks the guarded trip and returns its entry, held by the caller.
    fn pin_trip(&self, guard: TripGuard) -> Result<Ref<'_, Uuid, Trip>, StoreError> {
        let entity = guard.entity();
        let trip = self
            .trips
            .get(&guard.trip_id)
            .ok_or(StoreError::NotFound(entity))?;
        if trip.revision != guard.revision {
            debug!(%entity, expected = %guard.revision, actual = %trip.revision, "guarded trip moved");
            return Err(StoreError::ConcurrentModification {
                entity,
                expected: guard.revision,
                actual: trip.revision,
            });
        }
        Ok(trip)
    }

    fn commit<E: Lifecycle>(
        &self,
        snapshots: &DashMap<Uuid, E>,
        accepted: &Accepted<E>,
    ) -> Result<Revision, StoreError> {
        let _pinned = accepted
            .trip_guard
            .map(|guard| self.pin_trip(guard))
            .transpose()?;
        let entity = accepted.entity();
        let mut current = snapshots
            .get_mut(&entity.id)
            .ok_or(StoreError::NotFound(entity))?;

        let actual = current.revision();
        if actual != accepted.expected_revision {
            debug!(%entity, expected = %accepted.expected_revision, %actual, "commit lost revision check");
            return Err(StoreError::ConcurrentModification {
                entity,
                expected: accepted.expected_revision,
                actual,
            });
        }

        self.history
            .entry(entity)
            .or_default()
            .push(accepted.side_effects.history_entry.clone());
        self.enqueue(&accepted.side_effects);
        *current = accepted.next.clone();
        Ok(current.revision())
    }
}

#[async_trait]
impl LifecycleStore for InMemoryStore {
    async fn fetch_load(&self, id: Uuid) -> Result<Load, StoreError> {
        self.load(id).ok_or(StoreError::NotFound(EntityRef::load(id)))
    }

    async fn fetch_trip(&self, id: Uuid) -> Result<Trip, StoreError> {
        self.trip(id).ok_or(StoreError::NotFound(EntityRef::trip(id)))
    }

    async fn commit_load(&self, accepted: &Accepted<Load>) -> Result<Revision, StoreError> {
        self.commit(&self.loads, accepted)
    }

    async fn commit_trip(&self, accepted: &Accepted<Trip>) -> Result<Revision, StoreError> {
        self.commit(&self.trips, accepted)
    }

    async fn history(&self, entity: EntityRef) -> Result<Vec<StatusHistoryEntry>, StoreError> {
        Ok(self
            .history
            .get(&entity)
            .map(|entries| entries.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl OutboxStore for InMemoryStore {
    async fn claim_ready(&self, worker_id: &str, limit: i64) -> Result<Vec<ClaimedMessage>> {
        let now = self.now();
        let mut ready: Vec<(DateTime<Utc>, u64, Uuid)> = self
            .outbox
            .iter()
            .filter(|entry| entry.claimable(now))
            .map(|entry| (entry.run_at, entry.seq, entry.id))
            .collect();
        ready.sort();

        let mut claimed = Vec::new();
        for (_, _, id) in ready {
            if claimed.len() as i64 >= limit {
                break;
            }
            let Some(mut record) = self.outbox.get_mut(&id) else {
                continue;
            };
            // Another worker may have taken it since the scan.
            if !record.claimable(now) {
                continue;
            }
            record.state = OutboxState::Claimed;
            record.attempts += 1;
            record.lease_expires_at = Some(now + self.lease);
            record.worker_id = Some(worker_id.to_string());
            claimed.push(ClaimedMessage {
                id,
                message: record.message.clone(),
                attempt: record.attempts,
            });
        }
        Ok(claimed)
    }

    async fn mark_delivered(&self, id: Uuid) -> Result<()> {
        let mut record = self
            .outbox
            .get_mut(&id)
            .ok_or_else(|| anyhow!("outbox record {id} not found"))?;
        record.state = OutboxState::Delivered;
        record.lease_expires_at = None;
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str, kind: FailureKind) -> Result<()> {
        let now = self.now();
        let mut record = self
            .outbox
            .get_mut(&id)
            .ok_or_else(|| anyhow!("outbox record {id} not found"))?;

        record.last_error = Some(error.to_string());
        record.lease_expires_at = None;
        if kind == FailureKind::NonRetryable || record.attempts >= self.max_attempts {
            record.state = OutboxState::DeadLetter;
            error!(%id, attempts = record.attempts, kind = kind.as_str(), "outbox record dead-lettered");
        } else {
            record.state = OutboxState::Pending;
            record.run_at = now + retry_delay(record.attempts);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use haulage::testing::{LoadBuilder, TripBuilder};
    use haulage::{Actor, LifecycleEngine, LoadEvidence, LoadStatus, Proposal, TripStatus};

    fn publish(store: &InMemoryStore, load: &Load) -> Accepted<Load> {
        let proposal = Proposal::new(LoadStatus::Posted, Actor::owner(load.owner_id));
        let accepted = LifecycleEngine::new()
            .propose_load(load, &proposal, None)
            .unwrap()
            .into_result()
            .unwrap();
        store.commit(&store.loads, &accepted).unwrap();
        accepted
    }

    fn request(load: &Load) -> Accepted<Load> {
        let proposal = Proposal::new(LoadStatus::Requested, Actor::company(Uuid::new_v4()));
        LifecycleEngine::new()
            .propose_load(load, &proposal, None)
            .unwrap()
            .into_result()
            .unwrap()
    }

    #[tokio::test]
    async fn stale_commit_writes_nothing() {
        let store = InMemoryStore::new();
        let load = LoadBuilder::new().build();
        store.insert_load(load.clone());
        let published = publish(&store, &load);

        // Decided against the pre-publish snapshot.
        let stale = request(&LoadBuilder::new().id(load.id).status(LoadStatus::Posted).build());
        let err = store.commit_load(&stale).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::ConcurrentModification { expected, actual, .. }
                if expected == Revision::INITIAL && actual == published.next.revision
        ));

        assert_eq!(store.load(load.id).unwrap(), published.next);
        assert_eq!(store.history_len(), 1);
        assert!(store.outbox_records().is_empty());
    }

    #[tokio::test]
    async fn guarded_commit_fails_once_the_trip_moves() {
        let store = InMemoryStore::new();
        let trip = TripBuilder::new().active(1_000, "odo.jpg").build();
        store.insert_trip(trip.clone());
        let load = LoadBuilder::new()
            .assigned_to(trip.driver_id)
            .on_trip(trip.id)
            .build();
        store.insert_load(load.clone());

        let engine = LifecycleEngine::new();
        let pickup = Proposal::new(LoadStatus::InTransit, Actor::driver(trip.driver_id))
            .with_evidence(LoadEvidence::pickup_photo("bol.jpg"));
        let accepted = engine
            .propose_load(&load, &pickup, Some(&trip))
            .unwrap()
            .into_result()
            .unwrap();

        let cancel = engine
            .propose_trip(&trip, &Proposal::new(TripStatus::Cancelled, Actor::owner(trip.owner_id)))
            .unwrap()
            .into_result()
            .unwrap();
        store.commit_trip(&cancel).await.unwrap();

        let err = store.commit_load(&accepted).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::ConcurrentModification { entity, expected, actual }
                if entity == EntityRef::trip(trip.id)
                    && expected == trip.revision
                    && actual == cancel.next.revision
        ));
        assert_eq!(store.load(load.id).unwrap().status, LoadStatus::Assigned);
        assert_eq!(store.history_len(), 1);
        assert_eq!(store.outbox_records().len(), 1);
    }

    #[tokio::test]
    async fn commit_appends_history_and_outbox_together() {
        let store = InMemoryStore::new();
        let load = LoadBuilder::new().status(LoadStatus::Posted).build();
        store.insert_load(load.clone());

        let accepted = request(&load);
        let revision = store.commit_load(&accepted).await.unwrap();
        assert_eq!(revision, Revision(2));

        let history = store.history(EntityRef::load(load.id)).await.unwrap();
        assert_eq!(history, vec![accepted.side_effects.history_entry.clone()]);
        let outbox = store.outbox_records();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].state, OutboxState::Pending);
    }

    #[tokio::test]
    async fn failed_record_backs_off_then_dead_letters() {
        let store = InMemoryStore::new().with_max_attempts(2);
        let load = LoadBuilder::new().status(LoadStatus::Posted).build();
        store.insert_load(load.clone());
        store.commit_load(&request(&load)).await.unwrap();

        let first = store.claim_ready("w1", 10).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].attempt, 1);
        store
            .mark_failed(first[0].id, "smtp timeout", FailureKind::Retryable)
            .await
            .unwrap();

        assert!(store.claim_ready("w1", 10).await.unwrap().is_empty());
        store.advance_clock(retry_delay(1));

        let second = store.claim_ready("w1", 10).await.unwrap();
        assert_eq!(second[0].attempt, 2);
        store
            .mark_failed(second[0].id, "smtp timeout", FailureKind::Retryable)
            .await
            .unwrap();

        let dead = store.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].last_error.as_deref(), Some("smtp timeout"));
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed() {
        let store = InMemoryStore::new().with_lease(Duration::seconds(5));
        let load = LoadBuilder::new().status(LoadStatus::Posted).build();
        store.insert_load(load.clone());
        store.commit_load(&request(&load)).await.unwrap();

        assert_eq!(store.claim_ready("crashed", 10).await.unwrap().len(), 1);
        assert!(store.claim_ready("w2", 10).await.unwrap().is_empty());

        store.advance_clock(Duration::seconds(6));
        let reclaimed = store.claim_ready("w2", 10).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].attempt, 2);
    }
}
