//! PostgreSQL implementation of the haulage lifecycle store and outbox.
//!
//! This crate provides a production-ready PostgreSQL implementation of the
//! [`LifecycleStore`] and [`OutboxStore`] traits.
//!
//! # Features
//!
//! - Compare-and-swap commits on `revision` (`UPDATE ... WHERE revision = $n`)
//! - Status, history and outbox rows written in one transaction
//! - Load commits that depend on a trip share-lock and re-check that trip
//! - Outbox claims with `FOR UPDATE SKIP LOCKED`, safe across relay replicas
//! - Exponential backoff retry logic and a dead letter state
//! - Configurable lease timeouts; expired leases are reclaimed on the next claim
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE loads (
//!     id UUID PRIMARY KEY,
//!     owner_id UUID NOT NULL,
//!     status TEXT NOT NULL,
//!     pickup JSONB NOT NULL,
//!     delivery JSONB NOT NULL,
//!     assigned_driver_id UUID,
//!     trip_id UUID,
//!     requested_by UUID,
//!     rate_cents BIGINT NOT NULL DEFAULT 0,
//!     accessorials JSONB NOT NULL DEFAULT '[]',
//!     source TEXT NOT NULL DEFAULT 'internal',
//!     deleted BOOLEAN NOT NULL DEFAULT FALSE,
//!     revision BIGINT NOT NULL DEFAULT 1,
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//!
//! CREATE TABLE trips (
//!     id UUID PRIMARY KEY,
//!     owner_id UUID NOT NULL,
//!     driver_id UUID NOT NULL,
//!     status TEXT NOT NULL,
//!     odometer_start BIGINT,
//!     odometer_start_photo TEXT,
//!     odometer_end BIGINT,
//!     odometer_end_photo TEXT,
//!     settlement_id UUID,
//!     revision BIGINT NOT NULL DEFAULT 1,
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//!
//! CREATE TABLE status_history (
//!     id BIGSERIAL PRIMARY KEY,
//!     entity_kind TEXT NOT NULL,
//!     entity_id UUID NOT NULL,
//!     revision BIGINT NOT NULL,
//!     entry JSONB NOT NULL,
//!     recorded_at TIMESTAMPTZ NOT NULL
//! );
//!
//! CREATE TABLE lifecycle_outbox (
//!     id UUID PRIMARY KEY,
//!     kind TEXT NOT NULL,
//!     payload JSONB NOT NULL,
//!     status TEXT NOT NULL DEFAULT 'pending',
//!     attempt INTEGER NOT NULL DEFAULT 0,
//!     max_attempts INTEGER NOT NULL DEFAULT 5,
//!     run_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     worker_id TEXT,
//!     lease_expires_at TIMESTAMPTZ,
//!     error_message TEXT,
//!     error_kind TEXT,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//! ```
//!
//! The same statements, plus indexes, are in [`SCHEMA`] and can be applied
//! with [`PgLifecycleStore::install_schema`].
//!
//! # Usage
//!
//! ```rust,ignore
//! use haulage::{LifecycleService, Relay};
//! use haulage_postgres::PgLifecycleStore;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/haulage").await?;
//! let store = Arc::new(PgLifecycleStore::new(pool));
//!
//! let service = LifecycleService::new(store.clone());
//! let relay = Relay::new(store, notifier, ledger);
//! ```

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, error};
use uuid::Uuid;

use haulage::{
    retry_delay, Accepted, Accessorial, ClaimedMessage, EntityRef, FailureKind,
    LifecycleStore, Load, LoadSource, LoadStatus, Location, OutboxMessage, OutboxStore, Revision,
    SideEffects, StatusHistoryEntry, StoreError, Trip, TripGuard, TripStatus,
    DEFAULT_MAX_ATTEMPTS,
};

/// Held until the load commit's transaction ends.
const LOCK_GUARDED_TRIP: &str = "SELECT revision FROM trips WHERE id = $1 FOR SHARE";

/// DDL for every table the store touches. Idempotent.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS loads (
    id UUID PRIMARY KEY,
    owner_id UUID NOT NULL,
    status TEXT NOT NULL,
    pickup JSONB NOT NULL,
    delivery JSONB NOT NULL,
    assigned_driver_id UUID,
    trip_id UUID,
    requested_by UUID,
    rate_cents BIGINT NOT NULL DEFAULT 0,
    accessorials JSONB NOT NULL DEFAULT '[]',
    source TEXT NOT NULL DEFAULT 'internal',
    deleted BOOLEAN NOT NULL DEFAULT FALSE,
    revision BIGINT NOT NULL DEFAULT 1,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS trips (
    id UUID PRIMARY KEY,
    owner_id UUID NOT NULL,
    driver_id UUID NOT NULL,
    status TEXT NOT NULL,
    odometer_start BIGINT,
    odometer_start_photo TEXT,
    odometer_end BIGINT,
    odometer_end_photo TEXT,
    settlement_id UUID,
    revision BIGINT NOT NULL DEFAULT 1,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS status_history (
    id BIGSERIAL PRIMARY KEY,
    entity_kind TEXT NOT NULL,
    entity_id UUID NOT NULL,
    revision BIGINT NOT NULL,
    entry JSONB NOT NULL,
    recorded_at TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_status_history_entity
    ON status_history (entity_kind, entity_id, revision);

CREATE TABLE IF NOT EXISTS lifecycle_outbox (
    id UUID PRIMARY KEY,
    kind TEXT NOT NULL,
    payload JSONB NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    attempt INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 5,
    run_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    worker_id TEXT,
    lease_expires_at TIMESTAMPTZ,
    error_message TEXT,
    error_kind TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_lifecycle_outbox_ready
    ON lifecycle_outbox (run_at) WHERE status = 'pending';
CREATE INDEX IF NOT EXISTS idx_lifecycle_outbox_lease
    ON lifecycle_outbox (lease_expires_at) WHERE status = 'claimed';
"#;

/// PostgreSQL lifecycle store and outbox.
#[derive(Clone)]
pub struct PgLifecycleStore {
    pool: PgPool,
    default_lease_ms: i64,
    max_attempts: i32,
}

impl PgLifecycleStore {
    /// Create a store with a 60 second claim lease and
    /// [`DEFAULT_MAX_ATTEMPTS`] delivery attempts.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            default_lease_ms: 60_000,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Create a store with a custom lease timeout.
    ///
    /// The lease determines how long a relay may hold a claimed outbox
    /// record before another relay may claim it again.
    pub fn with_lease_timeout(pool: PgPool, lease_ms: i64) -> Self {
        Self {
            pool,
            default_lease_ms: lease_ms,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Attempts recorded on newly enqueued outbox rows.
    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn install_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .context("install lifecycle schema")?;
        Ok(())
    }

    pub async fn create_load(&self, load: &Load) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO loads (
                id, owner_id, status, pickup, delivery, assigned_driver_id, trip_id,
                requested_by, rate_cents, accessorials, source, deleted, revision, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(load.id)
        .bind(load.owner_id)
        .bind(load.status.as_str())
        .bind(Json(&load.pickup))
        .bind(Json(&load.delivery))
        .bind(load.assigned_driver_id)
        .bind(load.trip_id)
        .bind(load.requested_by)
        .bind(load.rate_cents)
        .bind(Json(&load.accessorials))
        .bind(load.source.as_str())
        .bind(load.deleted)
        .bind(load.revision.get())
        .bind(load.updated_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("insert load {}", load.id))?;
        Ok(())
    }

    pub async fn create_trip(&self, trip: &Trip) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trips (
                id, owner_id, driver_id, status, odometer_start, odometer_start_photo,
                odometer_end, odometer_end_photo, settlement_id, revision, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(trip.id)
        .bind(trip.owner_id)
        .bind(trip.driver_id)
        .bind(trip.status.as_str())
        .bind(trip.odometer_start)
        .bind(trip.odometer_start_photo.as_deref())
        .bind(trip.odometer_end)
        .bind(trip.odometer_end_photo.as_deref())
        .bind(trip.settlement_id)
        .bind(trip.revision.get())
        .bind(trip.updated_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("insert trip {}", trip.id))?;
        Ok(())
    }

    /// Distinguishes a lost compare-and-swap from a missing row.
    async fn conflict(
        tx: &mut Transaction<'_, Postgres>,
        table: &str,
        entity: EntityRef,
        expected: Revision,
    ) -> StoreError {
        let query = format!("SELECT revision FROM {table} WHERE id = $1");
        let current: Result<Option<i64>, sqlx::Error> = sqlx::query_scalar(&query)
            .bind(entity.id)
            .fetch_optional(&mut **tx)
            .await;
        match current {
            Ok(Some(actual)) => {
                debug!(%entity, %expected, actual, "commit lost revision check");
                StoreError::ConcurrentModification {
                    entity,
                    expected,
                    actual: Revision(actual),
                }
            }
            Ok(None) => StoreError::NotFound(entity),
            Err(e) => StoreError::Backend(anyhow!(e).context("read current revision")),
        }
    }

    /// Locks the guarded trip and checks it has not moved since the decision.
    async fn hold_trip(
        tx: &mut Transaction<'_, Postgres>,
        guard: TripGuard,
    ) -> Result<(), StoreError> {
        let entity = guard.entity();
        let actual: Option<i64> = sqlx::query_scalar(LOCK_GUARDED_TRIP)
            .bind(guard.trip_id)
            .fetch_optional(&mut **tx)
            .await
            .context("lock guarded trip")?;
        match actual {
            None => Err(StoreError::NotFound(entity)),
            Some(actual) if actual != guard.revision.get() => {
                debug!(%entity, expected = %guard.revision, actual, "guarded trip moved");
                Err(StoreError::ConcurrentModification {
                    entity,
                    expected: guard.revision,
                    actual: Revision(actual),
                })
            }
            Some(_) => Ok(()),
        }
    }

    /// History row and outbox rows for one accepted transition.
    async fn record(&self, tx: &mut Transaction<'_, Postgres>, effects: &SideEffects) -> Result<()> {
        let entry = &effects.history_entry;
        sqlx::query(
            r#"
            INSERT INTO status_history (entity_kind, entity_id, revision, entry, recorded_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(entry.entity.kind.as_str())
        .bind(entry.entity.id)
        .bind(entry.revision.get())
        .bind(Json(entry))
        .bind(entry.recorded_at)
        .execute(&mut **tx)
        .await
        .context("insert status history")?;

        for message in effects.outbox_messages() {
            sqlx::query(
                r#"
                INSERT INTO lifecycle_outbox (id, kind, payload, max_attempts)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(message.kind())
            .bind(Json(&message))
            .bind(self.max_attempts)
            .execute(&mut **tx)
            .await
            .context("insert outbox record")?;
        }
        Ok(())
    }
}

fn decode_load(row: &PgRow) -> Result<Load> {
    let status: String = row.try_get("status")?;
    let source: String = row.try_get("source")?;
    Ok(Load {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        status: status.parse::<LoadStatus>()?,
        pickup: row.try_get::<Json<Location>, _>("pickup")?.0,
        delivery: row.try_get::<Json<Location>, _>("delivery")?.0,
        assigned_driver_id: row.try_get("assigned_driver_id")?,
        trip_id: row.try_get("trip_id")?,
        requested_by: row.try_get("requested_by")?,
        rate_cents: row.try_get("rate_cents")?,
        accessorials: row.try_get::<Json<Vec<Accessorial>>, _>("accessorials")?.0,
        source: source.parse::<LoadSource>()?,
        deleted: row.try_get("deleted")?,
        revision: Revision(row.try_get("revision")?),
        updated_at: row.try_get("updated_at")?,
    })
}

fn decode_trip(row: &PgRow) -> Result<Trip> {
    let status: String = row.try_get("status")?;
    Ok(Trip {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        driver_id: row.try_get("driver_id")?,
        status: status.parse::<TripStatus>()?,
        odometer_start: row.try_get("odometer_start")?,
        odometer_start_photo: row.try_get("odometer_start_photo")?,
        odometer_end: row.try_get("odometer_end")?,
        odometer_end_photo: row.try_get("odometer_end_photo")?,
        settlement_id: row.try_get("settlement_id")?,
        revision: Revision(row.try_get("revision")?),
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl LifecycleStore for PgLifecycleStore {
    async fn fetch_load(&self, id: Uuid) -> Result<Load, StoreError> {
        let row = sqlx::query("SELECT * FROM loads WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetch load")?
            .ok_or(StoreError::NotFound(EntityRef::load(id)))?;
        Ok(decode_load(&row)?)
    }

    async fn fetch_trip(&self, id: Uuid) -> Result<Trip, StoreError> {
        let row = sqlx::query("SELECT * FROM trips WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetch trip")?
            .ok_or(StoreError::NotFound(EntityRef::trip(id)))?;
        Ok(decode_trip(&row)?)
    }

    async fn commit_load(&self, accepted: &Accepted<Load>) -> Result<Revision, StoreError> {
        let next = &accepted.next;
        let mut tx = self.pool.begin().await.context("begin load commit")?;

        if let Some(guard) = accepted.trip_guard {
            Self::hold_trip(&mut tx, guard).await?;
        }

        let updated = sqlx::query(
            r#"
            UPDATE loads
            SET status = $1,
                assigned_driver_id = $2,
                trip_id = $3,
                requested_by = $4,
                deleted = $5,
                revision = $6,
                updated_at = $7
            WHERE id = $8 AND revision = $9
            "#,
        )
        .bind(next.status.as_str())
        .bind(next.assigned_driver_id)
        .bind(next.trip_id)
        .bind(next.requested_by)
        .bind(next.deleted)
        .bind(next.revision.get())
        .bind(next.updated_at)
        .bind(next.id)
        .bind(accepted.expected_revision.get())
        .execute(&mut *tx)
        .await
        .context("update load")?;

        if updated.rows_affected() == 0 {
            return Err(
                Self::conflict(&mut tx, "loads", accepted.entity(), accepted.expected_revision)
                    .await,
            );
        }

        self.record(&mut tx, &accepted.side_effects).await?;
        tx.commit().await.context("commit load transition")?;
        Ok(next.revision)
    }

    async fn commit_trip(&self, accepted: &Accepted<Trip>) -> Result<Revision, StoreError> {
        let next = &accepted.next;
        let mut tx = self.pool.begin().await.context("begin trip commit")?;

        let updated = sqlx::query(
            r#"
            UPDATE trips
            SET status = $1,
                odometer_start = $2,
                odometer_start_photo = $3,
                odometer_end = $4,
                odometer_end_photo = $5,
                revision = $6,
                updated_at = $7
            WHERE id = $8 AND revision = $9
            "#,
        )
        .bind(next.status.as_str())
        .bind(next.odometer_start)
        .bind(next.odometer_start_photo.as_deref())
        .bind(next.odometer_end)
        .bind(next.odometer_end_photo.as_deref())
        .bind(next.revision.get())
        .bind(next.updated_at)
        .bind(next.id)
        .bind(accepted.expected_revision.get())
        .execute(&mut *tx)
        .await
        .context("update trip")?;

        if updated.rows_affected() == 0 {
            return Err(
                Self::conflict(&mut tx, "trips", accepted.entity(), accepted.expected_revision)
                    .await,
            );
        }

        self.record(&mut tx, &accepted.side_effects).await?;
        tx.commit().await.context("commit trip transition")?;
        Ok(next.revision)
    }

    async fn history(&self, entity: EntityRef) -> Result<Vec<StatusHistoryEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT entry
            FROM status_history
            WHERE entity_kind = $1 AND entity_id = $2
            ORDER BY revision ASC, id ASC
            "#,
        )
        .bind(entity.kind.as_str())
        .bind(entity.id)
        .fetch_all(&self.pool)
        .await
        .context("fetch status history")?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let Json(entry) = row
                .try_get::<Json<StatusHistoryEntry>, _>("entry")
                .context("decode status history")?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

#[async_trait]
impl OutboxStore for PgLifecycleStore {
    /// Claim ready records, including ones whose lease has expired.
    ///
    /// Uses `FOR UPDATE SKIP LOCKED` so concurrent relays never share a row.
    async fn claim_ready(&self, worker_id: &str, limit: i64) -> Result<Vec<ClaimedMessage>> {
        let lease_expires_at = Utc::now() + Duration::milliseconds(self.default_lease_ms);

        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM lifecycle_outbox
                WHERE (status = 'pending' AND run_at <= NOW())
                   OR (status = 'claimed' AND lease_expires_at < NOW())
                ORDER BY run_at ASC, created_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE lifecycle_outbox
            SET status = 'claimed',
                attempt = attempt + 1,
                worker_id = $2,
                lease_expires_at = $3,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM claimable)
            RETURNING id, payload, attempt
            "#,
        )
        .bind(limit)
        .bind(worker_id)
        .bind(lease_expires_at)
        .fetch_all(&self.pool)
        .await?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let Json(message) = row.try_get::<Json<OutboxMessage>, _>("payload")?;
            claimed.push(ClaimedMessage {
                id: row.try_get("id")?,
                message,
                attempt: row.try_get("attempt")?,
            });
        }
        Ok(claimed)
    }

    async fn mark_delivered(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE lifecycle_outbox
            SET status = 'delivered',
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Reschedule or dead-letter a failed record.
    ///
    /// - Retryable failures: retry after [`retry_delay`] while attempts remain
    /// - Non-retryable failures: dead letter immediately
    /// - Attempts exhausted: dead letter
    async fn mark_failed(&self, id: Uuid, error: &str, kind: FailureKind) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let record = sqlx::query(
            "SELECT attempt, max_attempts FROM lifecycle_outbox WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        let attempt: i32 = record.try_get("attempt")?;
        let max_attempts: i32 = record.try_get("max_attempts")?;

        match kind {
            FailureKind::Retryable if attempt < max_attempts => {
                let retry_at = Utc::now() + retry_delay(attempt);

                sqlx::query(
                    r#"
                    UPDATE lifecycle_outbox
                    SET status = 'pending',
                        run_at = $1,
                        error_message = $2,
                        error_kind = 'retryable',
                        worker_id = NULL,
                        lease_expires_at = NULL,
                        updated_at = NOW()
                    WHERE id = $3
                    "#,
                )
                .bind(retry_at)
                .bind(error)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            }
            _ => {
                error!(%id, attempt, kind = kind.as_str(), "outbox record dead-lettered");
                sqlx::query(
                    r#"
                    UPDATE lifecycle_outbox
                    SET status = 'dead_letter',
                        error_message = $1,
                        error_kind = $2,
                        lease_expires_at = NULL,
                        updated_at = NOW()
                    WHERE id = $3
                    "#,
                )
                .bind(error)
                .bind(kind.as_str())
                .bind(id)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_declares_every_table() {
        for table in ["loads", "trips", "status_history", "lifecycle_outbox"] {
            assert!(
                SCHEMA.contains(&format!("CREATE TABLE IF NOT EXISTS {table} (")),
                "missing {table}"
            );
        }
    }

    #[test]
    fn outbox_default_attempts_match_core() {
        assert!(SCHEMA.contains(&format!(
            "max_attempts INTEGER NOT NULL DEFAULT {DEFAULT_MAX_ATTEMPTS}"
        )));
    }

    #[test]
    fn stored_status_labels_parse_back() {
        for status in LoadStatus::ALL {
            assert_eq!(status.as_str().parse::<LoadStatus>().unwrap(), *status);
        }
        for status in TripStatus::ALL {
            assert_eq!(status.as_str().parse::<TripStatus>().unwrap(), *status);
        }
        assert_eq!("marketplace".parse::<LoadSource>().unwrap(), LoadSource::Marketplace);
    }

    #[test]
    fn trip_guard_takes_a_share_lock() {
        assert!(LOCK_GUARDED_TRIP.starts_with("SELECT revision FROM trips"));
        assert!(LOCK_GUARDED_TRIP.ends_with("FOR SHARE"));
    }
}
