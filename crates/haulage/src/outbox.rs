//! Transactional outbox.
//!
//! Notification and recalculation triggers are written next to the status
//! change, in the same transaction, and delivered afterwards by the
//! [`Relay`](crate::Relay). A failed delivery never touches the committed
//! status; it only reschedules or dead-letters the outbox record.
//!
//! The interface is policy-light on purpose: stores decide how to claim,
//! lease and retry, as long as they honor [`retry_delay`] and `max_attempts`.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::effects::{NotificationTrigger, RecalculationTrigger};

/// Default attempts before a record is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;

/// Payload of one outbox record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "trigger", rename_all = "snake_case")]
pub enum OutboxMessage {
    Notification(NotificationTrigger),
    Recalculation(RecalculationTrigger),
}

impl OutboxMessage {
    /// Stable label stored alongside the payload.
    pub fn kind(&self) -> &'static str {
        match self {
            OutboxMessage::Notification(_) => "notification",
            OutboxMessage::Recalculation(_) => "recalculation",
        }
    }
}

/// A record claimed by a relay worker.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedMessage {
    pub id: Uuid,
    pub message: OutboxMessage,
    /// 1-based attempt number of this delivery.
    pub attempt: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Try again later with backoff.
    Retryable,
    /// Retrying cannot help; dead-letter now.
    NonRetryable,
}

impl FailureKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            FailureKind::Retryable => "retryable",
            FailureKind::NonRetryable => "non_retryable",
        }
    }
}

/// Backoff before retrying a record that just failed `attempt`:
/// 2^attempt seconds, capped at one hour.
pub fn retry_delay(attempt: i32) -> Duration {
    let exponent = attempt.clamp(0, 12) as u32;
    Duration::seconds(2i64.pow(exponent).min(3600))
}

/// Storage side of the outbox.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Claim up to `limit` ready records for `worker_id`.
    async fn claim_ready(&self, worker_id: &str, limit: i64) -> Result<Vec<ClaimedMessage>>;

    async fn mark_delivered(&self, id: Uuid) -> Result<()>;

    /// Reschedule with [`retry_delay`] while attempts remain and the failure
    /// is retryable; dead-letter otherwise.
    async fn mark_failed(&self, id: Uuid, error: &str, kind: FailureKind) -> Result<()>;
}

/// Failure reported by a sink.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("transient delivery failure: {0}")]
    Retryable(#[source] anyhow::Error),

    #[error("permanent delivery failure: {0}")]
    Permanent(#[source] anyhow::Error),
}

impl DeliveryError {
    pub fn retryable(error: impl Into<anyhow::Error>) -> Self {
        DeliveryError::Retryable(error.into())
    }

    pub fn permanent(error: impl Into<anyhow::Error>) -> Self {
        DeliveryError::Permanent(error.into())
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            DeliveryError::Retryable(_) => FailureKind::Retryable,
            DeliveryError::Permanent(_) => FailureKind::NonRetryable,
        }
    }
}

impl From<anyhow::Error> for DeliveryError {
    fn from(error: anyhow::Error) -> Self {
        DeliveryError::Retryable(error)
    }
}

/// Notification collaborator: push, email, in-app. Delivery only.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, trigger: &NotificationTrigger) -> Result<(), DeliveryError>;
}

/// Financial collaborator: settlement and receivable recomputation.
#[async_trait]
pub trait RecalculationSink: Send + Sync {
    async fn recalculate(&self, trigger: &RecalculationTrigger) -> Result<(), DeliveryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_then_caps() {
        assert_eq!(retry_delay(1), Duration::seconds(2));
        assert_eq!(retry_delay(3), Duration::seconds(8));
        assert_eq!(retry_delay(11), Duration::seconds(2048));
        assert_eq!(retry_delay(12), Duration::seconds(3600));
        assert_eq!(retry_delay(40), Duration::seconds(3600));
    }

    #[test]
    fn message_round_trips_through_json() {
        let message = OutboxMessage::Recalculation(RecalculationTrigger::TripSettlement {
            trip_id: Uuid::new_v4(),
            settlement_id: None,
        });
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "recalculation");
        assert_eq!(json["trigger"]["kind"], "trip_settlement");
        let back: OutboxMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, message);
        assert_eq!(back.kind(), "recalculation");
    }

    #[test]
    fn delivery_error_kinds() {
        assert_eq!(
            DeliveryError::retryable(anyhow::anyhow!("timeout")).kind(),
            FailureKind::Retryable
        );
        assert_eq!(
            DeliveryError::permanent(anyhow::anyhow!("bad token")).kind(),
            FailureKind::NonRetryable
        );
        let converted: DeliveryError = anyhow::anyhow!("boom").into();
        assert_eq!(converted.kind(), FailureKind::Retryable);
    }
}
