//! Outbox relay: delivers committed triggers to the notification and
//! financial collaborators.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::stream::{self, StreamExt};
use tracing::{debug, error, warn};

use crate::outbox::{
    ClaimedMessage, DeliveryError, FailureKind, NotificationSink, OutboxMessage, OutboxStore,
    RecalculationSink,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Identifies this relay in claim leases.
    pub worker_id: String,
    /// Records claimed per poll.
    pub batch_size: i64,
    /// Deliveries in flight at once.
    pub concurrency: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("relay-{}", uuid::Uuid::new_v4()),
            batch_size: 32,
            concurrency: 4,
        }
    }
}

/// Counts from one relay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub claimed: usize,
    pub delivered: usize,
    pub failed: usize,
}

pub struct Relay {
    outbox: Arc<dyn OutboxStore>,
    notifications: Arc<dyn NotificationSink>,
    recalculations: Arc<dyn RecalculationSink>,
    config: RelayConfig,
}

impl Relay {
    pub fn new(
        outbox: Arc<dyn OutboxStore>,
        notifications: Arc<dyn NotificationSink>,
        recalculations: Arc<dyn RecalculationSink>,
    ) -> Self {
        Self {
            outbox,
            notifications,
            recalculations,
            config: RelayConfig::default(),
        }
    }

    pub fn with_config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Claim one batch, deliver it, and record every result.
    pub async fn run_once(&self) -> Result<RelayReport> {
        let batch = self
            .outbox
            .claim_ready(&self.config.worker_id, self.config.batch_size)
            .await?;
        let mut report = RelayReport {
            claimed: batch.len(),
            ..RelayReport::default()
        };
        if batch.is_empty() {
            return Ok(report);
        }

        let results: Vec<(ClaimedMessage, Result<(), DeliveryError>)> = stream::iter(batch)
            .map(|claimed| async move {
                let result = self.deliver(&claimed.message).await;
                (claimed, result)
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for (claimed, result) in results {
            match result {
                Ok(()) => {
                    self.outbox.mark_delivered(claimed.id).await?;
                    report.delivered += 1;
                    debug!(id = %claimed.id, kind = claimed.message.kind(), "outbox record delivered");
                }
                Err(e) => {
                    let kind = e.kind();
                    if kind == FailureKind::NonRetryable {
                        error!(id = %claimed.id, attempt = claimed.attempt, error = %e, "outbox record failed permanently");
                    } else {
                        warn!(id = %claimed.id, attempt = claimed.attempt, error = %e, "outbox delivery failed");
                    }
                    self.outbox
                        .mark_failed(claimed.id, &e.to_string(), kind)
                        .await?;
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Poll until `shutdown` resolves. Store errors are logged and the loop
    /// keeps going; a full batch is followed immediately by another pass.
    pub async fn run(self, poll_interval: Duration, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        loop {
            let full_batch = match self.run_once().await {
                Ok(report) => report.claimed as i64 >= self.config.batch_size,
                Err(e) => {
                    error!(error = %e, "outbox relay pass failed");
                    false
                }
            };
            let pause = if full_batch {
                Duration::ZERO
            } else {
                poll_interval
            };
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    async fn deliver(&self, message: &OutboxMessage) -> Result<(), DeliveryError> {
        match message {
            OutboxMessage::Notification(trigger) => self.notifications.notify(trigger).await,
            OutboxMessage::Recalculation(trigger) => {
                self.recalculations.recalculate(trigger).await
            }
        }
    }
}
