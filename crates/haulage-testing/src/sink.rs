//! Sinks that record what the relay delivered.

use std::collections::VecDeque;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::Mutex;

use haulage::{
    DeliveryError, FailureKind, NotificationEvent, NotificationSink, NotificationTrigger,
    RecalculationSink, RecalculationTrigger,
};

/// Records every delivery, and fails on cue.
///
/// Failures are scripted per call: [`RecordingSink::fail_next`] queues
/// failures that are consumed, in order, by the next deliveries of either
/// kind. A failed delivery is not recorded.
#[derive(Default)]
pub struct RecordingSink {
    notifications: Mutex<Vec<NotificationTrigger>>,
    recalculations: Mutex<Vec<RecalculationTrigger>>,
    script: Mutex<VecDeque<FailureKind>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` deliveries with `kind`.
    pub async fn fail_next(&self, count: usize, kind: FailureKind) {
        self.script
            .lock()
            .await
            .extend(std::iter::repeat(kind).take(count));
    }

    pub async fn notifications(&self) -> Vec<NotificationTrigger> {
        self.notifications.lock().await.clone()
    }

    pub async fn events(&self) -> Vec<NotificationEvent> {
        self.notifications
            .lock()
            .await
            .iter()
            .map(|trigger| trigger.event)
            .collect()
    }

    pub async fn recalculations(&self) -> Vec<RecalculationTrigger> {
        self.recalculations.lock().await.clone()
    }

    async fn scripted_failure(&self) -> Result<(), DeliveryError> {
        match self.script.lock().await.pop_front() {
            None => Ok(()),
            Some(FailureKind::Retryable) => {
                Err(DeliveryError::retryable(anyhow!("collaborator unavailable")))
            }
            Some(FailureKind::NonRetryable) => {
                Err(DeliveryError::permanent(anyhow!("collaborator refused payload")))
            }
        }
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn notify(&self, trigger: &NotificationTrigger) -> Result<(), DeliveryError> {
        self.scripted_failure().await?;
        self.notifications.lock().await.push(trigger.clone());
        Ok(())
    }
}

#[async_trait]
impl RecalculationSink for RecordingSink {
    async fn recalculate(&self, trigger: &RecalculationTrigger) -> Result<(), DeliveryError> {
        self.scripted_failure().await?;
        self.recalculations.lock().await.push(*trigger);
        Ok(())
    }
}
