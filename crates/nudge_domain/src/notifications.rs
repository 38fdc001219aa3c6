use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    error::DeliveryError,
    occurrence::{Occurrence, OccurrenceId},
    task::{Task, TaskId},
};

/// Payload handed to the delivery channel on every (re)delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationMessage {
    pub owner: String,
    pub task_id: TaskId,
    pub occurrence_id: OccurrenceId,
    pub text: String,
    pub scheduled_for: DateTime<Utc>,
}

impl NotificationMessage {
    pub fn for_occurrence(task: &Task, occurrence: &Occurrence) -> Self {
        Self {
            owner: task.owner.clone(),
            task_id: task.id,
            occurrence_id: occurrence.id,
            text: task.text.clone(),
            scheduled_for: occurrence.original_time(),
        }
    }
}

/// Transport adapters (chat bots, push services, the console) implement this.
///
/// Delivery is at-least-once: the same message is sent again on every retry
/// until the occurrence is acknowledged.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn send(&self, message: &NotificationMessage) -> Result<(), DeliveryError>;
}

/// Keeps delivered messages in memory. Can be switched into a failing mode.
#[derive(Debug, Default)]
pub struct MemoryChannel {
    sent: Mutex<Vec<NotificationMessage>>,
    failing: Mutex<Option<String>>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_with(&self, reason: impl Into<String>) {
        *self.failing.lock() = Some(reason.into());
    }

    pub fn recover(&self) {
        *self.failing.lock() = None;
    }

    pub fn sent(&self) -> Vec<NotificationMessage> {
        self.sent.lock().clone()
    }

    pub fn count_for(&self, occurrence_id: OccurrenceId) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|message| message.occurrence_id == occurrence_id)
            .count()
    }
}

#[async_trait]
impl DeliveryChannel for MemoryChannel {
    async fn send(&self, message: &NotificationMessage) -> Result<(), DeliveryError> {
        if let Some(reason) = self.failing.lock().clone() {
            return Err(DeliveryError::Unavailable(reason));
        }
        self.sent.lock().push(message.clone());
        Ok(())
    }
}
