//! Process-local registry of notifications awaiting acknowledgment.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use crate::{notifications::NotificationMessage, occurrence::OccurrenceId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingNotification {
    pub occurrence_id: OccurrenceId,
    pub next_notify_time: DateTime<Utc>,
    pub message: NotificationMessage,
    pub retry_period: Duration,
}

impl PendingNotification {
    pub fn new(
        message: NotificationMessage,
        next_notify_time: DateTime<Utc>,
        retry_period: Duration,
    ) -> Self {
        Self {
            occurrence_id: message.occurrence_id,
            next_notify_time,
            message,
            retry_period,
        }
    }
}

/// All operations take one short-lived lock and never fail.
#[derive(Debug, Default)]
pub struct NotificationRegistry {
    entries: Mutex<HashMap<OccurrenceId, PendingNotification>>,
}

impl NotificationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the entry for its occurrence. Returns `true` when
    /// the entry is now strictly earlier than every other pending entry.
    ///
    /// This compares registry entries only, never the scheduler's armed time.
    /// Whoever adds an entry must still call
    /// [`WakeupScheduler::rearm_if_earlier`](crate::scheduler::WakeupScheduler::rearm_if_earlier).
    pub fn add(&self, entry: PendingNotification) -> bool {
        let mut entries = self.entries.lock();
        let earliest_other = entries
            .iter()
            .filter(|(id, _)| **id != entry.occurrence_id)
            .map(|(_, other)| other.next_notify_time)
            .min();
        let is_earliest = earliest_other.map_or(true, |other| entry.next_notify_time < other);
        entries.insert(entry.occurrence_id, entry);
        is_earliest
    }

    pub fn delete(&self, occurrence_id: OccurrenceId) {
        self.entries.lock().remove(&occurrence_id);
    }

    /// Moves an entry from `expected` to `next`. An acknowledged (deleted)
    /// entry is not recreated, and an entry re-registered at another time
    /// keeps that time.
    pub fn reschedule(
        &self,
        occurrence_id: OccurrenceId,
        expected: DateTime<Utc>,
        next: DateTime<Utc>,
    ) -> bool {
        match self.entries.lock().get_mut(&occurrence_id) {
            Some(entry) if entry.next_notify_time == expected => {
                entry.next_notify_time = next;
                true
            }
            _ => false,
        }
    }

    /// Snapshot of entries due at or before `now`, ordered by due time.
    pub fn scan_due(&self, now: DateTime<Utc>) -> Vec<PendingNotification> {
        let mut due: Vec<PendingNotification> = self
            .entries
            .lock()
            .values()
            .filter(|entry| entry.next_notify_time <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.next_notify_time
                .cmp(&b.next_notify_time)
                .then_with(|| a.occurrence_id.cmp(&b.occurrence_id))
        });
        due
    }

    pub fn earliest_time(&self) -> Option<DateTime<Utc>> {
        self.entries
            .lock()
            .values()
            .map(|entry| entry.next_notify_time)
            .min()
    }

    pub fn get(&self, occurrence_id: OccurrenceId) -> Option<PendingNotification> {
        self.entries.lock().get(&occurrence_id).cloned()
    }

    pub fn contains(&self, occurrence_id: OccurrenceId) -> bool {
        self.entries.lock().contains_key(&occurrence_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
