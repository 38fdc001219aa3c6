use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::TaskId;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct OccurrenceId(Uuid);

impl OccurrenceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OccurrenceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OccurrenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for OccurrenceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// One concrete firing of a task.
///
/// `original_time` is fixed at creation. `next_time` moves forward on every
/// unacknowledged delivery and only moves backward through
/// [`Occurrence::reschedule`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Occurrence {
    pub id: OccurrenceId,
    pub task_id: TaskId,
    original_time: DateTime<Utc>,
    pub next_time: DateTime<Utc>,
    pub done: bool,
}

impl Occurrence {
    pub fn new(task_id: TaskId, at: DateTime<Utc>) -> Self {
        Self {
            id: OccurrenceId::new(),
            task_id,
            original_time: at,
            next_time: at,
            done: false,
        }
    }

    pub fn original_time(&self) -> DateTime<Utc> {
        self.original_time
    }

    pub fn is_active(&self) -> bool {
        !self.done
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.done && self.next_time <= now
    }

    /// Pushes the next delivery forward. Earlier targets are ignored.
    pub fn advance_to(&mut self, next: DateTime<Utc>) {
        if next > self.next_time {
            self.next_time = next;
        }
    }

    /// User-initiated move, the only path that may go backward.
    pub fn reschedule(&mut self, at: DateTime<Utc>) {
        self.next_time = at;
    }

    pub fn mark_done(&mut self) {
        self.done = true;
    }
}
