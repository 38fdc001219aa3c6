use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// A user-owned reminder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub id: TaskId,
    pub owner: String,
    pub text: String,
    pub schedule: Schedule,
}

impl Task {
    /// Validates the draft and assigns a fresh identity.
    pub fn new(
        owner: impl Into<String>,
        text: impl Into<String>,
        schedule: Schedule,
    ) -> Result<Self, ValidationError> {
        let task = Self {
            id: TaskId::new(),
            owner: owner.into(),
            text: text.into(),
            schedule,
        };
        task.validate()?;
        Ok(task)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.owner.trim().is_empty() {
            return Err(ValidationError::EmptyOwner);
        }
        if self.text.trim().is_empty() {
            return Err(ValidationError::EmptyText);
        }
        self.schedule.validate()
    }

    pub fn is_periodic(&self) -> bool {
        matches!(self.schedule, Schedule::Periodic(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    Single { at: DateTime<Utc> },
    Periodic(PeriodicSchedule),
}

impl Schedule {
    pub fn single(at: DateTime<Utc>) -> Self {
        Self::Single { at }
    }

    pub fn periodic(
        minimum_interval: Duration,
        maximum_interval: Duration,
        time_of_day: Duration,
    ) -> Result<Self, ValidationError> {
        PeriodicSchedule::new(minimum_interval, maximum_interval, time_of_day).map(Self::Periodic)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Schedule::Single { .. } => Ok(()),
            Schedule::Periodic(periodic) => periodic.validate(),
        }
    }
}

/// Recurrence window: the next firing lands between `minimum_interval` and
/// `maximum_interval` whole days after the current day, at `time_of_day`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeriodicSchedule {
    #[serde(with = "duration_secs")]
    pub minimum_interval: Duration,
    #[serde(with = "duration_secs")]
    pub maximum_interval: Duration,
    #[serde(with = "duration_secs")]
    pub time_of_day: Duration,
}

impl PeriodicSchedule {
    pub fn new(
        minimum_interval: Duration,
        maximum_interval: Duration,
        time_of_day: Duration,
    ) -> Result<Self, ValidationError> {
        let schedule = Self {
            minimum_interval,
            maximum_interval,
            time_of_day,
        };
        schedule.validate()?;
        Ok(schedule)
    }

    /// Convenience constructor for whole-day windows.
    pub fn days(
        minimum_days: i64,
        maximum_days: i64,
        time_of_day: Duration,
    ) -> Result<Self, ValidationError> {
        Self::new(
            whole_days(minimum_days)?,
            whole_days(maximum_days)?,
            time_of_day,
        )
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.minimum_interval < Duration::zero() || self.maximum_interval < Duration::zero() {
            return Err(ValidationError::NegativeInterval);
        }
        if self.time_of_day < Duration::zero() || self.time_of_day >= Duration::days(1) {
            return Err(ValidationError::TimeOfDayOutOfRange);
        }
        let (minimum_days, maximum_days) = self.day_window();
        if maximum_days > MAX_INTERVAL_DAYS {
            return Err(ValidationError::IntervalTooLong {
                days: maximum_days,
                limit: MAX_INTERVAL_DAYS,
            });
        }
        if maximum_days < minimum_days {
            return Err(ValidationError::IntervalOrder {
                minimum_days,
                maximum_days,
            });
        }
        Ok(())
    }

    /// Whole-day bounds, truncated toward zero.
    pub fn day_window(&self) -> (i64, i64) {
        (
            self.minimum_interval.num_days(),
            self.maximum_interval.num_days(),
        )
    }
}

/// Longest accepted recurrence window, roughly a century.
pub const MAX_INTERVAL_DAYS: i64 = 36_500;

/// `Duration::days` that reports overflow instead of panicking.
pub fn whole_days(days: i64) -> Result<Duration, ValidationError> {
    if days < 0 {
        return Err(ValidationError::NegativeInterval);
    }
    Duration::try_days(days).ok_or(ValidationError::IntervalTooLong {
        days,
        limit: MAX_INTERVAL_DAYS,
    })
}

mod duration_secs {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(value.num_seconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = i64::deserialize(deserializer)?;
        Duration::try_seconds(secs)
            .ok_or_else(|| serde::de::Error::custom(format!("duration out of range: {secs}s")))
    }
}
