//! Next-occurrence computation for periodic schedules.
//!
//! The calculator is pure apart from its [`DaySource`]. Production uses
//! [`ThreadRngDays`]; tests inject [`SeededDays`] or [`FixedDays`].

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    error::ValidationError,
    task::{PeriodicSchedule, Schedule},
};

/// Uniform integer source over an inclusive day range.
pub trait DaySource: Send + Sync {
    /// Returns a value in `[min, max]`. Callers guarantee `min <= max`.
    fn pick(&self, min: i64, max: i64) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRngDays;

impl DaySource for ThreadRngDays {
    fn pick(&self, min: i64, max: i64) -> i64 {
        if min >= max {
            return min;
        }
        rand::thread_rng().gen_range(min..=max)
    }
}

/// Reproducible source for tests and simulations.
pub struct SeededDays {
    rng: Mutex<StdRng>,
}

impl SeededDays {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl fmt::Debug for SeededDays {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeededDays").finish_non_exhaustive()
    }
}

impl DaySource for SeededDays {
    fn pick(&self, min: i64, max: i64) -> i64 {
        if min >= max {
            return min;
        }
        self.rng.lock().gen_range(min..=max)
    }
}

/// Always picks `offset` days past the minimum, clamped into the window.
#[derive(Debug, Clone, Copy)]
pub struct FixedDays(pub i64);

impl DaySource for FixedDays {
    fn pick(&self, min: i64, max: i64) -> i64 {
        (min + self.0).clamp(min, max.max(min))
    }
}

pub struct OccurrenceCalculator {
    days: Box<dyn DaySource>,
}

impl Default for OccurrenceCalculator {
    fn default() -> Self {
        Self::new(Box::new(ThreadRngDays))
    }
}

impl fmt::Debug for OccurrenceCalculator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OccurrenceCalculator").finish_non_exhaustive()
    }
}

impl OccurrenceCalculator {
    pub fn new(days: Box<dyn DaySource>) -> Self {
        Self { days }
    }

    /// Start of the UTC day containing `now`, plus a random whole-day offset
    /// in `[min, max]`, plus `time_of_day`.
    ///
    /// The window must already be validated; see [`PeriodicSchedule::validate`].
    /// A result past the end of the calendar is [`ValidationError::OutOfRange`].
    pub fn next_occurrence(
        &self,
        now: DateTime<Utc>,
        minimum_interval: Duration,
        maximum_interval: Duration,
        time_of_day: Duration,
    ) -> Result<DateTime<Utc>, ValidationError> {
        let min_days = minimum_interval.num_days();
        let max_days = maximum_interval.num_days();
        debug_assert!(max_days >= min_days, "unvalidated periodic window");
        let offset = if max_days == min_days {
            min_days
        } else {
            self.days.pick(min_days, max_days)
        };
        Duration::try_days(offset)
            .and_then(|days| start_of_day(now).checked_add_signed(days))
            .and_then(|day| day.checked_add_signed(time_of_day))
            .ok_or(ValidationError::OutOfRange)
    }

    pub fn next_for(
        &self,
        schedule: &PeriodicSchedule,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, ValidationError> {
        self.next_occurrence(
            now,
            schedule.minimum_interval,
            schedule.maximum_interval,
            schedule.time_of_day,
        )
    }

    /// Fire time for a freshly created or edited task.
    pub fn first_occurrence(
        &self,
        schedule: &Schedule,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, ValidationError> {
        match schedule {
            Schedule::Single { at } => Ok(*at),
            Schedule::Periodic(periodic) => self.next_for(periodic, now),
        }
    }
}

pub fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|midnight| midnight.and_utc())
        .unwrap_or(now)
}
