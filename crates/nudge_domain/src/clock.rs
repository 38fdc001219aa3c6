use std::fmt::Debug;

use chrono::{DateTime, Duration, Utc};
use tokio::time::Instant;

/// Source of "now" for the engine.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall time derived from tokio's monotonic clock, anchored at construction.
///
/// Under `tokio::time::pause` the reported time follows the paused clock,
/// which keeps timer tests deterministic.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    anchor_wall: DateTime<Utc>,
    anchor: Instant,
}

impl MonotonicClock {
    pub fn starting_at(anchor_wall: DateTime<Utc>) -> Self {
        Self {
            anchor_wall,
            anchor: Instant::now(),
        }
    }

    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed =
            Duration::from_std(self.anchor.elapsed()).unwrap_or_else(|_| Duration::zero());
        self.anchor_wall + elapsed
    }
}

/// Converts a wall-clock target into a tokio deadline. Past targets yield
/// an immediate deadline.
pub fn deadline_for(clock: &dyn Clock, target: DateTime<Utc>) -> Instant {
    let wait = (target - clock.now()).to_std().unwrap_or_default();
    Instant::now() + wait
}
