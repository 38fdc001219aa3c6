use chrono::Duration;

/// Timing knobs for the notification engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Upper bound on the time between two wakeups, even with nothing pending.
    pub fallback_check_interval: Duration,
    /// Delay before an unacknowledged notification is sent again.
    pub retry_period: Duration,
    /// Delay before retrying an entry whose delivery or storage update failed.
    /// Entries the previous pass already attempted may wake up this much after
    /// their due time instead of exactly at it.
    pub failure_backoff: Duration,
    /// On startup, occurrences due before `now + rehydrate_horizon` are loaded
    /// into the registry. Later ones are picked up by reconciliation.
    pub rehydrate_horizon: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fallback_check_interval: Duration::minutes(5),
            retry_period: Duration::hours(1),
            failure_backoff: Duration::minutes(1),
            rehydrate_horizon: Duration::hours(24),
        }
    }
}

impl EngineConfig {
    pub fn with_fallback_check_interval(mut self, interval: Duration) -> Self {
        self.fallback_check_interval = interval.max(Duration::seconds(1));
        self
    }

    pub fn with_retry_period(mut self, period: Duration) -> Self {
        self.retry_period = period.max(Duration::seconds(1));
        self
    }

    pub fn with_failure_backoff(mut self, backoff: Duration) -> Self {
        self.failure_backoff = backoff.max(Duration::seconds(1));
        self
    }

    pub fn with_rehydrate_horizon(mut self, horizon: Duration) -> Self {
        self.rehydrate_horizon = horizon.max(Duration::zero());
        self
    }
}
