//! The single resettable timer that drives delivery passes.
//!
//! The timer always targets the earliest of the fallback check interval and
//! the nearest known due time. Other components never touch the timer
//! directly; they call [`WakeupScheduler::rearm_if_earlier`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    clock::{deadline_for, Clock},
    registry::NotificationRegistry,
};

/// Work performed on every wakeup.
#[async_trait]
pub trait WakeupHandler: Send + Sync {
    /// Runs one pass at `now`. May return an additional due time the
    /// scheduler should wake for (e.g. the earliest pending time in storage).
    async fn on_wakeup(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    NotStarted,
    Idle,
    Firing,
    Terminated,
}

#[derive(Debug)]
struct Timer {
    state: SchedulerState,
    /// `None` while firing or before the first arming: any candidate counts
    /// as earlier and is folded into the next arming.
    armed: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct WakeupScheduler {
    registry: Arc<NotificationRegistry>,
    clock: Arc<dyn Clock>,
    fallback_check_interval: Duration,
    failure_backoff: Duration,
    timer: Mutex<Timer>,
    rearmed: Notify,
}

impl WakeupScheduler {
    pub fn new(
        registry: Arc<NotificationRegistry>,
        clock: Arc<dyn Clock>,
        fallback_check_interval: Duration,
        failure_backoff: Duration,
    ) -> Self {
        Self {
            registry,
            clock,
            fallback_check_interval,
            failure_backoff,
            timer: Mutex::new(Timer {
                state: SchedulerState::NotStarted,
                armed: None,
            }),
            rearmed: Notify::new(),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.timer.lock().state
    }

    pub fn armed_time(&self) -> Option<DateTime<Utc>> {
        self.timer.lock().armed
    }

    /// Moves the timer to `candidate` if it is strictly earlier than the
    /// current arming. Safe from any task, including during a pass, in which
    /// case it applies to the next arming.
    pub fn rearm_if_earlier(&self, candidate: DateTime<Utc>) -> bool {
        let mut timer = self.timer.lock();
        if timer.state == SchedulerState::Terminated {
            return false;
        }
        if timer.armed.is_some_and(|armed| candidate >= armed) {
            return false;
        }
        timer.armed = Some(candidate);
        drop(timer);
        self.rearmed.notify_one();
        debug!(%candidate, "wakeup re-arm requested");
        true
    }

    /// Runs until `cancel` fires. A pass that has already started completes
    /// before the loop exits.
    pub async fn run(&self, handler: &dyn WakeupHandler, cancel: CancellationToken) {
        {
            let mut timer = self.timer.lock();
            if timer.state != SchedulerState::NotStarted {
                warn!(state = ?timer.state, "wakeup scheduler already owned, ignoring run");
                return;
            }
            timer.state = SchedulerState::Idle;
        }
        info!(
            fallback_secs = self.fallback_check_interval.num_seconds(),
            "wakeup scheduler started"
        );

        let mut last_pass: Option<DateTime<Utc>> = None;
        let mut hint: Option<DateTime<Utc>> = None;
        loop {
            let mut target = self.arm(last_pass, hint);
            debug!(%target, "timer armed");
            loop {
                let deadline = deadline_for(self.clock.as_ref(), target);
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        let mut timer = self.timer.lock();
                        timer.state = SchedulerState::Terminated;
                        timer.armed = None;
                        drop(timer);
                        info!("wakeup scheduler stopped");
                        return;
                    }
                    () = self.rearmed.notified() => {
                        if let Some(armed) = self.timer.lock().armed {
                            target = target.min(armed);
                        }
                    }
                    () = tokio::time::sleep_until(deadline) => break,
                }
            }

            {
                let mut timer = self.timer.lock();
                timer.state = SchedulerState::Firing;
                timer.armed = None;
            }
            let now = self.clock.now();
            debug!(%now, "wakeup fired");
            hint = handler.on_wakeup(now).await;
            last_pass = Some(now);
            self.timer.lock().state = SchedulerState::Idle;
        }
    }

    /// Next wake time: the fallback check, the registry's earliest entry, the
    /// handler's hint, and any re-arm requested while firing.
    ///
    /// Candidates at or before the previous pass were already attempted by
    /// it; they are retried after `failure_backoff` instead of immediately.
    fn arm(
        &self,
        last_pass: Option<DateTime<Utc>>,
        hint: Option<DateTime<Utc>>,
    ) -> DateTime<Utc> {
        let now = self.clock.now();
        let mut target = now + self.fallback_check_interval;
        for candidate in [self.registry.earliest_time(), hint].into_iter().flatten() {
            let candidate = match last_pass {
                Some(pass) if candidate <= pass => pass + self.failure_backoff,
                _ => candidate,
            };
            target = target.min(candidate);
        }

        let mut timer = self.timer.lock();
        if let Some(requested) = timer.armed {
            target = target.min(requested);
        }
        timer.armed = Some(target);
        target
    }
}
