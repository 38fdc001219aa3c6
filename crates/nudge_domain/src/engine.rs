//! Wires the registry, the wakeup scheduler and the delivery coordinator
//! together and owns the background task that runs them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    clock::Clock,
    config::EngineConfig,
    coordinator::{DeliveryCoordinator, PassReport},
    error::StoreResult,
    notifications::{DeliveryChannel, NotificationMessage},
    occurrence::{Occurrence, OccurrenceId},
    registry::{NotificationRegistry, PendingNotification},
    scheduler::{SchedulerState, WakeupScheduler},
    store::ReminderStore,
};

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct NotificationEngine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    store: Arc<dyn ReminderStore>,
    registry: Arc<NotificationRegistry>,
    scheduler: Arc<WakeupScheduler>,
    coordinator: Arc<DeliveryCoordinator>,
    worker: Mutex<Option<Worker>>,
}

impl NotificationEngine {
    pub fn new(
        store: Arc<dyn ReminderStore>,
        channel: Arc<dyn DeliveryChannel>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        let registry = Arc::new(NotificationRegistry::new());
        let scheduler = Arc::new(WakeupScheduler::new(
            Arc::clone(&registry),
            Arc::clone(&clock),
            config.fallback_check_interval,
            config.failure_backoff,
        ));
        let coordinator = Arc::new(DeliveryCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            channel,
            config.retry_period,
        ));
        Self {
            config,
            clock,
            store,
            registry,
            scheduler,
            coordinator,
            worker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &NotificationRegistry {
        &self.registry
    }

    pub fn scheduler(&self) -> &WakeupScheduler {
        &self.scheduler
    }

    /// Tracks `occurrence` with `message`, replacing any previous entry, and
    /// pulls the timer forward if the occurrence is due sooner. Inactive
    /// occurrences are dropped from the registry instead.
    pub fn register_or_update(&self, occurrence: &Occurrence, message: NotificationMessage) {
        if !occurrence.is_active() {
            self.registry.delete(occurrence.id);
            return;
        }
        let entry = PendingNotification::new(message, occurrence.next_time, self.config.retry_period);
        self.registry.add(entry);
        self.scheduler.rearm_if_earlier(occurrence.next_time);
    }

    /// Stops further sends for the occurrence. Storage is the caller's job.
    pub fn acknowledge(&self, occurrence_id: OccurrenceId) {
        self.registry.delete(occurrence_id);
    }

    /// Loads undone occurrences due within the rehydrate horizon. Overdue ones
    /// fire on the first wakeup.
    pub async fn rehydrate(&self) -> StoreResult<usize> {
        let horizon = self.clock.now() + self.config.rehydrate_horizon;
        let due = self.store.list_due_occurrences(horizon).await?;
        let mut loaded = 0;
        for occurrence in due {
            if let Some(entry) = self.coordinator.pending_from_store(&occurrence).await {
                let at = entry.next_notify_time;
                self.registry.add(entry);
                self.scheduler.rearm_if_earlier(at);
                loaded += 1;
            }
        }
        info!(loaded, "rehydrated pending notifications");
        Ok(loaded)
    }

    /// Spawns the scheduler loop on the current runtime. Returns `false` when
    /// it is already running or has been stopped; a stopped engine stays
    /// stopped.
    pub fn start(&self, shutdown: &CancellationToken) -> bool {
        let mut worker = self.worker.lock();
        if worker.is_some() || self.scheduler.state() != SchedulerState::NotStarted {
            return false;
        }
        let cancel = shutdown.child_token();
        let scheduler = Arc::clone(&self.scheduler);
        let coordinator = Arc::clone(&self.coordinator);
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            scheduler.run(coordinator.as_ref(), token).await;
        });
        *worker = Some(Worker { cancel, handle });
        true
    }

    /// Cancels the scheduler and waits for an in-flight pass to finish.
    pub async fn stop(&self) {
        let worker = self.worker.lock().take();
        if let Some(Worker { cancel, handle }) = worker {
            cancel.cancel();
            if let Err(err) = handle.await {
                error!(%err, "wakeup scheduler task ended abnormally");
            }
        }
    }

    /// Runs a delivery pass immediately, outside the timer.
    pub async fn run_pass_now(&self) -> PassReport {
        self.coordinator.run_pass(self.clock.now()).await
    }

    pub fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        self.scheduler.armed_time()
    }
}
