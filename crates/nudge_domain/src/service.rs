use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    calculator::{DaySource, OccurrenceCalculator},
    clock::{Clock, SystemClock},
    config::EngineConfig,
    engine::NotificationEngine,
    error::{ServiceError, StoreError},
    notifications::{DeliveryChannel, NotificationMessage},
    occurrence::{Occurrence, OccurrenceId},
    store::{MemoryStore, ReminderStore},
    task::{Schedule, Task, TaskId},
};

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

/// A task together with its undone occurrence, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOverview {
    pub task: Task,
    pub pending: Option<Occurrence>,
}

/// Partial edit of a task. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub text: Option<String>,
    pub schedule: Option<Schedule>,
}

impl TaskUpdate {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            schedule: None,
        }
    }

    pub fn schedule(schedule: Schedule) -> Self {
        Self {
            text: None,
            schedule: Some(schedule),
        }
    }
}

pub struct ReminderService {
    store: Arc<dyn ReminderStore>,
    clock: Arc<dyn Clock>,
    calculator: OccurrenceCalculator,
    engine: NotificationEngine,
}

pub struct ReminderServiceBuilder {
    channel: Arc<dyn DeliveryChannel>,
    store: Option<Arc<dyn ReminderStore>>,
    clock: Option<Arc<dyn Clock>>,
    days: Option<Box<dyn DaySource>>,
    config: EngineConfig,
}

impl ReminderServiceBuilder {
    pub fn new(channel: Arc<dyn DeliveryChannel>) -> Self {
        Self {
            channel,
            store: None,
            clock: None,
            days: None,
            config: EngineConfig::default(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ReminderStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_day_source(mut self, days: Box<dyn DaySource>) -> Self {
        self.days = Some(days);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Missing collaborators default to an unpersisted [`MemoryStore`], the
    /// system clock and thread-local randomness.
    pub fn build(self) -> ReminderService {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn ReminderStore>);
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let calculator = self
            .days
            .map(OccurrenceCalculator::new)
            .unwrap_or_default();
        let engine = NotificationEngine::new(
            Arc::clone(&store),
            self.channel,
            Arc::clone(&clock),
            self.config,
        );
        ReminderService {
            store,
            clock,
            calculator,
            engine,
        }
    }
}

impl ReminderService {
    pub fn builder(channel: Arc<dyn DeliveryChannel>) -> ReminderServiceBuilder {
        ReminderServiceBuilder::new(channel)
    }

    pub fn engine(&self) -> &NotificationEngine {
        &self.engine
    }

    /// Loads pending occurrences from storage and spawns the scheduler.
    #[instrument(skip_all)]
    pub async fn start(&self, shutdown: &CancellationToken) -> ServiceResult<()> {
        self.engine.rehydrate().await?;
        if !self.engine.start(shutdown) {
            warn!("notification engine already started");
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.engine.stop().await;
        info!("reminder service stopped");
    }

    /// Validates the task, persists it with its first occurrence and
    /// registers that occurrence for delivery.
    #[instrument(skip(self, text, schedule))]
    pub async fn create_task(
        &self,
        owner: &str,
        text: &str,
        schedule: Schedule,
    ) -> ServiceResult<TaskOverview> {
        let task = Task::new(owner, text, schedule)?;
        let at = self
            .calculator
            .first_occurrence(&task.schedule, self.clock.now())?;
        self.store.insert_task(&task).await?;
        let occurrence = self.open_occurrence(&task, at).await?;
        info!(task = %task.id, occurrence = %occurrence.id, at = %at, "task created");
        Ok(TaskOverview {
            task,
            pending: Some(occurrence),
        })
    }

    /// Text edits keep the pending occurrence and refresh its message. A new
    /// schedule retires the pending occurrence and opens a fresh one.
    #[instrument(skip(self, update))]
    pub async fn update_task(&self, id: TaskId, update: TaskUpdate) -> ServiceResult<TaskOverview> {
        let mut task = self.load_task(id).await?;
        if let Some(text) = update.text {
            task.text = text;
        }
        let schedule_changed = match update.schedule {
            Some(schedule) if schedule != task.schedule => {
                task.schedule = schedule;
                true
            }
            _ => false,
        };
        task.validate()?;
        let next_at = if schedule_changed {
            Some(
                self.calculator
                    .first_occurrence(&task.schedule, self.clock.now())?,
            )
        } else {
            None
        };
        self.store.update_task(&task).await?;

        let current = self.store.active_occurrence(id).await?;
        let pending = if let Some(at) = next_at {
            if let Some(old) = current {
                self.engine.acknowledge(old.id);
                self.store.delete_occurrence(old.id).await?;
                debug!(occurrence = %old.id, "retired occurrence of old schedule");
            }
            Some(self.open_occurrence(&task, at).await?)
        } else {
            if let Some(occurrence) = &current {
                let message = NotificationMessage::for_occurrence(&task, occurrence);
                self.engine.register_or_update(occurrence, message);
            }
            current
        };
        info!(schedule_changed, "task updated");
        Ok(TaskOverview { task, pending })
    }

    #[instrument(skip(self))]
    pub async fn delete_task(&self, id: TaskId) -> ServiceResult<()> {
        if let Some(occurrence) = self.store.active_occurrence(id).await? {
            self.engine.acknowledge(occurrence.id);
        }
        self.store.delete_task(id).await?;
        info!("task deleted");
        Ok(())
    }

    pub async fn tasks_for(&self, owner: &str) -> ServiceResult<Vec<TaskOverview>> {
        let tasks = self.store.list_tasks(owner).await?;
        let mut overviews = Vec::with_capacity(tasks.len());
        for task in tasks {
            let pending = self.store.active_occurrence(task.id).await?;
            overviews.push(TaskOverview { task, pending });
        }
        Ok(overviews)
    }

    /// Marks the occurrence done and stops its deliveries. Periodic tasks get
    /// their next occurrence, computed from the acknowledgment time, which is
    /// returned. Acknowledging twice is a no-op.
    #[instrument(skip(self))]
    pub async fn acknowledge(
        &self,
        occurrence_id: OccurrenceId,
    ) -> ServiceResult<Option<Occurrence>> {
        let mut occurrence = self
            .store
            .get_occurrence(occurrence_id)
            .await?
            .ok_or(StoreError::OccurrenceNotFound(occurrence_id))?;
        self.engine.acknowledge(occurrence_id);
        if occurrence.done {
            debug!("occurrence already acknowledged");
            return Ok(None);
        }
        let task = self.load_task(occurrence.task_id).await?;
        let next_at = match &task.schedule {
            Schedule::Periodic(periodic) => {
                Some(self.calculator.next_for(periodic, self.clock.now())?)
            }
            Schedule::Single { .. } => None,
        };
        occurrence.mark_done();
        self.store.update_occurrence(&occurrence).await?;

        let next = match next_at {
            Some(at) => Some(self.open_occurrence(&task, at).await?),
            None => None,
        };
        info!(
            task = %task.id,
            next = ?next.as_ref().map(|occurrence| occurrence.next_time),
            "occurrence acknowledged"
        );
        Ok(next)
    }

    /// Moves an undone occurrence to `at`, earlier or later.
    #[instrument(skip(self))]
    pub async fn reschedule(
        &self,
        occurrence_id: OccurrenceId,
        at: DateTime<Utc>,
    ) -> ServiceResult<Occurrence> {
        let mut occurrence = self
            .store
            .get_occurrence(occurrence_id)
            .await?
            .filter(Occurrence::is_active)
            .ok_or(StoreError::OccurrenceNotFound(occurrence_id))?;
        let task = self.load_task(occurrence.task_id).await?;
        occurrence.reschedule(at);
        self.store.update_occurrence(&occurrence).await?;
        let message = NotificationMessage::for_occurrence(&task, &occurrence);
        self.engine.register_or_update(&occurrence, message);
        info!(%at, "occurrence rescheduled");
        Ok(occurrence)
    }

    async fn load_task(&self, id: TaskId) -> ServiceResult<Task> {
        Ok(self
            .store
            .get_task(id)
            .await?
            .ok_or(StoreError::TaskNotFound(id))?)
    }

    async fn open_occurrence(&self, task: &Task, at: DateTime<Utc>) -> ServiceResult<Occurrence> {
        let occurrence = Occurrence::new(task.id, at);
        self.store.insert_occurrence(&occurrence).await?;
        let message = NotificationMessage::for_occurrence(task, &occurrence);
        self.engine.register_or_update(&occurrence, message);
        Ok(occurrence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        calculator::FixedDays, clock::MonotonicClock, error::ValidationError,
        coordinator::PassReport, error::DeliveryError, notifications::MemoryChannel,
        task::PeriodicSchedule,
    };
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use std::future::Future;
    use tokio::sync::Notify;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn service(days: i64) -> (ReminderService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let service = ReminderService::builder(Arc::new(MemoryChannel::new()))
            .with_store(store.clone())
            .with_clock(Arc::new(MonotonicClock::starting_at(base())))
            .with_day_source(Box::new(FixedDays(days)))
            .build();
        (service, store)
    }

    fn every(min_days: i64, max_days: i64, hour: i64) -> Schedule {
        Schedule::periodic(
            Duration::days(min_days),
            Duration::days(max_days),
            Duration::hours(hour),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn create_registers_first_occurrence() {
        let (service, _) = service(1);
        let overview = service
            .create_task("ana", "stretch", every(1, 3, 9))
            .await
            .unwrap();
        let pending = overview.pending.unwrap();
        assert_eq!(
            pending.next_time,
            Utc.with_ymd_and_hms(2025, 6, 3, 9, 0, 0).unwrap()
        );
        assert!(service.engine().registry().contains(pending.id));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_schedule_creates_nothing() {
        let (service, store) = service(1);
        let schedule = Schedule::Periodic(crate::task::PeriodicSchedule {
            minimum_interval: Duration::days(5),
            maximum_interval: Duration::days(2),
            time_of_day: Duration::zero(),
        });
        let err = service
            .create_task("ana", "stretch", schedule)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Validation(ValidationError::IntervalOrder { .. })
        ));
        assert!(store.list_tasks("ana").await.unwrap().is_empty());
        assert!(service.engine().registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledging_periodic_opens_next_occurrence() {
        let (service, store) = service(1);
        let first = service
            .create_task("ana", "stretch", every(1, 1, 8))
            .await
            .unwrap()
            .pending
            .unwrap();

        let next = service.acknowledge(first.id).await.unwrap().unwrap();
        assert_eq!(
            next.next_time,
            Utc.with_ymd_and_hms(2025, 6, 2, 8, 0, 0).unwrap()
        );
        assert!(!service.engine().registry().contains(first.id));
        assert!(service.engine().registry().contains(next.id));
        assert!(store.get_occurrence(first.id).await.unwrap().unwrap().done);

        assert_eq!(service.acknowledge(first.id).await.unwrap(), None);
        assert_eq!(service.engine().registry().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledging_single_task_leaves_nothing_pending() {
        let (service, _) = service(0);
        let overview = service
            .create_task("ana", "call dentist", Schedule::single(base() + Duration::hours(2)))
            .await
            .unwrap();
        let next = service
            .acknowledge(overview.pending.unwrap().id)
            .await
            .unwrap();
        assert_eq!(next, None);
        assert!(service.engine().registry().is_empty());
        let listed = service.tasks_for("ana").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].pending, None);
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_change_replaces_pending_occurrence() {
        let (service, store) = service(1);
        let created = service
            .create_task("ana", "stretch", every(1, 1, 8))
            .await
            .unwrap();
        let old = created.pending.unwrap();

        let at = base() + Duration::hours(3);
        let updated = service
            .update_task(created.task.id, TaskUpdate::schedule(Schedule::single(at)))
            .await
            .unwrap();
        let new = updated.pending.unwrap();
        assert_ne!(new.id, old.id);
        assert_eq!(new.next_time, at);
        assert!(store.get_occurrence(old.id).await.unwrap().is_none());
        assert!(!service.engine().registry().contains(old.id));
        assert!(service.engine().registry().contains(new.id));
    }

    #[tokio::test(start_paused = true)]
    async fn text_change_keeps_occurrence_and_refreshes_message() {
        let (service, _) = service(1);
        let created = service
            .create_task("ana", "stretch", every(1, 1, 8))
            .await
            .unwrap();
        let pending = created.pending.unwrap();

        let updated = service
            .update_task(created.task.id, TaskUpdate::text("stretch hamstrings"))
            .await
            .unwrap();
        assert_eq!(updated.pending.as_ref().map(|o| o.id), Some(pending.id));
        let entry = service.engine().registry().get(pending.id).unwrap();
        assert_eq!(entry.message.text, "stretch hamstrings");
        assert_eq!(entry.next_notify_time, pending.next_time);
    }

    #[tokio::test(start_paused = true)]
    async fn update_rejects_blank_text() {
        let (service, store) = service(1);
        let created = service
            .create_task("ana", "stretch", every(1, 1, 8))
            .await
            .unwrap();
        let err = service
            .update_task(created.task.id, TaskUpdate::text("  "))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(ValidationError::EmptyText)));
        let stored = store.get_task(created.task.id).await.unwrap().unwrap();
        assert_eq!(stored.text, "stretch");
    }

    #[tokio::test(start_paused = true)]
    async fn delete_retires_pending_occurrence() {
        let (service, store) = service(1);
        let created = service
            .create_task("ana", "stretch", every(1, 1, 8))
            .await
            .unwrap();
        let pending = created.pending.unwrap();
        service.delete_task(created.task.id).await.unwrap();
        assert!(!service.engine().registry().contains(pending.id));
        assert!(store.get_occurrence(pending.id).await.unwrap().is_none());
        assert!(matches!(
            service.delete_task(created.task.id).await,
            Err(ServiceError::Store(StoreError::TaskNotFound(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_moves_registry_entry() {
        let (service, _) = service(3);
        let created = service
            .create_task("ana", "stretch", every(3, 3, 8))
            .await
            .unwrap();
        let pending = created.pending.unwrap();
        let at = base() + Duration::minutes(10);

        let moved = service.reschedule(pending.id, at).await.unwrap();
        assert_eq!(moved.next_time, at);
        assert_eq!(moved.original_time(), pending.original_time());
        assert_eq!(
            service.engine().registry().get(pending.id).unwrap().next_notify_time,
            at
        );
        assert_eq!(service.engine().next_wakeup(), Some(at));
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_of_acknowledged_occurrence_fails() {
        let (service, _) = service(0);
        let created = service
            .create_task("ana", "call dentist", Schedule::single(base()))
            .await
            .unwrap();
        let id = created.pending.unwrap().id;
        service.acknowledge(id).await.unwrap();
        assert!(matches!(
            service.reschedule(id, base()).await,
            Err(ServiceError::Store(StoreError::OccurrenceNotFound(_)))
        ));
    }

    /// Holds every send open until the test releases it.
    #[derive(Default)]
    struct GatedChannel {
        entered: Notify,
        release: Notify,
        sent: parking_lot::Mutex<Vec<NotificationMessage>>,
    }

    #[async_trait]
    impl DeliveryChannel for GatedChannel {
        async fn send(&self, message: &NotificationMessage) -> Result<(), DeliveryError> {
            self.entered.notify_one();
            self.release.notified().await;
            self.sent.lock().push(message.clone());
            Ok(())
        }
    }

    fn gated_service(days: i64) -> (ReminderService, Arc<MemoryStore>, Arc<GatedChannel>) {
        let store = Arc::new(MemoryStore::new());
        let channel = Arc::new(GatedChannel::default());
        let service = ReminderService::builder(channel.clone())
            .with_store(store.clone())
            .with_clock(Arc::new(MonotonicClock::starting_at(base())))
            .with_day_source(Box::new(FixedDays(days)))
            .build();
        (service, store, channel)
    }

    /// Runs a delivery pass and performs `action` while its send is parked.
    async fn while_sending<F: Future>(
        service: &ReminderService,
        channel: &GatedChannel,
        action: F,
    ) -> (PassReport, F::Output) {
        let interleaved = async {
            channel.entered.notified().await;
            let output = action.await;
            channel.release.notify_one();
            output
        };
        tokio::join!(service.engine().run_pass_now(), interleaved)
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledge_during_send_is_kept() {
        let (service, store, channel) = gated_service(0);
        let first = service
            .create_task("ana", "stretch", every(1, 1, 9))
            .await
            .unwrap()
            .pending
            .unwrap();
        service.reschedule(first.id, base()).await.unwrap();

        let (report, next) = while_sending(&service, &channel, service.acknowledge(first.id)).await;
        assert_eq!(report.delivered, 1);
        let next = next.unwrap().unwrap();

        let stored = store.get_occurrence(first.id).await.unwrap().unwrap();
        assert!(stored.done, "acknowledgment survived the pass");
        assert_eq!(stored.next_time, base());
        assert!(!service.engine().registry().contains(first.id));
        assert_eq!(
            store.active_occurrence(first.task_id).await.unwrap().map(|o| o.id),
            Some(next.id)
        );
        assert_eq!(channel.sent.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_during_send_keeps_the_new_time() {
        let (service, store, channel) = gated_service(0);
        let occurrence = service
            .create_task("ana", "call", Schedule::single(base()))
            .await
            .unwrap()
            .pending
            .unwrap();
        let snoozed = base() + Duration::hours(3);

        let (report, moved) =
            while_sending(&service, &channel, service.reschedule(occurrence.id, snoozed)).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(moved.unwrap().next_time, snoozed);

        let stored = store.get_occurrence(occurrence.id).await.unwrap().unwrap();
        assert_eq!(stored.next_time, snoozed);
        assert_eq!(
            service
                .engine()
                .registry()
                .get(occurrence.id)
                .map(|entry| entry.next_notify_time),
            Some(snoozed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn text_edit_during_send_keeps_the_new_text() {
        let (service, store, channel) = gated_service(0);
        let created = service
            .create_task("ana", "call", Schedule::single(base()))
            .await
            .unwrap();
        let occurrence = created.pending.unwrap();

        let (report, updated) = while_sending(
            &service,
            &channel,
            service.update_task(created.task.id, TaskUpdate::text("call the bank")),
        )
        .await;
        assert_eq!(report.delivered, 1);
        updated.unwrap();

        let retry = service.engine().config().retry_period;
        let stored = store.get_occurrence(occurrence.id).await.unwrap().unwrap();
        assert_eq!(stored.next_time, base() + retry);
        let entry = service.engine().registry().get(occurrence.id).unwrap();
        assert_eq!(entry.message.text, "call the bank");
        assert_eq!(entry.next_notify_time, base() + retry);
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_edit_during_send_keeps_the_new_occurrence() {
        let (service, store, channel) = gated_service(0);
        let created = service
            .create_task("ana", "call", Schedule::single(base()))
            .await
            .unwrap();
        let old = created.pending.unwrap();
        let later = base() + Duration::hours(5);

        let (_, updated) = while_sending(
            &service,
            &channel,
            service.update_task(created.task.id, TaskUpdate::schedule(Schedule::single(later))),
        )
        .await;
        let fresh = updated.unwrap().pending.unwrap();

        assert_eq!(store.get_occurrence(old.id).await.unwrap(), None);
        assert!(!service.engine().registry().contains(old.id));
        assert_eq!(
            service
                .engine()
                .registry()
                .get(fresh.id)
                .map(|entry| entry.next_notify_time),
            Some(later)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_window_is_rejected_before_storing() {
        let (service, store) = service(0);
        let huge = PeriodicSchedule {
            minimum_interval: Duration::days(1),
            maximum_interval: Duration::days(100_000_000),
            time_of_day: Duration::zero(),
        };
        let err = service
            .create_task("ana", "stretch", Schedule::Periodic(huge))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Validation(ValidationError::IntervalTooLong { .. })
        ));
        assert!(store.list_tasks("ana").await.unwrap().is_empty());
    }
}
