//! One delivery pass: reconcile storage into the registry, send everything
//! due, and push each delivered item one retry period forward.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, instrument, warn};

use crate::{
    notifications::{DeliveryChannel, NotificationMessage},
    occurrence::Occurrence,
    registry::{NotificationRegistry, PendingNotification},
    scheduler::WakeupHandler,
    store::ReminderStore,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassReport {
    pub delivered: usize,
    pub failed: usize,
    /// Storage errors; the item stays due and is retried on a later pass.
    pub skipped: usize,
    /// Entries dropped because storage shows them acknowledged or deleted.
    pub retired: usize,
    /// Entries pulled from storage that the registry did not know about.
    pub reconciled: usize,
    /// Earliest undone occurrence in storage after the pass.
    pub next_due: Option<DateTime<Utc>>,
}

impl PassReport {
    fn is_quiet(&self) -> bool {
        self.delivered + self.failed + self.skipped + self.retired + self.reconciled == 0
    }
}

enum Outcome {
    Delivered,
    Failed,
    Skipped,
    Retired,
}

pub struct DeliveryCoordinator {
    registry: Arc<NotificationRegistry>,
    store: Arc<dyn ReminderStore>,
    channel: Arc<dyn DeliveryChannel>,
    retry_period: Duration,
    pass_lock: tokio::sync::Mutex<()>,
}

impl DeliveryCoordinator {
    pub fn new(
        registry: Arc<NotificationRegistry>,
        store: Arc<dyn ReminderStore>,
        channel: Arc<dyn DeliveryChannel>,
        retry_period: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            channel,
            retry_period,
            pass_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn retry_period(&self) -> Duration {
        self.retry_period
    }

    /// Builds the registry entry for an occurrence loaded from storage.
    pub async fn pending_from_store(
        &self,
        occurrence: &Occurrence,
    ) -> Option<PendingNotification> {
        match self.store.get_task(occurrence.task_id).await {
            Ok(Some(task)) => Some(PendingNotification::new(
                NotificationMessage::for_occurrence(&task, occurrence),
                occurrence.next_time,
                self.retry_period,
            )),
            Ok(None) => {
                warn!(
                    occurrence = %occurrence.id,
                    task = %occurrence.task_id,
                    "occurrence has no task, ignoring"
                );
                None
            }
            Err(err) => {
                warn!(occurrence = %occurrence.id, %err, "unable to load task for occurrence");
                None
            }
        }
    }

    /// Passes never overlap; a concurrent caller waits for the running one.
    #[instrument(skip(self))]
    pub async fn run_pass(&self, now: DateTime<Utc>) -> PassReport {
        let _pass = self.pass_lock.lock().await;
        let mut report = PassReport {
            reconciled: self.reconcile(now).await,
            ..PassReport::default()
        };

        for entry in self.registry.scan_due(now) {
            match self.deliver(&entry, now).await {
                Outcome::Delivered => report.delivered += 1,
                Outcome::Failed => report.failed += 1,
                Outcome::Skipped => report.skipped += 1,
                Outcome::Retired => report.retired += 1,
            }
        }

        report.next_due = match self.store.earliest_pending_time().await {
            Ok(next) => next,
            Err(err) => {
                warn!(%err, "unable to read earliest pending time");
                None
            }
        };

        if report.is_quiet() {
            debug!("delivery pass found nothing due");
        } else {
            info!(
                delivered = report.delivered,
                failed = report.failed,
                skipped = report.skipped,
                retired = report.retired,
                reconciled = report.reconciled,
                "delivery pass complete"
            );
        }
        report
    }

    async fn reconcile(&self, now: DateTime<Utc>) -> usize {
        let due = match self.store.list_due_occurrences(now).await {
            Ok(due) => due,
            Err(err) => {
                warn!(%err, "unable to list due occurrences, using registry only");
                return 0;
            }
        };
        let mut added = 0;
        for occurrence in due {
            if self.registry.contains(occurrence.id) {
                continue;
            }
            if let Some(entry) = self.pending_from_store(&occurrence).await {
                debug!(occurrence = %occurrence.id, "reconciled occurrence from storage");
                self.registry.add(entry);
                added += 1;
            }
        }
        added
    }

    async fn deliver(&self, entry: &PendingNotification, now: DateTime<Utc>) -> Outcome {
        let id = entry.occurrence_id;
        let occurrence = match self.store.get_occurrence(id).await {
            Ok(Some(occurrence)) if occurrence.is_active() => occurrence,
            Ok(_) => {
                debug!(occurrence = %id, "occurrence acknowledged or removed, retiring");
                self.registry.delete(id);
                return Outcome::Retired;
            }
            Err(err) => {
                warn!(occurrence = %id, %err, "unable to load occurrence, skipping");
                return Outcome::Skipped;
            }
        };

        if let Err(err) = self.channel.send(&entry.message).await {
            warn!(occurrence = %id, owner = %entry.message.owner, %err, "delivery failed");
            return Outcome::Failed;
        }

        // The send may have raced an acknowledgment, reschedule or edit. Only
        // move the occurrence if nobody touched it meanwhile.
        let next = (now + entry.retry_period).max(occurrence.next_time);
        match self
            .store
            .advance_occurrence(id, occurrence.next_time, next)
            .await
        {
            Ok(true) => {
                self.registry.reschedule(id, entry.next_notify_time, next);
                debug!(occurrence = %id, %next, "delivered");
            }
            Ok(false) => {
                debug!(occurrence = %id, "delivered; occurrence changed during send, keeping it");
            }
            Err(err) => {
                warn!(occurrence = %id, %err, "delivered but unable to persist next time");
                return Outcome::Skipped;
            }
        }
        Outcome::Delivered
    }
}

#[async_trait]
impl WakeupHandler for DeliveryCoordinator {
    async fn on_wakeup(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.run_pass(now).await.next_due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::{DeliveryError, StoreResult},
        notifications::MemoryChannel,
        occurrence::OccurrenceId,
        store::MemoryStore,
        task::{Schedule, Task, TaskId},
    };
    use chrono::TimeZone;
    use parking_lot::Mutex;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, 10, 9, 0, 0).unwrap()
    }

    struct Fixture {
        registry: Arc<NotificationRegistry>,
        store: Arc<MemoryStore>,
        channel: Arc<MemoryChannel>,
        coordinator: DeliveryCoordinator,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(NotificationRegistry::new());
        let store = Arc::new(MemoryStore::new());
        let channel = Arc::new(MemoryChannel::new());
        let coordinator = DeliveryCoordinator::new(
            Arc::clone(&registry),
            store.clone(),
            channel.clone(),
            Duration::minutes(30),
        );
        Fixture {
            registry,
            store,
            channel,
            coordinator,
        }
    }

    async fn pending(fixture: &Fixture, text: &str, at: DateTime<Utc>) -> OccurrenceId {
        let task = Task::new("ana", text, Schedule::single(at)).unwrap();
        let occurrence = Occurrence::new(task.id, at);
        fixture.store.insert_task(&task).await.unwrap();
        fixture.store.insert_occurrence(&occurrence).await.unwrap();
        fixture.registry.add(PendingNotification::new(
            NotificationMessage::for_occurrence(&task, &occurrence),
            at,
            Duration::minutes(30),
        ));
        occurrence.id
    }

    #[tokio::test]
    async fn success_advances_by_retry_period() {
        let fixture = fixture();
        let id = pending(&fixture, "stand up", t0()).await;

        let report = fixture.coordinator.run_pass(t0()).await;
        assert_eq!(report.delivered, 1);
        let next = t0() + Duration::minutes(30);
        assert_eq!(fixture.registry.get(id).unwrap().next_notify_time, next);
        assert_eq!(
            fixture.store.get_occurrence(id).await.unwrap().unwrap().next_time,
            next
        );

        let report = fixture
            .coordinator
            .run_pass(next - Duration::seconds(1))
            .await;
        assert_eq!(report.delivered, 0);
        let report = fixture.coordinator.run_pass(next).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(fixture.channel.count_for(id), 2);
    }

    #[tokio::test]
    async fn failure_leaves_item_due_for_next_pass() {
        let fixture = fixture();
        let id = pending(&fixture, "stand up", t0()).await;
        fixture.channel.fail_with("offline");

        let report = fixture.coordinator.run_pass(t0()).await;
        assert_eq!(report.failed, 1);
        assert_eq!(fixture.registry.get(id).unwrap().next_notify_time, t0());
        assert_eq!(
            fixture.store.get_occurrence(id).await.unwrap().unwrap().next_time,
            t0()
        );

        fixture.channel.recover();
        let report = fixture
            .coordinator
            .run_pass(t0() + Duration::seconds(5))
            .await;
        assert_eq!(report.delivered, 1);
    }

    #[tokio::test]
    async fn acknowledged_item_is_retired_not_sent() {
        let fixture = fixture();
        let id = pending(&fixture, "stand up", t0()).await;
        let mut occurrence = fixture.store.get_occurrence(id).await.unwrap().unwrap();
        occurrence.mark_done();
        fixture.store.update_occurrence(&occurrence).await.unwrap();

        let report = fixture.coordinator.run_pass(t0()).await;
        assert_eq!(report.retired, 1);
        assert!(fixture.channel.sent().is_empty());
        assert!(fixture.registry.is_empty());
    }

    #[tokio::test]
    async fn reconciles_occurrences_missing_from_registry() {
        let fixture = fixture();
        let task = Task::new("bo", "water plants", Schedule::single(t0())).unwrap();
        let occurrence = Occurrence::new(task.id, t0());
        fixture.store.insert_task(&task).await.unwrap();
        fixture.store.insert_occurrence(&occurrence).await.unwrap();

        let report = fixture.coordinator.run_pass(t0()).await;
        assert_eq!(report.reconciled, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(fixture.channel.sent()[0].text, "water plants");
        assert_eq!(report.next_due, Some(t0() + Duration::minutes(30)));
    }

    #[tokio::test]
    async fn same_due_time_fires_together_and_nothing_early() {
        let fixture = fixture();
        let first = pending(&fixture, "first", t0()).await;
        let second = pending(&fixture, "second", t0()).await;
        let later = pending(&fixture, "later", t0() + Duration::minutes(1)).await;

        let report = fixture
            .coordinator
            .run_pass(t0() - Duration::seconds(1))
            .await;
        assert_eq!(report.delivered, 0);

        let report = fixture.coordinator.run_pass(t0()).await;
        assert_eq!(report.delivered, 2);
        assert_eq!(fixture.channel.count_for(first), 1);
        assert_eq!(fixture.channel.count_for(second), 1);
        assert_eq!(fixture.channel.count_for(later), 0);
    }

    /// Store whose occurrence writes fail for one chosen occurrence.
    struct FlakyStore {
        inner: MemoryStore,
        broken: Mutex<Option<OccurrenceId>>,
    }

    #[async_trait]
    impl ReminderStore for FlakyStore {
        async fn insert_task(&self, task: &Task) -> StoreResult<()> {
            self.inner.insert_task(task).await
        }
        async fn get_task(&self, id: TaskId) -> StoreResult<Option<Task>> {
            self.inner.get_task(id).await
        }
        async fn update_task(&self, task: &Task) -> StoreResult<()> {
            self.inner.update_task(task).await
        }
        async fn delete_task(&self, id: TaskId) -> StoreResult<()> {
            self.inner.delete_task(id).await
        }
        async fn list_tasks(&self, owner: &str) -> StoreResult<Vec<Task>> {
            self.inner.list_tasks(owner).await
        }
        async fn insert_occurrence(&self, occurrence: &Occurrence) -> StoreResult<()> {
            self.inner.insert_occurrence(occurrence).await
        }
        async fn get_occurrence(&self, id: OccurrenceId) -> StoreResult<Option<Occurrence>> {
            self.inner.get_occurrence(id).await
        }
        async fn update_occurrence(&self, occurrence: &Occurrence) -> StoreResult<()> {
            if *self.broken.lock() == Some(occurrence.id) {
                return Err(std::io::Error::other("disk full").into());
            }
            self.inner.update_occurrence(occurrence).await
        }
        async fn active_occurrence(&self, task_id: TaskId) -> StoreResult<Option<Occurrence>> {
            self.inner.active_occurrence(task_id).await
        }
        async fn advance_occurrence(
            &self,
            id: OccurrenceId,
            expected: DateTime<Utc>,
            next: DateTime<Utc>,
        ) -> StoreResult<bool> {
            if *self.broken.lock() == Some(id) {
                return Err(std::io::Error::other("disk full").into());
            }
            self.inner.advance_occurrence(id, expected, next).await
        }
        async fn delete_occurrence(&self, id: OccurrenceId) -> StoreResult<()> {
            self.inner.delete_occurrence(id).await
        }
        async fn delete_occurrences_for_task(&self, task_id: TaskId) -> StoreResult<()> {
            self.inner.delete_occurrences_for_task(task_id).await
        }
        async fn list_due_occurrences(
            &self,
            before: DateTime<Utc>,
        ) -> StoreResult<Vec<Occurrence>> {
            self.inner.list_due_occurrences(before).await
        }
        async fn earliest_pending_time(&self) -> StoreResult<Option<DateTime<Utc>>> {
            self.inner.earliest_pending_time().await
        }
    }

    #[tokio::test]
    async fn storage_failure_is_isolated_to_its_item() {
        let registry = Arc::new(NotificationRegistry::new());
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            broken: Mutex::new(None),
        });
        let channel = Arc::new(MemoryChannel::new());
        let coordinator = DeliveryCoordinator::new(
            Arc::clone(&registry),
            store.clone(),
            channel.clone(),
            Duration::minutes(30),
        );

        let mut ids = Vec::new();
        for text in ["one", "two", "three"] {
            let task = Task::new("ana", text, Schedule::single(t0())).unwrap();
            let occurrence = Occurrence::new(task.id, t0());
            store.insert_task(&task).await.unwrap();
            store.insert_occurrence(&occurrence).await.unwrap();
            ids.push(occurrence.id);
        }
        *store.broken.lock() = Some(ids[1]);

        let report = coordinator.run_pass(t0()).await;
        assert_eq!(report.delivered, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(registry.get(ids[1]).unwrap().next_notify_time, t0());
        assert_eq!(
            registry.get(ids[0]).unwrap().next_notify_time,
            t0() + Duration::minutes(30)
        );
    }

    struct RejectingChannel;

    #[async_trait]
    impl DeliveryChannel for RejectingChannel {
        async fn send(&self, message: &NotificationMessage) -> Result<(), DeliveryError> {
            Err(DeliveryError::Rejected(message.owner.clone()))
        }
    }

    #[tokio::test]
    async fn every_due_item_is_attempted_despite_failures() {
        let registry = Arc::new(NotificationRegistry::new());
        let store = Arc::new(MemoryStore::new());
        let coordinator = DeliveryCoordinator::new(
            Arc::clone(&registry),
            store.clone(),
            Arc::new(RejectingChannel),
            Duration::minutes(30),
        );
        for text in ["a", "b", "c"] {
            let task = Task::new("ana", text, Schedule::single(t0())).unwrap();
            store.insert_task(&task).await.unwrap();
            store
                .insert_occurrence(&Occurrence::new(task.id, t0()))
                .await
                .unwrap();
        }
        let report = coordinator.run_pass(t0()).await;
        assert_eq!(report.failed, 3);
        assert_eq!(registry.scan_due(t0()).len(), 3);
    }
}
