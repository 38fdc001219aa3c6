use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{
    error::{StoreError, StoreResult},
    occurrence::{Occurrence, OccurrenceId},
    task::{Task, TaskId},
};

/// Durable home of tasks and occurrences. The engine keeps no authoritative
/// state of its own; everything pending can be rebuilt from here.
#[async_trait]
pub trait ReminderStore: Send + Sync {
    async fn insert_task(&self, task: &Task) -> StoreResult<()>;
    async fn get_task(&self, id: TaskId) -> StoreResult<Option<Task>>;
    async fn update_task(&self, task: &Task) -> StoreResult<()>;
    /// Removes the task together with all of its occurrences.
    async fn delete_task(&self, id: TaskId) -> StoreResult<()>;
    async fn list_tasks(&self, owner: &str) -> StoreResult<Vec<Task>>;

    /// Fails with [`StoreError::ActiveOccurrenceExists`] when the task
    /// already has an undone occurrence.
    async fn insert_occurrence(&self, occurrence: &Occurrence) -> StoreResult<()>;
    async fn get_occurrence(&self, id: OccurrenceId) -> StoreResult<Option<Occurrence>>;
    async fn update_occurrence(&self, occurrence: &Occurrence) -> StoreResult<()>;
    async fn active_occurrence(&self, task_id: TaskId) -> StoreResult<Option<Occurrence>>;
    /// Atomically moves an undone occurrence still at `expected` forward to
    /// `next`. Returns `false` without writing when the occurrence is gone,
    /// done, or was moved by someone else.
    async fn advance_occurrence(
        &self,
        id: OccurrenceId,
        expected: DateTime<Utc>,
        next: DateTime<Utc>,
    ) -> StoreResult<bool>;
    async fn delete_occurrence(&self, id: OccurrenceId) -> StoreResult<()>;
    async fn delete_occurrences_for_task(&self, task_id: TaskId) -> StoreResult<()>;

    /// Undone occurrences with `next_time <= before`, earliest first.
    async fn list_due_occurrences(&self, before: DateTime<Utc>) -> StoreResult<Vec<Occurrence>>;
    async fn earliest_pending_time(&self) -> StoreResult<Option<DateTime<Utc>>>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    tasks: Vec<Task>,
    #[serde(default)]
    occurrences: Vec<Occurrence>,
}

#[derive(Debug, Default)]
struct State {
    tasks: HashMap<TaskId, Task>,
    occurrences: HashMap<OccurrenceId, Occurrence>,
}

impl State {
    fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            tasks: snapshot.tasks.into_iter().map(|task| (task.id, task)).collect(),
            occurrences: snapshot
                .occurrences
                .into_iter()
                .map(|occurrence| (occurrence.id, occurrence))
                .collect(),
        }
    }

    fn to_snapshot(&self) -> Snapshot {
        let mut tasks: Vec<Task> = self.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        let mut occurrences: Vec<Occurrence> = self.occurrences.values().cloned().collect();
        occurrences.sort_by(|a, b| a.id.cmp(&b.id));
        Snapshot { tasks, occurrences }
    }

    fn active_for(&self, task_id: TaskId) -> Option<&Occurrence> {
        self.occurrences
            .values()
            .find(|occurrence| occurrence.task_id == task_id && occurrence.is_active())
    }
}

/// In-memory store, optionally mirrored to a JSON snapshot file that is
/// rewritten after every mutation.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
    snapshot_path: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads `path` if it exists; later mutations are written back to it.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let snapshot = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            if raw.trim().is_empty() {
                Snapshot::default()
            } else {
                serde_json::from_str(&raw)?
            }
        } else {
            Snapshot::default()
        };
        tracing::debug!(
            path = %path.display(),
            tasks = snapshot.tasks.len(),
            occurrences = snapshot.occurrences.len(),
            "loaded reminder snapshot"
        );
        Ok(Self {
            state: RwLock::new(State::from_snapshot(snapshot)),
            snapshot_path: Some(path),
        })
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    fn mutate<T>(&self, apply: impl FnOnce(&mut State) -> StoreResult<T>) -> StoreResult<T> {
        let mut state = self.state.write();
        let out = apply(&mut state)?;
        if let Some(path) = &self.snapshot_path {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            let encoded = serde_json::to_string_pretty(&state.to_snapshot())?;
            let staging = path.with_extension("json.tmp");
            fs::write(&staging, encoded)?;
            fs::rename(&staging, path)?;
        }
        Ok(out)
    }
}

#[async_trait]
impl ReminderStore for MemoryStore {
    async fn insert_task(&self, task: &Task) -> StoreResult<()> {
        self.mutate(|state| {
            state.tasks.insert(task.id, task.clone());
            Ok(())
        })
    }

    async fn get_task(&self, id: TaskId) -> StoreResult<Option<Task>> {
        Ok(self.state.read().tasks.get(&id).cloned())
    }

    async fn update_task(&self, task: &Task) -> StoreResult<()> {
        self.mutate(|state| {
            let slot = state
                .tasks
                .get_mut(&task.id)
                .ok_or(StoreError::TaskNotFound(task.id))?;
            *slot = task.clone();
            Ok(())
        })
    }

    async fn delete_task(&self, id: TaskId) -> StoreResult<()> {
        self.mutate(|state| {
            state
                .tasks
                .remove(&id)
                .ok_or(StoreError::TaskNotFound(id))?;
            state.occurrences.retain(|_, occurrence| occurrence.task_id != id);
            Ok(())
        })
    }

    async fn list_tasks(&self, owner: &str) -> StoreResult<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .state
            .read()
            .tasks
            .values()
            .filter(|task| task.owner == owner)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.text.cmp(&b.text).then_with(|| a.id.cmp(&b.id)));
        Ok(tasks)
    }

    async fn insert_occurrence(&self, occurrence: &Occurrence) -> StoreResult<()> {
        self.mutate(|state| {
            if !state.tasks.contains_key(&occurrence.task_id) {
                return Err(StoreError::TaskNotFound(occurrence.task_id));
            }
            if occurrence.is_active() {
                if let Some(existing) = state.active_for(occurrence.task_id) {
                    return Err(StoreError::ActiveOccurrenceExists {
                        task_id: occurrence.task_id,
                        existing: existing.id,
                    });
                }
            }
            state.occurrences.insert(occurrence.id, occurrence.clone());
            Ok(())
        })
    }

    async fn get_occurrence(&self, id: OccurrenceId) -> StoreResult<Option<Occurrence>> {
        Ok(self.state.read().occurrences.get(&id).cloned())
    }

    async fn update_occurrence(&self, occurrence: &Occurrence) -> StoreResult<()> {
        self.mutate(|state| {
            let slot = state
                .occurrences
                .get_mut(&occurrence.id)
                .ok_or(StoreError::OccurrenceNotFound(occurrence.id))?;
            *slot = occurrence.clone();
            Ok(())
        })
    }

    async fn active_occurrence(&self, task_id: TaskId) -> StoreResult<Option<Occurrence>> {
        Ok(self.state.read().active_for(task_id).cloned())
    }

    async fn advance_occurrence(
        &self,
        id: OccurrenceId,
        expected: DateTime<Utc>,
        next: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let unchanged = self
            .state
            .read()
            .occurrences
            .get(&id)
            .is_some_and(|occurrence| occurrence.is_active() && occurrence.next_time == expected);
        if !unchanged {
            return Ok(false);
        }
        self.mutate(|state| match state.occurrences.get_mut(&id) {
            Some(occurrence) if occurrence.is_active() && occurrence.next_time == expected => {
                occurrence.advance_to(next);
                Ok(true)
            }
            _ => Ok(false),
        })
    }

    async fn delete_occurrence(&self, id: OccurrenceId) -> StoreResult<()> {
        self.mutate(|state| {
            state
                .occurrences
                .remove(&id)
                .map(|_| ())
                .ok_or(StoreError::OccurrenceNotFound(id))
        })
    }

    async fn delete_occurrences_for_task(&self, task_id: TaskId) -> StoreResult<()> {
        self.mutate(|state| {
            state
                .occurrences
                .retain(|_, occurrence| occurrence.task_id != task_id);
            Ok(())
        })
    }

    async fn list_due_occurrences(&self, before: DateTime<Utc>) -> StoreResult<Vec<Occurrence>> {
        let mut due: Vec<Occurrence> = self
            .state
            .read()
            .occurrences
            .values()
            .filter(|occurrence| occurrence.is_due(before))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.next_time.cmp(&b.next_time).then_with(|| a.id.cmp(&b.id)));
        Ok(due)
    }

    async fn earliest_pending_time(&self) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(self
            .state
            .read()
            .occurrences
            .values()
            .filter(|occurrence| occurrence.is_active())
            .map(|occurrence| occurrence.next_time)
            .min())
    }
}
