use thiserror::Error;

use crate::{occurrence::OccurrenceId, task::TaskId};

/// Rejected schedule or task input. Raised before any occurrence is computed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("maximum interval ({maximum_days}d) is shorter than minimum interval ({minimum_days}d)")]
    IntervalOrder { minimum_days: i64, maximum_days: i64 },
    #[error("interval must not be negative")]
    NegativeInterval,
    #[error("interval of {days}d exceeds the {limit}d limit")]
    IntervalTooLong { days: i64, limit: i64 },
    #[error("next occurrence falls outside the supported date range")]
    OutOfRange,
    #[error("time of day offset must be within [00:00, 24:00)")]
    TimeOfDayOutOfRange,
    #[error("task text must not be empty")]
    EmptyText,
    #[error("task owner must not be empty")]
    EmptyOwner,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    TaskNotFound(TaskId),
    #[error("occurrence {0} not found")]
    OccurrenceNotFound(OccurrenceId),
    #[error("task {task_id} already has active occurrence {existing}")]
    ActiveOccurrenceExists {
        task_id: TaskId,
        existing: OccurrenceId,
    },
    #[error("snapshot io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot encoding failed: {0}")]
    Snapshot(#[from] serde_json::Error),
}

/// Failure reported by a [`DeliveryChannel`](crate::notifications::DeliveryChannel).
/// Always treated as transient by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("delivery rejected: {0}")]
    Rejected(String),
    #[error("delivery channel unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
