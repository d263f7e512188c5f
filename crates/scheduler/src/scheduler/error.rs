use std::time::Duration;

use thiserror::Error;

use super::resolver::ResolutionError;
use super::store::StoreError;
use super::triggers::TriggerError;
use super::types::{TaskId, TaskState};

/// Errors surfaced by the scheduler's control surface.
///
/// Failures inside task bodies never show up here; they are recorded as
/// the task's outcome.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Task not found: {0}")]
    NotFound(TaskId),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Invalid trigger: {0}")]
    Trigger(#[from] TriggerError),

    #[error("Task {id} has not finished yet (state: {state})")]
    NotReady { id: TaskId, state: TaskState },

    /// The task was recorded as `FAILED` without running.
    #[error("Task {task_id} could not be resolved: {source}")]
    Resolution {
        task_id: TaskId,
        #[source]
        source: ResolutionError,
    },

    #[error("Scheduler queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Scheduler not running")]
    NotRunning,

    #[error("Scheduler already running")]
    AlreadyRunning,

    /// The caller's own wait elapsed; the task keeps going.
    #[error("Gave up waiting for task {id} after {waited:?}")]
    WaitTimeout { id: TaskId, waited: Duration },

    #[error("Config error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to start scheduler: {0}")]
    StartFailed(String),
}

/// Convenience type alias for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;
