use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use taskhub_core::SchedulerSettings;
use uuid::Uuid;

use super::error::SchedulerError;

/// Unique identifier assigned to a task at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Execution model of a resolved callable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Blocking callable, runs on the worker pool.
    Sync,
    /// Suspendable callable, runs on the coordination thread.
    Async,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Sync => f.write_str("sync"),
            TaskKind::Async => f.write_str("async"),
        }
    }
}

/// Task lifecycle. Only the scheduler moves a task between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl TaskState {
    /// States that can still move forward.
    pub const ACTIVE: [TaskState; 2] = [TaskState::Pending, TaskState::Running];

    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskState::Pending | TaskState::Running)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "PENDING",
            TaskState::Running => "RUNNING",
            TaskState::Succeeded => "SUCCEEDED",
            TaskState::Failed => "FAILED",
            TaskState::TimedOut => "TIMED_OUT",
            TaskState::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// Where a failure was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureOrigin {
    Sync,
    Async,
    /// The reference never resolved; the task did not run.
    Resolver,
}

impl From<TaskKind> for FailureOrigin {
    fn from(kind: TaskKind) -> Self {
        match kind {
            TaskKind::Sync => FailureOrigin::Sync,
            TaskKind::Async => FailureOrigin::Async,
        }
    }
}

impl fmt::Display for FailureOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureOrigin::Sync => f.write_str("sync"),
            FailureOrigin::Async => f.write_str("async"),
            FailureOrigin::Resolver => f.write_str("resolver"),
        }
    }
}

/// Captured failure of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub message: String,
    pub origin: FailureOrigin,
    pub occurred_at: DateTime<Utc>,
    /// Error chain or panic payload, when there is more than the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl FailureRecord {
    pub fn new(message: impl Into<String>, origin: FailureOrigin) -> Self {
        Self {
            message: message.into(),
            origin,
            occurred_at: Utc::now(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl fmt::Display for FailureRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.origin, self.message)
    }
}

/// Result of a finished task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success(Value),
    Failure(FailureRecord),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Outcome::Success(v) => Some(v),
            Outcome::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&FailureRecord> {
        match self {
            Outcome::Success(_) => None,
            Outcome::Failure(f) => Some(f),
        }
    }

    /// Terminal state this outcome maps to on normal completion.
    pub(crate) fn completion_state(&self) -> TaskState {
        if self.is_success() {
            TaskState::Succeeded
        } else {
            TaskState::Failed
        }
    }
}

/// Scheduler configuration, typically parsed from TOML or the environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of sync worker threads. 0 = available parallelism.
    #[serde(default)]
    pub worker_pool_size: usize,
    /// Timeout applied to submissions that don't carry one.
    #[serde(default)]
    pub default_timeout_ms: Option<u64>,
    /// Maximum number of tasks waiting to be accepted by an executor.
    /// Unbounded when unset.
    #[serde(default)]
    pub queue_capacity: Option<usize>,
    /// Buffer size of the lifecycle event channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_event_capacity() -> usize {
    256
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 0,
            default_timeout_ms: None,
            queue_capacity: None,
            event_capacity: default_event_capacity(),
        }
    }
}

impl SchedulerConfig {
    /// Parse a TOML document holding the config keys at top level.
    pub fn from_toml_str(raw: &str) -> Result<Self, SchedulerError> {
        let config: Self =
            toml::from_str(raw).map_err(|e| SchedulerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SchedulerError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SchedulerError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&raw)
    }

    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size;
        self
    }

    /// Stored in whole milliseconds, rounded up so that a non-zero
    /// timeout never becomes zero.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        let millis = timeout.as_nanos().div_ceil(1_000_000);
        self.default_timeout_ms = Some(u64::try_from(millis).unwrap_or(u64::MAX));
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.queue_capacity == Some(0) {
            return Err(SchedulerError::Config(
                "queue_capacity must be greater than 0 when set".into(),
            ));
        }
        if self.default_timeout_ms == Some(0) {
            return Err(SchedulerError::Config(
                "default_timeout_ms must be greater than 0 when set".into(),
            ));
        }
        Ok(())
    }

    /// Resolve worker pool size (0 means use available parallelism).
    pub fn resolved_worker_pool_size(&self) -> usize {
        if self.worker_pool_size == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.worker_pool_size
        }
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }
}

impl From<&SchedulerSettings> for SchedulerConfig {
    fn from(settings: &SchedulerSettings) -> Self {
        Self {
            worker_pool_size: settings.worker_pool_size,
            default_timeout_ms: settings.default_timeout_ms,
            queue_capacity: settings.queue_capacity,
            event_capacity: settings.event_capacity.unwrap_or_else(default_event_capacity),
        }
    }
}
