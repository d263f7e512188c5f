//! Task records keyed by id.
//!
//! [`ResultStore`] is the contract the scheduler writes through. Every state
//! change is a compare-and-set, so when normal completion races a timeout or
//! a cancellation exactly one writer wins and the outcome is written once.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::TaskDescriptor;
use super::types::{FailureRecord, Outcome, TaskId, TaskKind, TaskState};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Task {0} already exists")]
    Duplicate(TaskId),
    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
}

/// Everything known about one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub reference: String,
    /// `None` when the reference never resolved.
    pub kind: Option<TaskKind>,
    pub state: TaskState,
    pub outcome: Option<Outcome>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// Fresh record for an admitted task.
    pub fn pending(descriptor: &TaskDescriptor) -> Self {
        Self {
            id: descriptor.id(),
            reference: descriptor.reference().to_string(),
            kind: Some(descriptor.kind()),
            state: TaskState::Pending,
            outcome: None,
            submitted_at: descriptor.submitted_at(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Record for a task whose reference failed to resolve. It is terminal
    /// from the start and never enters `Running`.
    pub fn unresolved(id: TaskId, reference: impl Into<String>, failure: FailureRecord) -> Self {
        let now = Utc::now();
        Self {
            id,
            reference: reference.into(),
            kind: None,
            state: TaskState::Failed,
            outcome: Some(Outcome::Failure(failure)),
            submitted_at: now,
            started_at: None,
            finished_at: Some(now),
        }
    }

    /// Wall-clock run time, once the task has both started and finished.
    pub fn duration(&self) -> Option<Duration> {
        let started = self.started_at?;
        let finished = self.finished_at?;
        finished.signed_duration_since(started).to_std().ok()
    }
}

/// Storage contract for task records.
///
/// `insert`/`get` are the plain put/get half. `transition` is the only way
/// to change a stored record and must be atomic per id.
pub trait ResultStore: Send + Sync {
    /// Store a new record. Fails if the id is already present.
    fn insert(&self, record: TaskRecord) -> Result<(), StoreError>;

    /// Current snapshot of a record.
    fn get(&self, id: &TaskId) -> Result<Option<TaskRecord>, StoreError>;

    /// Move `id` to `next` if its current state is one of `expected`.
    ///
    /// Returns the previous state when the transition was applied, `None`
    /// when it was rejected (state mismatch or unknown id). `outcome` is
    /// only written if none is stored yet.
    fn transition(
        &self,
        id: &TaskId,
        expected: &[TaskState],
        next: TaskState,
        outcome: Option<Outcome>,
    ) -> Result<Option<TaskState>, StoreError>;

    /// Drop a record, returning it.
    fn evict(&self, id: &TaskId) -> Result<Option<TaskRecord>, StoreError>;

    fn len(&self) -> Result<usize, StoreError>;

    fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

/// Process-lifetime store backed by a `HashMap`.
#[derive(Debug, Default)]
pub struct MemoryResultStore {
    records: RwLock<HashMap<TaskId, TaskRecord>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::LockPoisoned(format!("task records: {}", e))
}

impl ResultStore for MemoryResultStore {
    fn insert(&self, record: TaskRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().map_err(poisoned)?;
        if records.contains_key(&record.id) {
            return Err(StoreError::Duplicate(record.id));
        }
        records.insert(record.id, record);
        Ok(())
    }

    fn get(&self, id: &TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let records = self.records.read().map_err(poisoned)?;
        Ok(records.get(id).cloned())
    }

    fn transition(
        &self,
        id: &TaskId,
        expected: &[TaskState],
        next: TaskState,
        outcome: Option<Outcome>,
    ) -> Result<Option<TaskState>, StoreError> {
        let mut records = self.records.write().map_err(poisoned)?;
        let Some(record) = records.get_mut(id) else {
            return Ok(None);
        };
        if record.state.is_terminal() || !expected.contains(&record.state) {
            return Ok(None);
        }

        let previous = record.state;
        let now = Utc::now();
        record.state = next;
        if next == TaskState::Running {
            record.started_at = Some(now);
        }
        if next.is_terminal() {
            record.finished_at = Some(now);
        }
        if record.outcome.is_none() {
            record.outcome = outcome;
        }
        Ok(Some(previous))
    }

    fn evict(&self, id: &TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let mut records = self.records.write().map_err(poisoned)?;
        Ok(records.remove(id))
    }

    fn len(&self) -> Result<usize, StoreError> {
        Ok(self.records.read().map_err(poisoned)?.len())
    }
}
