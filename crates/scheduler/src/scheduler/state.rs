use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::error::SchedulerError;
use super::events::{EventBus, EventKind, SchedulerEvent};
use super::jobs::JobTable;
use super::metrics::SchedulerMetrics;
use super::resolver::ResolutionError;
use super::store::{ResultStore, TaskRecord};
use super::task::TaskDescriptor;
use super::types::{FailureOrigin, FailureRecord, Outcome, TaskId, TaskState};

/// Bookkeeping shared by the scheduler core and both executors.
///
/// All state changes go through [`SchedulerState::transition`], which wraps
/// the store's compare-and-set and keeps the pending counter, metrics,
/// cancellation tokens, waiters and event subscribers in step with it.
pub struct SchedulerState {
    store: Arc<dyn ResultStore>,
    events: EventBus,
    metrics: RwLock<SchedulerMetrics>,
    /// Cancellation handle per non-terminal task.
    tokens: Mutex<HashMap<TaskId, CancellationToken>>,
    /// Tasks admitted but not yet accepted by an executor.
    pending: AtomicUsize,
    /// Woken on every terminal transition.
    finished: Notify,
    /// Recurring jobs fired by the coordination loop.
    jobs: JobTable,
}

/// Thread-safe handle to the shared scheduler state.
pub type SharedSchedulerState = Arc<SchedulerState>;

impl SchedulerState {
    pub fn new(store: Arc<dyn ResultStore>, event_capacity: usize) -> Self {
        Self {
            store,
            events: EventBus::new(event_capacity),
            metrics: RwLock::new(SchedulerMetrics::default()),
            tokens: Mutex::new(HashMap::new()),
            pending: AtomicUsize::new(0),
            finished: Notify::new(),
            jobs: JobTable::new(),
        }
    }

    pub fn store(&self) -> &dyn ResultStore {
        self.store.as_ref()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub(crate) fn jobs(&self) -> &JobTable {
        &self.jobs
    }

    /// Whether `id` is stored and not yet terminal.
    pub(crate) fn is_active(&self, id: TaskId) -> bool {
        match self.store.get(&id) {
            Ok(record) => record.is_some_and(|r| !r.state.is_terminal()),
            Err(e) => {
                warn!(task_id = %id, error = %e, "Could not read task state");
                false
            }
        }
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        match self.metrics.read() {
            Ok(m) => m.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn with_metrics(&self, f: impl FnOnce(&mut SchedulerMetrics)) {
        match self.metrics.write() {
            Ok(mut m) => f(&mut m),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Store a freshly submitted task as `Pending` and hand back its
    /// cancellation token. Fails with `QueueFull` when `capacity` pending
    /// tasks are already waiting.
    pub(crate) fn admit(
        &self,
        descriptor: &TaskDescriptor,
        capacity: Option<usize>,
    ) -> Result<CancellationToken, SchedulerError> {
        let reserved = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| match capacity {
                Some(cap) if n >= cap => None,
                _ => Some(n + 1),
            });
        if reserved.is_err() {
            return Err(SchedulerError::QueueFull {
                capacity: capacity.unwrap_or_default(),
            });
        }

        let token = CancellationToken::new();
        self.lock_tokens().insert(descriptor.id(), token.clone());

        if let Err(e) = self.store.insert(TaskRecord::pending(descriptor)) {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            self.lock_tokens().remove(&descriptor.id());
            return Err(e.into());
        }

        self.with_metrics(|m| {
            m.tasks_submitted += 1;
            m.pending += 1;
        });
        self.events.publish(SchedulerEvent::task(
            EventKind::TaskSubmitted,
            descriptor.id(),
            descriptor.reference(),
        ));
        Ok(token)
    }

    /// Record a task whose reference could not be resolved. It goes
    /// straight to `Failed` and never runs.
    pub(crate) fn reject(
        &self,
        id: TaskId,
        reference: &str,
        err: &ResolutionError,
    ) -> Result<(), SchedulerError> {
        let failure = FailureRecord::new(err.to_string(), FailureOrigin::Resolver);
        let record = TaskRecord::unresolved(id, reference, failure);
        let outcome = record.outcome.clone();
        self.store.insert(record)?;

        self.with_metrics(|m| {
            m.tasks_submitted += 1;
            *m.tasks_finished.entry(TaskState::Failed).or_default() += 1;
        });
        self.events.publish(
            SchedulerEvent::task(EventKind::TaskFailed, id, reference).with_outcome(outcome),
        );
        self.finished.notify_waiters();
        Ok(())
    }

    /// `Pending → Running`. Called by an executor at the moment it accepts
    /// the task; `false` means the task was cancelled or timed out first.
    pub(crate) fn mark_running(&self, descriptor: &TaskDescriptor) -> bool {
        self.transition(
            descriptor.id(),
            descriptor.reference(),
            &[TaskState::Pending],
            TaskState::Running,
            None,
        )
    }

    /// Move an active task to a terminal state with its outcome.
    pub(crate) fn finish(
        &self,
        descriptor: &TaskDescriptor,
        state: TaskState,
        outcome: Outcome,
    ) -> bool {
        self.transition(
            descriptor.id(),
            descriptor.reference(),
            &TaskState::ACTIVE,
            state,
            Some(outcome),
        )
    }

    /// Compare-and-set a task's state. Returns whether this call won.
    pub(crate) fn transition(
        &self,
        id: TaskId,
        reference: &str,
        expected: &[TaskState],
        next: TaskState,
        outcome: Option<Outcome>,
    ) -> bool {
        let event_outcome = if next.is_terminal() { outcome.clone() } else { None };
        let previous = match self.store.transition(&id, expected, next, outcome) {
            Ok(Some(prev)) => prev,
            Ok(None) => return false,
            Err(e) => {
                error!(task_id = %id, error = %e, "State transition failed");
                return false;
            }
        };

        if previous == TaskState::Pending {
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }

        let duration = if next.is_terminal() && previous == TaskState::Running {
            self.store.get(&id).ok().flatten().and_then(|r| r.duration())
        } else {
            None
        };
        self.with_metrics(|m| {
            m.record_transition(previous, next);
            if let Some(d) = duration {
                m.record_execution(reference, d);
            }
        });

        debug!(task_id = %id, reference = %reference, from = %previous, to = %next, "Task transition");
        self.events.publish(
            SchedulerEvent::task(EventKind::for_state(next), id, reference)
                .with_outcome(event_outcome),
        );

        if next.is_terminal() {
            self.lock_tokens().remove(&id);
            self.finished.notify_waiters();
        }
        true
    }

    pub(crate) fn token(&self, id: &TaskId) -> Option<CancellationToken> {
        self.lock_tokens().get(id).cloned()
    }

    /// Cancel every task that has not reached a terminal state yet.
    /// Returns how many were cancelled.
    pub(crate) fn cancel_all(&self, reason: &str) -> usize {
        let active: Vec<(TaskId, CancellationToken)> = self
            .lock_tokens()
            .iter()
            .map(|(id, token)| (*id, token.clone()))
            .collect();

        let mut cancelled = 0;
        for (id, token) in active {
            let record = match self.store.get(&id) {
                Ok(Some(r)) => r,
                Ok(None) => continue,
                Err(e) => {
                    warn!(task_id = %id, error = %e, "Could not read task during cancel");
                    continue;
                }
            };
            let origin = record.kind.map(FailureOrigin::from).unwrap_or(FailureOrigin::Resolver);
            let failure = FailureRecord::new(reason, origin);
            if self.transition(
                id,
                &record.reference,
                &TaskState::ACTIVE,
                TaskState::Cancelled,
                Some(Outcome::Failure(failure)),
            ) {
                cancelled += 1;
            }
            token.cancel();
        }
        cancelled
    }

    /// Wait until `id` reaches a terminal state.
    pub(crate) async fn wait_terminal(&self, id: TaskId) -> Result<TaskRecord, SchedulerError> {
        loop {
            let notified = self.finished.notified();
            tokio::pin!(notified);
            // Register before reading so a transition in between isn't missed.
            notified.as_mut().enable();

            let record = self.store.get(&id)?.ok_or(SchedulerError::NotFound(id))?;
            if record.state.is_terminal() {
                return Ok(record);
            }
            notified.await;
        }
    }

    pub(crate) fn set_worker_utilization(&self, busy: usize, pool_size: usize) {
        let ratio = if pool_size == 0 { 0.0 } else { busy as f64 / pool_size as f64 };
        self.with_metrics(|m| m.worker_utilization = ratio);
    }

    fn lock_tokens(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, CancellationToken>> {
        self.tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
