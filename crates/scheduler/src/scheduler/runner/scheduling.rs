use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::scheduler::error::{SchedulerError, SchedulerResult};
use crate::scheduler::events::{EventKind, SchedulerEvent};
use crate::scheduler::jobs::{JobDefinition, JobStatus};
use crate::scheduler::resolver::{Resolver, TaskReference};
use crate::scheduler::state::SharedSchedulerState;
use crate::scheduler::store::TaskRecord;
use crate::scheduler::task::{Callable, TaskArgs, TaskDescriptor, TaskRequest};
use crate::scheduler::types::{
    FailureOrigin, FailureRecord, Outcome, SchedulerConfig, TaskId, TaskKind, TaskState,
};

use super::execution::Command;
use super::Scheduler;

/// A task that passed admission and is stored as `Pending`.
pub(super) struct Admitted {
    pub descriptor: Arc<TaskDescriptor>,
    pub callable: Callable,
    pub token: CancellationToken,
}

/// The submission path shared by [`Scheduler::submit`] and the
/// coordination loop firing jobs: resolve the reference, build the
/// descriptor and store it as `Pending`.
pub(super) struct Admission {
    resolver: Arc<dyn Resolver>,
    state: SharedSchedulerState,
    default_timeout: Option<Duration>,
    queue_capacity: Option<usize>,
}

impl Admission {
    pub(super) fn new(
        config: &SchedulerConfig,
        resolver: Arc<dyn Resolver>,
        state: SharedSchedulerState,
    ) -> Self {
        Self {
            resolver,
            state,
            default_timeout: config.default_timeout(),
            queue_capacity: config.queue_capacity,
        }
    }

    /// Admit a request that already passed [`validate_request`]. When the
    /// reference cannot be resolved the task is recorded as `Failed` and
    /// the returned [`SchedulerError::Resolution`] carries its id.
    pub(super) fn admit(&self, request: TaskRequest) -> SchedulerResult<Admitted> {
        let TaskRequest {
            reference,
            args,
            kwargs,
            timeout,
        } = request;

        let id = TaskId::new();
        let callable = match self.resolver.resolve(&reference) {
            Ok(callable) => callable,
            Err(source) => {
                warn!(task_id = %id, reference = %reference, error = %source, "Task reference did not resolve");
                self.state.reject(id, &reference, &source)?;
                return Err(SchedulerError::Resolution { task_id: id, source });
            }
        };

        let descriptor = Arc::new(TaskDescriptor::new(
            id,
            reference,
            TaskArgs::new(args, kwargs),
            callable.kind(),
            timeout.or(self.default_timeout),
        ));
        let token = self.state.admit(&descriptor, self.queue_capacity)?;
        Ok(Admitted {
            descriptor,
            callable,
            token,
        })
    }
}

fn validate_request(request: &TaskRequest) -> SchedulerResult<()> {
    if request.reference.trim().is_empty() {
        return Err(SchedulerError::InvalidArgument("task reference must not be empty".into()));
    }
    if request.timeout == Some(Duration::ZERO) {
        return Err(SchedulerError::InvalidArgument("timeout must be greater than zero".into()));
    }
    Ok(())
}

impl Scheduler {
    /// Accept a task for execution and return its id.
    ///
    /// Never waits for the task to run. When the reference cannot be
    /// resolved the task is still recorded, as `Failed`, and the returned
    /// [`SchedulerError::Resolution`] carries its id.
    pub fn submit(&self, request: TaskRequest) -> SchedulerResult<TaskId> {
        validate_request(&request)?;

        // Held until the command is queued so `stop` cannot slip in between.
        let commands = self.read_commands();
        let tx = commands.as_ref().ok_or(SchedulerError::NotRunning)?;

        let Admitted {
            descriptor,
            callable,
            token,
        } = self.admission.admit(request)?;
        let id = descriptor.id();

        let command = Command::Dispatch {
            descriptor: Arc::clone(&descriptor),
            callable,
            token,
        };
        if tx.send(command).is_err() {
            let failure = FailureRecord::new(
                "Coordination loop is not running",
                descriptor.kind().into(),
            );
            self.state.finish(&descriptor, TaskState::Failed, Outcome::Failure(failure));
            return Err(SchedulerError::NotRunning);
        }

        debug!(task_id = %id, reference = %descriptor.reference(), kind = %descriptor.kind(), "Task submitted");
        Ok(id)
    }

    /// Full record of a task.
    pub fn record(&self, id: TaskId) -> SchedulerResult<TaskRecord> {
        self.state
            .store()
            .get(&id)?
            .ok_or(SchedulerError::NotFound(id))
    }

    pub fn get_status(&self, id: TaskId) -> SchedulerResult<TaskState> {
        Ok(self.record(id)?.state)
    }

    /// Outcome of a finished task. `NotReady` while it is pending or running.
    pub fn get_result(&self, id: TaskId) -> SchedulerResult<Outcome> {
        let record = self.record(id)?;
        if !record.state.is_terminal() {
            return Err(SchedulerError::NotReady {
                id,
                state: record.state,
            });
        }
        Ok(terminal_outcome(record))
    }

    /// Wait until the task is terminal and return its outcome.
    ///
    /// `wait` bounds only this call; the task itself keeps running when
    /// the wait elapses.
    pub async fn wait_result(
        &self,
        id: TaskId,
        wait: Option<Duration>,
    ) -> SchedulerResult<Outcome> {
        let record = match wait {
            Some(limit) => tokio::time::timeout(limit, self.state.wait_terminal(id))
                .await
                .map_err(|_| SchedulerError::WaitTimeout { id, waited: limit })??,
            None => self.state.wait_terminal(id).await?,
        };
        Ok(terminal_outcome(record))
    }

    /// Request cancellation.
    ///
    /// Returns `true` when the task was pending, or was a running async
    /// task (which unwinds at its next suspension point). Running sync
    /// tasks and finished tasks are left alone and yield `false`.
    pub fn cancel(&self, id: TaskId) -> SchedulerResult<bool> {
        let record = self.record(id)?;
        let expected: &[TaskState] = match record.kind {
            Some(TaskKind::Async) => &TaskState::ACTIVE,
            _ => &[TaskState::Pending],
        };

        // Grab the token first; a terminal transition removes it.
        let token = self.state.token(&id);
        let origin = record.kind.map(FailureOrigin::from).unwrap_or(FailureOrigin::Resolver);
        let failure = FailureRecord::new("Task cancelled", origin);
        let cancelled = self.state.transition(
            id,
            &record.reference,
            expected,
            TaskState::Cancelled,
            Some(Outcome::Failure(failure)),
        );

        if cancelled {
            if let Some(token) = token {
                token.cancel();
            }
            info!(task_id = %id, reference = %record.reference, from = %record.state, "Task cancelled");
        } else {
            debug!(task_id = %id, state = %record.state, "Cancel request had no effect");
        }
        Ok(cancelled)
    }

    /// Drop a finished task's record and return it.
    pub fn evict(&self, id: TaskId) -> SchedulerResult<TaskRecord> {
        let record = self.record(id)?;
        if !record.state.is_terminal() {
            return Err(SchedulerError::NotReady {
                id,
                state: record.state,
            });
        }
        self.state
            .store()
            .evict(&id)?
            .ok_or(SchedulerError::NotFound(id))
    }

    /// Register a recurring job, or replace the job with the same id.
    ///
    /// Returns the first fire time; `None` when the job is disabled or its
    /// trigger will never fire. Jobs can be added while the scheduler is
    /// stopped and start firing once it runs. Each fire submits the job's
    /// request like [`Scheduler::submit`], and a fire is skipped while the
    /// task from the previous one is still pending or running.
    pub fn add_job(&self, job: JobDefinition) -> SchedulerResult<Option<DateTime<Utc>>> {
        if job.id.trim().is_empty() {
            return Err(SchedulerError::InvalidArgument("job id must not be empty".into()));
        }
        validate_request(&job.request)?;
        TaskReference::parse(&job.request.reference)
            .map_err(|e| SchedulerError::InvalidArgument(e.to_string()))?;

        let id = job.id.clone();
        let trigger = job.trigger.to_string();
        let (existed, next_fire_at) = self.state.jobs().upsert(job, Utc::now());

        let kind = if existed {
            EventKind::JobUpdated
        } else {
            EventKind::JobAdded
        };
        self.state.events().publish(SchedulerEvent::job(kind, &id));
        info!(job_id = %id, %trigger, ?next_fire_at, replaced = existed, "Job registered");
        Ok(next_fire_at)
    }

    /// Unregister a job. A task it already submitted keeps running.
    pub fn remove_job(&self, id: &str) -> SchedulerResult<JobStatus> {
        let status = self
            .state
            .jobs()
            .remove(id)
            .ok_or_else(|| SchedulerError::JobNotFound(id.to_string()))?;
        self.state
            .events()
            .publish(SchedulerEvent::job(EventKind::JobRemoved, id));
        info!(job_id = %id, fired = status.fire_count, "Job removed");
        Ok(status)
    }

    /// Pause or resume a job. A resumed job is rescheduled from now.
    pub fn set_job_enabled(&self, id: &str, enabled: bool) -> SchedulerResult<JobStatus> {
        let status = self
            .state
            .jobs()
            .set_enabled(id, enabled, Utc::now())
            .ok_or_else(|| SchedulerError::JobNotFound(id.to_string()))?;
        self.state
            .events()
            .publish(SchedulerEvent::job(EventKind::JobUpdated, id));
        debug!(job_id = %id, enabled, "Job toggled");
        Ok(status)
    }

    pub fn job(&self, id: &str) -> SchedulerResult<JobStatus> {
        self.state
            .jobs()
            .status(id)
            .ok_or_else(|| SchedulerError::JobNotFound(id.to_string()))
    }

    /// Every registered job, ordered by id.
    pub fn jobs(&self) -> Vec<JobStatus> {
        self.state.jobs().list()
    }
}

fn terminal_outcome(record: TaskRecord) -> Outcome {
    match record.outcome {
        Some(outcome) => outcome,
        None => {
            let origin = record.kind.map(FailureOrigin::from).unwrap_or(FailureOrigin::Resolver);
            Outcome::Failure(FailureRecord::new(
                format!("Task finished as {} without an outcome", record.state),
                origin,
            ))
        }
    }
}
