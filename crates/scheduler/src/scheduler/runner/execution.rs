use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::scheduler::error::SchedulerError;
use crate::scheduler::events::{EventKind, SchedulerEvent};
use crate::scheduler::executor::{AsyncExecutor, Job, SyncExecutor};
use crate::scheduler::state::SharedSchedulerState;
use crate::scheduler::task::{Callable, TaskDescriptor};
use crate::scheduler::types::{FailureRecord, Outcome, TaskState};

use super::scheduling::{Admission, Admitted};
use super::ShutdownMode;

/// Upper bound on how long the loop sleeps before re-checking jobs.
const JOB_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Messages from the control surface into the coordination loop.
pub(crate) enum Command {
    Dispatch {
        descriptor: Arc<TaskDescriptor>,
        callable: Callable,
        token: CancellationToken,
    },
    Shutdown {
        mode: ShutdownMode,
        done: oneshot::Sender<()>,
    },
}

/// Runs on the coordination thread. Owns both executors, the supervisor
/// futures of every dispatched task, and the firing of recurring jobs.
pub(super) struct Coordinator {
    state: SharedSchedulerState,
    admission: Arc<Admission>,
    sync: SyncExecutor,
    async_exec: AsyncExecutor,
    in_flight: JoinSet<()>,
}

impl Coordinator {
    pub(super) fn new(
        state: SharedSchedulerState,
        sync: SyncExecutor,
        admission: Arc<Admission>,
    ) -> Self {
        Self {
            async_exec: AsyncExecutor::new(Arc::clone(&state)),
            state,
            admission,
            sync,
            in_flight: JoinSet::new(),
        }
    }

    /// Process commands until a shutdown is requested or every sender is
    /// gone. Returns the shutdown acknowledgement to fire once the runtime
    /// has been torn down.
    pub(super) async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<Command>,
    ) -> Option<oneshot::Sender<()>> {
        debug!(workers = self.sync.size(), "Coordination loop running");

        let done = loop {
            let wake = self.next_job_wake();
            let state = Arc::clone(&self.state);
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Dispatch { descriptor, callable, token }) => {
                        self.dispatch(descriptor, callable, token);
                    }
                    Some(Command::Shutdown { mode, done }) => {
                        self.shutdown(mode).await;
                        break Some(done);
                    }
                    None => {
                        warn!("Command channel closed without shutdown, cancelling in-flight tasks");
                        self.shutdown(ShutdownMode::Cancel).await;
                        break None;
                    }
                },
                Some(joined) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    reap(joined);
                }
                _ = tokio::time::sleep_until(wake) => self.fire_due_jobs(),
                // Re-plan the wake-up when jobs change.
                _ = state.jobs().changed() => {}
            }
        };

        self.state
            .events()
            .publish(SchedulerEvent::scheduler(EventKind::Shutdown));
        done
    }

    /// Route a task to its executor and start supervising it.
    fn dispatch(
        &mut self,
        descriptor: Arc<TaskDescriptor>,
        callable: Callable,
        token: CancellationToken,
    ) {
        let id = descriptor.id();
        if token.is_cancelled() {
            debug!(task_id = %id, "Not dispatching cancelled task");
            return;
        }
        match self.state.store().get(&id) {
            Ok(Some(record)) if record.state == TaskState::Pending => {}
            Ok(_) => {
                debug!(task_id = %id, "Not dispatching task that is no longer pending");
                return;
            }
            Err(e) => {
                error!(task_id = %id, error = %e, "Could not read task before dispatch");
                return;
            }
        }

        let job = Job {
            descriptor: Arc::clone(&descriptor),
            token: token.clone(),
        };
        let completion: BoxFuture<'static, Option<Outcome>> = match callable {
            Callable::Sync(body) => {
                let rx = self.sync.submit(job, body);
                async move { rx.await.ok() }.boxed()
            }
            Callable::Async(body) => {
                let handle = self.async_exec.submit(job, body);
                async move {
                    match handle.await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            error!(error = %e, "Async task wrapper did not complete");
                            None
                        }
                    }
                }
                .boxed()
            }
        };

        debug!(
            task_id = %id,
            reference = %descriptor.reference(),
            kind = %descriptor.kind(),
            timeout = ?descriptor.timeout(),
            "Dispatched task"
        );
        self.in_flight
            .spawn(supervise(Arc::clone(&self.state), descriptor, token, completion));
    }

    /// Submit every due job through the normal admission path and
    /// dispatch it. A job whose previous task is still active is skipped.
    fn fire_due_jobs(&mut self) {
        let state = Arc::clone(&self.state);
        let due = state.jobs().take_due(Utc::now(), |id| state.is_active(id));
        for job in due {
            match self.admission.admit(job.request) {
                Ok(Admitted {
                    descriptor,
                    callable,
                    token,
                }) => {
                    let task_id = descriptor.id();
                    state.jobs().record_fire(&job.id, task_id);
                    info!(
                        job_id = %job.id,
                        task_id = %task_id,
                        scheduled_for = %job.scheduled_for,
                        "Job fired"
                    );
                    state.events().publish(
                        SchedulerEvent::job(EventKind::JobFired, &job.id)
                            .with_task(task_id, descriptor.reference()),
                    );
                    self.dispatch(descriptor, callable, token);
                }
                // Recorded as a failed task; the job keeps its schedule.
                Err(SchedulerError::Resolution { task_id, source }) => {
                    state.jobs().record_fire(&job.id, task_id);
                    warn!(
                        job_id = %job.id,
                        task_id = %task_id,
                        error = %source,
                        "Job task did not resolve"
                    );
                }
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "Job fire missed");
                    state
                        .events()
                        .publish(SchedulerEvent::job(EventKind::JobMissed, &job.id));
                }
            }
        }
    }

    /// When the loop should next look for due jobs.
    fn next_job_wake(&self) -> Instant {
        let next = self.state.jobs().next_wake(|id| self.state.is_active(id));
        let delay = match next {
            Some(at) => (at - Utc::now()).to_std().unwrap_or(Duration::ZERO),
            None => JOB_POLL_INTERVAL,
        };
        Instant::now() + delay.min(JOB_POLL_INTERVAL)
    }

    async fn shutdown(&mut self, mode: ShutdownMode) {
        info!(?mode, in_flight = self.in_flight.len(), "Coordination loop shutting down");
        if mode == ShutdownMode::Cancel {
            let cancelled = self
                .state
                .cancel_all("Scheduler shut down before the task finished");
            if cancelled > 0 {
                info!(cancelled, "Cancelled unfinished tasks");
            }
        }
        while let Some(joined) = self.in_flight.join_next().await {
            reap(joined);
        }
    }
}

/// Race a task's completion against its timeout and its cancellation
/// token. Whichever writes first decides the terminal state; the others
/// lose the store's compare-and-set.
async fn supervise(
    state: SharedSchedulerState,
    descriptor: Arc<TaskDescriptor>,
    token: CancellationToken,
    completion: BoxFuture<'static, Option<Outcome>>,
) {
    let timeout = descriptor.timeout();
    let deadline = async move {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        outcome = completion => match outcome {
            Some(outcome) => {
                let next = outcome.completion_state();
                state.finish(&descriptor, next, outcome);
            }
            None if token.is_cancelled() => {}
            None => {
                let failure = FailureRecord::new(
                    "Task ended without producing an outcome",
                    descriptor.kind().into(),
                );
                state.finish(&descriptor, TaskState::Failed, Outcome::Failure(failure));
            }
        },
        _ = deadline => {
            let limit = timeout.unwrap_or_default();
            let failure = FailureRecord::new(
                format!("Task timed out after {:?}", limit),
                descriptor.kind().into(),
            );
            if state.finish(&descriptor, TaskState::TimedOut, Outcome::Failure(failure)) {
                warn!(
                    task_id = %descriptor.id(),
                    reference = %descriptor.reference(),
                    "Task timed out after {:?}",
                    limit
                );
            }
            token.cancel();
        }
        _ = token.cancelled() => {
            debug!(task_id = %descriptor.id(), "Supervisor released by cancellation");
        }
    }
}

fn reap(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(error = %e, "Task supervisor panicked");
        }
    }
}
