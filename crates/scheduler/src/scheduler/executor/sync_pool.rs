use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::scheduler::error::SchedulerError;
use crate::scheduler::state::SharedSchedulerState;
use crate::scheduler::task::SyncFn;
use crate::scheduler::types::{Outcome, TaskKind};

use super::{outcome_from, Job};

/// Runs blocking task bodies on a fixed-size rayon pool.
///
/// Jobs are queued with `spawn_fifo`, so when every worker is busy they
/// start in submission order. Workers are long-lived: a failing or
/// panicking task body is converted into an outcome and the thread moves
/// on to the next job.
pub struct SyncExecutor {
    pool: rayon::ThreadPool,
    state: SharedSchedulerState,
    /// Workers currently inside a task body.
    busy: Arc<AtomicUsize>,
    size: usize,
}

impl SyncExecutor {
    pub fn new(size: usize, state: SharedSchedulerState) -> Result<Self, SchedulerError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(size)
            .thread_name(|i| format!("taskhub-worker-{}", i))
            .build()
            .map_err(|e| SchedulerError::StartFailed(format!("worker pool: {}", e)))?;
        Ok(Self {
            pool,
            state,
            busy: Arc::new(AtomicUsize::new(0)),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Queue a job. The receiver yields the outcome, or errors if the job
    /// was skipped because it had already been cancelled or timed out.
    pub fn submit(&self, job: Job, body: SyncFn) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        let state = Arc::clone(&self.state);
        let busy = Arc::clone(&self.busy);
        let size = self.size;

        self.pool.spawn_fifo(move || {
            let descriptor = &job.descriptor;
            if job.token.is_cancelled() || !state.mark_running(descriptor) {
                debug!(task_id = %descriptor.id(), "Skipping sync task, no longer pending");
                return;
            }

            let now_busy = busy.fetch_add(1, Ordering::AcqRel) + 1;
            state.set_worker_utilization(now_busy, size);

            let args = descriptor.args().clone();
            let result = panic::catch_unwind(AssertUnwindSafe(|| body(args)));

            let now_busy = busy.fetch_sub(1, Ordering::AcqRel) - 1;
            state.set_worker_utilization(now_busy, size);

            let outcome = outcome_from(result, TaskKind::Sync);
            if let Outcome::Failure(failure) = &outcome {
                warn!(task_id = %descriptor.id(), reference = %descriptor.reference(), "Sync task failed: {}", failure.message);
            }
            if tx.send(outcome).is_err() {
                debug!(task_id = %descriptor.id(), "Sync task finished after its supervisor gave up");
            }
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{json, Map};

    use super::*;
    use crate::scheduler::state::SchedulerState;
    use crate::scheduler::store::MemoryResultStore;
    use crate::scheduler::task::{TaskArgs, TaskDescriptor, TaskError, TaskResult};
    use crate::scheduler::types::{FailureOrigin, TaskId, TaskState};

    fn setup(size: usize) -> (SyncExecutor, SharedSchedulerState) {
        let state = Arc::new(SchedulerState::new(Arc::new(MemoryResultStore::new()), 16));
        (SyncExecutor::new(size, Arc::clone(&state)).unwrap(), state)
    }

    fn admit(state: &SchedulerState, args: Vec<serde_json::Value>) -> Job {
        let descriptor = Arc::new(TaskDescriptor::new(
            TaskId::new(),
            "math:multiply".into(),
            TaskArgs::new(args, Map::new()),
            TaskKind::Sync,
            None,
        ));
        let token = state.admit(&descriptor, None).unwrap();
        Job { descriptor, token }
    }

    fn multiply() -> SyncFn {
        Arc::new(|a: TaskArgs| -> TaskResult { Ok(json!(a.arg::<i64>(0)? * a.arg::<i64>(1)?)) })
    }

    #[tokio::test]
    async fn runs_and_marks_running() {
        let (exec, state) = setup(2);
        let job = admit(&state, vec![json!(3), json!(4)]);
        let id = job.descriptor.id();

        let outcome = exec.submit(job, multiply()).await.unwrap();
        assert_eq!(outcome, Outcome::Success(json!(12)));

        // the executor only marks Running; the supervisor writes the outcome
        let record = state.store().get(&id).unwrap().unwrap();
        assert_eq!(record.state, TaskState::Running);
        assert!(record.started_at.is_some());
    }

    #[tokio::test]
    async fn failure_and_panic_are_captured() {
        let (exec, state) = setup(1);

        let failing: SyncFn =
            Arc::new(|_: TaskArgs| -> TaskResult { Err(TaskError::failed("Oops sync")) });
        let outcome = exec.submit(admit(&state, vec![]), failing).await.unwrap();
        let failure = outcome.failure().unwrap();
        assert!(failure.message.contains("Oops sync"));
        assert_eq!(failure.origin, FailureOrigin::Sync);

        let panicking: SyncFn =
            Arc::new(|_: TaskArgs| -> TaskResult { panic!("worker must survive") });
        let outcome = exec.submit(admit(&state, vec![]), panicking).await.unwrap();
        assert!(outcome.failure().unwrap().message.contains("worker must survive"));

        // the single worker is still alive
        let outcome = exec
            .submit(admit(&state, vec![json!(2), json!(2)]), multiply())
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Success(json!(4)));
    }

    #[tokio::test]
    async fn cancelled_job_is_skipped() {
        let (exec, state) = setup(1);
        let job = admit(&state, vec![json!(1), json!(1)]);
        job.token.cancel();

        let rx = exec.submit(job, multiply());
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn pool_bounds_concurrency() {
        let (exec, state) = setup(2);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let body: SyncFn = {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            Arc::new(move |_: TaskArgs| -> TaskResult {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(30));
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(json!(null))
            })
        };

        let receivers: Vec<_> = (0..6)
            .map(|_| exec.submit(admit(&state, vec![]), Arc::clone(&body)))
            .collect();
        for rx in receivers {
            assert!(rx.await.unwrap().is_success());
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(exec.size(), 2);
    }
}
