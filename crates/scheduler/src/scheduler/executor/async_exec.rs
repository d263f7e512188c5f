use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::scheduler::state::SharedSchedulerState;
use crate::scheduler::task::AsyncFn;
use crate::scheduler::types::{Outcome, TaskKind};

use super::{outcome_from, Job};

/// Runs suspendable task bodies on the current tokio runtime.
///
/// Inside the scheduler that runtime is the single-threaded coordination
/// runtime, so async tasks interleave cooperatively with each other and
/// with dispatch. A body that never yields starves everything else on
/// that thread.
///
/// Cancellation is cooperative: the token is only observed while the body
/// is suspended.
pub struct AsyncExecutor {
    state: SharedSchedulerState,
}

impl AsyncExecutor {
    pub fn new(state: SharedSchedulerState) -> Self {
        Self { state }
    }

    /// Spawn a job. Must be called from within a tokio runtime.
    ///
    /// The handle resolves to `None` when the job was skipped or cancelled
    /// before producing an outcome.
    pub fn submit(&self, job: Job, body: AsyncFn) -> JoinHandle<Option<Outcome>> {
        let state = Arc::clone(&self.state);

        tokio::spawn(async move {
            let descriptor = &job.descriptor;
            if job.token.is_cancelled() || !state.mark_running(descriptor) {
                debug!(task_id = %descriptor.id(), "Skipping async task, no longer pending");
                return None;
            }

            let args = descriptor.args().clone();
            let future = match panic::catch_unwind(AssertUnwindSafe(|| body(args))) {
                Ok(future) => future,
                Err(payload) => return Some(outcome_from(Err(payload), TaskKind::Async)),
            };

            let result = tokio::select! {
                biased;
                _ = job.token.cancelled() => {
                    debug!(task_id = %descriptor.id(), "Async task unwound at suspension point");
                    return None;
                }
                result = AssertUnwindSafe(future).catch_unwind() => result,
            };

            let outcome = outcome_from(result, TaskKind::Async);
            if let Outcome::Failure(failure) = &outcome {
                warn!(task_id = %descriptor.id(), reference = %descriptor.reference(), "Async task failed: {}", failure.message);
            }
            Some(outcome)
        })
    }
}
