//! Executors turn a dispatched task into an [`Outcome`].
//!
//! - `sync_pool`: blocking callables on a fixed-size rayon pool
//! - `async_exec`: suspendable callables on the coordination runtime
//!
//! Both catch every error and panic raised by the task body and convert it
//! into a [`FailureRecord`] tagged with their own origin.

mod async_exec;
mod sync_pool;

use std::any::Any;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

pub use self::async_exec::AsyncExecutor;
pub use self::sync_pool::SyncExecutor;

use super::task::{TaskDescriptor, TaskError, TaskResult};
use super::types::{FailureRecord, Outcome, TaskKind};

/// A task handed to an executor.
#[derive(Debug, Clone)]
pub struct Job {
    pub descriptor: Arc<TaskDescriptor>,
    pub token: CancellationToken,
}

/// Convert the result of running a task body, including a caught panic.
pub(crate) fn outcome_from(result: std::thread::Result<TaskResult>, kind: TaskKind) -> Outcome {
    match result {
        Ok(Ok(value)) => Outcome::Success(value),
        Ok(Err(err)) => {
            let mut failure = FailureRecord::new(err.to_string(), kind.into());
            if let TaskError::Other(inner) = &err {
                failure = failure.with_detail(format!("{:?}", inner));
            }
            Outcome::Failure(failure)
        }
        Err(payload) => Outcome::Failure(
            FailureRecord::new(
                format!("Task panicked: {}", panic_message(payload.as_ref())),
                kind.into(),
            )
            .with_detail("panic"),
        ),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::scheduler::types::FailureOrigin;

    #[test]
    fn success_passes_value_through() {
        let outcome = outcome_from(Ok(Ok(json!(12))), TaskKind::Sync);
        assert_eq!(outcome, Outcome::Success(json!(12)));
    }

    #[test]
    fn error_becomes_failure_with_origin() {
        let outcome = outcome_from(Ok(Err(TaskError::failed("Oops sync"))), TaskKind::Sync);
        let failure = outcome.failure().unwrap();
        assert!(failure.message.contains("Oops sync"));
        assert_eq!(failure.origin, FailureOrigin::Sync);
        assert!(failure.detail.is_none());
    }

    #[test]
    fn anyhow_error_keeps_chain() {
        let err = anyhow::anyhow!("connection reset").context("fetching report");
        let outcome = outcome_from(Ok(Err(err.into())), TaskKind::Async);
        let failure = outcome.failure().unwrap();
        assert_eq!(failure.origin, FailureOrigin::Async);
        assert_eq!(failure.message, "fetching report");
        assert!(failure.detail.as_deref().unwrap().contains("connection reset"));
    }

    #[test]
    fn panic_payloads() {
        let caught = std::panic::catch_unwind(|| -> TaskResult { panic!("kaboom {}", 7) });
        let outcome = outcome_from(caught, TaskKind::Sync);
        assert_eq!(outcome.failure().unwrap().message, "Task panicked: kaboom 7");

        let caught = std::panic::catch_unwind(|| -> TaskResult { std::panic::panic_any(42u8) });
        let outcome = outcome_from(caught, TaskKind::Sync);
        assert!(outcome.failure().unwrap().message.contains("unknown panic payload"));
    }
}
