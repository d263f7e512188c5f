use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::types::{TaskId, TaskKind};

/// Error type returned by task bodies.
///
/// Never reaches the scheduler's own control flow: executors turn it into a
/// [`FailureRecord`](super::types::FailureRecord).
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task failed: {0}")]
    Failed(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TaskError {
    pub fn failed(message: impl Into<String>) -> Self {
        TaskError::Failed(message.into())
    }
}

pub type TaskResult = Result<Value, TaskError>;

/// Blocking task body.
pub type SyncFn = Arc<dyn Fn(TaskArgs) -> TaskResult + Send + Sync>;

/// Suspendable task body. Invoking it yields a future that must be driven
/// to completion.
pub type AsyncFn = Arc<dyn Fn(TaskArgs) -> BoxFuture<'static, TaskResult> + Send + Sync>;

/// A resolved task body, tagged with its execution model.
///
/// The tag is fixed when the callable is registered, so dispatch never
/// has to inspect the callable again.
#[derive(Clone)]
pub enum Callable {
    Sync(SyncFn),
    Async(AsyncFn),
}

impl Callable {
    /// Wrap a blocking function.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(TaskArgs) -> TaskResult + Send + Sync + 'static,
    {
        Callable::Sync(Arc::new(f))
    }

    /// Wrap a function returning a future.
    pub fn from_async_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(TaskArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        Callable::Async(Arc::new(move |args| Box::pin(f(args))))
    }

    pub fn kind(&self) -> TaskKind {
        match self {
            Callable::Sync(_) => TaskKind::Sync,
            Callable::Async(_) => TaskKind::Async,
        }
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callable::{:?}", self.kind())
    }
}

/// Positional and named arguments captured at submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskArgs {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl TaskArgs {
    pub fn new(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self { args, kwargs }
    }

    /// Deserialize the positional argument at `index`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, TaskError> {
        let raw = self.args.get(index).ok_or_else(|| {
            TaskError::InvalidArgument(format!(
                "missing positional argument {} (got {})",
                index,
                self.args.len()
            ))
        })?;
        serde_json::from_value(raw.clone())
            .map_err(|e| TaskError::InvalidArgument(format!("argument {}: {}", index, e)))
    }

    /// Deserialize a named argument, `None` when absent.
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, TaskError> {
        match self.kwargs.get(name) {
            None => Ok(None),
            Some(raw) => serde_json::from_value(raw.clone())
                .map(Some)
                .map_err(|e| TaskError::InvalidArgument(format!("argument '{}': {}", name, e))),
        }
    }

    pub fn kwarg_or<T: DeserializeOwned>(&self, name: &str, default: T) -> Result<T, TaskError> {
        Ok(self.kwarg(name)?.unwrap_or(default))
    }
}

/// What a caller hands to [`Scheduler::submit`](super::Scheduler::submit).
#[derive(Debug, Clone, Default)]
pub struct TaskRequest {
    pub reference: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub timeout: Option<Duration>,
}

impl TaskRequest {
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    pub fn kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Immutable description of a submitted task.
///
/// Built once by the scheduler and shared as `Arc<TaskDescriptor>`; there is
/// no way to mutate it afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct TaskDescriptor {
    id: TaskId,
    reference: String,
    args: TaskArgs,
    kind: TaskKind,
    timeout: Option<Duration>,
    submitted_at: DateTime<Utc>,
}

impl TaskDescriptor {
    pub(crate) fn new(
        id: TaskId,
        reference: String,
        args: TaskArgs,
        kind: TaskKind,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            id,
            reference,
            args,
            kind,
            timeout,
            submitted_at: Utc::now(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn args(&self) -> &TaskArgs {
        &self.args
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn callable_kind_follows_constructor() {
        let sync = Callable::from_fn(|_| Ok(json!(1)));
        let asynchronous = Callable::from_async_fn(|_| async { Ok::<_, TaskError>(json!(1)) });
        assert_eq!(sync.kind(), TaskKind::Sync);
        assert_eq!(asynchronous.kind(), TaskKind::Async);
        assert_eq!(format!("{:?}", sync), "Callable::Sync");
    }

    #[test]
    fn args_accessors() {
        let args = TaskRequest::new("math:multiply")
            .arg(3)
            .arg("four")
            .kwarg("scale", 2.5);
        let args = TaskArgs::new(args.args, args.kwargs);

        assert_eq!(args.arg::<i64>(0).unwrap(), 3);
        assert_eq!(args.arg::<String>(1).unwrap(), "four");
        assert!(matches!(args.arg::<i64>(1), Err(TaskError::InvalidArgument(_))));
        assert!(matches!(args.arg::<i64>(5), Err(TaskError::InvalidArgument(_))));

        assert_eq!(args.kwarg::<f64>("scale").unwrap(), Some(2.5));
        assert_eq!(args.kwarg::<f64>("missing").unwrap(), None);
        assert_eq!(args.kwarg_or("missing", 7u32).unwrap(), 7);
    }

    #[test]
    fn task_error_messages() {
        assert_eq!(TaskError::failed("Oops sync").to_string(), "Task failed: Oops sync");
        let other: TaskError = anyhow::anyhow!("disk full").into();
        assert_eq!(other.to_string(), "disk full");
    }

    #[test]
    fn descriptor_keeps_submission_values() {
        let id = TaskId::new();
        let d = TaskDescriptor::new(
            id,
            "math:add".into(),
            TaskArgs::new(vec![json!(2), json!(5)], Map::new()),
            TaskKind::Async,
            Some(Duration::from_millis(50)),
        );
        assert_eq!(d.id(), id);
        assert_eq!(d.reference(), "math:add");
        assert_eq!(d.args().args.len(), 2);
        assert_eq!(d.kind(), TaskKind::Async);
        assert_eq!(d.timeout(), Some(Duration::from_millis(50)));
        assert!(d.submitted_at() <= Utc::now());
    }
}
