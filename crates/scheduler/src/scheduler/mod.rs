//! In-process task scheduler with a bounded blocking pool and cooperative
//! async execution.
//!
//! Callers submit tasks by reference (`"module:function"`). The reference is
//! resolved to a [`Callable`] whose variant decides where it runs: blocking
//! bodies go to a fixed-size worker pool, suspendable bodies run on a single
//! coordination thread. Every task moves through [`TaskState`] exactly once
//! to a terminal state, and its [`Outcome`] stays queryable until evicted.
//!
//! Recurring work is registered as a [`JobDefinition`]: a [`Trigger`] plus
//! the request the scheduler submits each time the trigger fires.

pub mod builtin;
pub mod error;
pub mod events;
pub mod executor;
pub mod jobs;
pub mod metrics;
pub mod resolver;
pub mod runner;
pub mod state;
pub mod store;
pub mod task;
pub mod triggers;
pub mod types;

pub use error::{SchedulerError, SchedulerResult};
pub use events::{EventBus, EventKind, SchedulerEvent};
pub use jobs::{JobDefinition, JobStatus};
pub use metrics::SchedulerMetrics;
pub use resolver::{CachedResolver, ResolutionError, Resolver, TaskReference, TaskRegistry};
pub use runner::{Scheduler, ShutdownMode};
pub use store::{MemoryResultStore, ResultStore, StoreError, TaskRecord};
pub use task::{Callable, TaskArgs, TaskDescriptor, TaskError, TaskRequest, TaskResult};
pub use triggers::{CronTrigger, DateTrigger, IntervalTrigger, Trigger, TriggerError};
pub use types::{
    FailureOrigin, FailureRecord, Outcome, SchedulerConfig, TaskId, TaskKind, TaskState,
};
