pub mod scheduler;

pub use scheduler::{
    CachedResolver, Callable, EventKind, FailureOrigin, FailureRecord, JobDefinition, JobStatus,
    MemoryResultStore, Outcome, ResolutionError, Resolver, ResultStore, Scheduler,
    SchedulerConfig, SchedulerError, SchedulerEvent, SchedulerMetrics, SchedulerResult,
    ShutdownMode, TaskArgs, TaskDescriptor, TaskError, TaskId, TaskKind, TaskRecord,
    TaskRegistry, TaskRequest, TaskResult, TaskState, Trigger, TriggerError,
};
