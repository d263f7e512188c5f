//! End-to-end tests driving the scheduler through its public API.
//!
//! Task bodies mirror a small fixture module: arithmetic tasks of both
//! kinds, a failing task of each kind and a slow async task used for
//! timeouts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::time::timeout;

use taskhub_scheduler::{
    Callable, FailureOrigin, JobDefinition, MemoryResultStore, Outcome, ResolutionError, Resolver,
    ResultStore, Scheduler, SchedulerConfig, ShutdownMode, TaskArgs, TaskError, TaskRegistry,
    TaskRequest, TaskResult, TaskState, Trigger,
};

const TIMEOUT: Duration = Duration::from_secs(5);

async fn async_add(a: TaskArgs) -> TaskResult {
    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(json!(a.arg::<i64>(0)? + a.arg::<i64>(1)?))
}

fn sync_multiply(a: TaskArgs) -> TaskResult {
    Ok(json!(a.arg::<i64>(0)? * a.arg::<i64>(1)?))
}

async fn async_long_running_task(_: TaskArgs) -> TaskResult {
    tokio::time::sleep(Duration::from_secs(1)).await;
    Ok(json!(1))
}

async fn async_failing_task(_: TaskArgs) -> TaskResult {
    Err(TaskError::failed("Oops async"))
}

fn sync_failing_task(_: TaskArgs) -> TaskResult {
    Err(TaskError::failed("Oops sync"))
}

fn fixture_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry.register_async("fixtures:async_add", async_add).unwrap();
    registry.register_sync("fixtures:sync_multiply", sync_multiply).unwrap();
    registry
        .register_async("fixtures:async_long_running_task", async_long_running_task)
        .unwrap();
    registry
        .register_async("fixtures:async_failing_task", async_failing_task)
        .unwrap();
    registry
        .register_sync("fixtures:sync_failing_task", sync_failing_task)
        .unwrap();
    registry
}

fn start(config: SchedulerConfig, registry: TaskRegistry) -> Scheduler {
    let scheduler = Scheduler::new(config, registry).unwrap();
    scheduler.start().unwrap();
    scheduler
}

#[tokio::test]
async fn mixed_workload_reaches_expected_outcomes() {
    let scheduler = start(
        SchedulerConfig::default().with_worker_pool_size(2),
        fixture_registry(),
    );

    let multiply = scheduler
        .submit(TaskRequest::new("fixtures:sync_multiply").arg(3).arg(4))
        .unwrap();
    let add = scheduler
        .submit(TaskRequest::new("fixtures:async_add").arg(2).arg(5))
        .unwrap();
    let sync_fail = scheduler
        .submit(TaskRequest::new("fixtures:sync_failing_task"))
        .unwrap();
    let async_fail = scheduler
        .submit(TaskRequest::new("fixtures:async_failing_task"))
        .unwrap();
    let slow = scheduler
        .submit(
            TaskRequest::new("fixtures:async_long_running_task")
                .timeout(Duration::from_millis(100)),
        )
        .unwrap();
    let submitted = Instant::now();

    assert_eq!(
        scheduler.wait_result(multiply, Some(TIMEOUT)).await.unwrap(),
        Outcome::Success(json!(12))
    );
    assert_eq!(
        scheduler.wait_result(add, Some(TIMEOUT)).await.unwrap(),
        Outcome::Success(json!(7))
    );

    let outcome = scheduler.wait_result(sync_fail, Some(TIMEOUT)).await.unwrap();
    let failure = outcome.failure().unwrap();
    assert!(failure.message.contains("Oops sync"));
    assert_eq!(failure.origin, FailureOrigin::Sync);
    assert_eq!(scheduler.get_status(sync_fail).unwrap(), TaskState::Failed);

    let outcome = scheduler.wait_result(async_fail, Some(TIMEOUT)).await.unwrap();
    let failure = outcome.failure().unwrap();
    assert!(failure.message.contains("Oops async"));
    assert_eq!(failure.origin, FailureOrigin::Async);

    scheduler.wait_result(slow, Some(TIMEOUT)).await.unwrap();
    assert_eq!(scheduler.get_status(slow).unwrap(), TaskState::TimedOut);
    assert!(
        submitted.elapsed() < Duration::from_millis(800),
        "timeout should beat the 1s task, took {:?}",
        submitted.elapsed()
    );

    scheduler.stop(ShutdownMode::Wait).await.unwrap();
}

#[tokio::test]
async fn terminal_state_is_stable_across_queries() {
    let scheduler = start(
        SchedulerConfig::default().with_worker_pool_size(1),
        fixture_registry(),
    );
    let id = scheduler
        .submit(TaskRequest::new("fixtures:async_add").arg(1).arg(1))
        .unwrap();
    let first = scheduler.wait_result(id, Some(TIMEOUT)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    for _ in 0..3 {
        assert_eq!(scheduler.get_status(id).unwrap(), TaskState::Succeeded);
        assert_eq!(scheduler.get_result(id).unwrap(), first);
    }
    let record = scheduler.record(id).unwrap();
    assert!(record.started_at.is_some());
    assert!(record.finished_at >= record.started_at);
    scheduler.stop(ShutdownMode::Wait).await.unwrap();
}

#[tokio::test]
async fn worker_pool_bounds_blocking_concurrency() {
    const WORKERS: usize = 2;
    const TASKS: usize = 8;

    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut registry = TaskRegistry::new();
    {
        let current = Arc::clone(&current);
        let peak = Arc::clone(&peak);
        registry
            .register_sync("fixtures:busy", move |_: TaskArgs| -> TaskResult {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(40));
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(json!(null))
            })
            .unwrap();
    }

    let scheduler = start(
        SchedulerConfig::default().with_worker_pool_size(WORKERS),
        registry,
    );
    let ids: Vec<_> = (0..TASKS)
        .map(|_| scheduler.submit(TaskRequest::new("fixtures:busy")).unwrap())
        .collect();

    for id in &ids {
        let outcome = scheduler.wait_result(*id, Some(TIMEOUT)).await.unwrap();
        assert!(outcome.is_success());
    }
    let peak = peak.load(Ordering::SeqCst);
    assert!(peak <= WORKERS, "peak concurrency {} exceeded pool size", peak);
    assert!(peak >= 1);
    scheduler.stop(ShutdownMode::Wait).await.unwrap();
}

#[tokio::test]
async fn blocking_tasks_start_in_submission_order() {
    const TASKS: i64 = 20;

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut registry = TaskRegistry::new();
    registry
        .register_sync("fixtures:hold", |_: TaskArgs| -> TaskResult {
            std::thread::sleep(Duration::from_millis(100));
            Ok(json!(null))
        })
        .unwrap();
    {
        let order = Arc::clone(&order);
        registry
            .register_sync("fixtures:record", move |a: TaskArgs| -> TaskResult {
                let i: i64 = a.arg(0)?;
                order.lock().unwrap().push(i);
                Ok(json!(i))
            })
            .unwrap();
    }

    // One worker, held busy so every recording task queues behind it.
    let scheduler = start(SchedulerConfig::default().with_worker_pool_size(1), registry);
    let hold = scheduler.submit(TaskRequest::new("fixtures:hold")).unwrap();
    let ids: Vec<_> = (0..TASKS)
        .map(|i| {
            scheduler
                .submit(TaskRequest::new("fixtures:record").arg(i))
                .unwrap()
        })
        .collect();

    scheduler.wait_result(hold, Some(TIMEOUT)).await.unwrap();
    for id in &ids {
        let outcome = scheduler.wait_result(*id, Some(TIMEOUT)).await.unwrap();
        assert!(outcome.is_success());
    }
    let order = order.lock().unwrap().clone();
    assert_eq!(order, (0..TASKS).collect::<Vec<_>>());
    scheduler.stop(ShutdownMode::Wait).await.unwrap();
}

#[tokio::test]
async fn cron_job_submits_through_the_scheduler() {
    let scheduler = start(
        SchedulerConfig::default().with_worker_pool_size(1),
        fixture_registry(),
    );
    let request = TaskRequest::new("fixtures:sync_multiply").arg(6).arg(7);
    let every_second = Trigger::cron("* * * * * *").unwrap();
    let first = scheduler
        .add_job(JobDefinition::new("answer", every_second, request))
        .unwrap()
        .expect("a cron job always has a next fire time");
    assert!(first > chrono::Utc::now() - chrono::Duration::seconds(1));

    let fired = timeout(TIMEOUT, async {
        while scheduler.job("answer").unwrap().fire_count < 2 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(fired.is_ok(), "cron job did not fire twice");

    let status = scheduler.job("answer").unwrap();
    let task = status.last_task.unwrap();
    let outcome = scheduler.wait_result(task, Some(TIMEOUT)).await.unwrap();
    assert_eq!(outcome.value(), Some(&json!(42)));
    assert_eq!(scheduler.jobs().len(), 1);

    scheduler.remove_job("answer").unwrap();
    scheduler.stop(ShutdownMode::Wait).await.unwrap();
}

#[tokio::test]
async fn async_tasks_overlap_on_the_coordination_thread() {
    let scheduler = start(
        SchedulerConfig::default().with_worker_pool_size(1),
        fixture_registry(),
    );
    let started = Instant::now();
    let ids: Vec<_> = (0..10)
        .map(|i| {
            scheduler
                .submit(TaskRequest::new("fixtures:async_add").arg(i).arg(i))
                .unwrap()
        })
        .collect();
    for (i, id) in ids.iter().enumerate() {
        let outcome = scheduler.wait_result(*id, Some(TIMEOUT)).await.unwrap();
        assert_eq!(outcome.value(), Some(&json!(2 * i as i64)));
    }
    // ten 50ms sleeps interleave rather than run back to back
    assert!(started.elapsed() < Duration::from_millis(400));
    scheduler.stop(ShutdownMode::Wait).await.unwrap();
}

#[tokio::test]
async fn concurrent_submitters_get_unique_ids() {
    let scheduler = Arc::new(start(
        SchedulerConfig::default().with_worker_pool_size(4),
        fixture_registry(),
    ));

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let scheduler = Arc::clone(&scheduler);
            std::thread::spawn(move || {
                (0..25)
                    .map(|i| {
                        scheduler
                            .submit(TaskRequest::new("fixtures:sync_multiply").arg(t).arg(i))
                            .unwrap()
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut ids = Vec::new();
    for handle in handles {
        ids.extend(handle.join().unwrap());
    }
    let unique: std::collections::HashSet<_> = ids.iter().collect();
    assert_eq!(unique.len(), 100);

    for id in &ids {
        assert!(scheduler.wait_result(*id, Some(TIMEOUT)).await.unwrap().is_success());
    }
    assert_eq!(scheduler.metrics().finished(TaskState::Succeeded), 100);
    scheduler.stop(ShutdownMode::Wait).await.unwrap();
}

/// Resolver that only knows one reference and counts lookups.
struct SingleTaskResolver {
    lookups: Arc<AtomicUsize>,
}

impl Resolver for SingleTaskResolver {
    fn resolve(&self, reference: &str) -> Result<Callable, ResolutionError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        match reference {
            "custom:double" => Ok(Callable::from_fn(|a: TaskArgs| -> TaskResult {
                Ok(json!(a.arg::<i64>(0)? * 2))
            })),
            other => Err(ResolutionError::NotFound(other.to_string())),
        }
    }
}

#[tokio::test]
async fn custom_resolver_and_shared_store() {
    let lookups = Arc::new(AtomicUsize::new(0));
    let store = Arc::new(MemoryResultStore::new());
    let scheduler = Scheduler::with_store(
        SchedulerConfig::default().with_worker_pool_size(1),
        SingleTaskResolver {
            lookups: Arc::clone(&lookups),
        },
        store.clone(),
    )
    .unwrap();
    scheduler.start().unwrap();

    let first = scheduler.submit(TaskRequest::new("custom:double").arg(21)).unwrap();
    let second = scheduler.submit(TaskRequest::new("custom:double").arg(4)).unwrap();
    assert_eq!(
        scheduler.wait_result(first, Some(TIMEOUT)).await.unwrap(),
        Outcome::Success(json!(42))
    );
    scheduler.wait_result(second, Some(TIMEOUT)).await.unwrap();

    // resolved once, then served from the cache
    assert_eq!(lookups.load(Ordering::SeqCst), 1);

    // records are visible through the caller's handle on the store
    let record = store.get(&first).unwrap().unwrap();
    assert_eq!(record.state, TaskState::Succeeded);
    assert_eq!(store.len().unwrap(), 2);

    assert!(scheduler.submit(TaskRequest::new("custom:missing")).is_err());
    assert_eq!(store.len().unwrap(), 3);
    scheduler.stop(ShutdownMode::Wait).await.unwrap();
}

#[tokio::test]
async fn builtin_tasks_run_end_to_end() {
    let scheduler = start(
        SchedulerConfig::default().with_worker_pool_size(1),
        TaskRegistry::with_builtins().unwrap(),
    );

    let echo = scheduler
        .submit(TaskRequest::new("builtin:echo").arg("hi").kwarg("n", 1))
        .unwrap();
    let sleep = scheduler
        .submit(TaskRequest::new("builtin:sleep").kwarg("ms", 10))
        .unwrap();
    let fail = scheduler
        .submit(TaskRequest::new("builtin:fail").kwarg("message", "nope"))
        .unwrap();

    assert_eq!(
        scheduler.wait_result(echo, Some(TIMEOUT)).await.unwrap(),
        Outcome::Success(json!({ "args": ["hi"], "kwargs": { "n": 1 } }))
    );
    assert_eq!(
        scheduler.wait_result(sleep, Some(TIMEOUT)).await.unwrap(),
        Outcome::Success(json!(10))
    );
    let failed = scheduler.wait_result(fail, Some(TIMEOUT)).await.unwrap();
    assert_eq!(failed.failure().unwrap().message, "Task failed: nope");
    scheduler.stop(ShutdownMode::Wait).await.unwrap();
}

#[tokio::test]
async fn sync_timeout_is_best_effort() {
    let mut registry = TaskRegistry::new();
    let finished = Arc::new(AtomicUsize::new(0));
    {
        let finished = Arc::clone(&finished);
        registry
            .register_sync("fixtures:slow_sync", move |_: TaskArgs| -> TaskResult {
                std::thread::sleep(Duration::from_millis(200));
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(json!("late"))
            })
            .unwrap();
    }
    let scheduler = start(SchedulerConfig::default().with_worker_pool_size(1), registry);

    let id = scheduler
        .submit(TaskRequest::new("fixtures:slow_sync").timeout(Duration::from_millis(50)))
        .unwrap();
    let outcome = timeout(Duration::from_millis(150), scheduler.wait_result(id, None))
        .await
        .expect("timeout should be reported before the worker finishes")
        .unwrap();
    assert!(!outcome.is_success());
    assert_eq!(outcome.failure().unwrap().origin, FailureOrigin::Sync);

    // the worker still finishes, but its late result is discarded
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.get_status(id).unwrap(), TaskState::TimedOut);
    assert!(!scheduler.get_result(id).unwrap().is_success());
    scheduler.stop(ShutdownMode::Wait).await.unwrap();
}
