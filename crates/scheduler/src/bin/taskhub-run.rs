//! taskhub-run: submit tasks to a local scheduler and print their records.
//!
//! Each positional argument is a task: `reference` or `reference=<json>`,
//! where the JSON is an array of positional arguments, an object of named
//! arguments, or a single scalar argument:
//!
//! ```text
//! taskhub-run builtin:echo='[1,"two"]' builtin:sleep='{"ms":250}' builtin:fail
//! ```
//!
//! Only the builtin tasks are registered. Every record is printed as one
//! JSON line once its task is terminal.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use serde_json::Value;
use tracing::{info, warn};

use taskhub_core::config::load_dotenv;
use taskhub_core::logging::init_tracing;
use taskhub_core::Config;
use taskhub_scheduler::{
    Scheduler, SchedulerConfig, SchedulerError, ShutdownMode, TaskId, TaskRegistry, TaskRequest,
    TaskState,
};

// ── CLI ─────────────────────────────────────────────────────────────

/// Run tasks on a local scheduler and print each task record as JSON.
#[derive(Parser, Debug)]
#[command(name = "taskhub-run", version, about)]
struct Cli {
    /// Tasks to run: `reference` or `reference=<json args>`.
    #[arg(required_unless_present = "list")]
    tasks: Vec<String>,

    /// Scheduler TOML config file. Environment settings are used when absent.
    #[arg(long, env = "TASKHUB_CONFIG")]
    config: Option<PathBuf>,

    /// Number of blocking worker threads (0 = available parallelism).
    #[arg(long)]
    workers: Option<usize>,

    /// Timeout applied to every task, in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// How long to wait for all tasks before cancelling the rest, in seconds.
    #[arg(long, env = "TASKHUB_WAIT_SECS", default_value_t = 60)]
    wait_secs: u64,

    /// List the registered task references and exit.
    #[arg(long)]
    list: bool,
}

/// Split `reference=<json>` into a request.
fn parse_task(raw_task: &str) -> anyhow::Result<TaskRequest> {
    let Some((reference, raw)) = raw_task.split_once('=') else {
        return Ok(TaskRequest::new(raw_task));
    };
    let value: Value = serde_json::from_str(raw)
        .with_context(|| format!("arguments for '{}' are not valid JSON", reference))?;
    let request = TaskRequest::new(reference);
    Ok(match value {
        Value::Array(args) => request.args(args),
        Value::Object(kwargs) => request.kwargs(kwargs),
        scalar => request.arg(scalar),
    })
}

fn scheduler_config(cli: &Cli, env: &Config) -> anyhow::Result<SchedulerConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let config = SchedulerConfig::from_file(path)?;
            info!(path = %path.display(), "Loaded scheduler config");
            config
        }
        None => SchedulerConfig::from(&env.scheduler),
    };
    if let Some(workers) = cli.workers {
        config = config.with_worker_pool_size(workers);
    }
    config.validate()?;
    Ok(config)
}

/// Deadline for waiting on every task. `None` when `wait_secs` is too far
/// out to represent, which means wait without a deadline.
fn wait_deadline(wait_secs: u64) -> Option<tokio::time::Instant> {
    tokio::time::Instant::now().checked_add(Duration::from_secs(wait_secs))
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    let env = Config::from_env()?;
    init_tracing(env.log.format, "info")?;

    let cli = Cli::parse();
    env.log_summary();

    let registry = TaskRegistry::with_builtins()?;
    if cli.list {
        for reference in registry.references() {
            println!("{}", reference);
        }
        return Ok(());
    }

    let requests = cli
        .tasks
        .iter()
        .map(|raw_task| parse_task(raw_task))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let config = scheduler_config(&cli, &env)?;
    let scheduler = Scheduler::new(config, registry)?;
    scheduler.start()?;

    let timeout = cli.timeout_ms.map(Duration::from_millis);
    let mut submitted: Vec<TaskId> = Vec::with_capacity(requests.len());
    for mut request in requests {
        if request.timeout.is_none() {
            request.timeout = timeout;
        }
        match scheduler.submit(request) {
            Ok(id) => submitted.push(id),
            // Recorded as failed; print it with the others.
            Err(SchedulerError::Resolution { task_id, source }) => {
                warn!(task_id = %task_id, error = %source, "Task did not resolve");
                submitted.push(task_id);
            }
            Err(e) => return Err(e.into()),
        }
    }
    info!(tasks = submitted.len(), "Submitted tasks");

    let deadline = wait_deadline(cli.wait_secs);
    let mut unsuccessful = 0;
    for id in &submitted {
        let remaining = deadline.map(|d| d.saturating_duration_since(tokio::time::Instant::now()));
        let waited = tokio::select! {
            result = scheduler.wait_result(*id, remaining) => result,
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, cancelling remaining tasks");
                break;
            }
        };
        match waited {
            Ok(_) => {}
            Err(SchedulerError::WaitTimeout { .. }) => {
                warn!(task_id = %id, "Gave up waiting for task");
            }
            Err(e) => return Err(e.into()),
        }
    }

    scheduler.stop(ShutdownMode::Cancel).await?;

    for id in &submitted {
        let record = scheduler.record(*id)?;
        if record.state != TaskState::Succeeded {
            unsuccessful += 1;
        }
        println!("{}", serde_json::to_string(&record)?);
    }

    if unsuccessful > 0 {
        bail!("{} of {} tasks did not succeed", unsuccessful, submitted.len());
    }
    info!("taskhub-run finished");
    Ok(())
}
