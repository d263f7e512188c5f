//! Tasks shipped with the scheduler, registered under the `builtin` module.
//!
//! | Reference         | Kind  | Behaviour                                      |
//! |-------------------|-------|------------------------------------------------|
//! | `builtin:echo`    | sync  | returns its arguments as `{args, kwargs}`       |
//! | `builtin:sleep`   | async | sleeps `ms` (kwarg or first arg, default 100)   |
//! | `builtin:block`   | sync  | blocks a worker for `ms` milliseconds           |
//! | `builtin:fail`    | sync  | fails with `message` (default "requested")      |

use std::time::Duration;

use serde_json::json;

use super::resolver::{ResolutionError, TaskRegistry};
use super::task::{TaskArgs, TaskError, TaskResult};

const DEFAULT_SLEEP_MS: u64 = 100;

/// Add every builtin task to `registry`.
pub fn register_builtins(registry: &mut TaskRegistry) -> Result<(), ResolutionError> {
    registry.register_sync("builtin:echo", echo)?;
    registry.register_async("builtin:sleep", sleep)?;
    registry.register_sync("builtin:block", block)?;
    registry.register_sync("builtin:fail", fail)?;
    Ok(())
}

impl TaskRegistry {
    /// A registry holding only the builtin tasks.
    pub fn with_builtins() -> Result<Self, ResolutionError> {
        let mut registry = Self::new();
        register_builtins(&mut registry)?;
        Ok(registry)
    }
}

fn duration_ms(args: &TaskArgs) -> Result<u64, TaskError> {
    match args.kwarg::<u64>("ms")? {
        Some(ms) => Ok(ms),
        None if !args.args.is_empty() => args.arg(0),
        None => Ok(DEFAULT_SLEEP_MS),
    }
}

fn echo(args: TaskArgs) -> TaskResult {
    Ok(json!({ "args": args.args, "kwargs": args.kwargs }))
}

async fn sleep(args: TaskArgs) -> TaskResult {
    let ms = duration_ms(&args)?;
    tokio::time::sleep(Duration::from_millis(ms)).await;
    Ok(json!(ms))
}

fn block(args: TaskArgs) -> TaskResult {
    let ms = duration_ms(&args)?;
    std::thread::sleep(Duration::from_millis(ms));
    Ok(json!(ms))
}

fn fail(args: TaskArgs) -> TaskResult {
    let message = args.kwarg_or("message", "requested".to_string())?;
    Err(TaskError::failed(message))
}
