//! Scheduler runner -- owns the coordination thread and the public control surface.
//!
//! Split into focused submodules:
//! - `core`: Scheduler struct, constructors, start/stop lifecycle and accessors
//! - `execution`: coordination loop, dispatch and per-task supervision
//! - `scheduling`: submission, status/result queries and cancellation

mod core;
mod execution;
mod scheduling;

pub use self::core::{Scheduler, ShutdownMode};
