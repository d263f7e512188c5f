pub mod config;
pub mod error;
pub mod logging;

pub use config::{Config, LogConfig, LogFormat, SchedulerSettings};
pub use error::CoreError;
