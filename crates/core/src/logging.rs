//! Tracing setup shared by the binaries.

use tracing_subscriber::EnvFilter;

use crate::config::LogFormat;
use crate::error::CoreError;

/// Install the global `tracing` subscriber.
///
/// The filter comes from `RUST_LOG`, falling back to `default_filter`
/// (usually `"info"`).
pub fn init_tracing(format: LogFormat, default_filter: &str) -> Result<(), CoreError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    result.map_err(|e| CoreError::Logging(e.to_string()))
}
