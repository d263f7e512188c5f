use std::env;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

/// Key lookup used by the profiled readers. `env::var` in production,
/// a plain map in tests.
type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled key: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_opt(lookup: Lookup<'_>, profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = lookup(&prefixed).filter(|s| !s.is_empty()) {
            return Some(v);
        }
    }
    lookup(key).filter(|s| !s.is_empty())
}

fn profiled_parse<T: FromStr>(
    lookup: Lookup<'_>,
    profile: &str,
    key: &str,
) -> Result<Option<T>, CoreError> {
    match profiled_opt(lookup, profile, key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| CoreError::InvalidValue {
                key: key.to_string(),
                value: raw,
            }),
    }
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub scheduler: SchedulerSettings,
    pub log: LogConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `TASKHUB_PROFILE`. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Result<Self, CoreError> {
        let profile = env_opt("TASKHUB_PROFILE").unwrap_or_default();
        Self::from_lookup(&profile, &env_opt)
    }

    /// Build config for a named profile from an arbitrary key source.
    pub fn from_lookup(profile: &str, lookup: Lookup<'_>) -> Result<Self, CoreError> {
        let p = profile.to_uppercase();
        Ok(Self {
            scheduler: SchedulerSettings::from_lookup(lookup, &p)?,
            log: LogConfig::from_lookup(lookup, &p)?,
            profile: p,
        })
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  scheduler:   workers={}, default_timeout_ms={}, queue_capacity={}",
            self.scheduler.worker_pool_size,
            self.scheduler
                .default_timeout_ms
                .map(|t| t.to_string())
                .unwrap_or_else(|| "(none)".into()),
            self.scheduler
                .queue_capacity
                .map(|c| c.to_string())
                .unwrap_or_else(|| "(unbounded)".into()),
        );
        tracing::info!("  log:         format={:?}", self.log.format);
    }
}

// ── Scheduler ─────────────────────────────────────────────────

/// Raw scheduler settings as read from the environment. The scheduler
/// crate validates and converts these into its own config type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// 0 = available parallelism.
    pub worker_pool_size: usize,
    pub default_timeout_ms: Option<u64>,
    pub queue_capacity: Option<usize>,
    pub event_capacity: Option<usize>,
}

impl SchedulerSettings {
    fn from_lookup(lookup: Lookup<'_>, p: &str) -> Result<Self, CoreError> {
        Ok(Self {
            worker_pool_size: profiled_parse(lookup, p, "SCHEDULER_WORKER_POOL_SIZE")?
                .unwrap_or(0),
            default_timeout_ms: profiled_parse(lookup, p, "SCHEDULER_DEFAULT_TIMEOUT_MS")?,
            queue_capacity: profiled_parse(lookup, p, "SCHEDULER_QUEUE_CAPACITY")?,
            event_capacity: profiled_parse(lookup, p, "SCHEDULER_EVENT_CAPACITY")?,
        })
    }
}

// ── Logging ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(CoreError::InvalidValue {
                key: "LOG_FORMAT".into(),
                value: other.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    pub format: LogFormat,
}

impl LogConfig {
    fn from_lookup(lookup: Lookup<'_>, p: &str) -> Result<Self, CoreError> {
        let format = match profiled_opt(lookup, p, "LOG_FORMAT") {
            Some(raw) => raw.parse()?,
            None => LogFormat::default(),
        };
        Ok(Self { format })
    }
}
