//! Fire-time calculation for recurring jobs.
//!
//! A [`Trigger`] answers one question: given the previous scheduled fire
//! time (if any) and the current time, when should the job fire next?
//! `None` means never again.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use cron::Schedule;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TriggerError {
    #[error("Interval must be at least 1ms, got {0:?}")]
    IntervalTooShort(Duration),

    #[error("Interval {0:?} is out of range")]
    IntervalOutOfRange(Duration),

    #[error("Interval window ends before it starts")]
    EmptyWindow,

    #[error("Invalid cron expression '{expression}': {message}")]
    InvalidCron { expression: String, message: String },

    #[error("A combined trigger needs at least one trigger")]
    NoTriggers,
}

/// Fires exactly once, at `run_at`. A time already in the past when the
/// job is added never fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateTrigger {
    run_at: DateTime<Utc>,
}

impl DateTrigger {
    pub fn new(run_at: DateTime<Utc>) -> Self {
        Self { run_at }
    }

    pub fn run_at(&self) -> DateTime<Utc> {
        self.run_at
    }

    fn next_fire_time(
        &self,
        previous: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if previous.is_some() || self.run_at <= now {
            return None;
        }
        Some(self.run_at)
    }
}

/// Fires every `every`, optionally inside a `[start_at, end_at]` window.
///
/// Missed slots are skipped: after downtime the next fire lands on the
/// first slot after `now` counted from the previous fire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalTrigger {
    every: Duration,
    step: TimeDelta,
    start_at: Option<DateTime<Utc>>,
    end_at: Option<DateTime<Utc>>,
}

impl IntervalTrigger {
    pub fn new(every: Duration) -> Result<Self, TriggerError> {
        if every < Duration::from_millis(1) {
            return Err(TriggerError::IntervalTooShort(every));
        }
        let step = TimeDelta::from_std(every)
            .map_err(|_| TriggerError::IntervalOutOfRange(every))?;
        Ok(Self {
            every,
            step,
            start_at: None,
            end_at: None,
        })
    }

    /// Do not fire before `start_at`. The first fire is at `start_at`
    /// when it is still in the future.
    pub fn starting_at(mut self, start_at: DateTime<Utc>) -> Result<Self, TriggerError> {
        if matches!(self.end_at, Some(end) if end < start_at) {
            return Err(TriggerError::EmptyWindow);
        }
        self.start_at = Some(start_at);
        Ok(self)
    }

    /// Never fire after `end_at`.
    pub fn ending_at(mut self, end_at: DateTime<Utc>) -> Result<Self, TriggerError> {
        if matches!(self.start_at, Some(start) if end_at < start) {
            return Err(TriggerError::EmptyWindow);
        }
        self.end_at = Some(end_at);
        Ok(self)
    }

    pub fn every(&self) -> Duration {
        self.every
    }

    fn next_fire_time(
        &self,
        previous: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if matches!(self.end_at, Some(end) if now >= end) {
            return None;
        }

        let next = match previous {
            None => match self.start_at {
                Some(start) if start > now => start,
                _ => now.checked_add_signed(self.step)?,
            },
            Some(previous) => {
                let next = previous.checked_add_signed(self.step)?;
                if next < now {
                    self.catch_up(previous, now)?
                } else {
                    next
                }
            }
        };

        match self.end_at {
            Some(end) if next > end => None,
            _ => Some(next),
        }
    }

    /// First slot strictly after `now`, counted in whole steps from `previous`.
    fn catch_up(&self, previous: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let elapsed = (now - previous).to_std().ok()?;
        let missed = elapsed.as_nanos() / self.every.as_nanos();
        let steps = u32::try_from(missed + 1).ok()?;
        let offset = TimeDelta::from_std(self.every.checked_mul(steps)?).ok()?;
        previous.checked_add_signed(offset)
    }
}

/// Fires on a cron schedule.
///
/// Accepts the usual 5-field form (`min hour dom month dow`) as well as the
/// 6-field form with a leading seconds column.
#[derive(Debug, Clone)]
pub struct CronTrigger {
    expression: String,
    schedule: Schedule,
}

impl CronTrigger {
    pub fn parse(expression: &str) -> Result<Self, TriggerError> {
        Schedule::from_str(&normalize_cron(expression))
            .map(|schedule| Self {
                expression: expression.trim().to_string(),
                schedule,
            })
            .map_err(|e| TriggerError::InvalidCron {
                expression: expression.to_string(),
                message: e.to_string(),
            })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    fn next_fire_time(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&now).next()
    }
}

impl PartialEq for CronTrigger {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

/// Prepend a zero seconds column to a 5-field expression.
fn normalize_cron(expression: &str) -> String {
    let trimmed = expression.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    }
}

/// When a recurring job fires.
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    Date(DateTrigger),
    Interval(IntervalTrigger),
    Cron(CronTrigger),
    /// Fires whenever any of the inner triggers would.
    Any(Vec<Trigger>),
}

impl Trigger {
    pub fn at(run_at: DateTime<Utc>) -> Self {
        Trigger::Date(DateTrigger::new(run_at))
    }

    pub fn every(every: Duration) -> Result<Self, TriggerError> {
        IntervalTrigger::new(every).map(Trigger::Interval)
    }

    pub fn cron(expression: &str) -> Result<Self, TriggerError> {
        CronTrigger::parse(expression).map(Trigger::Cron)
    }

    pub fn any(triggers: Vec<Trigger>) -> Result<Self, TriggerError> {
        if triggers.is_empty() {
            return Err(TriggerError::NoTriggers);
        }
        Ok(Trigger::Any(triggers))
    }

    /// Next fire time after `now`, given the previous scheduled fire time.
    pub fn next_fire_time(
        &self,
        previous: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Date(t) => t.next_fire_time(previous, now),
            Trigger::Interval(t) => t.next_fire_time(previous, now),
            Trigger::Cron(t) => t.next_fire_time(now),
            // Each child is asked as if it had never fired, so a one-shot
            // child keeps contributing until its time passes.
            Trigger::Any(triggers) => triggers
                .iter()
                .filter_map(|t| t.next_fire_time(None, now))
                .min(),
        }
    }
}

impl From<DateTrigger> for Trigger {
    fn from(t: DateTrigger) -> Self {
        Trigger::Date(t)
    }
}

impl From<IntervalTrigger> for Trigger {
    fn from(t: IntervalTrigger) -> Self {
        Trigger::Interval(t)
    }
}

impl From<CronTrigger> for Trigger {
    fn from(t: CronTrigger) -> Self {
        Trigger::Cron(t)
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Date(t) => write!(f, "date[{}]", t.run_at.to_rfc3339()),
            Trigger::Interval(t) => write!(f, "interval[{:?}]", t.every),
            Trigger::Cron(t) => write!(f, "cron[{}]", t.expression),
            Trigger::Any(triggers) => {
                write!(f, "any[")?;
                for (i, t) in triggers.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", t)?;
                }
                write!(f, "]")
            }
        }
    }
}
