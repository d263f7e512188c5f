//! Recurring jobs: a [`Trigger`] plus the request submitted each time it
//! fires.
//!
//! The table only tracks fire times. Submitting the task is left to the
//! coordination loop, which takes due jobs with [`JobTable::take_due`].

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;

use super::task::TaskRequest;
use super::triggers::Trigger;
use super::types::TaskId;

/// A job as registered with [`Scheduler::add_job`](super::Scheduler::add_job).
#[derive(Debug, Clone)]
pub struct JobDefinition {
    pub id: String,
    pub trigger: Trigger,
    pub request: TaskRequest,
    /// Disabled jobs are kept but never fire.
    pub enabled: bool,
}

impl JobDefinition {
    pub fn new(id: impl Into<String>, trigger: Trigger, request: TaskRequest) -> Self {
        Self {
            id: id.into(),
            trigger,
            request,
            enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Snapshot of a registered job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatus {
    pub id: String,
    pub reference: String,
    pub trigger: String,
    pub enabled: bool,
    pub next_fire_at: Option<DateTime<Utc>>,
    pub last_fired_at: Option<DateTime<Utc>>,
    /// Task submitted by the most recent fire.
    pub last_task: Option<TaskId>,
    pub fire_count: u64,
}

/// A job whose fire time has come.
#[derive(Debug)]
pub(crate) struct DueJob {
    pub id: String,
    pub scheduled_for: DateTime<Utc>,
    pub request: TaskRequest,
}

#[derive(Debug)]
struct JobEntry {
    definition: JobDefinition,
    next_fire_at: Option<DateTime<Utc>>,
    last_fired_at: Option<DateTime<Utc>>,
    last_task: Option<TaskId>,
    fire_count: u64,
}

impl JobEntry {
    fn status(&self) -> JobStatus {
        JobStatus {
            id: self.definition.id.clone(),
            reference: self.definition.request.reference.clone(),
            trigger: self.definition.trigger.to_string(),
            enabled: self.definition.enabled,
            next_fire_at: self.next_fire_at,
            last_fired_at: self.last_fired_at,
            last_task: self.last_task,
            fire_count: self.fire_count,
        }
    }

    /// Still waiting on the task from its last fire.
    fn in_flight(&self, is_active: &impl Fn(TaskId) -> bool) -> bool {
        self.last_task.is_some_and(is_active)
    }

    fn first_fire(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.definition.enabled {
            self.definition.trigger.next_fire_time(None, now)
        } else {
            None
        }
    }
}

/// Registered jobs keyed by id.
#[derive(Debug, Default)]
pub(crate) struct JobTable {
    entries: Mutex<BTreeMap<String, JobEntry>>,
    /// Woken whenever a job is added, changed or removed.
    changed: Notify,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a job, or replace the definition of an existing one. Returns
    /// whether the job already existed and its next fire time.
    ///
    /// Replacing keeps the fire history, so a job whose last task is
    /// still running is not fired again until that task finishes.
    pub fn upsert(
        &self,
        definition: JobDefinition,
        now: DateTime<Utc>,
    ) -> (bool, Option<DateTime<Utc>>) {
        let mut entries = self.lock();
        let (existed, entry) = match entries.entry(definition.id.clone()) {
            Entry::Occupied(occupied) => {
                let entry = occupied.into_mut();
                entry.definition = definition;
                (true, entry)
            }
            Entry::Vacant(vacant) => {
                let entry = vacant.insert(JobEntry {
                    definition,
                    next_fire_at: None,
                    last_fired_at: None,
                    last_task: None,
                    fire_count: 0,
                });
                (false, entry)
            }
        };
        entry.next_fire_at = entry.first_fire(now);
        let next = entry.next_fire_at;
        drop(entries);

        self.changed.notify_one();
        (existed, next)
    }

    pub fn remove(&self, id: &str) -> Option<JobStatus> {
        let removed = self.lock().remove(id).map(|entry| entry.status());
        if removed.is_some() {
            self.changed.notify_one();
        }
        removed
    }

    /// Enable or disable a job. Enabling schedules it from `now`.
    pub fn set_enabled(&self, id: &str, enabled: bool, now: DateTime<Utc>) -> Option<JobStatus> {
        let mut entries = self.lock();
        let entry = entries.get_mut(id)?;
        if entry.definition.enabled != enabled {
            entry.definition.enabled = enabled;
            entry.next_fire_at = entry.first_fire(now);
        }
        let status = entry.status();
        drop(entries);

        self.changed.notify_one();
        Some(status)
    }

    pub fn status(&self, id: &str) -> Option<JobStatus> {
        self.lock().get(id).map(JobEntry::status)
    }

    pub fn list(&self) -> Vec<JobStatus> {
        self.lock().values().map(JobEntry::status).collect()
    }

    /// Take every enabled job due at `now` and advance its next fire
    /// time. Jobs whose previous task is still active are skipped and
    /// stay due.
    pub fn take_due(&self, now: DateTime<Utc>, is_active: impl Fn(TaskId) -> bool) -> Vec<DueJob> {
        let mut entries = self.lock();
        let mut due = Vec::new();
        for entry in entries.values_mut() {
            let Some(scheduled_for) = entry.next_fire_at else {
                continue;
            };
            if !entry.definition.enabled || scheduled_for > now || entry.in_flight(&is_active) {
                continue;
            }
            let trigger = &entry.definition.trigger;
            entry.next_fire_at = trigger.next_fire_time(Some(scheduled_for), now);
            entry.last_fired_at = Some(now);
            entry.fire_count += 1;
            due.push(DueJob {
                id: entry.definition.id.clone(),
                scheduled_for,
                request: entry.definition.request.clone(),
            });
        }
        due
    }

    /// Remember the task submitted for a fire. Ignored when the job was
    /// removed in the meantime.
    pub fn record_fire(&self, id: &str, task_id: TaskId) {
        if let Some(entry) = self.lock().get_mut(id) {
            entry.last_task = Some(task_id);
        }
    }

    /// Earliest fire time among jobs that can fire. Jobs still waiting on
    /// their previous task are left out; they become eligible again when
    /// that task finishes.
    pub fn next_wake(&self, is_active: impl Fn(TaskId) -> bool) -> Option<DateTime<Utc>> {
        self.lock()
            .values()
            .filter(|entry| entry.definition.enabled && !entry.in_flight(&is_active))
            .filter_map(|entry| entry.next_fire_at)
            .min()
    }

    /// Resolves after the next change to the table.
    pub async fn changed(&self) {
        self.changed.notified().await;
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, JobEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
