//! Lifecycle events.
//!
//! The scheduler publishes one event per lifecycle step on a
//! [`tokio::sync::broadcast`] channel. Publishing never blocks; events sent
//! while nobody is subscribed are dropped, and slow receivers observe
//! `RecvError::Lagged`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use super::types::{Outcome, TaskId, TaskState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Startup,
    Shutdown,
    TaskSubmitted,
    TaskStarted,
    TaskSucceeded,
    TaskFailed,
    TaskTimedOut,
    TaskCancelled,
    JobAdded,
    JobUpdated,
    JobRemoved,
    JobFired,
    /// A due job could not be submitted, for example because the queue was full.
    JobMissed,
}

impl EventKind {
    /// Event emitted when a task lands in `state`.
    pub fn for_state(state: TaskState) -> Self {
        match state {
            TaskState::Pending => EventKind::TaskSubmitted,
            TaskState::Running => EventKind::TaskStarted,
            TaskState::Succeeded => EventKind::TaskSucceeded,
            TaskState::Failed => EventKind::TaskFailed,
            TaskState::TimedOut => EventKind::TaskTimedOut,
            TaskState::Cancelled => EventKind::TaskCancelled,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerEvent {
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
}

impl SchedulerEvent {
    pub fn scheduler(kind: EventKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            job_id: None,
            task_id: None,
            reference: None,
            outcome: None,
        }
    }

    pub fn job(kind: EventKind, job_id: &str) -> Self {
        Self {
            job_id: Some(job_id.to_string()),
            ..Self::scheduler(kind)
        }
    }

    /// Attach the task a job event refers to.
    pub fn with_task(mut self, task_id: TaskId, reference: &str) -> Self {
        self.task_id = Some(task_id);
        self.reference = Some(reference.to_string());
        self
    }

    pub fn task(kind: EventKind, task_id: TaskId, reference: &str) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            job_id: None,
            task_id: Some(task_id),
            reference: Some(reference.to_string()),
            outcome: None,
        }
    }

    pub fn with_outcome(mut self, outcome: Option<Outcome>) -> Self {
        self.outcome = outcome;
        self
    }
}

/// Cheap-to-clone publisher side of the event channel.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<SchedulerEvent>,
}

impl EventBus {
    /// Capacity is clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: SchedulerEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new(0);
        bus.publish(SchedulerEvent::scheduler(EventKind::Startup));
    }

    #[test]
    fn subscriber_sees_events_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let id = TaskId::new();

        bus.publish(SchedulerEvent::task(EventKind::TaskSubmitted, id, "a:b"));
        bus.publish(SchedulerEvent::task(EventKind::TaskStarted, id, "a:b"));

        let first = rx.try_recv().unwrap();
        assert_eq!(first.kind, EventKind::TaskSubmitted);
        assert_eq!(first.task_id, Some(id));
        assert_eq!(rx.try_recv().unwrap().kind, EventKind::TaskStarted);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn kind_for_state() {
        assert_eq!(EventKind::for_state(TaskState::TimedOut), EventKind::TaskTimedOut);
        assert_eq!(EventKind::for_state(TaskState::Running), EventKind::TaskStarted);
    }

    #[test]
    fn job_event_carries_its_task() {
        let id = TaskId::new();
        let event = SchedulerEvent::job(EventKind::JobFired, "nightly")
            .with_task(id, "a:b");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "job_fired");
        assert_eq!(value["job_id"], "nightly");
        assert_eq!(value["task_id"], id.to_string());
        assert_eq!(value["reference"], "a:b");
    }

    #[test]
    fn event_serializes_compactly() {
        let event = SchedulerEvent::scheduler(EventKind::Shutdown);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "shutdown");
        assert!(value.get("task_id").is_none());
        assert!(value.get("job_id").is_none());
    }
}
