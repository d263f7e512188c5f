use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::types::TaskState;

/// Scheduler operational metrics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerMetrics {
    /// Tasks accepted by `submit`, including ones that failed to resolve.
    pub tasks_submitted: u64,
    /// Terminal state counts.
    pub tasks_finished: HashMap<TaskState, u64>,
    /// Completed executions by reference.
    pub tasks_executed: HashMap<String, u64>,
    /// Average execution duration by reference.
    pub avg_task_duration: HashMap<String, Duration>,
    /// Last completion time by reference.
    pub last_run: HashMap<String, DateTime<Utc>>,
    /// Tasks admitted but not yet accepted by an executor.
    pub pending: usize,
    /// Tasks currently executing.
    pub running: usize,
    /// Busy sync workers / pool size (0.0 - 1.0).
    pub worker_utilization: f64,
}

impl SchedulerMetrics {
    /// Record a completed execution.
    pub fn record_execution(&mut self, reference: &str, duration: Duration) {
        *self.tasks_executed.entry(reference.to_string()).or_default() += 1;
        self.last_run.insert(reference.to_string(), Utc::now());

        let count = self.tasks_executed[reference];
        let prev_avg = self
            .avg_task_duration
            .get(reference)
            .copied()
            .unwrap_or_default();

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let new_avg = if count == 1 {
            duration
        } else {
            let prev_nanos = prev_avg.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / count as f64;
            Duration::from_nanos(avg_nanos as u64)
        };

        self.avg_task_duration.insert(reference.to_string(), new_avg);
    }

    /// Record a state transition. `from` is the state the task left.
    pub fn record_transition(&mut self, from: TaskState, to: TaskState) {
        match from {
            TaskState::Pending => self.pending = self.pending.saturating_sub(1),
            TaskState::Running => self.running = self.running.saturating_sub(1),
            _ => {}
        }
        if to == TaskState::Running {
            self.running += 1;
        }
        if to.is_terminal() {
            *self.tasks_finished.entry(to).or_default() += 1;
        }
    }

    pub fn finished(&self, state: TaskState) -> u64 {
        self.tasks_finished.get(&state).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_single_execution() {
        let mut m = SchedulerMetrics::default();
        m.record_execution("math:multiply", Duration::from_millis(100));

        assert_eq!(m.tasks_executed["math:multiply"], 1);
        assert!(m.last_run.contains_key("math:multiply"));
        assert_eq!(m.avg_task_duration["math:multiply"], Duration::from_millis(100));
    }

    #[test]
    fn record_multiple_executions_averages() {
        let mut m = SchedulerMetrics::default();
        m.record_execution("task:a", Duration::from_millis(100));
        m.record_execution("task:a", Duration::from_millis(200));

        assert_eq!(m.tasks_executed["task:a"], 2);
        // Average of 100ms and 200ms = 150ms
        let avg = m.avg_task_duration["task:a"].as_millis();
        assert!((140..=160).contains(&avg), "expected ~150ms, got {}ms", avg);
    }

    #[test]
    fn transitions_move_gauges() {
        let mut m = SchedulerMetrics {
            pending: 2,
            ..Default::default()
        };
        m.record_transition(TaskState::Pending, TaskState::Running);
        assert_eq!((m.pending, m.running), (1, 1));

        m.record_transition(TaskState::Running, TaskState::Succeeded);
        m.record_transition(TaskState::Pending, TaskState::Cancelled);
        assert_eq!((m.pending, m.running), (0, 0));
        assert_eq!(m.finished(TaskState::Succeeded), 1);
        assert_eq!(m.finished(TaskState::Cancelled), 1);
        assert_eq!(m.finished(TaskState::Failed), 0);
    }

    #[test]
    fn default_metrics() {
        let m = SchedulerMetrics::default();
        assert_eq!(m.tasks_submitted, 0);
        assert_eq!(m.worker_utilization, 0.0);
        assert!(m.tasks_executed.is_empty());
    }
}
