//! Status query surface: serializable views for dashboards and operators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    AssignmentId, Availability, Priority, TaskId, TaskRecord, TaskStatus, WorkerId, WorkerRecord,
};

/// Task counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub assigned: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
    pub on_hold: usize,
    pub cancelled: usize,
}

impl StatusCounts {
    pub fn record(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Assigned => self.assigned += 1,
            TaskStatus::InProgress => self.in_progress += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Blocked => self.blocked += 1,
            TaskStatus::OnHold => self.on_hold += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending
            + self.assigned
            + self.in_progress
            + self.completed
            + self.failed
            + self.blocked
            + self.on_hold
            + self.cancelled
    }

    pub fn active(&self) -> usize {
        self.assigned + self.in_progress
    }
}

/// Aggregate state of the whole task set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallState {
    /// No tasks submitted.
    Idle,
    /// Work is pending or in flight.
    Running,
    /// Every task completed or was cancelled.
    Drained,
    /// Nothing can move without operator action (failed dependencies, holds).
    Stuck,
}

impl OverallState {
    pub fn from_counts(counts: &StatusCounts) -> Self {
        if counts.total() == 0 {
            OverallState::Idle
        } else if counts.completed + counts.cancelled == counts.total() {
            OverallState::Drained
        } else if counts.pending > 0 || counts.active() > 0 {
            OverallState::Running
        } else {
            OverallState::Stuck
        }
    }
}

/// Narrows a task listing. Unset fields match everything.
///
/// ```ignore
/// let mine = engine.query_tasks(&TaskQuery::all().worker(WorkerId::new("W1")));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskQuery {
    worker: Option<WorkerId>,
    status: Option<TaskStatus>,
    priority: Option<Priority>,
}

impl TaskQuery {
    pub fn all() -> Self {
        Self::default()
    }

    /// Tasks currently assigned to `worker`.
    pub fn worker(mut self, worker: WorkerId) -> Self {
        self.worker = Some(worker);
        self
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn matches(&self, task: &TaskRecord) -> bool {
        self.worker
            .as_ref()
            .is_none_or(|w| task.assigned_worker.as_ref() == Some(w))
            && self.status.is_none_or(|s| task.status == s)
            && self.priority.is_none_or(|p| task.priority == p)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    pub id: TaskId,
    pub title: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub assigned_worker: Option<WorkerId>,
    pub assignment_id: Option<AssignmentId>,
    pub attempt_count: u32,
    pub progress: f32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<&TaskRecord> for TaskView {
    fn from(record: &TaskRecord) -> Self {
        Self {
            id: record.id.clone(),
            title: record.title.clone(),
            status: record.status,
            priority: record.priority,
            assigned_worker: record.assigned_worker.clone(),
            assignment_id: record.assignment_id.clone(),
            attempt_count: record.attempt_count,
            progress: record.progress,
            last_error: record.last_error.clone(),
            updated_at: record.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerView {
    pub id: WorkerId,
    pub current_load: u32,
    pub capacity: u32,
    pub availability: Availability,
    pub last_seen_at: DateTime<Utc>,
}

impl From<&WorkerRecord> for WorkerView {
    fn from(record: &WorkerRecord) -> Self {
        Self {
            id: record.id.clone(),
            current_load: record.current_load,
            capacity: record.capacity,
            availability: record.availability,
            last_seen_at: record.last_seen_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    pub state: OverallState,
    pub counts: StatusCounts,
    pub open_alerts: usize,
    pub tasks: Vec<TaskView>,
    pub workers: Vec<WorkerView>,
}

impl StatusReport {
    pub fn task(&self, id: &TaskId) -> Option<&TaskView> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    pub fn worker(&self, id: &WorkerId) -> Option<&WorkerView> {
        self.workers.iter().find(|w| &w.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn counts(statuses: &[TaskStatus]) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for s in statuses {
            counts.record(*s);
        }
        counts
    }

    #[test]
    fn empty_set_is_idle() {
        assert_eq!(OverallState::from_counts(&counts(&[])), OverallState::Idle);
    }

    #[rstest]
    #[case::all_done(&[TaskStatus::Completed, TaskStatus::Cancelled], OverallState::Drained)]
    #[case::pending(&[TaskStatus::Completed, TaskStatus::Pending], OverallState::Running)]
    #[case::in_flight(&[TaskStatus::InProgress, TaskStatus::Blocked], OverallState::Running)]
    #[case::failed_chain(&[TaskStatus::Failed, TaskStatus::Blocked], OverallState::Stuck)]
    #[case::held(&[TaskStatus::OnHold], OverallState::Stuck)]
    fn overall_state_from_counts(#[case] statuses: &[TaskStatus], #[case] expected: OverallState) {
        assert_eq!(OverallState::from_counts(&counts(statuses)), expected);
    }

    #[test]
    fn counts_serialize_flat() {
        let value = serde_json::to_value(counts(&[TaskStatus::InProgress])).unwrap();
        assert_eq!(value["in_progress"], 1);
        assert_eq!(value["pending"], 0);
    }
}
