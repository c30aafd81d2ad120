//! Task record: lifecycle state plus the metadata carried from the task definition.
//!
//! Design:
//! - `TaskRecord` is the single source of truth for a task's state.
//! - Scheduler structures (ready heap, ledger) hold ids only.
//! - All state transitions happen through methods here and stamp `updated_at`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{AssignmentId, TaskId, WorkerId};
use super::spec::TaskSpec;
use crate::error::{Error, Result};

/// Ordered priority; `Critical` sorts highest.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match normalize(s).as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(Error::validation(format!("unknown priority: {other}"))),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Task lifecycle state.
///
/// State transitions:
/// - Pending <-> Blocked (dependency completion / new incomplete dependency)
/// - Pending -> Assigned -> InProgress -> Completed
/// - Assigned/InProgress -> Pending (retry, worker lost) or Failed (retries exhausted)
/// - Pending/Blocked <-> OnHold
/// - any non-terminal -> Cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Failed,
    Blocked,
    OnHold,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 8] = [
        TaskStatus::Pending,
        TaskStatus::Assigned,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Blocked,
        TaskStatus::OnHold,
        TaskStatus::Cancelled,
    ];

    /// No further transitions without operator action.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Bound to a worker.
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::InProgress)
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match normalize(s).as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "assigned" => Ok(TaskStatus::Assigned),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "blocked" => Ok(TaskStatus::Blocked),
            "on_hold" => Ok(TaskStatus::OnHold),
            "cancelled" | "canceled" => Ok(TaskStatus::Cancelled),
            other => Err(Error::validation(format!("unknown task status: {other}"))),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Blocked => "blocked",
            TaskStatus::OnHold => "on_hold",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

fn normalize(s: &str) -> String {
    s.trim().to_ascii_lowercase().replace(['-', ' '], "_")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    pub priority: Priority,

    pub dependencies: BTreeSet<TaskId>,
    pub required_capabilities: BTreeSet<String>,

    /// Set only while the task is assigned or in progress.
    pub assigned_worker: Option<WorkerId>,
    pub assignment_id: Option<AssignmentId>,

    /// Retries consumed so far.
    pub attempt_count: u32,

    /// Percentage reported by the worker, 0..=100.
    pub progress: f32,
    pub last_error: Option<String>,

    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub parent_id: Option<TaskId>,
    #[serde(default)]
    pub subtasks: Vec<TaskId>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,

    /// Workers this task stalled on; the scheduler prefers anyone else.
    #[serde(default)]
    pub avoid_workers: BTreeSet<WorkerId>,

    /// Timestamped status-change notes.
    #[serde(default)]
    pub notes: Vec<String>,
}

impl TaskRecord {
    /// Build a pending record from a spec whose id has already been resolved.
    pub fn from_spec(id: TaskId, spec: TaskSpec, now: DateTime<Utc>) -> Self {
        Self {
            id,
            title: spec.title,
            description: spec.description,
            status: TaskStatus::Pending,
            priority: spec.priority,
            dependencies: spec.dependencies.into_iter().collect(),
            required_capabilities: spec.required_capabilities.into_iter().collect(),
            assigned_worker: None,
            assignment_id: None,
            attempt_count: 0,
            progress: 0.0,
            last_error: None,
            last_heartbeat_at: None,
            created_at: now,
            updated_at: now,
            assigned_at: None,
            started_at: None,
            completed_at: None,
            parent_id: spec.parent_id,
            subtasks: Vec::new(),
            tags: spec.tags.into_iter().collect(),
            metadata: spec.metadata,
            avoid_workers: BTreeSet::new(),
            notes: Vec::new(),
        }
    }

    fn transition(&mut self, to: TaskStatus, now: DateTime<Utc>, detail: Option<&str>) {
        if self.status != to {
            let note = match detail {
                Some(detail) => format!("[{}] {} -> {}: {}", now.to_rfc3339(), self.status, to, detail),
                None => format!("[{}] {} -> {}", now.to_rfc3339(), self.status, to),
            };
            self.notes.push(note);
        }
        self.status = to;
        self.updated_at = now;
    }

    fn invalid(&self, to: TaskStatus) -> Error {
        Error::InvalidTransition {
            task: self.id.clone(),
            from: self.status,
            to,
        }
    }

    /// Whether `assignment` is the binding currently held by this task.
    pub fn is_held_by(&self, assignment: &AssignmentId) -> bool {
        self.status.is_active() && self.assignment_id.as_ref() == Some(assignment)
    }

    pub fn mark_blocked(&mut self, now: DateTime<Utc>) {
        self.transition(TaskStatus::Blocked, now, None);
    }

    pub fn mark_pending(&mut self, now: DateTime<Utc>) {
        self.transition(TaskStatus::Pending, now, None);
    }

    pub fn mark_assigned(&mut self, worker: WorkerId, assignment: AssignmentId, now: DateTime<Utc>) {
        let detail = format!("worker {worker}");
        self.transition(TaskStatus::Assigned, now, Some(&detail));
        self.assigned_worker = Some(worker);
        self.assignment_id = Some(assignment);
        self.assigned_at = Some(now);
        self.last_heartbeat_at = None;
        self.progress = 0.0;
    }

    pub fn mark_in_progress(&mut self, now: DateTime<Utc>) {
        if self.status == TaskStatus::Assigned {
            self.transition(TaskStatus::InProgress, now, None);
            if self.started_at.is_none() {
                self.started_at = Some(now);
            }
        }
    }

    /// Monotonic: heartbeats older than the stored one are ignored.
    pub fn record_heartbeat(&mut self, at: DateTime<Utc>) -> bool {
        match self.last_heartbeat_at {
            Some(last) if at <= last => false,
            _ => {
                self.last_heartbeat_at = Some(at);
                true
            }
        }
    }

    pub fn set_progress(&mut self, percent: f32, now: DateTime<Utc>) -> Result<()> {
        if !(0.0..=100.0).contains(&percent) {
            return Err(Error::validation(format!(
                "task {}: progress {percent} outside 0..=100",
                self.id
            )));
        }
        self.progress = percent;
        self.updated_at = now;
        Ok(())
    }

    /// Drop the worker binding, returning it.
    pub fn clear_assignment(&mut self) -> Option<(WorkerId, AssignmentId)> {
        let worker = self.assigned_worker.take();
        let assignment = self.assignment_id.take();
        self.assigned_at = None;
        worker.zip(assignment)
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.clear_assignment();
        self.transition(TaskStatus::Completed, now, None);
        self.progress = 100.0;
        self.completed_at = Some(now);
    }

    /// Back to pending after a failure or stall. `consume_attempt` is false when the
    /// worker vanished rather than the task misbehaving.
    pub fn requeue(&mut self, reason: &str, consume_attempt: bool, now: DateTime<Utc>) {
        self.clear_assignment();
        if consume_attempt {
            self.attempt_count += 1;
            self.last_error = Some(reason.to_string());
        }
        self.transition(TaskStatus::Pending, now, Some(reason));
    }

    pub fn mark_failed(&mut self, reason: &str, now: DateTime<Utc>) {
        self.clear_assignment();
        self.last_error = Some(reason.to_string());
        self.transition(TaskStatus::Failed, now, Some(reason));
    }

    pub fn mark_cancelled(&mut self, reason: &str, now: DateTime<Utc>) -> Result<()> {
        if self.status.is_terminal() && self.status != TaskStatus::Cancelled {
            return Err(self.invalid(TaskStatus::Cancelled));
        }
        self.clear_assignment();
        self.transition(TaskStatus::Cancelled, now, Some(reason));
        Ok(())
    }

    pub fn hold(&mut self, now: DateTime<Utc>) -> Result<()> {
        match self.status {
            TaskStatus::Pending | TaskStatus::Blocked => {
                self.transition(TaskStatus::OnHold, now, None);
                Ok(())
            }
            TaskStatus::OnHold => Ok(()),
            _ => Err(self.invalid(TaskStatus::OnHold)),
        }
    }

    /// Operator retry of a task that exhausted its budget.
    pub fn reset_for_resubmit(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != TaskStatus::Failed {
            return Err(self.invalid(TaskStatus::Pending));
        }
        self.attempt_count = 0;
        self.avoid_workers.clear();
        self.progress = 0.0;
        self.transition(TaskStatus::Pending, now, Some("resubmitted"));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn record() -> TaskRecord {
        TaskRecord::from_spec(TaskId::new("T1"), TaskSpec::new("T1", "demo"), t0())
    }

    #[test]
    fn priority_orders_critical_highest() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
    }

    #[rstest]
    #[case("HIGH", Priority::High)]
    #[case(" critical ", Priority::Critical)]
    #[case("Low", Priority::Low)]
    fn priority_parses_case_insensitively(#[case] raw: &str, #[case] expected: Priority) {
        assert_eq!(raw.parse::<Priority>().unwrap(), expected);
    }

    #[rstest]
    #[case("In_Progress", TaskStatus::InProgress)]
    #[case("in-progress", TaskStatus::InProgress)]
    #[case("ON HOLD", TaskStatus::OnHold)]
    #[case("canceled", TaskStatus::Cancelled)]
    fn status_parses_legacy_spellings(#[case] raw: &str, #[case] expected: TaskStatus) {
        assert_eq!(raw.parse::<TaskStatus>().unwrap(), expected);
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
    }

    #[test]
    fn assignment_lifecycle_sets_and_clears_worker() {
        let mut task = record();
        let asg = AssignmentId::new("asg-1");
        task.mark_assigned(WorkerId::new("w1"), asg.clone(), t0());
        assert!(task.is_held_by(&asg));
        assert_eq!(task.assigned_worker, Some(WorkerId::new("w1")));

        task.mark_in_progress(t0());
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.started_at, Some(t0()));

        task.mark_completed(t0());
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.assigned_worker, None);
        assert!(!task.is_held_by(&asg));
        assert_eq!(task.progress, 100.0);
    }

    #[test]
    fn heartbeats_are_monotonic() {
        let mut task = record();
        let later = t0() + chrono::Duration::seconds(10);
        assert!(task.record_heartbeat(later));
        assert!(!task.record_heartbeat(t0()));
        assert_eq!(task.last_heartbeat_at, Some(later));
    }

    #[rstest]
    #[case(-1.0, false)]
    #[case(0.0, true)]
    #[case(55.5, true)]
    #[case(100.0, true)]
    #[case(100.1, false)]
    #[case(f32::NAN, false)]
    fn progress_must_be_a_percentage(#[case] percent: f32, #[case] ok: bool) {
        let mut task = record();
        assert_eq!(task.set_progress(percent, t0()).is_ok(), ok);
    }

    #[test]
    fn requeue_counts_attempts_only_when_asked() {
        let mut task = record();
        task.mark_assigned(WorkerId::new("w1"), AssignmentId::new("a"), t0());
        task.requeue("boom", true, t0());
        assert_eq!(task.attempt_count, 1);
        assert_eq!(task.last_error.as_deref(), Some("boom"));

        task.mark_assigned(WorkerId::new("w1"), AssignmentId::new("b"), t0());
        task.requeue("worker lost", false, t0());
        assert_eq!(task.attempt_count, 1);
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[test]
    fn cancel_rejected_after_completion_but_idempotent_on_cancelled() {
        let mut task = record();
        task.mark_cancelled("operator", t0()).unwrap();
        assert!(task.mark_cancelled("again", t0()).is_ok());

        let mut done = record();
        done.mark_completed(t0());
        assert!(matches!(
            done.mark_cancelled("late", t0()),
            Err(Error::InvalidTransition { .. })
        ));
    }

    #[test]
    fn status_changes_leave_notes() {
        let mut task = record();
        task.mark_blocked(t0());
        task.mark_pending(t0());
        assert_eq!(task.notes.len(), 2);
        assert!(task.notes[0].contains("pending -> blocked"));
    }

    #[test]
    fn hold_only_from_idle_states() {
        let mut task = record();
        task.hold(t0()).unwrap();
        assert_eq!(task.status, TaskStatus::OnHold);

        let mut active = record();
        active.mark_assigned(WorkerId::new("w"), AssignmentId::new("a"), t0());
        assert!(active.hold(t0()).is_err());
    }
}
