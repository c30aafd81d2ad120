//! Typed messages carried by the router.
//!
//! Every event names the task it concerns; ordering is only guaranteed among events for
//! the same task. `seq` is stamped by the router on publish and lets consumers detect
//! duplicates and gaps.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::alert::Severity;
use super::ids::{AssignmentId, TaskId, WorkerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Assign,
    Heartbeat,
    Progress,
    Completed,
    Failed,
    Escalate,
    Cancel,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::Assign => "assign",
            EventKind::Heartbeat => "heartbeat",
            EventKind::Progress => "progress",
            EventKind::Completed => "completed",
            EventKind::Failed => "failed",
            EventKind::Escalate => "escalate",
            EventKind::Cancel => "cancel",
        };
        f.write_str(s)
    }
}

/// Who put the event on the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Coordinator,
    Monitor,
    Worker,
    Operator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    /// No heartbeat within `stall_timeout`.
    Stalled,
    /// Sat in `assigned` longer than `assignment_timeout`.
    AssignmentTimeout,
    /// Retry budget spent; the task is terminally failed.
    RetriesExhausted,
    /// The worker holding the task was deregistered.
    WorkerLost,
}

impl EscalationReason {
    pub fn severity(self) -> Severity {
        match self {
            EscalationReason::RetriesExhausted => Severity::Critical,
            EscalationReason::Stalled
            | EscalationReason::AssignmentTimeout
            | EscalationReason::WorkerLost => Severity::Warning,
        }
    }
}

impl fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EscalationReason::Stalled => "stalled",
            EscalationReason::AssignmentTimeout => "assignment_timeout",
            EscalationReason::RetriesExhausted => "retries_exhausted",
            EscalationReason::WorkerLost => "worker_lost",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Empty,
    Assignment {
        title: String,
        attempt: u32,
    },
    Progress {
        percent: Option<f32>,
        message: Option<String>,
    },
    Failure {
        error: String,
    },
    Escalation {
        reason: EscalationReason,
        detail: String,
    },
    Cancellation {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Router sequence number; 0 until published.
    #[serde(default)]
    pub seq: u64,
    pub kind: EventKind,
    pub task_id: TaskId,
    pub worker_id: Option<WorkerId>,
    pub assignment_id: Option<AssignmentId>,
    pub payload: EventPayload,
    pub source: EventSource,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    fn new(
        kind: EventKind,
        task_id: TaskId,
        worker_id: Option<WorkerId>,
        assignment_id: Option<AssignmentId>,
        payload: EventPayload,
        source: EventSource,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            seq: 0,
            kind,
            task_id,
            worker_id,
            assignment_id,
            payload,
            source,
            timestamp,
        }
    }

    pub fn assign(
        task_id: TaskId,
        worker_id: WorkerId,
        assignment_id: AssignmentId,
        title: String,
        attempt: u32,
        at: DateTime<Utc>,
    ) -> Self {
        Self::new(
            EventKind::Assign,
            task_id,
            Some(worker_id),
            Some(assignment_id),
            EventPayload::Assignment { title, attempt },
            EventSource::Coordinator,
            at,
        )
    }

    pub fn heartbeat(
        task_id: TaskId,
        worker_id: WorkerId,
        assignment_id: AssignmentId,
        at: DateTime<Utc>,
    ) -> Self {
        Self::new(
            EventKind::Heartbeat,
            task_id,
            Some(worker_id),
            Some(assignment_id),
            EventPayload::Empty,
            EventSource::Worker,
            at,
        )
    }

    pub fn progress(
        task_id: TaskId,
        worker_id: WorkerId,
        assignment_id: AssignmentId,
        percent: Option<f32>,
        message: Option<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self::new(
            EventKind::Progress,
            task_id,
            Some(worker_id),
            Some(assignment_id),
            EventPayload::Progress { percent, message },
            EventSource::Worker,
            at,
        )
    }

    pub fn completed(
        task_id: TaskId,
        worker_id: WorkerId,
        assignment_id: AssignmentId,
        at: DateTime<Utc>,
    ) -> Self {
        Self::new(
            EventKind::Completed,
            task_id,
            Some(worker_id),
            Some(assignment_id),
            EventPayload::Empty,
            EventSource::Worker,
            at,
        )
    }

    pub fn failed(
        task_id: TaskId,
        worker_id: WorkerId,
        assignment_id: AssignmentId,
        error: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self::new(
            EventKind::Failed,
            task_id,
            Some(worker_id),
            Some(assignment_id),
            EventPayload::Failure {
                error: error.into(),
            },
            EventSource::Worker,
            at,
        )
    }

    pub fn escalate(
        task_id: TaskId,
        worker_id: Option<WorkerId>,
        assignment_id: Option<AssignmentId>,
        reason: EscalationReason,
        detail: impl Into<String>,
        source: EventSource,
        at: DateTime<Utc>,
    ) -> Self {
        Self::new(
            EventKind::Escalate,
            task_id,
            worker_id,
            assignment_id,
            EventPayload::Escalation {
                reason,
                detail: detail.into(),
            },
            source,
            at,
        )
    }

    pub fn cancel(
        task_id: TaskId,
        worker_id: Option<WorkerId>,
        assignment_id: Option<AssignmentId>,
        reason: impl Into<String>,
        source: EventSource,
        at: DateTime<Utc>,
    ) -> Self {
        Self::new(
            EventKind::Cancel,
            task_id,
            worker_id,
            assignment_id,
            EventPayload::Cancellation {
                reason: reason.into(),
            },
            source,
            at,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn event_json_shape() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap();
        let event = Event::failed(
            TaskId::new("T2"),
            WorkerId::new("w1"),
            AssignmentId::new("asg-1"),
            "disk full",
            at,
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "failed");
        assert_eq!(value["task_id"], "T2");
        assert_eq!(value["payload"]["type"], "failure");
        assert_eq!(value["payload"]["error"], "disk full");
        assert_eq!(value["source"], "worker");
    }

    #[test]
    fn terminal_failures_are_critical() {
        assert_eq!(EscalationReason::RetriesExhausted.severity(), Severity::Critical);
        assert_eq!(EscalationReason::Stalled.severity(), Severity::Warning);
    }
}
