//! Escalation notices for humans or external systems.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::event::EscalationReason;
use super::ids::{AlertId, TaskId, WorkerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: AlertId,
    pub task_id: TaskId,
    pub worker_id: Option<WorkerId>,
    pub reason: EscalationReason,
    pub severity: Severity,
    pub message: String,
    pub raised_at: DateTime<Utc>,
    #[serde(default)]
    pub acknowledged: bool,
}

impl Alert {
    pub fn new(
        id: AlertId,
        task_id: TaskId,
        worker_id: Option<WorkerId>,
        reason: EscalationReason,
        message: impl Into<String>,
        raised_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            task_id,
            worker_id,
            severity: reason.severity(),
            reason,
            message: message.into(),
            raised_at,
            acknowledged: false,
        }
    }
}
