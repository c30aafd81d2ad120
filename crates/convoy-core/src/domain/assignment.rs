//! Assignment: one task bound to one worker at a point in time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{AssignmentId, TaskId, WorkerId};

/// Ephemeral binding. Identity is the `id`, not the task: a retried task gets a fresh
/// assignment, so late reports against the old one can be told apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: AssignmentId,
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub assigned_at: DateTime<Utc>,
}
