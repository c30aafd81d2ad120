//! RecoveryManager: applies retry/give-up decisions to a task whose assignment ended
//! badly.
//!
//! By the time a task reaches here its assignment has already been closed in the ledger
//! and the worker slot released; recovery only moves the task record. Keeping release
//! out of this module means a second failure signal for the same assignment never gets
//! this far.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::domain::{Decider, Decision, FailureCause, TaskRecord, WorkerId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Back to pending; `attempt` is the updated retry count.
    Requeued { attempt: u32 },
    /// Terminally failed.
    Terminal { attempts: u32, reason: String },
}

pub struct RecoveryManager {
    decider: Arc<dyn Decider>,
}

impl RecoveryManager {
    pub fn new(decider: Arc<dyn Decider>) -> Self {
        Self { decider }
    }

    pub fn recover(
        &self,
        task: &mut TaskRecord,
        cause: &FailureCause,
        now: DateTime<Utc>,
    ) -> RecoveryOutcome {
        match self.decider.decide(task, cause) {
            Decision::Retry { reason } => {
                task.requeue(&reason, true, now);
                info!(
                    task_id = %task.id,
                    attempt = task.attempt_count,
                    %cause,
                    "task requeued"
                );
                RecoveryOutcome::Requeued {
                    attempt: task.attempt_count,
                }
            }
            Decision::GiveUp { reason } => {
                task.mark_failed(&reason, now);
                warn!(
                    task_id = %task.id,
                    attempts = task.attempt_count,
                    %reason,
                    "task failed terminally"
                );
                RecoveryOutcome::Terminal {
                    attempts: task.attempt_count,
                    reason,
                }
            }
        }
    }

    /// Requeue a task whose worker disappeared. The retry budget is untouched.
    pub fn requeue_lost(&self, task: &mut TaskRecord, worker: &WorkerId, now: DateTime<Utc>) {
        task.requeue(&format!("worker {worker} deregistered"), false, now);
        info!(task_id = %task.id, worker_id = %worker, "task requeued after worker loss");
    }
}
