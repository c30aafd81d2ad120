//! Decision model: what to do with a task whose assignment went wrong.
//!
//! The Decider is a pure function of the task record and the failure cause. Applying
//! the decision (releasing the worker, requeueing, raising alerts) is the
//! RecoveryManager's job.

use std::fmt;
use std::time::Duration;

use super::task::TaskRecord;

/// Why an assignment ended without completing.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureCause {
    /// The worker reported a failure.
    Reported { error: String },
    /// No heartbeat for longer than the stall timeout.
    Stalled { silent_for: Duration },
    /// Never started within the assignment timeout.
    AssignmentTimeout { waited: Duration },
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::Reported { error } => write!(f, "reported failure: {error}"),
            FailureCause::Stalled { silent_for } => {
                write!(f, "stalled: no heartbeat for {}s", silent_for.as_secs())
            }
            FailureCause::AssignmentTimeout { waited } => {
                write!(f, "assignment timeout: not started after {}s", waited.as_secs())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Put the task back in the ready pool.
    Retry { reason: String },
    /// Give up; the task becomes terminally failed.
    GiveUp { reason: String },
}

/// Decides the next action for a failed or stalled task.
pub trait Decider: Send + Sync {
    fn decide(&self, task: &TaskRecord, cause: &FailureCause) -> Decision;
}

/// Retry while `attempt_count < max_retries`, then give up.
#[derive(Debug, Clone)]
pub struct DefaultDecider {
    max_retries: u32,
}

impl DefaultDecider {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, task: &TaskRecord, cause: &FailureCause) -> Decision {
        if task.attempt_count < self.max_retries {
            Decision::Retry {
                reason: format!(
                    "retry {}/{} after {cause}",
                    task.attempt_count + 1,
                    self.max_retries
                ),
            }
        } else {
            Decision::GiveUp {
                reason: format!("retry budget of {} exhausted; last {cause}", self.max_retries),
            }
        }
    }
}
