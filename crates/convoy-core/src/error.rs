//! Crate-wide error type.
//!
//! Errors are scoped to a single task/worker pair; nothing here is allowed to take the
//! coordinator down. `Error::kind` tells callers which failures are recovered locally
//! (stalls, capacity races) and which must be surfaced to an operator.

use thiserror::Error;

use crate::domain::{TaskId, TaskStatus, WorkerId};

/// Operational classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retried or absorbed by the coordinator.
    Transient,
    /// Needs a change of input or operator action.
    Permanent,
    /// IO / encoding / runtime plumbing.
    Infrastructure,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("dependency cycle: {}", format_path(.path))]
    Cycle { path: Vec<TaskId> },

    #[error("unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("unknown worker: {0}")]
    UnknownWorker(WorkerId),

    #[error("worker {worker} is at capacity ({capacity})")]
    Capacity { worker: WorkerId, capacity: u32 },

    #[error("task {task} stalled on worker {worker}: {detail}")]
    Stall {
        task: TaskId,
        worker: WorkerId,
        detail: String,
    },

    #[error("task {task} failed permanently after {attempts} attempt(s): {reason}")]
    TerminalFailure {
        task: TaskId,
        attempts: u32,
        reason: String,
    },

    #[error("task {task} cannot move from {from} to {to}")]
    InvalidTransition {
        task: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("coordinator is not running")]
    CoordinatorClosed,

    /// An outbound channel or external consumer is gone.
    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Stall { .. } | Error::Capacity { .. } => ErrorKind::Transient,
            Error::Validation(_)
            | Error::Cycle { .. }
            | Error::UnknownTask(_)
            | Error::UnknownWorker(_)
            | Error::TerminalFailure { .. }
            | Error::InvalidTransition { .. } => ErrorKind::Permanent,
            Error::CoordinatorClosed
            | Error::Unavailable(_)
            | Error::Io(_)
            | Error::Json(_)
            | Error::Toml(_) => ErrorKind::Infrastructure,
        }
    }
}

fn format_path(path: &[TaskId]) -> String {
    path.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_error_renders_path() {
        let err = Error::Cycle {
            path: vec![TaskId::new("a"), TaskId::new("b"), TaskId::new("a")],
        };
        assert_eq!(err.to_string(), "dependency cycle: a -> b -> a");
        assert_eq!(err.kind(), ErrorKind::Permanent);
    }

    #[test]
    fn stalls_are_transient() {
        let err = Error::Stall {
            task: TaskId::new("t"),
            worker: WorkerId::new("w"),
            detail: "no heartbeat for 301s".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Transient);
    }
}
