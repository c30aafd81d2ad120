//! Domain identifiers (strongly-typed IDs).
//!
//! Task and worker ids come from outside (task files, rosters) and are kept verbatim.
//! Assignment and alert ids are minted by the coordinator as prefixed ULIDs, so they sort
//! by creation time.
//!
//! `Id<T>` carries a zero-sized marker so a `TaskId` cannot be passed where a `WorkerId`
//! is expected. The marker never reaches the wire: ids serialize as plain strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// Marker trait for each id kind.
pub trait IdMarker: Send + Sync + 'static {
    /// Prefix used for generated ids ("task-", "asg-", ...).
    fn prefix() -> &'static str;
}

/// Generic string-backed id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    value: String,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            _marker: PhantomData,
        }
    }

    /// Mint a fresh id from a ULID, e.g. `asg-01J9...`.
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self::new(format!("{}{}", T::prefix(), ulid))
    }

    pub fn generate() -> Self {
        Self::from_ulid(Ulid::new())
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// Empty or whitespace-only ids are rejected at the input boundary.
    pub fn is_blank(&self) -> bool {
        self.value.trim().is_empty()
    }
}

impl<T: IdMarker> From<&str> for Id<T> {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl<T: IdMarker> From<String> for Id<T> {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl<T: IdMarker> AsRef<str> for Id<T> {
    fn as_ref(&self) -> &str {
        &self.value
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Worker {}

impl IdMarker for Worker {
    fn prefix() -> &'static str {
        "worker-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Assignment {}

impl IdMarker for Assignment {
    fn prefix() -> &'static str {
        "asg-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Alert {}

impl IdMarker for Alert {
    fn prefix() -> &'static str {
        "alert-"
    }
}

/// Identifier of a task (stable across retries and reassignment).
pub type TaskId = Id<Task>;

/// Identifier of a worker on the roster.
pub type WorkerId = Id<Worker>;

/// Identifier of one task-to-worker binding. A retry gets a new one.
pub type AssignmentId = Id<Assignment>;

/// Identifier of an escalation notice.
pub type AlertId = Id<Alert>;
