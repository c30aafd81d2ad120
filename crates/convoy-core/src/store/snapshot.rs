//! Serializable image of the task and worker sets.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{TaskRecord, WorkerRecord};
use crate::error::{Error, Result};

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub taken_at: DateTime<Utc>,
    pub tasks: Vec<TaskRecord>,
    pub workers: Vec<WorkerRecord>,
}

impl Snapshot {
    pub fn new(taken_at: DateTime<Utc>, tasks: Vec<TaskRecord>, workers: Vec<WorkerRecord>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            taken_at,
            tasks,
            workers,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let snapshot: Snapshot = serde_json::from_str(raw)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(Error::validation(format!(
                "unsupported snapshot version {} (expected {SNAPSHOT_VERSION})",
                snapshot.version
            )));
        }
        Ok(snapshot)
    }
}
