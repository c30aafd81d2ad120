//! Authoritative map of task records. Holds no policy: readiness lives in the
//! dependency graph and lifecycle rules live on `TaskRecord`.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use crate::app::status::StatusCounts;
use crate::domain::{TaskId, TaskRecord, TaskStatus};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct TaskStore {
    tasks: HashMap<TaskId, TaskRecord>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects a second record with the same id.
    pub fn insert(&mut self, record: TaskRecord) -> Result<()> {
        match self.tasks.entry(record.id.clone()) {
            Entry::Occupied(e) => Err(Error::validation(format!("duplicate task id: {}", e.key()))),
            Entry::Vacant(e) => {
                e.insert(record);
                Ok(())
            }
        }
    }

    pub fn get(&self, id: &TaskId) -> Option<&TaskRecord> {
        self.tasks.get(id)
    }

    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut TaskRecord> {
        self.tasks.get_mut(id)
    }

    pub fn require(&self, id: &TaskId) -> Result<&TaskRecord> {
        self.tasks
            .get(id)
            .ok_or_else(|| Error::UnknownTask(id.clone()))
    }

    pub fn require_mut(&mut self, id: &TaskId) -> Result<&mut TaskRecord> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| Error::UnknownTask(id.clone()))
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn status_of(&self, id: &TaskId) -> Option<TaskStatus> {
        self.tasks.get(id).map(|t| t.status)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskRecord> {
        self.tasks.values()
    }

    /// Records sorted by id, for stable output.
    pub fn sorted(&self) -> Vec<&TaskRecord> {
        let mut records: Vec<&TaskRecord> = self.tasks.values().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn count_by_status(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for record in self.tasks.values() {
            counts.record(record.status);
        }
        counts
    }
}
