//! Input records: task definitions and the worker roster.
//!
//! These are what external collaborators hand the coordinator. Validation here is purely
//! structural; references to other tasks are checked when the task enters the graph.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::ids::{TaskId, WorkerId};
use super::task::Priority;
use crate::error::{Error, Result};

/// A task definition as submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Caller-chosen id. A `task-<ulid>` id is minted when absent.
    #[serde(default)]
    pub id: Option<TaskId>,

    pub title: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default)]
    pub dependencies: Vec<TaskId>,

    #[serde(default)]
    pub required_capabilities: Vec<String>,

    #[serde(default)]
    pub parent_id: Option<TaskId>,

    #[serde(default)]
    pub tags: Vec<String>,

    /// Opaque to the coordinator.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl TaskSpec {
    pub fn new(id: impl Into<TaskId>, title: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            title: title.into(),
            description: String::new(),
            priority: Priority::default(),
            dependencies: Vec::new(),
            required_capabilities: Vec::new(),
            parent_id: None,
            tags: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, dep: impl Into<TaskId>) -> Self {
        self.dependencies.push(dep.into());
        self
    }

    pub fn requires(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.push(capability.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(id) = &self.id
            && id.is_blank()
        {
            return Err(Error::validation("task id must not be blank"));
        }
        let label = self.id.as_ref().map(|id| id.as_str()).unwrap_or("<new>");
        if self.title.trim().is_empty() {
            return Err(Error::validation(format!("task {label}: title must not be blank")));
        }
        if self.dependencies.iter().any(|dep| dep.is_blank()) {
            return Err(Error::validation(format!(
                "task {label}: dependency ids must not be blank"
            )));
        }
        if self.required_capabilities.iter().any(|c| c.trim().is_empty()) {
            return Err(Error::validation(format!(
                "task {label}: capability tags must not be blank"
            )));
        }
        if let (Some(id), Some(parent)) = (&self.id, &self.parent_id)
            && id == parent
        {
            return Err(Error::validation(format!("task {label}: task cannot be its own parent")));
        }
        Ok(())
    }
}

/// A roster entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub id: WorkerId,

    #[serde(default)]
    pub capabilities: Vec<String>,

    pub capacity: u32,

    /// Worker-side configuration (prompt text and the like). Never interpreted here.
    #[serde(default)]
    pub instructions: Option<serde_json::Value>,
}

impl WorkerSpec {
    pub fn new(id: impl Into<WorkerId>, capacity: u32) -> Self {
        Self {
            id: id.into(),
            capabilities: Vec::new(),
            capacity,
            instructions: None,
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.is_blank() {
            return Err(Error::validation("worker id must not be blank"));
        }
        if self.capacity == 0 {
            return Err(Error::validation(format!(
                "worker {}: capacity must be at least 1",
                self.id
            )));
        }
        if self.capabilities.iter().any(|c| c.trim().is_empty()) {
            return Err(Error::validation(format!(
                "worker {}: capability tags must not be blank",
                self.id
            )));
        }
        Ok(())
    }
}

/// File format for a batch of task definitions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskManifest {
    pub tasks: Vec<TaskSpec>,
}

/// File format for the worker roster.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Roster {
    pub workers: Vec<WorkerSpec>,
}

impl TaskManifest {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

impl Roster {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn task_spec_from_minimal_json() {
        let spec: TaskSpec = serde_json::from_str(r#"{"id": "T1", "title": "Draft report"}"#).unwrap();
        assert_eq!(spec.id, Some(TaskId::new("T1")));
        assert_eq!(spec.priority, Priority::Medium);
        assert!(spec.dependencies.is_empty());
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn task_spec_full_json() {
        let json = r#"{
            "id": "T3",
            "title": "Publish",
            "priority": "critical",
            "dependencies": ["T1", "T2"],
            "required_capabilities": ["writing"],
            "metadata": {"source": "tracker"}
        }"#;
        let spec: TaskSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.priority, Priority::Critical);
        assert_eq!(spec.dependencies.len(), 2);
        assert_eq!(spec.metadata["source"], "tracker");
    }

    #[rstest]
    #[case::blank_title(TaskSpec::new("T1", "  "))]
    #[case::blank_id(TaskSpec::new("", "ok"))]
    #[case::blank_dependency(TaskSpec::new("T1", "ok").depends_on(""))]
    #[case::blank_capability(TaskSpec::new("T1", "ok").requires(" "))]
    fn malformed_task_specs_are_rejected(#[case] spec: TaskSpec) {
        assert!(matches!(spec.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn own_parent_is_rejected() {
        let mut spec = TaskSpec::new("T1", "ok");
        spec.parent_id = Some(TaskId::new("T1"));
        assert!(spec.validate().is_err());
    }

    #[rstest]
    #[case(0, false)]
    #[case(1, true)]
    #[case(8, true)]
    fn worker_capacity_must_be_positive(#[case] capacity: u32, #[case] ok: bool) {
        let spec = WorkerSpec::new("w1", capacity).with_capability("rust");
        assert_eq!(spec.validate().is_ok(), ok);
    }

    #[test]
    fn roster_keeps_instructions_opaque() {
        let json = r#"{"workers": [
            {"id": "w1", "capabilities": ["research"], "capacity": 2,
             "instructions": {"prompt": "be concise"}}
        ]}"#;
        let roster: Roster = serde_json::from_str(json).unwrap();
        assert_eq!(roster.workers[0].capacity, 2);
        assert_eq!(roster.workers[0].instructions.as_ref().unwrap()["prompt"], "be concise");
    }
}
