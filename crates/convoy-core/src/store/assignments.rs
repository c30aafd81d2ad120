//! Ledger of active assignments, keyed by assignment id.
//!
//! `close` hands back an assignment at most once. Every release of worker capacity goes
//! through it, so a stall escalation racing a late failure report for the same
//! assignment decrements the worker's load exactly once.

use std::collections::{BTreeSet, HashMap};

use crate::domain::{Assignment, AssignmentId, TaskId, WorkerId};

#[derive(Debug, Clone, Default)]
pub struct AssignmentLedger {
    active: HashMap<AssignmentId, Assignment>,
    by_worker: HashMap<WorkerId, BTreeSet<AssignmentId>>,
}

impl AssignmentLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, assignment: Assignment) {
        self.by_worker
            .entry(assignment.worker_id.clone())
            .or_default()
            .insert(assignment.id.clone());
        self.active.insert(assignment.id.clone(), assignment);
    }

    /// Returns the assignment the first time it is closed, `None` afterwards.
    pub fn close(&mut self, id: &AssignmentId) -> Option<Assignment> {
        let assignment = self.active.remove(id)?;
        if let Some(ids) = self.by_worker.get_mut(&assignment.worker_id) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_worker.remove(&assignment.worker_id);
            }
        }
        Some(assignment)
    }

    pub fn get(&self, id: &AssignmentId) -> Option<&Assignment> {
        self.active.get(id)
    }

    pub fn is_active(&self, id: &AssignmentId) -> bool {
        self.active.contains_key(id)
    }

    /// Whether `id` is the live binding of `task` to `worker`.
    pub fn matches(&self, id: &AssignmentId, task: &TaskId, worker: Option<&WorkerId>) -> bool {
        self.active.get(id).is_some_and(|a| {
            &a.task_id == task && worker.is_none_or(|w| &a.worker_id == w)
        })
    }

    pub fn for_worker(&self, worker: &WorkerId) -> Vec<AssignmentId> {
        self.by_worker
            .get(worker)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Assignment> {
        self.active.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn assignment(id: &str, task: &str, worker: &str) -> Assignment {
        Assignment {
            id: AssignmentId::new(id),
            task_id: TaskId::new(task),
            worker_id: WorkerId::new(worker),
            assigned_at: Utc::now(),
        }
    }

    #[test]
    fn close_is_one_shot() {
        let mut ledger = AssignmentLedger::new();
        ledger.open(assignment("a1", "t1", "w1"));
        let id = AssignmentId::new("a1");
        assert!(ledger.is_active(&id));
        assert!(ledger.close(&id).is_some());
        assert!(ledger.close(&id).is_none());
        assert!(ledger.is_empty());
    }

    #[test]
    fn worker_index_tracks_open_assignments() {
        let mut ledger = AssignmentLedger::new();
        ledger.open(assignment("a1", "t1", "w1"));
        ledger.open(assignment("a2", "t2", "w1"));
        ledger.open(assignment("a3", "t3", "w2"));
        assert_eq!(
            ledger.for_worker(&WorkerId::new("w1")),
            vec![AssignmentId::new("a1"), AssignmentId::new("a2")]
        );
        ledger.close(&AssignmentId::new("a1"));
        assert_eq!(ledger.for_worker(&WorkerId::new("w1")).len(), 1);
        assert!(ledger.for_worker(&WorkerId::new("nobody")).is_empty());
    }

    #[test]
    fn matches_checks_task_and_worker() {
        let mut ledger = AssignmentLedger::new();
        ledger.open(assignment("a1", "t1", "w1"));
        let id = AssignmentId::new("a1");
        assert!(ledger.matches(&id, &TaskId::new("t1"), Some(&WorkerId::new("w1"))));
        assert!(ledger.matches(&id, &TaskId::new("t1"), None));
        assert!(!ledger.matches(&id, &TaskId::new("t2"), None));
        assert!(!ledger.matches(&id, &TaskId::new("t1"), Some(&WorkerId::new("w9"))));
    }
}
