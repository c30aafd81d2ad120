//! Dependency graph over the task store.
//!
//! Design:
//! - Forward edges: task -> tasks it depends on (waits for)
//! - Reverse edges: task -> tasks that depend on it (waiting tasks)
//! - Invariant: edges and reverse_edges are kept in sync
//! - Invariant: the graph is acyclic; `add_dependency` refuses any edge that would close
//!   a cycle, so a graph built through it always has a topological order
//!
//! Readiness is computed against the `TaskStore`, never cached here. When a task
//! completes only its direct dependents are re-examined.

use std::cmp::Reverse;
use std::collections::hash_map::Entry;
use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::domain::{TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::store::TaskStore;

/// DFS node colours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    /// On the current DFS path.
    Gray,
    /// Fully explored.
    Black,
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: HashSet<TaskId>,

    /// Forward edges: task -> tasks it depends on (waits for)
    edges: HashMap<TaskId, HashSet<TaskId>>,

    /// Reverse edges: task -> tasks that depend on it (waiting tasks)
    /// Enables O(out-degree) lookup: "who is waiting for this task?"
    reverse_edges: HashMap<TaskId, HashSet<TaskId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bulk load without per-edge checks, then validate the whole graph once.
    /// Used when restoring persisted state.
    pub fn from_edges(
        nodes: impl IntoIterator<Item = TaskId>,
        edges: impl IntoIterator<Item = (TaskId, TaskId)>,
    ) -> Result<Self> {
        let mut graph = Self::new();
        for node in nodes {
            graph.add_task(node);
        }
        for (task, depends_on) in edges {
            graph.ensure_known(&task)?;
            graph.ensure_known(&depends_on)?;
            graph.insert_edge(task, depends_on);
        }
        if let Some(path) = graph.detect_cycle() {
            return Err(Error::Cycle { path });
        }
        Ok(graph)
    }

    /// Register a node. Returns false if it was already present.
    pub fn add_task(&mut self, id: TaskId) -> bool {
        self.nodes.insert(id)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.nodes.contains(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn ensure_known(&self, id: &TaskId) -> Result<()> {
        if self.contains(id) {
            Ok(())
        } else {
            Err(Error::UnknownTask(id.clone()))
        }
    }

    /// Add a dependency: `task` depends on `depends_on`.
    ///
    /// Example: add_dependency(b, a) means "B waits for A".
    ///
    /// Fails with `UnknownTask` if either id is absent and with `Cycle` if `task` is
    /// already reachable from `depends_on`. Nothing is applied on failure. Re-adding an
    /// existing edge is a no-op.
    pub fn add_dependency(&mut self, task: &TaskId, depends_on: &TaskId) -> Result<()> {
        self.ensure_known(task)?;
        self.ensure_known(depends_on)?;
        if self.depends_directly(task, depends_on) {
            return Ok(());
        }
        if let Some(back) = self.find_path(depends_on, task) {
            let mut path = Vec::with_capacity(back.len() + 1);
            path.push(task.clone());
            path.extend(back);
            return Err(Error::Cycle { path });
        }
        self.insert_edge(task.clone(), depends_on.clone());
        Ok(())
    }

    fn insert_edge(&mut self, task: TaskId, depends_on: TaskId) {
        self.reverse_edges
            .entry(depends_on.clone())
            .or_default()
            .insert(task.clone());
        self.edges.entry(task).or_default().insert(depends_on);
    }

    /// Remove a dependency: `task` no longer depends on `depends_on`.
    pub fn remove_dependency(&mut self, task: &TaskId, depends_on: &TaskId) {
        if let Entry::Occupied(mut e) = self.edges.entry(task.clone()) {
            e.get_mut().remove(depends_on);
            if e.get().is_empty() {
                e.remove_entry();
            }
        }
        if let Entry::Occupied(mut e) = self.reverse_edges.entry(depends_on.clone()) {
            e.get_mut().remove(task);
            if e.get().is_empty() {
                e.remove_entry();
            }
        }
    }

    pub fn depends_directly(&self, task: &TaskId, depends_on: &TaskId) -> bool {
        self.edges
            .get(task)
            .is_some_and(|deps| deps.contains(depends_on))
    }

    pub fn has_dependencies(&self, task: &TaskId) -> bool {
        self.edges.get(task).is_some_and(|deps| !deps.is_empty())
    }

    /// Direct dependencies of `task`, sorted.
    pub fn dependencies(&self, task: &TaskId) -> Vec<TaskId> {
        sorted(self.edges.get(task))
    }

    /// Tasks directly waiting for `task`, sorted.
    ///
    /// Includes dependents that still wait on other tasks; callers re-check readiness.
    pub fn dependents(&self, task: &TaskId) -> Vec<TaskId> {
        sorted(self.reverse_edges.get(task))
    }

    /// Dependencies of `task` that have not completed.
    pub fn unsatisfied_dependencies(&self, task: &TaskId, store: &TaskStore) -> Vec<TaskId> {
        self.dependencies(task)
            .into_iter()
            .filter(|dep| store.status_of(dep) != Some(TaskStatus::Completed))
            .collect()
    }

    pub fn dependencies_satisfied(&self, task: &TaskId, store: &TaskStore) -> bool {
        self.edges.get(task).is_none_or(|deps| {
            deps.iter()
                .all(|dep| store.status_of(dep) == Some(TaskStatus::Completed))
        })
    }

    /// True iff the task is pending and every dependency has completed.
    pub fn is_ready(&self, task: &TaskId, store: &TaskStore) -> bool {
        store.status_of(task) == Some(TaskStatus::Pending)
            && self.dependencies_satisfied(task, store)
    }

    /// Lazy topological order (dependencies first, ties by id).
    ///
    /// Each call starts a fresh pass; the returned iterator can also be cloned to
    /// restart from the same point.
    pub fn topo_order(&self) -> TopoOrder<'_> {
        let mut remaining = HashMap::with_capacity(self.nodes.len());
        let mut frontier = BinaryHeap::new();
        for node in &self.nodes {
            let in_degree = self.edges.get(node).map_or(0, HashSet::len);
            if in_degree == 0 {
                frontier.push(Reverse(node));
            } else {
                remaining.insert(node, in_degree);
            }
        }
        TopoOrder {
            graph: self,
            remaining,
            frontier,
        }
    }

    /// Path `from -> ... -> to` along forward edges, if any.
    fn find_path(&self, from: &TaskId, to: &TaskId) -> Option<Vec<TaskId>> {
        if from == to {
            return Some(vec![from.clone()]);
        }
        let mut color: HashMap<&TaskId, Color> = HashMap::new();
        let mut path: Vec<&TaskId> = vec![from];
        let mut stack = vec![self.neighbours(from)];
        color.insert(from, Color::Gray);

        while let Some(frame) = stack.last_mut() {
            match frame.next() {
                Some(next) if next == to => {
                    path.push(next);
                    return Some(path.into_iter().cloned().collect());
                }
                Some(next) => {
                    if !color.contains_key(next) {
                        color.insert(next, Color::Gray);
                        path.push(next);
                        stack.push(self.neighbours(next));
                    }
                }
                None => {
                    stack.pop();
                    if let Some(done) = path.pop() {
                        color.insert(done, Color::Black);
                    }
                }
            }
        }
        None
    }

    /// Detect a cycle anywhere in the graph (DFS with colouring).
    ///
    /// Returns the first cycle found as `a -> b -> ... -> a`, or None for a DAG.
    pub fn detect_cycle(&self) -> Option<Vec<TaskId>> {
        let mut color: HashMap<&TaskId, Color> = HashMap::new();
        let mut roots: Vec<&TaskId> = self.nodes.iter().collect();
        roots.sort();

        for root in roots {
            if color.contains_key(root) {
                continue;
            }
            let mut path: Vec<&TaskId> = vec![root];
            let mut stack = vec![self.neighbours(root)];
            color.insert(root, Color::Gray);

            while let Some(frame) = stack.last_mut() {
                match frame.next() {
                    Some(next) => match color.get(next) {
                        Some(Color::Gray) => {
                            let start = path.iter().position(|n| *n == next).unwrap_or(0);
                            let mut cycle: Vec<TaskId> =
                                path[start..].iter().map(|n| (*n).clone()).collect();
                            cycle.push(next.clone());
                            return Some(cycle);
                        }
                        Some(Color::Black) => {}
                        None => {
                            color.insert(next, Color::Gray);
                            path.push(next);
                            stack.push(self.neighbours(next));
                        }
                    },
                    None => {
                        stack.pop();
                        if let Some(done) = path.pop() {
                            color.insert(done, Color::Black);
                        }
                    }
                }
            }
        }
        None
    }

    fn neighbours(&self, id: &TaskId) -> std::vec::IntoIter<&TaskId> {
        let mut deps: Vec<&TaskId> = self
            .edges
            .get(id)
            .map(|deps| deps.iter().collect())
            .unwrap_or_default();
        deps.sort();
        deps.into_iter()
    }
}

fn sorted(set: Option<&HashSet<TaskId>>) -> Vec<TaskId> {
    let mut ids: Vec<TaskId> = set
        .map(|ids| ids.iter().cloned().collect())
        .unwrap_or_default();
    ids.sort();
    ids
}

/// Kahn's algorithm, one node per `next()`.
#[derive(Debug, Clone)]
pub struct TopoOrder<'a> {
    graph: &'a DependencyGraph,
    remaining: HashMap<&'a TaskId, usize>,
    frontier: BinaryHeap<Reverse<&'a TaskId>>,
}

impl Iterator for TopoOrder<'_> {
    type Item = TaskId;

    fn next(&mut self) -> Option<TaskId> {
        let graph = self.graph;
        let Reverse(node) = self.frontier.pop()?;
        if let Some(waiting) = graph.reverse_edges.get(node) {
            for dependent in waiting {
                if let Some(count) = self.remaining.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        self.remaining.remove(dependent);
                        self.frontier.push(Reverse(dependent));
                    }
                }
            }
        }
        Some(node.clone())
    }
}
