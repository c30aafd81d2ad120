//! Scheduler: matches ready tasks to eligible workers.
//!
//! Ready tasks sit in a max-heap ordered by priority, then `created_at` (FIFO within a
//! priority), then the order in which they became ready. The heap holds ids only and is
//! allowed to go stale: an entry whose task is no longer ready when it reaches the top is
//! dropped, so cancelling or holding a queued task needs no heap surgery.
//!
//! Matching is event driven. The engine calls `next_match` after every mutation until it
//! returns `None`; a task with no eligible worker stays queued until the next call.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use chrono::{DateTime, Utc};

use crate::domain::{Priority, TaskId, TaskRecord, WorkerId, WorkerRecord};
use crate::store::{DependencyGraph, TaskStore, WorkerRegistry};

#[derive(Debug, Clone, PartialEq, Eq)]
struct ReadyEntry {
    priority: Priority,
    created_at: DateTime<Utc>,
    seq: u64,
    task_id: TaskId,
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then older tasks, then earlier arrivals.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// One task/worker pair chosen by the scheduler. Nothing has been mutated yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
}

#[derive(Debug, Default)]
pub struct Scheduler {
    ready: BinaryHeap<ReadyEntry>,
    queued: HashSet<TaskId>,
    next_seq: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal that `task` became ready. Returns false if it is already queued.
    pub fn mark_ready(&mut self, task: &TaskRecord) -> bool {
        if !self.queued.insert(task.id.clone()) {
            return false;
        }
        self.ready.push(ReadyEntry {
            priority: task.priority,
            created_at: task.created_at,
            seq: self.next_seq,
            task_id: task.id.clone(),
        });
        self.next_seq += 1;
        true
    }

    /// Number of queued entries, including stale ones not yet discarded.
    pub fn queued(&self) -> usize {
        self.ready.len()
    }

    pub fn clear(&mut self) {
        self.ready.clear();
        self.queued.clear();
    }

    /// Pick the best ready task that has an eligible worker.
    ///
    /// Tasks that are ready but currently unmatched stay queued in their original order.
    pub fn next_match(
        &mut self,
        store: &TaskStore,
        graph: &DependencyGraph,
        registry: &WorkerRegistry,
    ) -> Option<Match> {
        let mut waiting = Vec::new();
        let mut found = None;

        while let Some(entry) = self.ready.pop() {
            if !graph.is_ready(&entry.task_id, store) {
                self.queued.remove(&entry.task_id);
                continue;
            }
            let Some(task) = store.get(&entry.task_id) else {
                self.queued.remove(&entry.task_id);
                continue;
            };
            if let Some(worker) = select_worker(task, registry) {
                self.queued.remove(&entry.task_id);
                found = Some(Match {
                    task_id: entry.task_id,
                    worker_id: worker.id.clone(),
                });
                break;
            }
            waiting.push(entry);
        }

        self.ready.extend(waiting);
        found
    }
}

/// Lowest load, then longest idle (oldest `last_seen_at`), then id.
///
/// Workers the task already stalled on are only considered when nobody else qualifies.
pub fn select_worker<'a>(task: &TaskRecord, registry: &'a WorkerRegistry) -> Option<&'a WorkerRecord> {
    let key = |w: &&'a WorkerRecord| (w.current_load, w.last_seen_at, w.id.clone());
    let (avoided, preferred): (Vec<_>, Vec<_>) = registry
        .eligible(&task.required_capabilities)
        .partition(|w| task.avoid_workers.contains(&w.id));

    preferred
        .into_iter()
        .min_by_key(key)
        .or_else(|| avoided.into_iter().min_by_key(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Availability, TaskSpec, TaskStatus, WorkerSpec};
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap()
    }

    struct Fixture {
        store: TaskStore,
        graph: DependencyGraph,
        registry: WorkerRegistry,
        scheduler: Scheduler,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: TaskStore::new(),
                graph: DependencyGraph::new(),
                registry: WorkerRegistry::new(),
                scheduler: Scheduler::new(),
            }
        }

        fn task(&mut self, spec: TaskSpec, created_at: DateTime<Utc>) {
            let id = spec.id.clone().unwrap();
            let record = TaskRecord::from_spec(id.clone(), spec, created_at);
            self.graph.add_task(id.clone());
            self.scheduler.mark_ready(&record);
            self.store.insert(record).unwrap();
        }

        fn worker(&mut self, spec: WorkerSpec, seen: DateTime<Utc>) {
            self.registry.register(spec, seen).unwrap();
        }

        fn next(&mut self) -> Option<Match> {
            self.scheduler
                .next_match(&self.store, &self.graph, &self.registry)
        }
    }

    #[test]
    fn critical_beats_high() {
        let mut fx = Fixture::new();
        fx.task(TaskSpec::new("T1", "high").with_priority(Priority::High), t0());
        fx.task(
            TaskSpec::new("T2", "critical").with_priority(Priority::Critical),
            t0() + Duration::seconds(1),
        );
        fx.worker(WorkerSpec::new("W", 1), t0());

        let first = fx.next().unwrap();
        assert_eq!(first.task_id, TaskId::new("T2"));
    }

    #[test]
    fn fifo_within_priority() {
        let mut fx = Fixture::new();
        fx.task(TaskSpec::new("late", "b"), t0() + Duration::seconds(5));
        fx.task(TaskSpec::new("early", "a"), t0());
        fx.worker(WorkerSpec::new("W", 2), t0());

        assert_eq!(fx.next().unwrap().task_id, TaskId::new("early"));
    }

    #[test]
    fn unmatched_task_does_not_block_others() {
        let mut fx = Fixture::new();
        fx.task(
            TaskSpec::new("gpu", "needs gpu")
                .with_priority(Priority::Critical)
                .requires("gpu"),
            t0(),
        );
        fx.task(TaskSpec::new("plain", "anyone"), t0());
        fx.worker(WorkerSpec::new("W", 1), t0());

        assert_eq!(fx.next().unwrap().task_id, TaskId::new("plain"));
        assert_eq!(fx.scheduler.queued(), 1, "gpu task stays queued");
    }

    #[test]
    fn never_picks_worker_missing_a_capability() {
        let mut fx = Fixture::new();
        fx.task(TaskSpec::new("T", "t").requires("rust").requires("review"), t0());
        fx.worker(WorkerSpec::new("W1", 1).with_capability("rust"), t0());
        assert!(fx.next().is_none());

        fx.worker(
            WorkerSpec::new("W2", 1)
                .with_capability("rust")
                .with_capability("review"),
            t0(),
        );
        assert_eq!(fx.next().unwrap().worker_id, WorkerId::new("W2"));
    }

    #[test]
    fn lowest_load_then_longest_idle() {
        let mut fx = Fixture::new();
        fx.task(TaskSpec::new("T", "t"), t0());
        fx.worker(WorkerSpec::new("busy", 3), t0() - Duration::hours(1));
        fx.worker(WorkerSpec::new("fresh", 3), t0());
        fx.worker(WorkerSpec::new("idle", 3), t0() - Duration::minutes(10));
        fx.registry.acquire(&WorkerId::new("busy")).unwrap();

        assert_eq!(fx.next().unwrap().worker_id, WorkerId::new("idle"));
    }

    #[test]
    fn stale_entries_are_dropped() {
        let mut fx = Fixture::new();
        fx.task(TaskSpec::new("T", "t"), t0());
        fx.store
            .get_mut(&TaskId::new("T"))
            .unwrap()
            .mark_cancelled("operator", t0())
            .unwrap();
        fx.worker(WorkerSpec::new("W", 1), t0());

        assert!(fx.next().is_none());
        assert_eq!(fx.scheduler.queued(), 0);
        assert_eq!(fx.store.status_of(&TaskId::new("T")), Some(TaskStatus::Cancelled));
    }

    #[test]
    fn avoided_worker_is_last_resort() {
        let mut fx = Fixture::new();
        fx.task(TaskSpec::new("T", "t"), t0());
        fx.store
            .get_mut(&TaskId::new("T"))
            .unwrap()
            .avoid_workers
            .insert(WorkerId::new("W1"));
        fx.worker(WorkerSpec::new("W1", 1), t0() - Duration::hours(1));
        fx.worker(WorkerSpec::new("W2", 1), t0());

        let task = fx.store.get(&TaskId::new("T")).unwrap();
        assert_eq!(select_worker(task, &fx.registry).unwrap().id, WorkerId::new("W2"));

        fx.registry
            .set_availability(&WorkerId::new("W2"), Availability::Unavailable)
            .unwrap();
        let task = fx.store.get(&TaskId::new("T")).unwrap();
        assert_eq!(select_worker(task, &fx.registry).unwrap().id, WorkerId::new("W1"));
    }

    #[test]
    fn selected_worker_outlives_the_task_borrow() {
        let mut fx = Fixture::new();
        fx.worker(WorkerSpec::new("W", 1).with_capability("rust"), t0());

        let chosen = {
            let task = TaskRecord::from_spec(
                TaskId::new("tmp"),
                TaskSpec::new("tmp", "t").requires("rust"),
                t0(),
            );
            select_worker(&task, &fx.registry)
        };
        assert_eq!(chosen.map(|w| w.id.clone()), Some(WorkerId::new("W")));
    }

    #[test]
    fn mark_ready_is_idempotent() {
        let mut fx = Fixture::new();
        fx.task(TaskSpec::new("T", "t"), t0());
        let record = fx.store.get(&TaskId::new("T")).unwrap().clone();
        assert!(!fx.scheduler.mark_ready(&record));
        assert_eq!(fx.scheduler.queued(), 1);
    }
}
