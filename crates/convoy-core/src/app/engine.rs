//! Engine: the single writer over tasks, dependencies, workers and assignments.
//!
//! Every public method is one atomic step: it validates first and mutates only once
//! nothing can fail any more. The engine never awaits. Outgoing events and alerts are
//! queued as [`Effect`]s and drained by the coordinator, which owns the only `Engine`.
//!
//! Reports from workers are matched by assignment id. A report for an assignment that
//! has already been released (completed, failed, stalled, cancelled, worker lost) is
//! `Stale` and changes nothing, which is what keeps worker load from being released
//! twice when a stall escalation and a late failure race each other.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::monitor::LivenessProbe;
use super::recovery::{RecoveryManager, RecoveryOutcome};
use super::scheduler::Scheduler;
use super::status::{OverallState, StatusReport, TaskQuery, TaskView, WorkerView};
use crate::config::CoordinatorConfig;
use crate::domain::{
    Alert, AlertId, Assignment, AssignmentId, Availability, Decider, EscalationReason, Event,
    EventKind, EventPayload, EventSource, FailureCause, Severity, TaskId, TaskRecord, TaskSpec,
    TaskStatus, WorkerId, WorkerRecord, WorkerSpec,
};
use crate::error::{Error, Result};
use crate::ports::{Clock, IdGenerator};
use crate::store::{
    AssignmentLedger, DependencyGraph, SNAPSHOT_VERSION, Snapshot, TaskStore, WorkerRegistry,
};

/// What an inbound event did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Applied,
    /// Already reflected in state (repeat `completed`, old heartbeat, repeat cancel).
    Duplicate,
    /// Refers to an assignment that is no longer active.
    Stale,
}

/// Side effects produced by a step, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Publish(Event),
    Alert(Alert),
}

/// Audit trail entry. `disposition` is `None` for events the engine emitted itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub recorded_at: DateTime<Utc>,
    pub event: Event,
    pub disposition: Option<Disposition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineLimits {
    pub alert_retention: usize,
    pub event_log_retention: usize,
}

impl From<&CoordinatorConfig> for EngineLimits {
    fn from(config: &CoordinatorConfig) -> Self {
        Self {
            alert_retention: config.alert_retention,
            event_log_retention: config.event_log_retention,
        }
    }
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self::from(&CoordinatorConfig::default())
    }
}

/// Keeps the newest `limit` items.
#[derive(Debug)]
struct Bounded<T> {
    items: VecDeque<T>,
    limit: usize,
}

impl<T> Bounded<T> {
    fn new(limit: usize) -> Self {
        Self {
            items: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    fn push(&mut self, item: T) {
        if self.items.len() == self.limit {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }
}

pub struct Engine {
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    tasks: TaskStore,
    graph: DependencyGraph,
    workers: WorkerRegistry,
    ledger: AssignmentLedger,
    scheduler: Scheduler,
    recovery: RecoveryManager,
    alerts: Bounded<Alert>,
    audit: Bounded<AuditEntry>,
    effects: Vec<Effect>,
}

impl Engine {
    pub fn new(
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        decider: Arc<dyn Decider>,
        limits: EngineLimits,
    ) -> Self {
        Self {
            clock,
            ids,
            tasks: TaskStore::new(),
            graph: DependencyGraph::new(),
            workers: WorkerRegistry::new(),
            ledger: AssignmentLedger::new(),
            scheduler: Scheduler::new(),
            recovery: RecoveryManager::new(decider),
            alerts: Bounded::new(limits.alert_retention),
            audit: Bounded::new(limits.event_log_retention),
            effects: Vec::new(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ---------------------------------------------------------------------
    // Tasks
    // ---------------------------------------------------------------------

    pub fn submit(&mut self, spec: TaskSpec) -> Result<TaskId> {
        let mut ids = self.submit_batch(vec![spec])?;
        ids.pop()
            .ok_or_else(|| Error::validation("empty submission"))
    }

    /// All-or-nothing insert. Batch members may depend on each other; every dependency
    /// must name a task already in the store or in the batch.
    pub fn submit_batch(&mut self, specs: Vec<TaskSpec>) -> Result<Vec<TaskId>> {
        let now = self.clock.now();

        let mut staged = Vec::with_capacity(specs.len());
        let mut seen = HashSet::new();
        for spec in specs {
            spec.validate()?;
            let id = match &spec.id {
                Some(id) => id.clone(),
                None => self.ids.generate_task_id(),
            };
            if self.tasks.contains(&id) || !seen.insert(id.clone()) {
                return Err(Error::validation(format!("duplicate task id: {id}")));
            }
            staged.push((id, spec));
        }

        // Wire the batch into a scratch graph so a bad edge leaves nothing behind.
        let mut graph = self.graph.clone();
        for (id, _) in &staged {
            graph.add_task(id.clone());
        }
        for (id, spec) in &staged {
            for dep in &spec.dependencies {
                graph.add_dependency(id, dep)?;
            }
            if let Some(parent) = &spec.parent_id
                && !graph.contains(parent)
            {
                return Err(Error::validation(format!(
                    "task {id}: unknown parent {parent}"
                )));
            }
        }

        self.graph = graph;
        let mut submitted = Vec::with_capacity(staged.len());
        let mut children = Vec::new();
        for (id, spec) in staged {
            if let Some(parent) = &spec.parent_id {
                children.push((parent.clone(), id.clone()));
            }
            self.tasks
                .insert(TaskRecord::from_spec(id.clone(), spec, now))?;
            submitted.push(id);
        }
        for (parent, child) in children {
            if let Some(parent) = self.tasks.get_mut(&parent) {
                parent.subtasks.push(child);
            }
        }
        for id in &submitted {
            self.settle(id, now);
            if let Some(task) = self.tasks.get(id) {
                info!(
                    task_id = %id,
                    priority = %task.priority,
                    status = %task.status,
                    "task submitted"
                );
            }
        }
        Ok(submitted)
    }

    /// `task` additionally waits for `dep`.
    pub fn add_dependency(&mut self, task_id: &TaskId, dep: &TaskId) -> Result<()> {
        let status = self.tasks.require(task_id)?.status;
        let dep_status = self.tasks.require(dep)?.status;
        if status.is_terminal() {
            return Err(Error::validation(format!(
                "task {task_id} is {status}; its dependencies are frozen"
            )));
        }
        if status.is_active() && dep_status != TaskStatus::Completed {
            return Err(Error::validation(format!(
                "task {task_id} is already {status} but {dep} is {dep_status}"
            )));
        }

        self.graph.add_dependency(task_id, dep)?;
        let now = self.clock.now();
        let task = self.tasks.require_mut(task_id)?;
        task.dependencies.insert(dep.clone());
        task.updated_at = now;
        self.settle(task_id, now);
        debug!(task_id = %task_id, depends_on = %dep, "dependency added");
        Ok(())
    }

    /// Cancel from any non-terminal state. An active assignment is released and the
    /// worker told to stop. Dependents are never unblocked by a cancelled task.
    pub fn cancel(&mut self, task_id: &TaskId, reason: &str) -> Result<Disposition> {
        let task = self.tasks.require(task_id)?;
        match task.status {
            TaskStatus::Cancelled => return Ok(Disposition::Duplicate),
            TaskStatus::Completed | TaskStatus::Failed => {
                return Err(Error::InvalidTransition {
                    task: task_id.clone(),
                    from: task.status,
                    to: TaskStatus::Cancelled,
                });
            }
            _ => {}
        }
        let held = task
            .assignment_id
            .clone()
            .filter(|_| task.status.is_active());

        let now = self.clock.now();
        if let Some(assignment) = held.and_then(|id| self.release(&id)) {
            self.emit(Event::cancel(
                task_id.clone(),
                Some(assignment.worker_id),
                Some(assignment.id),
                reason,
                EventSource::Coordinator,
                now,
            ));
        }
        self.tasks.require_mut(task_id)?.mark_cancelled(reason, now)?;
        info!(task_id = %task_id, %reason, "task cancelled");
        Ok(Disposition::Applied)
    }

    pub fn hold(&mut self, task_id: &TaskId) -> Result<()> {
        let now = self.clock.now();
        self.tasks.require_mut(task_id)?.hold(now)?;
        info!(task_id = %task_id, "task put on hold");
        Ok(())
    }

    /// Back to pending, or blocked if dependencies are still open.
    pub fn release_hold(&mut self, task_id: &TaskId) -> Result<()> {
        let satisfied = self.graph.dependencies_satisfied(task_id, &self.tasks);
        let now = self.clock.now();
        let task = self.tasks.require_mut(task_id)?;
        if task.status != TaskStatus::OnHold {
            return Err(Error::InvalidTransition {
                task: task_id.clone(),
                from: task.status,
                to: TaskStatus::Pending,
            });
        }
        if satisfied {
            task.mark_pending(now);
            self.scheduler.mark_ready(task);
        } else {
            task.mark_blocked(now);
        }
        info!(task_id = %task_id, status = %task.status, "hold released");
        Ok(())
    }

    /// Operator override: drop dependencies that can never complete (failed or
    /// cancelled) and re-evaluate readiness. Returns the dropped ids.
    pub fn override_blocked(&mut self, task_id: &TaskId) -> Result<Vec<TaskId>> {
        let status = self.tasks.require(task_id)?.status;
        if !matches!(status, TaskStatus::Blocked | TaskStatus::OnHold) {
            return Err(Error::validation(format!(
                "task {task_id} is {status}, not blocked"
            )));
        }
        let dropped: Vec<TaskId> = self
            .graph
            .dependencies(task_id)
            .into_iter()
            .filter(|dep| {
                matches!(
                    self.tasks.status_of(dep),
                    Some(TaskStatus::Failed | TaskStatus::Cancelled)
                )
            })
            .collect();

        let now = self.clock.now();
        for dep in &dropped {
            self.graph.remove_dependency(task_id, dep);
        }
        let task = self.tasks.require_mut(task_id)?;
        if !dropped.is_empty() {
            for dep in &dropped {
                task.dependencies.remove(dep);
            }
            let list: Vec<&str> = dropped.iter().map(|d| d.as_str()).collect();
            task.notes.push(format!(
                "[{}] override dropped dependencies: {}",
                now.to_rfc3339(),
                list.join(", ")
            ));
            task.updated_at = now;
        }
        self.settle(task_id, now);
        warn!(task_id = %task_id, dropped = dropped.len(), "blocked task overridden");
        Ok(dropped)
    }

    /// Operator retry of a terminally failed task with a fresh retry budget.
    pub fn resubmit(&mut self, task_id: &TaskId) -> Result<()> {
        let now = self.clock.now();
        self.tasks.require_mut(task_id)?.reset_for_resubmit(now)?;
        self.settle(task_id, now);
        info!(task_id = %task_id, "task resubmitted");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Workers
    // ---------------------------------------------------------------------

    pub fn register_worker(&mut self, spec: WorkerSpec) -> Result<()> {
        let now = self.clock.now();
        let worker = self.workers.register(spec, now)?;
        info!(
            worker_id = %worker.id,
            capacity = worker.capacity,
            capabilities = ?worker.capabilities,
            "worker registered"
        );
        Ok(())
    }

    /// Remove a worker. Each active assignment is released once and its task requeued
    /// without spending retry budget. Returns the requeued tasks.
    pub fn deregister_worker(&mut self, worker_id: &WorkerId) -> Result<Vec<TaskId>> {
        self.workers.require(worker_id)?;
        let now = self.clock.now();

        let mut requeued = Vec::new();
        for assignment_id in self.ledger.for_worker(worker_id) {
            let Some(assignment) = self.release(&assignment_id) else {
                continue;
            };
            if let Some(task) = self.tasks.get_mut(&assignment.task_id) {
                self.recovery.requeue_lost(task, worker_id, now);
            }
            self.escalate(
                assignment.task_id.clone(),
                Some(worker_id.clone()),
                Some(assignment.id),
                EscalationReason::WorkerLost,
                format!("worker {worker_id} deregistered while holding the task"),
                now,
            );
            self.settle(&assignment.task_id, now);
            requeued.push(assignment.task_id);
        }

        self.workers.deregister(worker_id)?;
        info!(worker_id = %worker_id, requeued = requeued.len(), "worker deregistered");
        Ok(requeued)
    }

    /// Returns whether the heartbeat advanced `last_seen_at`.
    pub fn worker_heartbeat(&mut self, worker_id: &WorkerId, at: DateTime<Utc>) -> Result<bool> {
        self.workers.update_heartbeat(worker_id, at)
    }

    pub fn set_availability(
        &mut self,
        worker_id: &WorkerId,
        availability: Availability,
    ) -> Result<Availability> {
        let previous = self.workers.set_availability(worker_id, availability)?;
        if previous != availability {
            info!(worker_id = %worker_id, ?previous, ?availability, "worker availability changed");
        }
        Ok(previous)
    }

    // ---------------------------------------------------------------------
    // Inbound events
    // ---------------------------------------------------------------------

    pub fn handle_event(&mut self, event: Event) -> Result<Disposition> {
        let disposition = match event.kind {
            EventKind::Heartbeat => self.on_heartbeat(&event)?,
            EventKind::Progress => self.on_progress(&event)?,
            EventKind::Completed => self.on_completed(&event)?,
            EventKind::Failed => self.on_failed(&event)?,
            EventKind::Escalate => self.on_escalate(&event)?,
            EventKind::Cancel => {
                let reason = match &event.payload {
                    EventPayload::Cancellation { reason } => reason.clone(),
                    _ => format!("cancel requested by {:?}", event.source),
                };
                self.cancel(&event.task_id, &reason)?
            }
            EventKind::Assign => {
                return Err(Error::validation(
                    "assign events are emitted by the coordinator, not consumed",
                ));
            }
        };
        self.touch_worker(&event);

        if disposition != Disposition::Applied {
            debug!(
                task_id = %event.task_id,
                kind = %event.kind,
                seq = event.seq,
                ?disposition,
                "event ignored"
            );
        }
        self.audit.push(AuditEntry {
            recorded_at: self.clock.now(),
            event,
            disposition: Some(disposition),
        });
        Ok(disposition)
    }

    /// A report that passed validation counts as a sign of life for its worker,
    /// even when it turned out stale or duplicate.
    fn touch_worker(&mut self, event: &Event) {
        if event.source != EventSource::Worker {
            return;
        }
        let Some(worker_id) = &event.worker_id else {
            return;
        };
        if let Err(e) = self.workers.update_heartbeat(worker_id, event.timestamp) {
            debug!(worker_id = %worker_id, error = %e, "report from unregistered worker");
        }
    }

    /// The live assignment this report refers to, or `None` if it has been released.
    fn active_report(&self, event: &Event) -> Result<Option<AssignmentId>> {
        let task = self.tasks.require(&event.task_id)?;
        let assignment_id = event.assignment_id.as_ref().ok_or_else(|| {
            Error::validation(format!(
                "{} report for {} carries no assignment id",
                event.kind, event.task_id
            ))
        })?;
        let live = task.is_held_by(assignment_id)
            && self
                .ledger
                .matches(assignment_id, &event.task_id, event.worker_id.as_ref());
        Ok(live.then(|| assignment_id.clone()))
    }

    fn on_heartbeat(&mut self, event: &Event) -> Result<Disposition> {
        if self.active_report(event)?.is_none() {
            return Ok(Disposition::Stale);
        }
        let task = self.tasks.require_mut(&event.task_id)?;
        Ok(if task.record_heartbeat(event.timestamp) {
            Disposition::Applied
        } else {
            Disposition::Duplicate
        })
    }

    fn on_progress(&mut self, event: &Event) -> Result<Disposition> {
        if self.active_report(event)?.is_none() {
            return Ok(Disposition::Stale);
        }
        let (percent, message) = match &event.payload {
            EventPayload::Progress { percent, message } => (*percent, message.clone()),
            _ => (None, None),
        };
        let now = self.clock.now();
        let task = self.tasks.require_mut(&event.task_id)?;
        if let Some(percent) = percent {
            task.set_progress(percent, now)?;
        }
        task.record_heartbeat(event.timestamp);
        task.mark_in_progress(now);
        if let Some(message) = message {
            task.notes
                .push(format!("[{}] progress: {message}", event.timestamp.to_rfc3339()));
        }
        Ok(Disposition::Applied)
    }

    fn on_completed(&mut self, event: &Event) -> Result<Disposition> {
        if self.tasks.require(&event.task_id)?.status == TaskStatus::Completed {
            return Ok(Disposition::Duplicate);
        }
        let Some(assignment_id) = self.active_report(event)? else {
            return Ok(Disposition::Stale);
        };

        let now = self.clock.now();
        self.release(&assignment_id);
        self.tasks.require_mut(&event.task_id)?.mark_completed(now);
        info!(task_id = %event.task_id, assignment_id = %assignment_id, "task completed");

        // Only direct dependents can have become ready.
        for dependent in self.graph.dependents(&event.task_id) {
            if self.tasks.status_of(&dependent) == Some(TaskStatus::Blocked) {
                self.settle(&dependent, now);
            }
        }
        Ok(Disposition::Applied)
    }

    fn on_failed(&mut self, event: &Event) -> Result<Disposition> {
        let Some(assignment_id) = self.active_report(event)? else {
            return Ok(Disposition::Stale);
        };
        let error = match &event.payload {
            EventPayload::Failure { error } => error.clone(),
            _ => "unspecified failure".to_string(),
        };
        let now = self.clock.now();
        self.fail_assignment(&event.task_id, &assignment_id, FailureCause::Reported { error }, now)
    }

    fn on_escalate(&mut self, event: &Event) -> Result<Disposition> {
        let (reason, detail) = match &event.payload {
            EventPayload::Escalation { reason, detail } => (*reason, detail.clone()),
            _ => return Err(Error::validation("escalate event without escalation payload")),
        };
        if !matches!(
            reason,
            EscalationReason::Stalled | EscalationReason::AssignmentTimeout
        ) {
            return Err(Error::validation(format!(
                "{reason} escalations are raised by the coordinator, not consumed"
            )));
        }
        let Some(assignment_id) = self.active_report(event)? else {
            return Ok(Disposition::Stale);
        };

        let now = self.clock.now();
        let task = self.tasks.require_mut(&event.task_id)?;
        let Some(worker_id) = task.assigned_worker.clone() else {
            return Ok(Disposition::Stale);
        };
        let assigned_at = task.assigned_at.unwrap_or(now);
        let cause = if reason == EscalationReason::Stalled {
            task.avoid_workers.insert(worker_id.clone());
            let since = task.last_heartbeat_at.unwrap_or(assigned_at);
            FailureCause::Stalled {
                silent_for: (now - since).to_std().unwrap_or_default(),
            }
        } else {
            FailureCause::AssignmentTimeout {
                waited: (now - assigned_at).to_std().unwrap_or_default(),
            }
        };

        let stall = Error::Stall {
            task: event.task_id.clone(),
            worker: worker_id.clone(),
            detail: detail.clone(),
        };
        self.raise_alert(
            event.task_id.clone(),
            Some(worker_id.clone()),
            reason,
            stall.to_string(),
            now,
        );
        self.emit(Event::cancel(
            event.task_id.clone(),
            Some(worker_id),
            Some(assignment_id.clone()),
            format!("reassigning: {detail}"),
            EventSource::Coordinator,
            now,
        ));
        self.fail_assignment(&event.task_id, &assignment_id, cause, now)
    }

    /// Release the assignment once, then let recovery decide the task's fate.
    fn fail_assignment(
        &mut self,
        task_id: &TaskId,
        assignment_id: &AssignmentId,
        cause: FailureCause,
        now: DateTime<Utc>,
    ) -> Result<Disposition> {
        let Some(assignment) = self.release(assignment_id) else {
            return Ok(Disposition::Stale);
        };
        let task = self.tasks.require_mut(task_id)?;
        match self.recovery.recover(task, &cause, now) {
            RecoveryOutcome::Requeued { .. } => self.settle(task_id, now),
            RecoveryOutcome::Terminal { attempts, reason } => {
                let failure = Error::TerminalFailure {
                    task: task_id.clone(),
                    attempts,
                    reason,
                };
                self.escalate(
                    task_id.clone(),
                    Some(assignment.worker_id),
                    Some(assignment.id),
                    EscalationReason::RetriesExhausted,
                    failure.to_string(),
                    now,
                );
            }
        }
        Ok(Disposition::Applied)
    }

    // ---------------------------------------------------------------------
    // Scheduling
    // ---------------------------------------------------------------------

    /// Make every match currently possible. Returns the new assignments.
    pub fn schedule(&mut self) -> Vec<Assignment> {
        let mut made = Vec::new();
        while let Some(next) = self
            .scheduler
            .next_match(&self.tasks, &self.graph, &self.workers)
        {
            match self.assign(&next.task_id, &next.worker_id) {
                Ok(assignment) => made.push(assignment),
                Err(e) => {
                    warn!(
                        task_id = %next.task_id,
                        worker_id = %next.worker_id,
                        error = %e,
                        "assignment rejected"
                    );
                    if let Some(task) = self.tasks.get(&next.task_id) {
                        self.scheduler.mark_ready(task);
                    }
                    break;
                }
            }
        }
        made
    }

    /// Bind `task` to `worker`: task to `assigned` and worker load +1, or neither.
    pub fn assign(&mut self, task_id: &TaskId, worker_id: &WorkerId) -> Result<Assignment> {
        let task = self.tasks.require(task_id)?;
        if task.status != TaskStatus::Pending {
            return Err(Error::InvalidTransition {
                task: task_id.clone(),
                from: task.status,
                to: TaskStatus::Assigned,
            });
        }
        let waiting = self.graph.unsatisfied_dependencies(task_id, &self.tasks);
        if !waiting.is_empty() {
            return Err(Error::validation(format!(
                "task {task_id} still waits on {} dependency(ies)",
                waiting.len()
            )));
        }
        let worker = self.workers.require(worker_id)?;
        if !worker.has_capabilities(&task.required_capabilities) {
            return Err(Error::validation(format!(
                "worker {worker_id} lacks capabilities required by {task_id}"
            )));
        }
        if worker.availability != Availability::Available {
            return Err(Error::validation(format!(
                "worker {worker_id} is {:?}",
                worker.availability
            )));
        }
        let attempt = task.attempt_count + 1;
        let title = task.title.clone();

        self.workers.acquire(worker_id)?;

        let now = self.clock.now();
        let assignment = Assignment {
            id: self.ids.generate_assignment_id(),
            task_id: task_id.clone(),
            worker_id: worker_id.clone(),
            assigned_at: now,
        };
        let Some(task) = self.tasks.get_mut(task_id) else {
            self.workers.release(worker_id);
            return Err(Error::UnknownTask(task_id.clone()));
        };
        task.mark_assigned(worker_id.clone(), assignment.id.clone(), now);
        self.ledger.open(assignment.clone());

        info!(
            task_id = %task_id,
            worker_id = %worker_id,
            assignment_id = %assignment.id,
            attempt,
            "task assigned"
        );
        self.emit(Event::assign(
            task_id.clone(),
            worker_id.clone(),
            assignment.id.clone(),
            title,
            attempt,
            now,
        ));
        Ok(assignment)
    }

    // ---------------------------------------------------------------------
    // Alerts
    // ---------------------------------------------------------------------

    pub fn acknowledge_alert(&mut self, alert_id: &AlertId) -> Result<()> {
        let alert = self
            .alerts
            .items
            .iter_mut()
            .find(|a| &a.id == alert_id)
            .ok_or_else(|| Error::validation(format!("unknown alert: {alert_id}")))?;
        alert.acknowledged = true;
        Ok(())
    }

    fn raise_alert(
        &mut self,
        task_id: TaskId,
        worker_id: Option<WorkerId>,
        reason: EscalationReason,
        message: String,
        now: DateTime<Utc>,
    ) {
        let alert = Alert::new(
            self.ids.generate_alert_id(),
            task_id,
            worker_id,
            reason,
            message,
            now,
        );
        match alert.severity {
            Severity::Critical => error!(
                alert_id = %alert.id,
                task_id = %alert.task_id,
                reason = %alert.reason,
                message = %alert.message,
                "alert raised"
            ),
            _ => warn!(
                alert_id = %alert.id,
                task_id = %alert.task_id,
                reason = %alert.reason,
                message = %alert.message,
                "alert raised"
            ),
        }
        self.alerts.push(alert.clone());
        self.effects.push(Effect::Alert(alert));
    }

    /// Alert plus an `escalate` event on the router.
    fn escalate(
        &mut self,
        task_id: TaskId,
        worker_id: Option<WorkerId>,
        assignment_id: Option<AssignmentId>,
        reason: EscalationReason,
        message: String,
        now: DateTime<Utc>,
    ) {
        self.raise_alert(task_id.clone(), worker_id.clone(), reason, message.clone(), now);
        self.emit(Event::escalate(
            task_id,
            worker_id,
            assignment_id,
            reason,
            message,
            EventSource::Coordinator,
            now,
        ));
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    /// Close an assignment and give the slot back. `None` if it was already closed.
    fn release(&mut self, assignment_id: &AssignmentId) -> Option<Assignment> {
        let assignment = self.ledger.close(assignment_id)?;
        self.workers.release(&assignment.worker_id);
        debug!(
            assignment_id = %assignment.id,
            worker_id = %assignment.worker_id,
            "assignment released"
        );
        Some(assignment)
    }

    /// Re-derive pending/blocked for an idle task and queue it if ready.
    fn settle(&mut self, task_id: &TaskId, now: DateTime<Utc>) {
        let satisfied = self.graph.dependencies_satisfied(task_id, &self.tasks);
        let Some(task) = self.tasks.get_mut(task_id) else {
            return;
        };
        if !matches!(task.status, TaskStatus::Pending | TaskStatus::Blocked) {
            return;
        }
        if satisfied {
            if task.status != TaskStatus::Pending {
                task.mark_pending(now);
                debug!(task_id = %task_id, "task unblocked");
            }
            self.scheduler.mark_ready(task);
        } else if task.status != TaskStatus::Blocked {
            task.mark_blocked(now);
        }
    }

    fn emit(&mut self, event: Event) {
        self.audit.push(AuditEntry {
            recorded_at: event.timestamp,
            event: event.clone(),
            disposition: None,
        });
        self.effects.push(Effect::Publish(event));
    }

    pub fn drain_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    pub fn task(&self, task_id: &TaskId) -> Option<&TaskRecord> {
        self.tasks.get(task_id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskRecord> {
        self.tasks.iter()
    }

    pub fn task_view(&self, task_id: &TaskId) -> Result<TaskView> {
        self.tasks.require(task_id).map(TaskView::from)
    }

    /// Matching tasks, sorted by id.
    pub fn query_tasks(&self, query: &TaskQuery) -> Vec<TaskView> {
        self.tasks
            .sorted()
            .into_iter()
            .filter(|t| query.matches(t))
            .map(TaskView::from)
            .collect()
    }

    pub fn worker(&self, worker_id: &WorkerId) -> Option<&WorkerRecord> {
        self.workers.get(worker_id)
    }

    pub fn workers(&self) -> impl Iterator<Item = &WorkerRecord> {
        self.workers.iter()
    }

    pub fn active_assignments(&self) -> usize {
        self.ledger.len()
    }

    /// Pending tasks whose dependencies have all completed, sorted by id.
    pub fn ready_set(&self) -> Vec<TaskId> {
        let mut ready: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|t| self.graph.is_ready(&t.id, &self.tasks))
            .map(|t| t.id.clone())
            .collect();
        ready.sort();
        ready
    }

    pub fn topo_order(&self) -> Vec<TaskId> {
        self.graph.topo_order().collect()
    }

    pub fn dependents(&self, task_id: &TaskId) -> Vec<TaskId> {
        self.graph.dependents(task_id)
    }

    pub fn liveness_probes(&self) -> Vec<LivenessProbe> {
        let mut probes: Vec<LivenessProbe> = self
            .ledger
            .iter()
            .filter_map(|a| {
                let task = self.tasks.get(&a.task_id)?;
                Some(LivenessProbe {
                    task_id: a.task_id.clone(),
                    worker_id: a.worker_id.clone(),
                    assignment_id: a.id.clone(),
                    status: task.status,
                    assigned_at: a.assigned_at,
                    last_heartbeat_at: task.last_heartbeat_at,
                })
            })
            .collect();
        probes.sort_by(|a, b| {
            a.assigned_at
                .cmp(&b.assigned_at)
                .then_with(|| a.assignment_id.cmp(&b.assignment_id))
        });
        probes
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.items.iter().cloned().collect()
    }

    pub fn open_alerts(&self) -> usize {
        self.alerts.items.iter().filter(|a| !a.acknowledged).count()
    }

    /// The newest `limit` audit entries, oldest first.
    pub fn events(&self, limit: usize) -> Vec<AuditEntry> {
        let skip = self.audit.items.len().saturating_sub(limit);
        self.audit.items.iter().skip(skip).cloned().collect()
    }

    pub fn status_report(&self) -> StatusReport {
        let counts = self.tasks.count_by_status();
        StatusReport {
            generated_at: self.clock.now(),
            state: OverallState::from_counts(&counts),
            counts,
            open_alerts: self.open_alerts(),
            tasks: self.tasks.sorted().into_iter().map(TaskView::from).collect(),
            workers: self.workers.sorted().into_iter().map(WorkerView::from).collect(),
        }
    }

    // ---------------------------------------------------------------------
    // Persistence
    // ---------------------------------------------------------------------

    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(
            self.clock.now(),
            self.tasks.sorted().into_iter().cloned().collect(),
            self.workers.sorted().into_iter().cloned().collect(),
        )
    }

    /// Replace all state with `snapshot`.
    ///
    /// The graph is rebuilt and checked for unknown ids and cycles; the ledger and
    /// worker loads are rebuilt from the active tasks. An active task whose worker is
    /// missing from the snapshot goes back to pending. Nothing changes on error.
    pub fn restore(&mut self, snapshot: Snapshot) -> Result<()> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(Error::validation(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        let now = self.clock.now();

        let edges: Vec<(TaskId, TaskId)> = snapshot
            .tasks
            .iter()
            .flat_map(|t| t.dependencies.iter().map(|d| (t.id.clone(), d.clone())))
            .collect();
        let graph = DependencyGraph::from_edges(snapshot.tasks.iter().map(|t| t.id.clone()), edges)?;

        let known_workers: HashSet<&WorkerId> = snapshot.workers.iter().map(|w| &w.id).collect();
        let mut ledger = AssignmentLedger::new();
        let mut loads: HashMap<WorkerId, u32> = HashMap::new();
        let mut tasks = TaskStore::new();
        for mut record in snapshot.tasks.iter().cloned() {
            if record.status.is_active() {
                match (&record.assigned_worker, &record.assignment_id, record.assigned_at) {
                    (Some(worker), Some(id), Some(at)) if known_workers.contains(worker) => {
                        *loads.entry(worker.clone()).or_default() += 1;
                        ledger.open(Assignment {
                            id: id.clone(),
                            task_id: record.id.clone(),
                            worker_id: worker.clone(),
                            assigned_at: at,
                        });
                    }
                    _ => record.requeue("assignment lost across restore", false, now),
                }
            }
            tasks.insert(record)?;
        }

        let mut workers = WorkerRegistry::new();
        for mut worker in snapshot.workers.iter().cloned() {
            worker.current_load = loads.get(&worker.id).copied().unwrap_or(0);
            if worker.current_load > worker.capacity {
                return Err(Error::Capacity {
                    worker: worker.id,
                    capacity: worker.capacity,
                });
            }
            workers.insert_record(worker)?;
        }

        self.tasks = tasks;
        self.graph = graph;
        self.workers = workers;
        self.ledger = ledger;
        self.scheduler.clear();
        let ids: Vec<TaskId> = self.tasks.sorted().into_iter().map(|t| t.id.clone()).collect();
        for id in &ids {
            self.settle(id, now);
        }
        info!(
            tasks = self.tasks.len(),
            workers = self.workers.len(),
            active = self.ledger.len(),
            "state restored from snapshot"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DefaultDecider, Priority};
    use crate::ports::{ManualClock, UlidGenerator};
    use chrono::{Duration, TimeZone};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    struct Harness {
        clock: Arc<ManualClock>,
        engine: Engine,
    }

    fn harness(max_retries: u32) -> Harness {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap(),
        ));
        let engine = Engine::new(
            clock.clone(),
            Arc::new(UlidGenerator::new(clock.clone())),
            Arc::new(DefaultDecider::new(max_retries)),
            EngineLimits::default(),
        );
        Harness { clock, engine }
    }

    fn id(s: &str) -> TaskId {
        TaskId::new(s)
    }

    fn wid(s: &str) -> WorkerId {
        WorkerId::new(s)
    }

    impl Harness {
        fn status(&self, task: &str) -> TaskStatus {
            self.engine.task(&id(task)).unwrap().status
        }

        fn load(&self, worker: &str) -> u32 {
            self.engine.worker(&wid(worker)).unwrap().current_load
        }

        fn assignment_of(&self, task: &str) -> (WorkerId, AssignmentId) {
            let t = self.engine.task(&id(task)).unwrap();
            (t.assigned_worker.clone().unwrap(), t.assignment_id.clone().unwrap())
        }

        fn complete(&mut self, task: &str) -> Disposition {
            let (w, a) = self.assignment_of(task);
            let event = Event::completed(id(task), w, a, self.clock.now());
            self.engine.handle_event(event).unwrap()
        }

        fn fail(&mut self, task: &str) -> Disposition {
            let (w, a) = self.assignment_of(task);
            let event = Event::failed(id(task), w, a, "exit status 1", self.clock.now());
            self.engine.handle_event(event).unwrap()
        }

        fn published(&mut self) -> Vec<Event> {
            self.engine
                .drain_effects()
                .into_iter()
                .filter_map(|e| match e {
                    Effect::Publish(event) => Some(event),
                    Effect::Alert(_) => None,
                })
                .collect()
        }
    }

    #[test]
    fn critical_task_is_assigned_before_high() {
        let mut h = harness(3);
        h.engine
            .submit(TaskSpec::new("T1", "high").with_priority(Priority::High))
            .unwrap();
        h.engine
            .submit(TaskSpec::new("T2", "critical").with_priority(Priority::Critical))
            .unwrap();
        h.engine.register_worker(WorkerSpec::new("W", 1)).unwrap();

        let made = h.engine.schedule();
        assert_eq!(made.len(), 1);
        assert_eq!(made[0].task_id, id("T2"));
        assert_eq!(h.status("T2"), TaskStatus::Assigned);
        assert_eq!(h.status("T1"), TaskStatus::Pending);

        let assigns: Vec<Event> = h
            .published()
            .into_iter()
            .filter(|e| e.kind == EventKind::Assign)
            .collect();
        assert_eq!(assigns.len(), 1);
        assert_eq!(assigns[0].worker_id, Some(wid("W")));
    }

    #[test]
    fn dependents_of_exhausted_task_stay_blocked() {
        let mut h = harness(3);
        h.engine.submit(TaskSpec::new("T2", "flaky")).unwrap();
        h.engine
            .submit(TaskSpec::new("T3", "after T2").depends_on("T2"))
            .unwrap();
        h.engine.register_worker(WorkerSpec::new("W", 1)).unwrap();
        assert_eq!(h.status("T3"), TaskStatus::Blocked);

        for _ in 0..4 {
            h.engine.schedule();
            assert_eq!(h.status("T2"), TaskStatus::Assigned);
            assert_eq!(h.fail("T2"), Disposition::Applied);
            assert_eq!(h.status("T3"), TaskStatus::Blocked);
        }

        assert_eq!(h.status("T2"), TaskStatus::Failed);
        assert_eq!(h.engine.task(&id("T2")).unwrap().attempt_count, 3);
        assert_eq!(h.load("W"), 0);
        assert!(h.engine.schedule().is_empty());
        assert_eq!(h.status("T3"), TaskStatus::Blocked);

        let alerts = h.engine.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].reason, EscalationReason::RetriesExhausted);
        assert_eq!(alerts[0].severity, Severity::Critical);
        assert!(h.published().iter().any(|e| e.kind == EventKind::Escalate));
    }

    #[test]
    fn stalled_task_moves_to_another_worker() {
        let mut h = harness(3);
        h.engine.register_worker(WorkerSpec::new("W", 1)).unwrap();
        h.engine.submit(TaskSpec::new("T4", "long job")).unwrap();
        h.engine.schedule();
        let (w, a) = h.assignment_of("T4");
        assert_eq!(w, wid("W"));
        h.engine
            .handle_event(Event::progress(id("T4"), w.clone(), a.clone(), Some(10.0), None, h.clock.now()))
            .unwrap();
        assert_eq!(h.status("T4"), TaskStatus::InProgress);

        h.engine.register_worker(WorkerSpec::new("W2", 1)).unwrap();
        h.clock.advance(Duration::seconds(301));
        let escalation = Event::escalate(
            id("T4"),
            Some(w.clone()),
            Some(a.clone()),
            EscalationReason::Stalled,
            "no heartbeat for 301s",
            EventSource::Monitor,
            h.clock.now(),
        );
        assert_eq!(h.engine.handle_event(escalation).unwrap(), Disposition::Applied);
        let task = h.engine.task(&id("T4")).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempt_count, 1);
        assert_eq!(h.load("W"), 0);

        let made = h.engine.schedule();
        assert_eq!(made[0].worker_id, wid("W2"));
        assert_eq!(h.engine.task(&id("T4")).unwrap().attempt_count, 1);

        let published = h.published();
        assert!(published.iter().any(|e| e.kind == EventKind::Cancel && e.worker_id == Some(wid("W"))));
    }

    #[test]
    fn late_failure_after_stall_is_stale() {
        let mut h = harness(3);
        h.engine.register_worker(WorkerSpec::new("W", 2)).unwrap();
        h.engine.submit(TaskSpec::new("T", "t")).unwrap();
        h.engine.schedule();
        let (w, a) = h.assignment_of("T");

        h.clock.advance(Duration::seconds(400));
        let escalation = Event::escalate(
            id("T"),
            Some(w.clone()),
            Some(a.clone()),
            EscalationReason::Stalled,
            "silent",
            EventSource::Monitor,
            h.clock.now(),
        );
        h.engine.handle_event(escalation.clone()).unwrap();
        assert_eq!(h.load("W"), 0);
        let late = Event::failed(id("T"), w.clone(), a.clone(), "gave up", h.clock.now());
        assert_eq!(h.engine.handle_event(late).unwrap(), Disposition::Stale);
        assert_eq!(h.engine.handle_event(escalation).unwrap(), Disposition::Stale);
        assert_eq!(h.load("W"), 0);
        assert_eq!(h.engine.task(&id("T")).unwrap().attempt_count, 1);
    }

    #[test]
    fn task_waits_until_its_only_worker_is_available() {
        let mut h = harness(3);
        h.engine
            .register_worker(WorkerSpec::new("gpu", 1).with_capability("cuda"))
            .unwrap();
        h.engine.register_worker(WorkerSpec::new("cpu", 1)).unwrap();
        h.engine
            .set_availability(&wid("gpu"), Availability::Unavailable)
            .unwrap();
        h.engine
            .submit(TaskSpec::new("T", "render").requires("cuda"))
            .unwrap();

        assert!(h.engine.schedule().is_empty());
        assert_eq!(h.status("T"), TaskStatus::Pending);
        assert_eq!(h.load("cpu"), 0);

        let previous = h
            .engine
            .set_availability(&wid("gpu"), Availability::Available)
            .unwrap();
        assert_eq!(previous, Availability::Unavailable);
        let made = h.engine.schedule();
        assert_eq!(made.len(), 1);
        assert_eq!(made[0].worker_id, wid("gpu"));
        assert_eq!(h.status("T"), TaskStatus::Assigned);
        assert_eq!(h.load("gpu"), 1);
    }

    #[test]
    fn assignment_timeout_frees_the_slot_and_reassigns() {
        let mut h = harness(3);
        h.engine.register_worker(WorkerSpec::new("W", 1)).unwrap();
        h.engine.submit(TaskSpec::new("T", "slow start")).unwrap();
        h.engine.schedule();
        let (w, first) = h.assignment_of("T");
        assert_eq!(h.load("W"), 1);
        h.published();

        h.clock.advance(Duration::seconds(130));
        let timeout = Event::escalate(
            id("T"),
            Some(w.clone()),
            Some(first.clone()),
            EscalationReason::AssignmentTimeout,
            "not started after 130s",
            EventSource::Monitor,
            h.clock.now(),
        );
        assert_eq!(h.engine.handle_event(timeout.clone()).unwrap(), Disposition::Applied);
        let task = h.engine.task(&id("T")).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.assignment_id.is_none());
        assert!(!task.avoid_workers.contains(&w), "only stalls mark a worker to avoid");
        assert_eq!(h.load("W"), 0);
        assert_eq!(h.engine.active_assignments(), 0);

        let alerts = h.engine.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].reason, EscalationReason::AssignmentTimeout);
        assert!(h.published().iter().any(|e| e.kind == EventKind::Cancel
            && e.assignment_id.as_ref() == Some(&first)));

        let made = h.engine.schedule();
        assert_eq!(made.len(), 1);
        assert_eq!(made[0].worker_id, w);
        assert_ne!(made[0].id, first);
        assert_eq!(h.load("W"), 1);

        // A repeat of the escalation names the released assignment.
        assert_eq!(h.engine.handle_event(timeout).unwrap(), Disposition::Stale);
        assert_eq!(h.status("T"), TaskStatus::Assigned);
        assert_eq!(h.assignment_of("T").1, made[0].id);
        assert_eq!(h.load("W"), 1);
        assert_eq!(h.engine.alerts().len(), 1);
    }

    #[test]
    fn task_queries_filter_by_worker_priority_and_status() {
        let mut h = harness(3);
        h.engine.register_worker(WorkerSpec::new("W1", 1)).unwrap();
        h.engine
            .submit_batch(vec![
                TaskSpec::new("A", "urgent").with_priority(Priority::Critical),
                TaskSpec::new("B", "after A").depends_on("A"),
                TaskSpec::new("C", "also urgent")
                    .with_priority(Priority::Critical)
                    .depends_on("A"),
            ])
            .unwrap();
        h.engine.schedule();

        let ids = |views: Vec<TaskView>| views.into_iter().map(|v| v.id).collect::<Vec<_>>();
        assert_eq!(
            ids(h.engine.query_tasks(&TaskQuery::all().worker(wid("W1")))),
            vec![id("A")]
        );
        assert!(h.engine.query_tasks(&TaskQuery::all().worker(wid("W9"))).is_empty());
        assert_eq!(
            ids(h.engine.query_tasks(&TaskQuery::all().priority(Priority::Critical))),
            vec![id("A"), id("C")]
        );
        assert_eq!(
            ids(h.engine.query_tasks(&TaskQuery::all().status(TaskStatus::Blocked))),
            vec![id("B"), id("C")]
        );
        assert_eq!(
            ids(h.engine.query_tasks(
                &TaskQuery::all()
                    .status(TaskStatus::Blocked)
                    .priority(Priority::Critical)
            )),
            vec![id("C")]
        );

        h.complete("A");
        assert!(h.engine.query_tasks(&TaskQuery::all().worker(wid("W1"))).is_empty());
        assert!(h.engine.query_tasks(&TaskQuery::all().status(TaskStatus::Blocked)).is_empty());
    }

    #[test]
    fn deregistration_requeues_exactly_once() {
        let mut h = harness(3);
        h.engine.register_worker(WorkerSpec::new("W", 2)).unwrap();
        h.engine.submit(TaskSpec::new("A", "a")).unwrap();
        h.engine.submit(TaskSpec::new("B", "b")).unwrap();
        h.engine.schedule();
        let (w, a) = h.assignment_of("A");

        let mut requeued = h.engine.deregister_worker(&wid("W")).unwrap();
        requeued.sort();
        assert_eq!(requeued, vec![id("A"), id("B")]);
        for task in ["A", "B"] {
            let record = h.engine.task(&id(task)).unwrap();
            assert_eq!(record.status, TaskStatus::Pending);
            assert_eq!(record.attempt_count, 0);
        }
        assert_eq!(h.engine.active_assignments(), 0);
        assert_eq!(h.engine.alerts().len(), 2);

        let late = Event::failed(id("A"), w, a, "lost", h.clock.now());
        assert_eq!(h.engine.handle_event(late).unwrap(), Disposition::Stale);
        assert_eq!(h.engine.ready_set(), vec![id("A"), id("B")]);
        assert!(h.engine.deregister_worker(&wid("W")).is_err());
    }

    #[test]
    fn duplicate_completion_is_a_noop() {
        let mut h = harness(3);
        h.engine.register_worker(WorkerSpec::new("W", 1)).unwrap();
        h.engine.submit(TaskSpec::new("A", "a")).unwrap();
        h.engine.submit(TaskSpec::new("B", "b").depends_on("A")).unwrap();
        h.engine.schedule();
        let (w, a) = h.assignment_of("A");
        let done = Event::completed(id("A"), w, a, h.clock.now());

        assert_eq!(h.engine.handle_event(done.clone()).unwrap(), Disposition::Applied);
        let once = h.engine.snapshot();
        assert_eq!(h.engine.handle_event(done).unwrap(), Disposition::Duplicate);
        let twice = h.engine.snapshot();
        assert_eq!(once.tasks, twice.tasks);
        assert_eq!(once.workers, twice.workers);
        assert_eq!(h.status("B"), TaskStatus::Pending);
    }

    #[test]
    fn batch_is_all_or_nothing() {
        let mut h = harness(3);
        h.engine.submit(TaskSpec::new("base", "base")).unwrap();

        let cyclic = vec![
            TaskSpec::new("x", "x").depends_on("y"),
            TaskSpec::new("y", "y").depends_on("x"),
        ];
        assert!(matches!(h.engine.submit_batch(cyclic), Err(Error::Cycle { .. })));

        let unknown = vec![
            TaskSpec::new("x", "x").depends_on("base"),
            TaskSpec::new("y", "y").depends_on("ghost"),
        ];
        assert!(matches!(h.engine.submit_batch(unknown), Err(Error::UnknownTask(_))));
        assert!(h.engine.task(&id("x")).is_none());

        let ok = vec![
            TaskSpec::new("y", "y").depends_on("x"),
            TaskSpec::new("x", "x").depends_on("base"),
        ];
        assert_eq!(h.engine.submit_batch(ok).unwrap().len(), 2);
        assert_eq!(h.engine.topo_order(), vec![id("base"), id("x"), id("y")]);
        assert!(matches!(
            h.engine.submit(TaskSpec::new("base", "again")),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn tasks_without_id_get_one_minted() {
        let mut h = harness(3);
        let mut spec = TaskSpec::new("ignored", "anonymous");
        spec.id = None;
        let minted = h.engine.submit(spec).unwrap();
        assert!(minted.as_str().starts_with("task-"));
    }

    #[test]
    fn add_dependency_guards_state() {
        let mut h = harness(3);
        h.engine.register_worker(WorkerSpec::new("W", 1)).unwrap();
        h.engine.submit(TaskSpec::new("A", "a")).unwrap();
        h.engine.submit(TaskSpec::new("B", "b")).unwrap();
        h.engine.submit(TaskSpec::new("C", "c")).unwrap();

        h.engine.add_dependency(&id("B"), &id("C")).unwrap();
        assert_eq!(h.status("B"), TaskStatus::Blocked);
        assert!(matches!(
            h.engine.add_dependency(&id("C"), &id("B")),
            Err(Error::Cycle { .. })
        ));
        assert!(matches!(
            h.engine.add_dependency(&id("A"), &id("nope")),
            Err(Error::UnknownTask(_))
        ));

        h.engine.schedule();
        let active = if h.status("A") == TaskStatus::Assigned { "A" } else { "C" };
        let other = if active == "A" { "C" } else { "A" };
        assert!(matches!(
            h.engine.add_dependency(&id(active), &id(other)),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn cancel_releases_and_stops_propagation() {
        let mut h = harness(3);
        h.engine.register_worker(WorkerSpec::new("W", 1)).unwrap();
        h.engine.submit(TaskSpec::new("A", "a")).unwrap();
        h.engine.submit(TaskSpec::new("B", "b").depends_on("A")).unwrap();
        h.engine.schedule();
        h.published();

        assert_eq!(h.engine.cancel(&id("A"), "no longer needed").unwrap(), Disposition::Applied);
        assert_eq!(h.load("W"), 0);
        assert_eq!(h.status("B"), TaskStatus::Blocked);
        let cancels: Vec<Event> = h.published();
        assert_eq!(cancels.len(), 1);
        assert_eq!(cancels[0].kind, EventKind::Cancel);

        assert_eq!(h.engine.cancel(&id("A"), "again").unwrap(), Disposition::Duplicate);

        assert_eq!(h.engine.override_blocked(&id("B")).unwrap(), vec![id("A")]);
        assert_eq!(h.status("B"), TaskStatus::Pending);
        h.engine.schedule();
        h.complete("B");
        assert!(matches!(
            h.engine.cancel(&id("B"), "late"),
            Err(Error::InvalidTransition { .. })
        ));
    }

    #[test]
    fn hold_and_release() {
        let mut h = harness(3);
        h.engine.register_worker(WorkerSpec::new("W", 1)).unwrap();
        h.engine.submit(TaskSpec::new("A", "a")).unwrap();
        h.engine.submit(TaskSpec::new("B", "b").depends_on("A")).unwrap();
        h.engine.hold(&id("A")).unwrap();
        h.engine.hold(&id("B")).unwrap();
        assert!(h.engine.schedule().is_empty());

        h.engine.release_hold(&id("B")).unwrap();
        assert_eq!(h.status("B"), TaskStatus::Blocked);
        h.engine.release_hold(&id("A")).unwrap();
        assert_eq!(h.engine.schedule().len(), 1);
        assert!(h.engine.release_hold(&id("A")).is_err());
    }

    #[test]
    fn resubmit_restores_budget() {
        let mut h = harness(0);
        h.engine.register_worker(WorkerSpec::new("W", 1)).unwrap();
        h.engine.submit(TaskSpec::new("A", "a")).unwrap();
        h.engine.submit(TaskSpec::new("B", "b").depends_on("A")).unwrap();
        h.engine.schedule();
        h.fail("A");
        assert_eq!(h.status("A"), TaskStatus::Failed);

        h.engine.resubmit(&id("A")).unwrap();
        h.engine.schedule();
        h.complete("A");
        assert_eq!(h.status("B"), TaskStatus::Pending);

        let alert = h.engine.alerts()[0].id.clone();
        assert_eq!(h.engine.open_alerts(), 1);
        h.engine.acknowledge_alert(&alert).unwrap();
        assert_eq!(h.engine.open_alerts(), 0);
    }

    #[test]
    fn progress_starts_work_and_validates_percentage() {
        let mut h = harness(3);
        h.engine.register_worker(WorkerSpec::new("W", 1)).unwrap();
        h.engine.submit(TaskSpec::new("A", "a")).unwrap();
        h.engine.schedule();
        let (w, a) = h.assignment_of("A");

        let seen = h.engine.worker(&w).unwrap().last_seen_at;
        h.clock.advance(Duration::seconds(5));
        let bad = Event::progress(id("A"), w.clone(), a.clone(), Some(140.0), None, h.clock.now());
        assert!(matches!(h.engine.handle_event(bad), Err(Error::Validation(_))));
        assert_eq!(h.status("A"), TaskStatus::Assigned);
        assert_eq!(
            h.engine.worker(&w).unwrap().last_seen_at,
            seen,
            "rejected report is no sign of life"
        );

        let ok = Event::progress(id("A"), w.clone(), a.clone(), Some(40.0), Some("halfway-ish".into()), h.clock.now());
        h.engine.handle_event(ok).unwrap();
        let task = h.engine.task(&id("A")).unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.progress, 40.0);
        assert_eq!(h.engine.worker(&w).unwrap().last_seen_at, h.clock.now());

        let old = Event::heartbeat(id("A"), w, a, h.clock.now() - Duration::seconds(30));
        assert_eq!(h.engine.handle_event(old).unwrap(), Disposition::Duplicate);
        assert!(!h.engine.events(100).is_empty());
    }

    #[test]
    fn dependency_invariant_holds_under_random_completion() {
        for seed in 0..20u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut h = harness(2);
            for w in 0..3 {
                h.engine
                    .register_worker(WorkerSpec::new(format!("W{w}"), rng.gen_range(1..=3)))
                    .unwrap();
            }
            let n = 25;
            let mut specs = Vec::new();
            for i in 0..n {
                let mut spec = TaskSpec::new(format!("T{i:02}"), "random");
                for j in 0..i {
                    if rng.gen_bool(0.15) {
                        spec = spec.depends_on(format!("T{j:02}"));
                    }
                }
                specs.push(spec);
            }
            h.engine.submit_batch(specs).unwrap();

            for _ in 0..1_000 {
                h.engine.schedule();
                for task in h.engine.tasks.iter() {
                    if task.status.is_active() {
                        for dep in &task.dependencies {
                            assert_eq!(h.engine.tasks.status_of(dep), Some(TaskStatus::Completed));
                        }
                    }
                }
                for worker in h.engine.workers() {
                    assert!(worker.current_load <= worker.capacity);
                }
                let active: Vec<TaskId> = h
                    .engine
                    .tasks
                    .iter()
                    .filter(|t| t.status.is_active())
                    .map(|t| t.id.clone())
                    .collect();
                if active.is_empty() {
                    break;
                }
                let mut active = active;
                active.sort();
                let pick = active[rng.gen_range(0..active.len())].clone();
                if rng.gen_bool(0.2) {
                    h.fail(pick.as_str());
                } else {
                    h.complete(pick.as_str());
                }
            }
            assert_eq!(h.engine.active_assignments(), 0);
        }
    }

    #[test]
    fn snapshot_round_trip_keeps_ready_set() {
        let mut h = harness(3);
        h.engine.register_worker(WorkerSpec::new("W", 1).with_capability("rust")).unwrap();
        h.engine.submit(TaskSpec::new("A", "a")).unwrap();
        h.engine.submit(TaskSpec::new("B", "b").depends_on("A")).unwrap();
        h.engine.submit(TaskSpec::new("C", "c")).unwrap();
        h.engine.submit(TaskSpec::new("D", "d").depends_on("C")).unwrap();
        h.engine.schedule();
        h.complete("A");
        h.engine.schedule();

        let json = h.engine.snapshot().to_json().unwrap();
        let mut restored = harness(3);
        restored.engine.restore(Snapshot::from_json(&json).unwrap()).unwrap();

        assert_eq!(restored.engine.ready_set(), h.engine.ready_set());
        assert_eq!(restored.engine.active_assignments(), h.engine.active_assignments());
        assert_eq!(restored.load("W"), h.load("W"));
        assert_eq!(restored.engine.topo_order(), h.engine.topo_order());
    }

    #[test]
    fn restore_rejects_cycles() {
        let mut h = harness(3);
        h.engine.submit(TaskSpec::new("A", "a")).unwrap();
        h.engine.submit(TaskSpec::new("B", "b").depends_on("A")).unwrap();
        let mut snapshot = h.engine.snapshot();
        snapshot.tasks[0].dependencies.insert(id("B"));

        let mut other = harness(3);
        assert!(matches!(other.engine.restore(snapshot), Err(Error::Cycle { .. })));
        assert!(other.engine.task(&id("A")).is_none());
    }

    #[test]
    fn assign_refuses_full_worker() {
        let mut h = harness(3);
        h.engine.register_worker(WorkerSpec::new("W", 1)).unwrap();
        h.engine.submit(TaskSpec::new("A", "a")).unwrap();
        h.engine.submit(TaskSpec::new("B", "b")).unwrap();
        h.engine.assign(&id("A"), &wid("W")).unwrap();
        assert!(matches!(
            h.engine.assign(&id("B"), &wid("W")),
            Err(Error::Capacity { .. })
        ));
        assert_eq!(h.status("B"), TaskStatus::Pending);
        assert_eq!(h.load("W"), 1);
    }
}
