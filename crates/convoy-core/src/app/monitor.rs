//! Monitor: liveness checks over active assignments.
//!
//! The monitor only reads. Each tick it asks the coordinator for a probe per active
//! assignment and publishes an `escalate` event for anything stalled; the coordinator
//! picks the event up from the router and hands it to recovery.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::coordinator::CoordinatorHandle;
use super::router::MessageRouter;
use crate::domain::{
    AssignmentId, EscalationReason, Event, EventSource, TaskId, TaskStatus, WorkerId,
};
use crate::ports::Clock;

/// Liveness facts for one active assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivenessProbe {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub assignment_id: AssignmentId,
    pub status: TaskStatus,
    pub assigned_at: DateTime<Utc>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

impl LivenessProbe {
    /// Time since the last sign of life; assignment time counts as the first.
    pub fn silent_for(&self, now: DateTime<Utc>) -> Duration {
        let since = self.last_heartbeat_at.unwrap_or(self.assigned_at);
        (now - since).to_std().unwrap_or_default()
    }

    pub fn waiting_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.assigned_at).to_std().unwrap_or_default()
    }
}

#[derive(Debug)]
pub struct Monitor {
    stall_timeout: Duration,
    assignment_timeout: Option<Duration>,
    /// Assignments already escalated; at most one escalation per assignment.
    escalated: HashSet<AssignmentId>,
}

impl Monitor {
    pub fn new(stall_timeout: Duration, assignment_timeout: Option<Duration>) -> Self {
        Self {
            stall_timeout,
            assignment_timeout,
            escalated: HashSet::new(),
        }
    }

    pub fn scan(&mut self, probes: &[LivenessProbe], now: DateTime<Utc>) -> Vec<Event> {
        // Forget assignments that are no longer active.
        let live: HashSet<&AssignmentId> = probes.iter().map(|p| &p.assignment_id).collect();
        self.escalated.retain(|id| live.contains(id));

        let mut escalations = Vec::new();
        for probe in probes {
            if self.escalated.contains(&probe.assignment_id) {
                continue;
            }
            let Some((reason, detail)) = self.check(probe, now) else {
                continue;
            };
            self.escalated.insert(probe.assignment_id.clone());
            escalations.push(Event::escalate(
                probe.task_id.clone(),
                Some(probe.worker_id.clone()),
                Some(probe.assignment_id.clone()),
                reason,
                detail,
                EventSource::Monitor,
                now,
            ));
        }
        escalations
    }

    fn check(&self, probe: &LivenessProbe, now: DateTime<Utc>) -> Option<(EscalationReason, String)> {
        let silent = probe.silent_for(now);
        if silent > self.stall_timeout {
            return Some((
                EscalationReason::Stalled,
                format!("no heartbeat for {}s", silent.as_secs()),
            ));
        }
        if probe.status == TaskStatus::Assigned
            && let Some(limit) = self.assignment_timeout
        {
            let waited = probe.waiting_for(now);
            if waited > limit {
                return Some((
                    EscalationReason::AssignmentTimeout,
                    format!("not started after {}s", waited.as_secs()),
                ));
            }
        }
        None
    }

    /// Tick until shutdown, publishing escalations to the router.
    pub async fn run(
        mut self,
        handle: CoordinatorHandle,
        router: MessageRouter,
        clock: Arc<dyn Clock>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let probes = match handle.liveness_probes().await {
                        Ok(probes) => probes,
                        Err(e) => {
                            debug!(error = %e, "coordinator gone, monitor stopping");
                            break;
                        }
                    };
                    for event in self.scan(&probes, clock.now()) {
                        warn!(
                            task_id = %event.task_id,
                            worker_id = ?event.worker_id,
                            assignment_id = ?event.assignment_id,
                            "assignment escalated"
                        );
                        router.publish(event);
                    }
                }
            }
        }
        debug!("monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventKind, EventPayload};
    use chrono::TimeZone;
    use rstest::rstest;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn probe(status: TaskStatus, heartbeat_secs: Option<i64>) -> LivenessProbe {
        LivenessProbe {
            task_id: TaskId::new("T4"),
            worker_id: WorkerId::new("W"),
            assignment_id: AssignmentId::new("a1"),
            status,
            assigned_at: t0(),
            last_heartbeat_at: heartbeat_secs.map(|s| t0() + chrono::Duration::seconds(s)),
        }
    }

    fn reason_of(event: &Event) -> EscalationReason {
        match &event.payload {
            EventPayload::Escalation { reason, .. } => *reason,
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[rstest]
    #[case::fresh(Some(100), 350, false)]
    #[case::exactly_at_limit(Some(50), 350, false)]
    #[case::silent(Some(10), 350, true)]
    #[case::never_beat(None, 301, true)]
    fn stall_detection(#[case] heartbeat: Option<i64>, #[case] now_secs: i64, #[case] stalled: bool) {
        let mut monitor = Monitor::new(Duration::from_secs(300), None);
        let now = t0() + chrono::Duration::seconds(now_secs);
        let events = monitor.scan(&[probe(TaskStatus::InProgress, heartbeat)], now);
        assert_eq!(events.len(), usize::from(stalled));
        if stalled {
            assert_eq!(events[0].kind, EventKind::Escalate);
            assert_eq!(events[0].source, EventSource::Monitor);
            assert_eq!(reason_of(&events[0]), EscalationReason::Stalled);
        }
    }

    #[test]
    fn escalates_once_per_assignment() {
        let mut monitor = Monitor::new(Duration::from_secs(300), None);
        let probes = [probe(TaskStatus::InProgress, None)];
        let later = t0() + chrono::Duration::seconds(400);
        assert_eq!(monitor.scan(&probes, later).len(), 1);
        assert!(monitor.scan(&probes, later + chrono::Duration::seconds(60)).is_empty());

        // A new assignment for the same task is watched afresh.
        let mut next = probe(TaskStatus::InProgress, None);
        next.assignment_id = AssignmentId::new("a2");
        assert_eq!(monitor.scan(&[next], later).len(), 1);
    }

    #[test]
    fn assignment_timeout_only_while_assigned() {
        let mut monitor = Monitor::new(Duration::from_secs(300), Some(Duration::from_secs(60)));
        let now = t0() + chrono::Duration::seconds(90);

        let events = monitor.scan(&[probe(TaskStatus::Assigned, Some(80))], now);
        assert_eq!(reason_of(&events[0]), EscalationReason::AssignmentTimeout);

        let mut other = Monitor::new(Duration::from_secs(300), Some(Duration::from_secs(60)));
        assert!(other.scan(&[probe(TaskStatus::InProgress, Some(80))], now).is_empty());
    }
}
