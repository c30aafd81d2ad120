//! Simulated workers for `convoy run`.
//!
//! Each worker takes its assignments off the router, works them on a timer while
//! sending progress, and then completes, fails or goes silent according to its profile.
//! A cancel aborts the matching job.

use std::collections::HashMap;
use std::time::Duration;

use convoy_core::app::{Delivery, WorkerEndpoint};
use convoy_core::domain::{AssignmentId, EventKind, TaskId};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy)]
pub struct SimProfile {
    /// Chance that a job reports failure.
    pub failure_rate: f64,
    /// Chance that a job never reports again.
    pub stall_rate: f64,
    /// Nominal job length; each job takes between half and one and a half times this.
    pub work: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Complete,
    Fail,
    Stall,
}

enum Report {
    Progress {
        task: TaskId,
        assignment: AssignmentId,
        percent: f32,
    },
    Finished {
        task: TaskId,
        assignment: AssignmentId,
        outcome: Outcome,
    },
}

const PROGRESS_STEPS: u32 = 4;

pub async fn run_worker(
    mut endpoint: WorkerEndpoint,
    profile: SimProfile,
    seed: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut rng = StdRng::seed_from_u64(seed);
    let (report_tx, mut report_rx) = mpsc::channel::<Report>(64);
    let mut jobs: HashMap<TaskId, JoinHandle<()>> = HashMap::new();

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            delivery = endpoint.next() => {
                let Some(delivery) = delivery else { break };
                endpoint.ack(&delivery);
                handle_delivery(&delivery, &profile, &mut rng, &report_tx, &mut jobs);
            }
            Some(report) = report_rx.recv() => match report {
                Report::Progress { task, assignment, percent } => {
                    endpoint.progress(&task, &assignment, Some(percent), None);
                }
                Report::Finished { task, assignment, outcome } => {
                    jobs.remove(&task);
                    match outcome {
                        Outcome::Complete => {
                            endpoint.complete(&task, &assignment);
                        }
                        Outcome::Fail => {
                            endpoint.fail(&task, &assignment, "simulated failure");
                        }
                        Outcome::Stall => {
                            debug!(worker_id = %endpoint.worker_id(), task_id = %task, "going silent");
                        }
                    }
                }
            },
        }
    }

    for (_, job) in jobs.drain() {
        job.abort();
    }
    debug!(worker_id = %endpoint.worker_id(), "simulated worker stopped");
}

fn handle_delivery(
    delivery: &Delivery,
    profile: &SimProfile,
    rng: &mut StdRng,
    reports: &mpsc::Sender<Report>,
    jobs: &mut HashMap<TaskId, JoinHandle<()>>,
) {
    let event = &delivery.event;
    match event.kind {
        EventKind::Assign => {
            let Some(assignment) = event.assignment_id.clone() else {
                return;
            };
            // A redelivered assign for a job already running.
            if jobs.contains_key(&event.task_id) {
                return;
            }
            let outcome = if rng.gen_bool(profile.stall_rate) {
                Outcome::Stall
            } else if rng.gen_bool(profile.failure_rate) {
                Outcome::Fail
            } else {
                Outcome::Complete
            };
            let base = profile.work.as_millis() as u64;
            let length = Duration::from_millis(rng.gen_range(base / 2..=base + base / 2));
            info!(task_id = %event.task_id, ?outcome, "simulated job started");
            let job = tokio::spawn(work(
                event.task_id.clone(),
                assignment,
                length,
                outcome,
                reports.clone(),
            ));
            jobs.insert(event.task_id.clone(), job);
        }
        EventKind::Cancel => {
            if let Some(job) = jobs.remove(&event.task_id) {
                job.abort();
                info!(task_id = %event.task_id, "simulated job cancelled");
            }
        }
        _ => {}
    }
}

async fn work(
    task: TaskId,
    assignment: AssignmentId,
    length: Duration,
    outcome: Outcome,
    reports: mpsc::Sender<Report>,
) {
    let step = length / PROGRESS_STEPS;
    for i in 1..PROGRESS_STEPS {
        tokio::time::sleep(step).await;
        if outcome == Outcome::Stall && i > 1 {
            // Keeps the slot, sends nothing more.
            continue;
        }
        let percent = (i * 100 / PROGRESS_STEPS) as f32;
        let progress = Report::Progress {
            task: task.clone(),
            assignment: assignment.clone(),
            percent,
        };
        if reports.send(progress).await.is_err() {
            return;
        }
    }
    tokio::time::sleep(step).await;
    let _ = reports
        .send(Report::Finished {
            task,
            assignment,
            outcome,
        })
        .await;
}
