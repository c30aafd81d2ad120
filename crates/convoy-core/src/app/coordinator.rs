//! Coordinator: the task that owns the [`Engine`].
//!
//! # Flow
//! 1. Commands arrive from [`CoordinatorHandle`]s; reports arrive from the router inbox
//! 2. Each one is applied to the engine as a single step
//! 3. `Engine::schedule()` makes every match now possible
//! 4. Queued effects go out: events to the router, alerts to the forwarder queue
//!
//! Nothing else touches the engine, so no lock is held across components. The
//! coordinator never awaits the alert sink; a separate forwarder task does.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::engine::{AuditEntry, Disposition, Effect, Engine};
use super::monitor::{LivenessProbe, Monitor};
use super::publisher_loop::PublisherLoop;
use super::router::{EventFilter, MessageRouter, Subscription};
use super::status::{StatusReport, TaskQuery, TaskView};
use crate::config::CoordinatorConfig;
use crate::domain::{
    Alert, AlertId, Availability, Event, EventSource, Priority, TaskId, TaskSpec, TaskStatus,
    WorkerId, WorkerSpec,
};
use crate::error::{Error, Result};
use crate::ports::{AlertSink, Clock, SnapshotStore};
use crate::store::Snapshot;

type Job = Box<dyn FnOnce(&mut Engine) + Send>;

/// How long shutdown waits for queued alerts to reach the sink.
const ALERT_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Cloneable front door to a running coordinator.
///
/// Every method is one engine step. `Error::CoordinatorClosed` means the coordinator
/// has stopped.
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::Sender<Job>,
    router: MessageRouter,
}

impl CoordinatorHandle {
    async fn call<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Engine) -> R + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move |engine| {
            // The caller may have given up waiting.
            let _ = reply_tx.send(f(engine));
        });
        self.commands
            .send(job)
            .await
            .map_err(|_| Error::CoordinatorClosed)?;
        reply_rx.await.map_err(|_| Error::CoordinatorClosed)
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub async fn submit(&self, spec: TaskSpec) -> Result<TaskId> {
        self.call(move |engine| engine.submit(spec)).await?
    }

    pub async fn submit_batch(&self, specs: Vec<TaskSpec>) -> Result<Vec<TaskId>> {
        self.call(move |engine| engine.submit_batch(specs)).await?
    }

    pub async fn add_dependency(&self, task: TaskId, dep: TaskId) -> Result<()> {
        self.call(move |engine| engine.add_dependency(&task, &dep))
            .await?
    }

    pub async fn register_worker(&self, spec: WorkerSpec) -> Result<()> {
        self.call(move |engine| engine.register_worker(spec)).await?
    }

    /// Returns the tasks that were requeued.
    pub async fn deregister_worker(&self, worker: WorkerId) -> Result<Vec<TaskId>> {
        self.call(move |engine| engine.deregister_worker(&worker))
            .await?
    }

    /// Worker-level heartbeat, stamped with the coordinator's clock.
    pub async fn worker_heartbeat(&self, worker: WorkerId) -> Result<bool> {
        self.call(move |engine| {
            let now = engine.now();
            engine.worker_heartbeat(&worker, now)
        })
        .await?
    }

    pub async fn set_availability(
        &self,
        worker: WorkerId,
        availability: Availability,
    ) -> Result<Availability> {
        self.call(move |engine| engine.set_availability(&worker, availability))
            .await?
    }

    pub async fn cancel(&self, task: TaskId, reason: impl Into<String>) -> Result<Disposition> {
        let reason = reason.into();
        self.call(move |engine| engine.cancel(&task, &reason)).await?
    }

    pub async fn hold(&self, task: TaskId) -> Result<()> {
        self.call(move |engine| engine.hold(&task)).await?
    }

    pub async fn release_hold(&self, task: TaskId) -> Result<()> {
        self.call(move |engine| engine.release_hold(&task)).await?
    }

    pub async fn override_blocked(&self, task: TaskId) -> Result<Vec<TaskId>> {
        self.call(move |engine| engine.override_blocked(&task))
            .await?
    }

    pub async fn resubmit(&self, task: TaskId) -> Result<()> {
        self.call(move |engine| engine.resubmit(&task)).await?
    }

    pub async fn acknowledge_alert(&self, alert: AlertId) -> Result<()> {
        self.call(move |engine| engine.acknowledge_alert(&alert))
            .await?
    }

    /// Apply a report directly instead of through the router.
    pub async fn report(&self, event: Event) -> Result<Disposition> {
        self.call(move |engine| engine.handle_event(event)).await?
    }

    pub async fn task_view(&self, task: TaskId) -> Result<TaskView> {
        self.call(move |engine| engine.task_view(&task)).await?
    }

    pub async fn query_tasks(&self, query: TaskQuery) -> Result<Vec<TaskView>> {
        self.call(move |engine| engine.query_tasks(&query)).await
    }

    /// What `worker` is holding right now.
    pub async fn tasks_for_worker(&self, worker: WorkerId) -> Result<Vec<TaskView>> {
        self.query_tasks(TaskQuery::all().worker(worker)).await
    }

    pub async fn tasks_by_priority(&self, priority: Priority) -> Result<Vec<TaskView>> {
        self.query_tasks(TaskQuery::all().priority(priority)).await
    }

    pub async fn blocked_tasks(&self) -> Result<Vec<TaskView>> {
        self.query_tasks(TaskQuery::all().status(TaskStatus::Blocked))
            .await
    }

    pub async fn status_report(&self) -> Result<StatusReport> {
        self.call(|engine| engine.status_report()).await
    }

    pub async fn ready_set(&self) -> Result<Vec<TaskId>> {
        self.call(|engine| engine.ready_set()).await
    }

    pub async fn topo_order(&self) -> Result<Vec<TaskId>> {
        self.call(|engine| engine.topo_order()).await
    }

    pub async fn liveness_probes(&self) -> Result<Vec<LivenessProbe>> {
        self.call(|engine| engine.liveness_probes()).await
    }

    pub async fn alerts(&self) -> Result<Vec<Alert>> {
        self.call(|engine| engine.alerts()).await
    }

    pub async fn events(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        self.call(move |engine| engine.events(limit)).await
    }

    pub async fn snapshot(&self) -> Result<Snapshot> {
        self.call(|engine| engine.snapshot()).await
    }
}

struct Coordinator {
    engine: Engine,
    router: MessageRouter,
    inbox: Subscription,
    commands: mpsc::Receiver<Job>,
    alerts: mpsc::Sender<Alert>,
}

impl Coordinator {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Engine {
        info!(
            workers = self.engine.workers().count(),
            "coordinator started"
        );
        self.settle();

        let mut handles_open = true;
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    // A dropped sender counts as shutdown.
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                job = self.commands.recv(), if handles_open => match job {
                    Some(job) => job(&mut self.engine),
                    None => {
                        debug!("all coordinator handles dropped");
                        handles_open = false;
                        continue;
                    }
                },
                delivery = self.inbox.recv() => match delivery {
                    Some(delivery) => self.apply(delivery.event),
                    None => {
                        warn!("coordinator inbox closed by the router");
                        break;
                    }
                },
            }
            self.settle();
        }

        // Drain what is already queued so callers get an answer.
        self.commands.close();
        while let Ok(job) = self.commands.try_recv() {
            job(&mut self.engine);
        }
        self.settle();
        info!(
            active_assignments = self.engine.active_assignments(),
            "coordinator stopped"
        );
        self.engine
    }

    fn apply(&mut self, event: Event) {
        let kind = event.kind;
        let task_id = event.task_id.clone();
        match self.engine.handle_event(event) {
            Ok(Disposition::Applied) => {}
            Ok(disposition) => {
                debug!(task_id = %task_id, ?kind, ?disposition, "report ignored");
            }
            Err(e) => {
                warn!(task_id = %task_id, ?kind, error = %e, "report rejected");
            }
        }
    }

    /// Schedule, then push effects out in the order they were produced.
    fn settle(&mut self) {
        self.engine.schedule();
        for effect in self.engine.drain_effects() {
            match effect {
                Effect::Publish(event) => {
                    self.router.publish(event);
                }
                Effect::Alert(alert) => match self.alerts.try_send(alert) {
                    Ok(()) => {}
                    Err(TrySendError::Full(alert)) => {
                        // Still recorded in the engine's alert log.
                        warn!(alert_id = %alert.id, "alert queue full, dropping sink delivery");
                    }
                    Err(TrySendError::Closed(alert)) => {
                        warn!(alert_id = %alert.id, "alert forwarder gone");
                    }
                },
            }
        }
    }
}

/// Hands queued alerts to the sink one at a time. Ends when the coordinator drops
/// its sender.
async fn forward_alerts(sink: Arc<dyn AlertSink>, mut alerts: mpsc::Receiver<Alert>) {
    while let Some(alert) = alerts.recv().await {
        if let Err(e) = sink.publish(&alert).await {
            warn!(alert_id = %alert.id, error = %e, "alert sink failed");
        }
    }
    debug!("alert forwarder stopped");
}

/// Running coordinator plus its monitor, publisher and alert forwarder tasks.
///
/// - `request_shutdown()` stops every loop
/// - `shutdown_and_join()` waits for them and writes a final snapshot
pub struct CoordinatorRuntime {
    shutdown_tx: watch::Sender<bool>,
    coordinator: JoinHandle<Engine>,
    loops: Vec<JoinHandle<()>>,
    alert_forwarder: JoinHandle<()>,
    snapshot_store: Option<Arc<dyn SnapshotStore>>,
}

impl CoordinatorRuntime {
    pub fn request_shutdown(&self) {
        // Receivers may already be gone.
        let _ = self.shutdown_tx.send(true);
    }

    /// Stop everything and hand back the final engine state.
    pub async fn shutdown_and_join(self) -> Result<Engine> {
        self.request_shutdown();
        for join in self.loops {
            if let Err(e) = join.await {
                warn!(error = %e, "background loop ended abnormally");
            }
        }
        let engine = self.coordinator.await.map_err(|e| {
            warn!(error = %e, "coordinator task ended abnormally");
            Error::CoordinatorClosed
        })?;

        // The coordinator's sender is gone, so the forwarder finishes once the
        // queue is empty, unless the sink itself is stuck.
        let mut forwarder = self.alert_forwarder;
        if tokio::time::timeout(ALERT_DRAIN_GRACE, &mut forwarder)
            .await
            .is_err()
        {
            warn!("alert sink did not drain in time, abandoning queued alerts");
            forwarder.abort();
        }
        if let Some(store) = &self.snapshot_store {
            store.save(&engine.snapshot()).await?;
            info!("final snapshot saved");
        }
        Ok(engine)
    }
}

/// Everything `launch` needs besides the engine itself.
pub(crate) struct Wiring {
    pub config: CoordinatorConfig,
    /// Endpoints may already be connected to it.
    pub router: MessageRouter,
    pub clock: Arc<dyn Clock>,
    pub alert_sink: Arc<dyn AlertSink>,
    pub snapshot_store: Option<Arc<dyn SnapshotStore>>,
}

/// Spawn the coordinator, monitor and publisher loops around `engine`.
pub(crate) fn launch(engine: Engine, wiring: Wiring) -> (CoordinatorHandle, CoordinatorRuntime) {
    let Wiring {
        config,
        router,
        clock,
        alert_sink,
        snapshot_store,
    } = wiring;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (commands_tx, commands_rx) = mpsc::channel(config.channel_capacity);
    let (alerts_tx, alerts_rx) = mpsc::channel(config.channel_capacity);
    let alert_forwarder = tokio::spawn(forward_alerts(alert_sink, alerts_rx));

    // Everything except the coordinator's own output.
    let inbox = router.subscribe(EventFilter::all().excluding_source(EventSource::Coordinator));
    let handle = CoordinatorHandle {
        commands: commands_tx,
        router: router.clone(),
    };

    let coordinator = Coordinator {
        engine,
        router: router.clone(),
        inbox,
        commands: commands_rx,
        alerts: alerts_tx,
    };
    let coordinator = tokio::spawn(coordinator.run(shutdown_rx.clone()));

    let monitor = Monitor::new(config.stall_timeout(), config.assignment_timeout());
    let monitor = tokio::spawn(monitor.run(
        handle.clone(),
        router.clone(),
        clock,
        config.monitor_interval(),
        shutdown_rx.clone(),
    ));

    let publisher = PublisherLoop::new(
        router,
        config.redelivery_interval(),
        config.redelivery_after(),
    );
    let publisher = tokio::spawn(publisher.run(shutdown_rx));

    let runtime = CoordinatorRuntime {
        shutdown_tx,
        coordinator,
        loops: vec![monitor, publisher],
        alert_forwarder,
        snapshot_store,
    };
    (handle, runtime)
}
