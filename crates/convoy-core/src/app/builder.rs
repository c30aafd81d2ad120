//! CoordinatorBuilder: wiring and start-up validation.
//!
//! Everything that can be checked before the coordinator runs is checked here, so a
//! bad roster or task file fails at start instead of surfacing as a stuck task later.
//!
//! ```ignore
//! let (handle, runtime) = CoordinatorBuilder::new(config)
//!     .roster(roster.workers)
//!     .tasks(manifest.tasks)
//!     .require_capability_coverage()
//!     .spawn()
//!     .await?;
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info};

use super::coordinator::{CoordinatorHandle, CoordinatorRuntime, Wiring, launch};
use super::engine::{Engine, EngineLimits};
use super::router::MessageRouter;
use crate::config::CoordinatorConfig;
use crate::domain::{Decider, DefaultDecider, TaskId, TaskSpec, WorkerId, WorkerSpec};
use crate::error::Error;
use crate::impls::{JsonFileSnapshotStore, TracingAlertSink};
use crate::ports::{AlertSink, Clock, IdGenerator, SnapshotStore, SystemClock, UlidGenerator};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[source] Error),

    #[error("worker {0} appears more than once in the roster")]
    DuplicateWorker(WorkerId),

    #[error("no registered worker can take: {}", format_uncovered(.0))]
    UnsatisfiableCapabilities(Vec<(TaskId, Vec<String>)>),

    #[error(transparent)]
    Rejected(#[from] Error),
}

fn format_uncovered(uncovered: &[(TaskId, Vec<String>)]) -> String {
    uncovered
        .iter()
        .map(|(task, caps)| format!("{task} [{}]", caps.join(", ")))
        .collect::<Vec<_>>()
        .join("; ")
}

pub struct CoordinatorBuilder {
    config: CoordinatorConfig,
    clock: Arc<dyn Clock>,
    ids: Option<Arc<dyn IdGenerator>>,
    decider: Option<Arc<dyn Decider>>,
    alert_sink: Arc<dyn AlertSink>,
    snapshot_store: Option<Arc<dyn SnapshotStore>>,
    router: Option<MessageRouter>,
    roster: Vec<WorkerSpec>,
    tasks: Vec<TaskSpec>,
    require_capability_coverage: bool,
}

impl CoordinatorBuilder {
    pub fn new(config: CoordinatorConfig) -> Self {
        let snapshot_store = config
            .snapshot_path
            .clone()
            .map(|path| Arc::new(JsonFileSnapshotStore::new(path)) as Arc<dyn SnapshotStore>);
        Self {
            config,
            clock: Arc::new(SystemClock),
            ids: None,
            decider: None,
            alert_sink: Arc::new(TracingAlertSink),
            snapshot_store,
            router: None,
            roster: Vec::new(),
            tasks: Vec::new(),
            require_capability_coverage: false,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Replaces the default `max_retries` policy.
    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    pub fn alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alert_sink = sink;
        self
    }

    /// Overrides the store derived from `snapshot_path`.
    pub fn snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshot_store = Some(store);
        self
    }

    /// Use a router created up front, so worker endpoints can connect before the
    /// first assignment goes out.
    pub fn router(mut self, router: MessageRouter) -> Self {
        self.router = Some(router);
        self
    }

    pub fn roster(mut self, workers: impl IntoIterator<Item = WorkerSpec>) -> Self {
        self.roster.extend(workers);
        self
    }

    pub fn tasks(mut self, tasks: impl IntoIterator<Item = TaskSpec>) -> Self {
        self.tasks.extend(tasks);
        self
    }

    /// Fail the build if some task requires capabilities no worker has.
    pub fn require_capability_coverage(mut self) -> Self {
        self.require_capability_coverage = true;
        self
    }

    /// Validate and assemble the engine without starting anything.
    ///
    /// Order: config, roster, saved snapshot, roster registration, task batch, coverage.
    /// Workers and tasks already present in the snapshot are not added again.
    pub async fn build_engine(&self) -> Result<Engine, BuildError> {
        self.config.validate().map_err(BuildError::InvalidConfig)?;

        let mut seen = HashSet::new();
        for worker in &self.roster {
            if !seen.insert(&worker.id) {
                return Err(BuildError::DuplicateWorker(worker.id.clone()));
            }
        }

        let ids = self
            .ids
            .clone()
            .unwrap_or_else(|| {
                Arc::new(UlidGenerator::new(self.clock.clone())) as Arc<dyn IdGenerator>
            });
        let decider = self
            .decider
            .clone()
            .unwrap_or_else(|| {
                Arc::new(DefaultDecider::new(self.config.max_retries)) as Arc<dyn Decider>
            });
        let mut engine = Engine::new(
            self.clock.clone(),
            ids,
            decider,
            EngineLimits::from(&self.config),
        );

        if let Some(store) = &self.snapshot_store
            && let Some(snapshot) = store.load().await?
        {
            info!(
                tasks = snapshot.tasks.len(),
                workers = snapshot.workers.len(),
                "restoring snapshot"
            );
            engine.restore(snapshot)?;
        }

        for worker in &self.roster {
            if engine.worker(&worker.id).is_some() {
                debug!(worker_id = %worker.id, "worker restored from snapshot");
                continue;
            }
            engine.register_worker(worker.clone())?;
        }

        let fresh: Vec<TaskSpec> = self
            .tasks
            .iter()
            .filter(|spec| spec.id.as_ref().is_none_or(|id| engine.task(id).is_none()))
            .cloned()
            .collect();
        if fresh.len() < self.tasks.len() {
            debug!(
                skipped = self.tasks.len() - fresh.len(),
                "tasks already present in snapshot"
            );
        }
        if !fresh.is_empty() {
            engine.submit_batch(fresh)?;
        }

        if self.require_capability_coverage {
            let uncovered = self.uncovered(&engine);
            if !uncovered.is_empty() {
                return Err(BuildError::UnsatisfiableCapabilities(uncovered));
            }
        }
        Ok(engine)
    }

    fn uncovered(&self, engine: &Engine) -> Vec<(TaskId, Vec<String>)> {
        let mut uncovered: Vec<(TaskId, Vec<String>)> = engine
            .tasks()
            .filter(|task| !task.status.is_terminal())
            .filter(|task| {
                !engine
                    .workers()
                    .any(|w| w.has_capabilities(&task.required_capabilities))
            })
            .map(|task| {
                let caps = task.required_capabilities.iter().cloned().collect();
                (task.id.clone(), caps)
            })
            .collect();
        uncovered.sort();
        uncovered
    }

    /// Build, then start the coordinator with its monitor and publisher loops.
    pub async fn spawn(self) -> Result<(CoordinatorHandle, CoordinatorRuntime), BuildError> {
        let engine = self.build_engine().await?;
        info!(
            workers = engine.workers().count(),
            ready = engine.ready_set().len(),
            "coordinator built"
        );
        let router = self.router.unwrap_or_else(|| {
            MessageRouter::with_backlog_limit(self.config.channel_capacity, self.config.max_backlog)
        });
        Ok(launch(
            engine,
            Wiring {
                router,
                config: self.config,
                clock: self.clock,
                alert_sink: self.alert_sink,
                snapshot_store: self.snapshot_store,
            },
        ))
    }
}
