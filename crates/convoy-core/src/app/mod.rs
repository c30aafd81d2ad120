//! App: coordination logic built on the store and the ports.
//!
//! # Main components
//! - **Engine**: single-writer state machine over tasks, workers and assignments
//! - **Scheduler**: ready queue and worker selection
//! - **RecoveryManager**: retry or give up after a failed or stalled assignment
//! - **Monitor**: liveness scan and escalation loop
//! - **MessageRouter**: ordered fan-out of events to subscribers and workers
//! - **PublisherLoop**: backlog flush and redelivery
//! - **Coordinator**: the task owning the engine, plus its handle and runtime
//! - **CoordinatorBuilder**: wiring and start-up validation

pub mod builder;
pub mod coordinator;
pub mod engine;
pub mod monitor;
pub mod publisher_loop;
pub mod recovery;
pub mod router;
pub mod scheduler;
pub mod status;

pub use self::builder::{BuildError, CoordinatorBuilder};
pub use self::coordinator::{CoordinatorHandle, CoordinatorRuntime};
pub use self::engine::{AuditEntry, Disposition, Effect, Engine, EngineLimits};
pub use self::monitor::{LivenessProbe, Monitor};
pub use self::publisher_loop::PublisherLoop;
pub use self::recovery::{RecoveryManager, RecoveryOutcome};
pub use self::router::{
    Delivery, EventFilter, MessageRouter, RouterStats, SubscriberId, Subscription, WorkerEndpoint,
};
pub use self::scheduler::{Match, Scheduler};
pub use self::status::{
    OverallState, StatusCounts, StatusReport, TaskQuery, TaskView, WorkerView,
};
