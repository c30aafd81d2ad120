//! State owned by the coordinator: tasks, their dependency graph, workers and live
//! assignments, plus persistence and legacy import.

pub mod assignments;
pub mod dependency;
pub mod migrate;
pub mod registry;
pub mod snapshot;
pub mod task_store;

pub use assignments::AssignmentLedger;
pub use dependency::{DependencyGraph, TopoOrder};
pub use migrate::{LegacySource, Migration, MigrationReport, migrate};
pub use registry::WorkerRegistry;
pub use snapshot::{SNAPSHOT_VERSION, Snapshot};
pub use task_store::TaskStore;
