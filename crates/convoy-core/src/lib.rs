//! convoy-core
//!
//! Dependency-aware task coordination for a fixed roster of workers.
//!
//! # Modules
//! - **domain**: ids, task and worker records, events, alerts, retry decisions
//! - **ports**: clock, id generation, alert sink, snapshot store
//! - **store**: task store, dependency graph, worker registry, assignment ledger, snapshots
//! - **app**: engine, scheduler, monitor, router, coordinator, builder
//! - **impls**: bundled port implementations
//! - **config**: `CoordinatorConfig` loaded from TOML

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;
pub mod store;

pub use config::CoordinatorConfig;
pub use error::{Error, ErrorKind, Result};
