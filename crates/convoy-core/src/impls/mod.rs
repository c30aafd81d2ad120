//! Port implementations shipped with the core.
//!
//! - **TracingAlertSink**: alerts as `tracing` records (default)
//! - **ChannelAlertSink**: alerts over an mpsc channel to an in-process consumer
//! - **JsonFileSnapshotStore**: snapshot persistence as a JSON file

pub mod channel_sink;
pub mod json_snapshot;
pub mod tracing_sink;

pub use self::channel_sink::ChannelAlertSink;
pub use self::json_snapshot::JsonFileSnapshotStore;
pub use self::tracing_sink::TracingAlertSink;
