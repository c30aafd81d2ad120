//! Ports: the seams where the core meets time, id minting, alert consumers and storage.

pub mod alert_sink;
pub mod clock;
pub mod id_generator;
pub mod snapshot_store;

pub use self::alert_sink::AlertSink;
pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::snapshot_store::SnapshotStore;
