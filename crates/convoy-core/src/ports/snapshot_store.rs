//! SnapshotStore port: persistence of the task/worker set.
//!
//! The coordinator only needs whole-snapshot load and save; the format is up to the
//! implementation.

use async_trait::async_trait;

use crate::error::Result;
use crate::store::Snapshot;

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// `Ok(None)` when nothing has been saved yet.
    async fn load(&self) -> Result<Option<Snapshot>>;

    async fn save(&self, snapshot: &Snapshot) -> Result<()>;
}
