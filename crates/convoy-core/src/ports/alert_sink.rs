//! AlertSink port: where escalation notices leave the core.

use async_trait::async_trait;

use crate::domain::Alert;
use crate::error::Result;

/// Receives every alert the coordinator raises, in the order raised.
///
/// A failing sink is logged and skipped; it never stalls coordination.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn publish(&self, alert: &Alert) -> Result<()>;
}
