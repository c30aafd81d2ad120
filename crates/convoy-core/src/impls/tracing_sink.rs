//! TracingAlertSink: alerts as log records.
//!
//! The default sink. Critical alerts go out at `error`, everything else at `warn`.

use async_trait::async_trait;
use tracing::{error, warn};

use crate::domain::{Alert, Severity};
use crate::error::Result;
use crate::ports::AlertSink;

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn publish(&self, alert: &Alert) -> Result<()> {
        match alert.severity {
            Severity::Critical => error!(
                alert_id = %alert.id,
                task_id = %alert.task_id,
                worker_id = ?alert.worker_id,
                reason = %alert.reason,
                "{}",
                alert.message
            ),
            Severity::Warning | Severity::Info => warn!(
                alert_id = %alert.id,
                task_id = %alert.task_id,
                worker_id = ?alert.worker_id,
                reason = %alert.reason,
                "{}",
                alert.message
            ),
        }
        Ok(())
    }
}
