//! ChannelAlertSink: hands alerts to an in-process consumer over a bounded channel.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::Alert;
use crate::error::{Error, Result};
use crate::ports::AlertSink;

pub struct ChannelAlertSink {
    tx: mpsc::Sender<Alert>,
}

impl ChannelAlertSink {
    /// The sink and the receiving end for the consumer.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Alert>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl AlertSink for ChannelAlertSink {
    /// Waits for room; fails once the consumer is gone.
    async fn publish(&self, alert: &Alert) -> Result<()> {
        self.tx
            .send(alert.clone())
            .await
            .map_err(|_| Error::Unavailable(format!("alert consumer closed, dropped {}", alert.id)))
    }
}
