//! PublisherLoop: keeps router deliveries moving.
//!
//! # Flow
//! 1. `MessageRouter::flush()` pushes backlogged deliveries into subscriber queues
//! 2. `MessageRouter::redeliver_expired()` re-offers unacknowledged deliveries
//! 3. Repeat every `interval` until shutdown

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, trace};

use super::router::MessageRouter;

pub struct PublisherLoop {
    router: MessageRouter,
    interval: Duration,
    redeliver_after: Duration,
}

impl PublisherLoop {
    pub fn new(router: MessageRouter, interval: Duration, redeliver_after: Duration) -> Self {
        Self {
            router,
            interval,
            redeliver_after,
        }
    }

    /// One pass. Returns (flushed, redelivered).
    pub fn tick(&self) -> (usize, usize) {
        let flushed = self.router.flush();
        let redelivered = self.router.redeliver_expired(self.redeliver_after);
        if flushed > 0 || redelivered > 0 {
            trace!(flushed, redelivered, "publisher pass");
        }
        (flushed, redelivered)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.tick();
                }
            }
        }
        // Last pass so nothing sits in a backlog at shutdown.
        self.router.flush();
        debug!("publisher loop stopped");
    }
}
