//! Worker record.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::WorkerId;
use super::spec::WorkerSpec;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Available,
    Busy,
    Unavailable,
}

/// Invariant: `current_load <= capacity`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: WorkerId,
    pub capabilities: BTreeSet<String>,
    pub capacity: u32,
    pub current_load: u32,
    pub availability: Availability,
    pub last_seen_at: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    #[serde(default)]
    pub instructions: Option<serde_json::Value>,
}

impl WorkerRecord {
    pub fn from_spec(spec: WorkerSpec, now: DateTime<Utc>) -> Self {
        Self {
            id: spec.id,
            capabilities: spec.capabilities.into_iter().collect(),
            capacity: spec.capacity,
            current_load: 0,
            availability: Availability::Available,
            last_seen_at: now,
            registered_at: now,
            instructions: spec.instructions,
        }
    }

    /// Capability superset match.
    pub fn has_capabilities(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }

    pub fn has_spare_capacity(&self) -> bool {
        self.current_load < self.capacity
    }

    pub fn is_eligible_for(&self, required: &BTreeSet<String>) -> bool {
        self.availability == Availability::Available
            && self.has_spare_capacity()
            && self.has_capabilities(required)
    }

    pub fn acquire_slot(&mut self) -> Result<()> {
        if !self.has_spare_capacity() {
            return Err(Error::Capacity {
                worker: self.id.clone(),
                capacity: self.capacity,
            });
        }
        self.current_load += 1;
        Ok(())
    }

    pub fn release_slot(&mut self) {
        debug_assert!(self.current_load > 0, "release without matching acquire");
        self.current_load = self.current_load.saturating_sub(1);
    }

    /// Monotonic: an older timestamp is ignored.
    pub fn record_heartbeat(&mut self, at: DateTime<Utc>) -> bool {
        if at <= self.last_seen_at {
            return false;
        }
        self.last_seen_at = at;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn worker(capacity: u32) -> WorkerRecord {
        let spec = WorkerSpec::new("w1", capacity)
            .with_capability("rust")
            .with_capability("review");
        WorkerRecord::from_spec(spec, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
    }

    fn caps(tags: &[&str]) -> BTreeSet<String> {
        tags.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn capability_match_is_superset() {
        let w = worker(1);
        assert!(w.has_capabilities(&caps(&[])));
        assert!(w.has_capabilities(&caps(&["rust"])));
        assert!(w.has_capabilities(&caps(&["rust", "review"])));
        assert!(!w.has_capabilities(&caps(&["rust", "design"])));
    }

    #[test]
    fn acquire_never_exceeds_capacity() {
        let mut w = worker(2);
        w.acquire_slot().unwrap();
        w.acquire_slot().unwrap();
        assert!(matches!(w.acquire_slot(), Err(Error::Capacity { capacity: 2, .. })));
        assert_eq!(w.current_load, 2);
        w.release_slot();
        assert!(w.is_eligible_for(&caps(&["rust"])));
    }

    #[test]
    fn unavailable_worker_is_not_eligible() {
        let mut w = worker(1);
        w.availability = Availability::Busy;
        assert!(!w.is_eligible_for(&caps(&[])));
    }

    #[test]
    fn stale_heartbeat_is_ignored() {
        let mut w = worker(1);
        let seen = w.last_seen_at;
        assert!(!w.record_heartbeat(seen - chrono::Duration::seconds(5)));
        assert!(w.record_heartbeat(seen + chrono::Duration::seconds(5)));
        assert!(w.last_seen_at > seen);
    }
}
