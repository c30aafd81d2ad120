//! Worker registry: identity, capability tags, capacity, liveness.
//!
//! The registry answers "who could take this task"; choosing among them is the
//! scheduler's call. Load accounting goes through `acquire`/`release` so the capacity
//! invariant is enforced in one place.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::domain::{Availability, WorkerId, WorkerRecord, WorkerSpec};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct WorkerRegistry {
    workers: HashMap<WorkerId, WorkerRecord>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: WorkerSpec, now: DateTime<Utc>) -> Result<&WorkerRecord> {
        spec.validate()?;
        match self.workers.entry(spec.id.clone()) {
            Entry::Occupied(e) => Err(Error::validation(format!(
                "worker {} is already registered",
                e.key()
            ))),
            Entry::Vacant(e) => Ok(e.insert(WorkerRecord::from_spec(spec, now))),
        }
    }

    /// Insert a record as-is (restore path).
    pub(crate) fn insert_record(&mut self, record: WorkerRecord) -> Result<()> {
        match self.workers.entry(record.id.clone()) {
            Entry::Occupied(e) => Err(Error::validation(format!(
                "worker {} is already registered",
                e.key()
            ))),
            Entry::Vacant(e) => {
                e.insert(record);
                Ok(())
            }
        }
    }

    /// Remove a worker. The caller is responsible for its active assignments.
    pub fn deregister(&mut self, id: &WorkerId) -> Result<WorkerRecord> {
        self.workers
            .remove(id)
            .ok_or_else(|| Error::UnknownWorker(id.clone()))
    }

    /// Returns whether the heartbeat advanced `last_seen_at`.
    pub fn update_heartbeat(&mut self, id: &WorkerId, at: DateTime<Utc>) -> Result<bool> {
        let worker = self.require_mut(id)?;
        let applied = worker.record_heartbeat(at);
        if !applied {
            debug!(worker_id = %id, at = %at, "ignoring out-of-order worker heartbeat");
        }
        Ok(applied)
    }

    /// Returns the previous availability.
    pub fn set_availability(&mut self, id: &WorkerId, state: Availability) -> Result<Availability> {
        let worker = self.require_mut(id)?;
        Ok(std::mem::replace(&mut worker.availability, state))
    }

    pub fn get(&self, id: &WorkerId) -> Option<&WorkerRecord> {
        self.workers.get(id)
    }

    pub fn require(&self, id: &WorkerId) -> Result<&WorkerRecord> {
        self.workers
            .get(id)
            .ok_or_else(|| Error::UnknownWorker(id.clone()))
    }

    fn require_mut(&mut self, id: &WorkerId) -> Result<&mut WorkerRecord> {
        self.workers
            .get_mut(id)
            .ok_or_else(|| Error::UnknownWorker(id.clone()))
    }

    pub fn contains(&self, id: &WorkerId) -> bool {
        self.workers.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerRecord> {
        self.workers.values()
    }

    pub fn sorted(&self) -> Vec<&WorkerRecord> {
        let mut records: Vec<&WorkerRecord> = self.workers.values().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Workers that are available, have a free slot and hold every required tag.
    ///
    /// The yielded records borrow the registry only, not `required`.
    pub fn eligible<'a, 'b>(
        &'a self,
        required: &'b BTreeSet<String>,
    ) -> impl Iterator<Item = &'a WorkerRecord> + use<'a, 'b> {
        self.workers
            .values()
            .filter(move |w| w.is_eligible_for(required))
    }

    /// Whether any registered worker could ever serve these tags, ignoring load.
    pub fn can_serve(&self, required: &BTreeSet<String>) -> bool {
        self.workers.values().any(|w| w.has_capabilities(required))
    }

    /// Take one slot. Fails with `Capacity` when the worker is full.
    pub fn acquire(&mut self, id: &WorkerId) -> Result<()> {
        self.require_mut(id)?.acquire_slot()
    }

    /// Give one slot back. A worker that has been deregistered is ignored.
    pub fn release(&mut self, id: &WorkerId) {
        if let Some(worker) = self.workers.get_mut(id) {
            worker.release_slot();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    fn registry() -> WorkerRegistry {
        let mut reg = WorkerRegistry::new();
        reg.register(WorkerSpec::new("w1", 1).with_capability("rust"), t0())
            .unwrap();
        reg.register(
            WorkerSpec::new("w2", 2)
                .with_capability("rust")
                .with_capability("docs"),
            t0(),
        )
        .unwrap();
        reg
    }

    fn caps(tags: &[&str]) -> BTreeSet<String> {
        tags.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut reg = registry();
        let err = reg
            .register(WorkerSpec::new("w1", 3), t0())
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(reg.require(&WorkerId::new("w1")).unwrap().capacity, 1);
    }

    #[test]
    fn invalid_roster_entry_is_rejected() {
        let mut reg = WorkerRegistry::new();
        assert!(reg.register(WorkerSpec::new("w0", 0), t0()).is_err());
        assert!(reg.is_empty());
    }

    #[test]
    fn eligibility_filters_capability_availability_and_load() {
        let mut reg = registry();
        let docs = caps(&["docs"]);
        let ids: Vec<_> = reg.eligible(&docs).map(|w| w.id.clone()).collect();
        assert_eq!(ids, vec![WorkerId::new("w2")]);

        reg.set_availability(&WorkerId::new("w2"), Availability::Unavailable)
            .unwrap();
        assert_eq!(reg.eligible(&docs).count(), 0);

        let rust = caps(&["rust"]);
        reg.acquire(&WorkerId::new("w1")).unwrap();
        assert_eq!(reg.eligible(&rust).count(), 0);
        assert!(reg.can_serve(&rust));
        assert!(!reg.can_serve(&caps(&["gpu"])));
    }

    #[test]
    fn acquire_past_capacity_fails() {
        let mut reg = registry();
        let w1 = WorkerId::new("w1");
        reg.acquire(&w1).unwrap();
        assert!(matches!(reg.acquire(&w1), Err(Error::Capacity { .. })));
        reg.release(&w1);
        assert_eq!(reg.require(&w1).unwrap().current_load, 0);
    }

    #[test]
    fn heartbeat_is_monotonic() {
        let mut reg = registry();
        let w1 = WorkerId::new("w1");
        assert!(reg.update_heartbeat(&w1, t0() + Duration::seconds(30)).unwrap());
        assert!(!reg.update_heartbeat(&w1, t0() + Duration::seconds(10)).unwrap());
        assert_eq!(
            reg.require(&w1).unwrap().last_seen_at,
            t0() + Duration::seconds(30)
        );
        assert!(matches!(
            reg.update_heartbeat(&WorkerId::new("ghost"), t0()),
            Err(Error::UnknownWorker(_))
        ));
    }

    #[test]
    fn deregister_returns_record() {
        let mut reg = registry();
        let record = reg.deregister(&WorkerId::new("w2")).unwrap();
        assert_eq!(record.capacity, 2);
        assert!(!reg.contains(&WorkerId::new("w2")));
        assert!(reg.deregister(&WorkerId::new("w2")).is_err());
        // releasing against a removed worker is harmless
        reg.release(&WorkerId::new("w2"));
    }
}
