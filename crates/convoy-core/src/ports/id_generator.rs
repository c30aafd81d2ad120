//! IdGenerator port.
//!
//! Ids minted by the coordinator are ULIDs whose timestamp comes from the injected clock,
//! so ids created under a `ManualClock` sort in simulated time.

use ulid::Ulid;

use crate::domain::{AlertId, AssignmentId, TaskId};
use crate::ports::Clock;

pub trait IdGenerator: Send + Sync {
    /// Id for a task submitted without one.
    fn generate_task_id(&self) -> TaskId;

    fn generate_assignment_id(&self) -> AssignmentId;

    fn generate_alert_id(&self) -> AlertId;
}

pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_task_id(&self) -> TaskId {
        TaskId::from_ulid(self.next_ulid())
    }

    fn generate_assignment_id(&self) -> AssignmentId {
        AssignmentId::from_ulid(self.next_ulid())
    }

    fn generate_alert_id(&self) -> AlertId {
        AlertId::from_ulid(self.next_ulid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{ManualClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn ulid_generator_generates_unique_ids() {
        let id_gen = UlidGenerator::new(SystemClock);
        let id1 = id_gen.generate_assignment_id();
        let id2 = id_gen.generate_assignment_id();
        assert_ne!(id1, id2);
    }

    #[test]
    fn ulid_generator_uses_clock_timestamp() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(ManualClock::new(fixed_time));
        let id = id_gen.generate_alert_id();
        let ulid: Ulid = id.as_str().trim_start_matches("alert-").parse().unwrap();
        assert_eq!(ulid.timestamp_ms(), fixed_time.timestamp_millis() as u64);
    }

    #[test]
    fn different_id_kinds_have_distinct_prefixes() {
        let id_gen = UlidGenerator::new(SystemClock);
        assert!(id_gen.generate_task_id().as_str().starts_with("task-"));
        assert!(id_gen.generate_assignment_id().as_str().starts_with("asg-"));
        assert!(id_gen.generate_alert_id().as_str().starts_with("alert-"));
    }
}
