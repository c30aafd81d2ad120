//! Domain model: ids, task and worker records, events, alerts, recovery decisions.

pub mod alert;
pub mod assignment;
pub mod decision;
pub mod event;
pub mod ids;
pub mod spec;
pub mod task;
pub mod worker;

pub use alert::{Alert, Severity};
pub use assignment::Assignment;
pub use decision::{Decider, Decision, DefaultDecider, FailureCause};
pub use event::{EscalationReason, Event, EventKind, EventPayload, EventSource};
pub use ids::{AlertId, AssignmentId, Id, IdMarker, TaskId, WorkerId};
pub use spec::{Roster, TaskManifest, TaskSpec, WorkerSpec};
pub use task::{Priority, TaskRecord, TaskStatus};
pub use worker::{Availability, WorkerRecord};
