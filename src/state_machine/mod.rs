mod job;
mod state;

pub use job::{AuditRecord, FailureKind, Job, JobOutcome, JobStatus};
pub use state::{State, StateMachine, Transition};
