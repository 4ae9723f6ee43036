//! Job domain module.
//!
//! The job record, its status machine, the wire event, and the pure policies
//! that drive admission and simulated work. Deterministic domain logic only
//! (no IO, no HTTP, no storage).

pub mod event;
pub mod job;
pub mod policy;

pub use event::{JobEvent, Subject};
pub use job::{Job, JobOutcome, JobStatus};
pub use policy::{AdmissionDecision, CooldownPolicy, ReadmissionMode, SleepPolicy};
