//! Job persistence.
//!
//! - `JobStore`: async store abstraction with atomic admission and
//!   conditional terminal writes
//! - `InMemoryJobStore`: tests/dev
//! - `PostgresJobStore`: durable store (sqlx)

pub mod postgres;
pub mod store;

pub use postgres::PostgresJobStore;
pub use store::{
    AdmissionRules, AdmitOutcome, CompleteOutcome, InMemoryJobStore, JobStore, JobStoreError,
    StoredJob,
};
