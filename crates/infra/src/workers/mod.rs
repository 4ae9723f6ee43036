//! Background consumers.
//!
//! - `lifecycle`: worker side, drives `job:created` to a terminal outcome
//! - `status_sync`: api side, applies terminal events to the api's store

pub mod lifecycle;
pub mod status_sync;

pub use lifecycle::{
    CancelRequestHandler, CancellationRegistry, LifecycleError, LifecycleOrchestrator,
    LifecycleWorker, LifecycleWorkerConfig, ProcessOutcome, Registration, WorkFn, simulate_work,
    work_fn,
};
pub use status_sync::{STATUS_SYNC_GROUP, StatusSyncHandler, spawn_status_sync};
