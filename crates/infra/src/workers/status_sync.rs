//! Api-side consumer of terminal job events.
//!
//! Applies `job:finished` / `job:cancelled` to the api's view of the store.
//! With a shared store the worker's write has usually landed already, in
//! which case the event is a no-op.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hasty_events::{
    BusError, DeliverPolicy, Disposition, EventBus, ListenerHandle, Message, MessageHandler,
    SubscriptionOptions, spawn_listener,
};
use hasty_jobs::{JobEvent, JobOutcome, JobStatus, Subject};

use crate::jobs::{CompleteOutcome, JobStore, JobStoreError};

/// Durable queue group the api instances share for terminal events.
pub const STATUS_SYNC_GROUP: &str = "hasty-api-status";

#[derive(Debug)]
pub struct StatusSyncHandler<S: ?Sized> {
    store: Arc<S>,
}

impl<S: ?Sized> StatusSyncHandler<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S> MessageHandler for StatusSyncHandler<S>
where
    S: JobStore + ?Sized + 'static,
{
    async fn handle(&self, message: &Message) -> Disposition {
        let event = match JobEvent::decode(&message.payload) {
            Ok(event) => event,
            Err(e) => return Disposition::DeadLetter(format!("malformed job event: {e}")),
        };
        let outcome = match event.job.status {
            JobStatus::Finished => JobOutcome::Finished,
            JobStatus::Cancelled => JobOutcome::Cancelled,
            other => {
                return Disposition::DeadLetter(format!(
                    "terminal event {} carries non-terminal status {other}",
                    event.subject
                ));
            }
        };
        let job_id = event.job.job_id;
        let sleep = event.job.sleep_time_used.unwrap_or_default();

        match self.store.complete(job_id, outcome, sleep).await {
            Ok(CompleteOutcome::Applied(job)) => {
                info!(job_id = %job_id, object_id = %job.object_id, status = %job.status, "terminal status synced");
                Disposition::Ack
            }
            Ok(CompleteOutcome::AlreadyTerminal(job)) => {
                if job.status != event.job.status {
                    warn!(
                        job_id = %job_id,
                        stored = %job.status,
                        received = %event.job.status,
                        "terminal event disagrees with stored status; keeping stored"
                    );
                } else {
                    debug!(job_id = %job_id, "terminal status already recorded");
                }
                Disposition::Ack
            }
            Err(JobStoreError::NotFound(_)) => {
                debug!(job_id = %job_id, "terminal event for unknown job; ignoring");
                Disposition::Ack
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "failed to sync terminal status");
                Disposition::Retry
            }
        }
    }
}

/// Subscribe the api to both terminal subjects.
pub async fn spawn_status_sync<B, S>(
    bus: &B,
    store: Arc<S>,
    ack_wait: Duration,
    shutdown: CancellationToken,
) -> Result<Vec<ListenerHandle>, BusError>
where
    B: EventBus + ?Sized,
    S: JobStore + ?Sized + 'static,
{
    let handler = Arc::new(StatusSyncHandler::new(store));
    let mut handles = Vec::new();
    for (name, subject) in [
        ("status-sync-finished", Subject::Finished),
        ("status-sync-cancelled", Subject::Cancelled),
    ] {
        let sub = bus
            .subscribe(
                SubscriptionOptions::new(subject.as_str(), STATUS_SYNC_GROUP)
                    .durable(STATUS_SYNC_GROUP)
                    .deliver(DeliverPolicy::All)
                    .ack_wait(ack_wait),
            )
            .await?;
        handles.push(spawn_listener(
            name,
            sub,
            Arc::clone(&handler),
            16,
            shutdown.child_token(),
        ));
    }
    Ok(handles)
}
