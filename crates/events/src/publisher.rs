//! Typed publishing of job events.

use std::sync::Arc;

use tracing::{instrument, warn};

use hasty_jobs::JobEvent;

use crate::bus::{BusError, EventBus};
use crate::retry::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("failed to encode job event: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to publish job event: {0}")]
    Transport(#[from] BusError),
}

/// Serializes [`JobEvent`]s onto the subject named by the event.
#[derive(Debug)]
pub struct JobEventPublisher<B: ?Sized> {
    bus: Arc<B>,
}

impl<B: ?Sized> Clone for JobEventPublisher<B> {
    fn clone(&self) -> Self {
        Self {
            bus: Arc::clone(&self.bus),
        }
    }
}

impl<B> JobEventPublisher<B>
where
    B: EventBus + ?Sized,
{
    pub fn new(bus: Arc<B>) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &Arc<B> {
        &self.bus
    }

    #[instrument(
        skip(self, event),
        fields(subject = %event.subject, job_id = %event.job.job_id, object_id = %event.job.object_id),
        err
    )]
    pub async fn publish(&self, event: &JobEvent) -> Result<(), PublishError> {
        let payload = event.encode()?;
        self.bus.publish(event.subject.as_str(), payload).await?;
        Ok(())
    }

    /// Publish, retrying transport failures with backoff.
    ///
    /// Encoding failures are returned immediately.
    pub async fn publish_with_retry(
        &self,
        event: &JobEvent,
        policy: &RetryPolicy,
    ) -> Result<(), PublishError> {
        let payload = event.encode()?;
        let mut retry = 0;
        loop {
            match self.bus.publish(event.subject.as_str(), payload.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if retry < policy.max_retries => {
                    let delay = policy.backoff_with_jitter(retry, &mut rand::thread_rng());
                    warn!(
                        subject = %event.subject,
                        job_id = %event.job.job_id,
                        attempt = retry + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "publish failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(e) => return Err(PublishError::Transport(e)),
            }
        }
    }
}
