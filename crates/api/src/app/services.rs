use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use hasty_events::{BusError, EventBus, JobEventPublisher, ListenerHandle, RetryPolicy};
use hasty_infra::config::AppConfig;
use hasty_infra::jobs::JobStore;
use hasty_infra::workers::spawn_status_sync;
use hasty_infra::{AdmissionGuard, Backends};

/// Handles shared by every request.
#[derive(Clone)]
pub struct AppServices {
    pub store: Arc<dyn JobStore>,
    pub bus: Arc<dyn EventBus>,
    pub guard: AdmissionGuard<dyn JobStore>,
    pub publisher: JobEventPublisher<dyn EventBus>,
    /// Bound on admission + publish for one request
    pub request_timeout: Duration,
    pub publish_retry: RetryPolicy,
}

impl AppServices {
    pub fn new(backends: &Backends, cfg: &AppConfig) -> Self {
        Self {
            store: Arc::clone(&backends.store),
            bus: Arc::clone(&backends.bus),
            guard: AdmissionGuard::new(Arc::clone(&backends.store), cfg.admission_rules()),
            publisher: JobEventPublisher::new(Arc::clone(&backends.bus)),
            request_timeout: cfg.request_timeout(),
            publish_retry: cfg.publish_retry(),
        }
    }

    /// Keep the api's store in step with terminal events from the workers.
    pub async fn start_status_sync(
        &self,
        ack_wait: Duration,
        shutdown: CancellationToken,
    ) -> Result<Vec<ListenerHandle>, BusError> {
        spawn_status_sync(self.bus.as_ref(), Arc::clone(&self.store), ack_wait, shutdown).await
    }
}
