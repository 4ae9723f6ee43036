//! Store and bus selection from configuration.
//!
//! - no `database` section: in-memory store
//! - no `redis` section: in-memory bus (single-process dev mode); nothing
//!   outside the process can consume it, so the api runs the lifecycle
//!   worker itself
//!
//! Both binaries build their handles here once at startup.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use hasty_events::{BusError, EventBus, InMemoryEventBus, JobEventPublisher};

use crate::config::{AppConfig, ConfigError};
use crate::jobs::{InMemoryJobStore, JobStore, JobStoreError, PostgresJobStore};
use crate::workers::{LifecycleOrchestrator, LifecycleWorker};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("job store unavailable: {0}")]
    Store(#[from] JobStoreError),

    #[error("event bus unavailable: {0}")]
    Bus(#[from] BusError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("redis configured but this build lacks the `redis` feature")]
    RedisDisabled,
}

/// Shared store and bus handles for one process.
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn JobStore>,
    pub bus: Arc<dyn EventBus>,
    postgres: Option<PostgresJobStore>,
    in_process_bus: bool,
}

impl core::fmt::Debug for Backends {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Backends")
            .field("postgres", &self.postgres.is_some())
            .field("in_process_bus", &self.in_process_bus)
            .finish_non_exhaustive()
    }
}

impl Backends {
    /// In-process store and bus.
    pub fn in_memory() -> Self {
        Self {
            store: InMemoryJobStore::arc(),
            bus: Arc::new(InMemoryEventBus::new()),
            postgres: None,
            in_process_bus: true,
        }
    }

    pub async fn from_config(cfg: &AppConfig) -> Result<Self, BackendError> {
        let mut backends = Self::in_memory();

        match &cfg.database {
            Some(db) => {
                let store = PostgresJobStore::connect(&db.url, db.max_connections).await?;
                info!(max_connections = db.max_connections, "using postgres job store");
                backends.store = Arc::new(store.clone());
                backends.postgres = Some(store);
            }
            None => warn!("no database configured; using in-memory job store"),
        }

        match &cfg.redis {
            Some(redis) => {
                backends.bus = connect_redis(&redis.url, &redis.stream_prefix).await?;
                backends.in_process_bus = false;
            }
            None => warn!("no redis configured; using in-memory event bus"),
        }

        Ok(backends)
    }

    /// `true` when the bus lives in this process only.
    pub fn bus_is_in_process(&self) -> bool {
        self.in_process_bus
    }

    /// Start a lifecycle worker over these handles.
    pub async fn start_worker(
        &self,
        cfg: &AppConfig,
        shutdown: CancellationToken,
    ) -> Result<LifecycleWorker, BackendError> {
        let orchestrator = Arc::new(LifecycleOrchestrator::new(
            Arc::clone(&self.store),
            JobEventPublisher::new(Arc::clone(&self.bus)),
            cfg.sleep_policy()?,
        ));
        let worker = LifecycleWorker::start(
            Arc::clone(&self.bus),
            orchestrator,
            cfg.worker_config(),
            shutdown,
        )
        .await?;
        Ok(worker)
    }

    /// Worker for a process that publishes `job:created` onto an in-process
    /// bus; `None` when a shared bus reaches separate workers.
    pub async fn start_embedded_worker(
        &self,
        cfg: &AppConfig,
        shutdown: CancellationToken,
    ) -> Result<Option<LifecycleWorker>, BackendError> {
        if !self.in_process_bus {
            return Ok(None);
        }
        warn!("in-memory event bus; running the lifecycle worker in this process");
        self.start_worker(cfg, shutdown).await.map(Some)
    }

    /// Release connections; call once at shutdown.
    pub async fn close(&self) {
        if let Err(e) = self.bus.close().await {
            warn!(error = %e, "event bus close failed");
        }
        if let Some(pg) = &self.postgres {
            pg.close().await;
        }
    }
}

#[cfg(feature = "redis")]
async fn connect_redis(url: &str, prefix: &str) -> Result<Arc<dyn EventBus>, BackendError> {
    let bus = crate::event_bus::RedisStreamsEventBus::connect(url, Some(prefix.to_string())).await?;
    info!(prefix, "using redis streams event bus");
    Ok(Arc::new(bus))
}

#[cfg(not(feature = "redis"))]
async fn connect_redis(_url: &str, _prefix: &str) -> Result<Arc<dyn EventBus>, BackendError> {
    Err(BackendError::RedisDisabled)
}
