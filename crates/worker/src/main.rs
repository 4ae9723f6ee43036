//! Job-processing service: consumes `job:created` and drives each job to a
//! terminal status.

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use hasty_infra::{AppConfig, Backends};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = AppConfig::load().context("loading configuration")?;
    hasty_observability::init_with(&cfg.observability.log_level, cfg.observability.json);

    let backends = Backends::from_config(&cfg)
        .await
        .context("connecting backends")?;

    if backends.bus_is_in_process() {
        tracing::warn!("no redis configured; this worker only sees its own in-memory bus");
    }

    let shutdown = CancellationToken::new();
    let worker = backends
        .start_worker(&cfg, shutdown.child_token())
        .await
        .context("subscribing to job:created")?;

    tracing::info!(
        queue_group = %cfg.lifecycle.queue_group,
        durable = %cfg.lifecycle.durable_name,
        "worker running"
    );

    shutdown_signal().await;
    shutdown.cancel();
    worker.shutdown().await;
    backends.close().await;
    tracing::info!("worker stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
