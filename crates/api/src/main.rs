use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use hasty_api::app::{build_app, services::AppServices};
use hasty_infra::{AppConfig, Backends};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = AppConfig::load().context("loading configuration")?;
    hasty_observability::init_with(&cfg.observability.log_level, cfg.observability.json);

    let backends = Backends::from_config(&cfg)
        .await
        .context("connecting backends")?;
    let services = Arc::new(AppServices::new(&backends, &cfg));

    let shutdown = CancellationToken::new();
    let sync = services
        .start_status_sync(cfg.ack_wait(), shutdown.child_token())
        .await
        .context("subscribing to terminal events")?;
    let embedded = backends
        .start_embedded_worker(&cfg, shutdown.child_token())
        .await
        .context("starting in-process worker")?;

    let addr = cfg.listen_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    let signal = shutdown.clone();
    axum::serve(listener, build_app(services))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            signal.cancel();
        })
        .await
        .context("http server")?;

    shutdown.cancel();
    for handle in sync {
        handle.shutdown().await;
    }
    if let Some(worker) = embedded {
        worker.shutdown().await;
    }
    backends.close().await;
    tracing::info!("api stopped");
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
