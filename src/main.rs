//! Coordinator entry point.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ptt_controller::config::Config;
use ptt_controller::engine::{HttpMediaEngine, MediaEngine, MemoryMediaEngine};
use ptt_controller::observability::{self, HealthState};
use ptt_controller::signaling::server;
use ptt_controller::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init_tracing();

    let config = Config::from_env().context("loading configuration")?;
    info!(target: "ptt.main", ?config, "Starting PTT coordinator");

    let engine: Arc<dyn MediaEngine> = match &config.sfu_url {
        Some(url) => Arc::new(HttpMediaEngine::new(url.clone())),
        None => {
            warn!(target: "ptt.main", "No PTT_SFU_URL set, using in-memory engine (dev only)");
            Arc::new(MemoryMediaEngine::new())
        }
    };

    let root_token = CancellationToken::new();
    let (state, coordinator_task) = AppState::build(&config, engine, &root_token)
        .await
        .context("building application state")?;
    let health = Arc::new(HealthState::new());

    let server_task = tokio::spawn({
        let config = config.clone();
        let state = state.clone();
        let health = Arc::clone(&health);
        let token = root_token.clone();
        async move { server::serve(&config, state, health, token).await }
    });

    shutdown_signal().await;
    info!(target: "ptt.main", "Shutdown signal received, draining");
    health.set_ready(false);
    if let Err(e) = state.coordinator.begin_drain().await {
        warn!(target: "ptt.main", error = %e, "Drain request failed");
    }

    root_token.cancel();
    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(target: "ptt.main", error = %e, "Server exited with error"),
        Err(e) => warn!(target: "ptt.main", error = %e, "Server task failed"),
    }
    if let Err(e) = coordinator_task.await {
        warn!(target: "ptt.main", error = %e, "Coordinator task failed");
    }
    info!(target: "ptt.main", "Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
