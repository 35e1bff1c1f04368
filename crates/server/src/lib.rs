// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Server binary crate: wire transport, configuration, and process
//! lifecycle around the `agentbridge-core` domain engine.

pub mod config;
pub mod error;
pub mod host;
pub mod router;
pub mod session;
pub mod state;

use std::sync::Arc;

use tokio::time::{sleep, Duration};
use tracing::info;

use crate::config::ServerConfig;
use crate::state::AppState;

/// Runs the server until a shutdown signal arrives, then drains in-flight
/// executions and persists state before returning. Mirrors the fan-in in
/// the component design: stop accepting, cancel executions, drain, close
/// logs, persist, exit.
pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let drain_deadline = config.shutdown_drain();
    let state = AppState::new(config).await?;

    spawn_signal_handler(state.shutdown.clone());

    host::serve(state.clone()).await?;

    info!("draining in-flight executions before shutdown");
    state.execution.cancel_all().await;
    let deadline = tokio::time::Instant::now() + drain_deadline;
    while state.execution.has_active().await && tokio::time::Instant::now() < deadline {
        sleep(Duration::from_millis(50)).await;
    }

    state.registry.shutdown().await.map_err(|e| anyhow::anyhow!("failed to persist on shutdown: {e}"))?;
    info!("shutdown complete");
    Ok(())
}

/// First SIGTERM/SIGINT triggers graceful shutdown (stop accepting, drain);
/// a second forces an immediate exit.
fn spawn_signal_handler(shutdown: tokio_util::sync::CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();

        tokio::select! {
            _ = async {
                if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
            } => info!("received SIGTERM"),
            _ = async {
                if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
            } => info!("received SIGINT"),
        }
        shutdown.cancel();

        tokio::select! {
            _ = async {
                if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
            } => info!("received signal again, forcing exit"),
            _ = async {
                if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
            } => info!("received signal again, forcing exit"),
        }
        std::process::exit(130);
    });
}
