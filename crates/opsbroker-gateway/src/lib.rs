// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Axum binary wiring `opsbroker-core`'s domain logic to real WebSocket sockets.

pub mod config;
pub mod socket;
pub mod state;
pub mod transport;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use config::BrokerConfig;
use state::{AppState, Collaborators};
use transport::build_router;

/// Run the gateway until shutdown. Background loops (cleanup, heartbeat,
/// token refresh, terminal flush) are spawned before the listener binds and
/// are all rooted at the same `CancellationToken`.
pub async fn run(config: BrokerConfig) -> anyhow::Result<()> {
    run_with_collaborators(config, Collaborators::default()).await
}

/// Same as [`run`] but lets a host application supply its own agent/command/
/// audit/token-validator backends instead of the in-memory defaults.
pub async fn run_with_collaborators(config: BrokerConfig, collaborators: Collaborators) -> anyhow::Result<()> {
    config.validate()?;
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    serve(listener, config, collaborators).await
}

/// Build the gateway, spawn its background loops, and serve on an
/// already-bound listener — split out from [`run_with_collaborators`] so
/// tests can bind an ephemeral port and learn the address before serving.
pub async fn serve(listener: TcpListener, config: BrokerConfig, collaborators: Collaborators) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let state = AppState::new(config.clone(), collaborators, shutdown.clone());

    tokio::spawn(Arc::clone(&state.pool).run_cleanup_loop(
        config.cleanup_interval_ms,
        config.agent_connection_timeout_ms,
        config.dashboard_connection_timeout_ms,
        shutdown.clone(),
    ));
    tokio::spawn(Arc::clone(&state.heartbeat).run(shutdown.clone()));
    tokio::spawn(Arc::clone(&state.tokens).run(config.refresh_interval_ms, shutdown.clone()));
    tokio::spawn(Arc::clone(&state.mux).run(shutdown.clone()));

    let router = build_router(Arc::clone(&state));
    info!("opsbroker gateway listening on {:?}", listener.local_addr());

    axum::serve(listener, router).with_graceful_shutdown(shutdown_signal(shutdown)).await?;
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    tokio::select! {
        () = ctrl_c => {}
        () = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}
