// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP + WebSocket transport for the opsbroker gateway.

pub mod auth;
pub mod health;
pub mod ws;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::state::AppState;

/// Build the axum `Router`: `/ws/agent`, `/ws/dashboard`, `/api/v1/health`.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(health::health))
        .route("/ws/agent", get(ws::ws_agent))
        .route("/ws/dashboard", get(ws::ws_dashboard))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
