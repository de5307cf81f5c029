// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `GET /api/v1/health` — liveness and load snapshot (spec §6).

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub connection_count: usize,
    pub agent_count: usize,
    pub dashboard_count: usize,
    pub buffered_stream_keys: usize,
    pub terminal_overflow_count: u64,
    pub tracked_tokens: usize,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        connection_count: state.pool.snapshot_all().await.len(),
        agent_count: state.pool.authenticated_agents().await.len(),
        dashboard_count: state.pool.authenticated_dashboards().await.len(),
        buffered_stream_keys: state.mux.buffered_keys(),
        terminal_overflow_count: state.mux.overflow_count(),
        tracked_tokens: state.tokens.len(),
    })
}
