// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `GET /ws/agent` and `GET /ws/dashboard` — WebSocket upgrade and the
//! per-connection read loop (spec §4.6 session state machine).

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use futures_util::StreamExt;
use serde::Deserialize;
use tracing::{debug, info, warn};

use opsbroker_core::error::{BrokerError, ErrorCode};
use opsbroker_core::model::{new_connection_id, SessionKind};
use opsbroker_core::protocol::{Envelope, MessageType};
use opsbroker_core::socket::Socket;

use crate::socket::AxumSocket;
use crate::state::AppState;
use crate::transport::auth::extract_token;

/// Mirrors `MessageRouter::error_envelope` for the sites that need to send an
/// `ERROR` frame before a `MessageRouter` session even exists (spec §4.6).
fn error_envelope(code: ErrorCode, message: impl Into<String>) -> Envelope {
    let body = BrokerError::new(code, message).to_error_body();
    Envelope::new(MessageType::Error.as_str(), new_connection_id(), serde_json::to_value(body).unwrap_or(serde_json::Value::Null))
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

pub async fn ws_agent(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade(state, headers, query, ws, SessionKind::Agent).await
}

pub async fn ws_dashboard(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade(state, headers, query, ws, SessionKind::Dashboard).await
}

async fn upgrade(
    state: Arc<AppState>,
    headers: HeaderMap,
    query: WsQuery,
    ws: WebSocketUpgrade,
    kind: SessionKind,
) -> axum::response::Response {
    let query_str = query.token.as_ref().map(|t| format!("token={t}")).unwrap_or_default();
    let Some(token) = extract_token(&headers, &query_str) else {
        return (StatusCode::UNAUTHORIZED, "missing bearer token").into_response();
    };

    let claims = match state.validator.validate(&token).await {
        Ok(claims) => claims,
        Err(err) => {
            debug!(err = %err, "ws upgrade rejected: invalid token");
            return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_connection(state, socket, kind, token, claims)).into_response()
}

async fn handle_connection(
    state: Arc<AppState>,
    socket: WebSocket,
    kind: SessionKind,
    token: String,
    claims: opsbroker_core::external::TokenClaims,
) {
    let connection_id = new_connection_id();
    let (socket_handle, mut reader) = AxumSocket::new(socket);

    let session = match state.pool.add(connection_id.clone(), kind, Arc::clone(&socket_handle) as _, serde_json::Value::Null).await {
        Ok(session) => session,
        Err(err) => {
            warn!(err = %err, "rejecting connection");
            let frame = error_envelope(ErrorCode::CapacityExceeded, err.message).to_text();
            let _ = socket_handle.send(frame).await;
            socket_handle.close(ErrorCode::CapacityExceeded.close_code().unwrap_or(1013), "capacity exceeded").await;
            return;
        }
    };

    state.tokens.register(
        connection_id.clone(),
        token,
        claims.expires_at_ms,
        claims.refresh_token,
        Some(claims.user_id),
        claims.agent_id,
    );

    info!(connection_id = %connection_id, kind = ?kind, "connection established");

    let auth_timeout = tokio::time::sleep(state.config.auth_timeout());
    tokio::pin!(auth_timeout);
    let mut awaiting_handshake = true;

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                session.close(1001, "shutting down").await;
                break;
            }
            () = &mut auth_timeout, if awaiting_handshake => {
                let _ = session.send(error_envelope(ErrorCode::AuthTimeout, "no handshake frame received").to_text()).await;
                session.close(ErrorCode::AuthTimeout.close_code().unwrap_or(4003), "auth timeout").await;
                break;
            }
            message = reader.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        if text.len() > state.config.max_payload {
                            let _ = session.send(error_envelope(ErrorCode::InvalidMessage, "frame exceeds max_payload").to_text()).await;
                            session.close(1009, "payload too large").await;
                            break;
                        }
                        dispatch(&state, &session, kind, text.as_str()).await;
                        if session.is_authenticated() {
                            awaiting_handshake = false;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        state.heartbeat.record_pong(&connection_id).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(connection_id = %connection_id, err = %err, "websocket read error");
                        break;
                    }
                }
            }
        }
    }

    if kind == SessionKind::Agent {
        if let Some(agent_id) = session.agent_id().await {
            state.router.handle_agent_disconnected(&agent_id).await;
        }
    }
    state.tokens.unregister(&connection_id);
    state.pool.remove(&connection_id).await;
    info!(connection_id = %connection_id, kind = ?kind, "connection closed");
}

async fn dispatch(state: &Arc<AppState>, session: &Arc<opsbroker_core::model::Session>, kind: SessionKind, raw: &str) {
    match kind {
        SessionKind::Dashboard => {
            let reply = state.router.handle_dashboard_frame(session, raw).await;
            let _ = session.send(reply.to_text()).await;
        }
        SessionKind::Agent => {
            if let Some(reply) = state.router.handle_agent_frame(session, raw).await {
                let _ = session.send(reply.to_text()).await;
            }
        }
    }
}
