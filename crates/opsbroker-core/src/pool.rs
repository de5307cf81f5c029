// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! ConnectionPool — authoritative registry of live sessions (spec §4.1).

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{BrokerError, ErrorCode, Result};
use crate::model::{ConnectionId, Health, Session, SessionKind, SessionSnapshot};
use crate::socket::Socket;

/// Unauthenticated sessions older than this are evicted (spec §3 invariant (b)).
const UNAUTH_GRACE: Duration = Duration::from_secs(60);

/// Health-unhealthy threshold for cleanup-driven eviction (spec §4.1).
const UNHEALTHY_MISS_THRESHOLD: u32 = 5;

/// Typed pool lifecycle events, consumed by observers constructed at startup (spec §9).
#[derive(Debug, Clone)]
pub enum PoolEvent {
    Added(SessionSnapshot),
    Updated(SessionSnapshot),
    Removed(ConnectionId),
    HealthChanged(SessionSnapshot),
}

pub struct ConnectionPool {
    sessions: DashMap<ConnectionId, Arc<Session>>,
    max_connections: usize,
    events_tx: broadcast::Sender<PoolEvent>,
}

impl ConnectionPool {
    pub fn new(max_connections: usize) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(1024);
        Arc::new(Self { sessions: DashMap::new(), max_connections, events_tx })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events_tx.subscribe()
    }

    fn emit(&self, event: PoolEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Insert a new unauthenticated session. Fails with `CapacityExceeded`
    /// once the live count would exceed `max_connections`.
    pub async fn add(
        &self,
        connection_id: ConnectionId,
        kind: SessionKind,
        socket: Arc<dyn Socket>,
        _metadata: Value,
    ) -> Result<Arc<Session>> {
        if self.sessions.len() >= self.max_connections {
            return Err(BrokerError::new(ErrorCode::CapacityExceeded, "connection pool is full"));
        }

        let session = Session::new(connection_id.clone(), kind, socket);
        self.sessions.insert(connection_id, Arc::clone(&session));
        self.emit(PoolEvent::Added(session.snapshot().await));
        Ok(session)
    }

    /// Idempotent removal; emits `Removed` only if the session was present.
    pub async fn remove(&self, connection_id: &str) {
        if self.sessions.remove(connection_id).is_some() {
            self.emit(PoolEvent::Removed(connection_id.to_owned()));
        }
    }

    /// Internal accessor: a live handle usable for sends. External callers
    /// (HTTP status endpoints, dashboards) should use the `*_snapshot`
    /// lookups instead, which return immutable copies.
    pub fn get(&self, connection_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(connection_id).map(|r| Arc::clone(r.value()))
    }

    /// Fails with `UnknownSession` if the session is absent — used by
    /// callers that must mutate an existing session (spec §4.1 `update`).
    pub fn require(&self, connection_id: &str) -> Result<Arc<Session>> {
        self.get(connection_id)
            .ok_or_else(|| BrokerError::new(ErrorCode::InternalError, "unknown session"))
    }

    pub async fn notify_updated(&self, connection_id: &str) {
        if let Some(session) = self.get(connection_id) {
            self.emit(PoolEvent::Updated(session.snapshot().await));
        }
    }

    pub async fn notify_health_changed(&self, connection_id: &str) {
        if let Some(session) = self.get(connection_id) {
            self.emit(PoolEvent::HealthChanged(session.snapshot().await));
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub async fn snapshot_all(&self) -> Vec<SessionSnapshot> {
        let sessions: Vec<_> = self.sessions.iter().map(|r| Arc::clone(r.value())).collect();
        let mut out = Vec::with_capacity(sessions.len());
        for s in sessions {
            out.push(s.snapshot().await);
        }
        out
    }

    pub async fn by_kind(&self, kind: SessionKind) -> Vec<SessionSnapshot> {
        let mut out = self.snapshot_all().await;
        out.retain(|s| s.kind == kind);
        out
    }

    /// Resolve the live agent session for `agent_id`, if authenticated as that agent.
    pub async fn agent_session(&self, agent_id: &str) -> Option<Arc<Session>> {
        let candidates: Vec<_> = self
            .sessions
            .iter()
            .filter(|r| r.value().kind == SessionKind::Agent)
            .map(|r| Arc::clone(r.value()))
            .collect();
        for s in candidates {
            if s.agent_id().await.as_deref() == Some(agent_id) {
                return Some(s);
            }
        }
        None
    }

    pub async fn authenticated_dashboards(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .filter(|r| r.value().kind == SessionKind::Dashboard && r.value().is_authenticated())
            .map(|r| Arc::clone(r.value()))
            .collect()
    }

    pub async fn authenticated_agents(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .filter(|r| r.value().kind == SessionKind::Agent && r.value().is_authenticated())
            .map(|r| Arc::clone(r.value()))
            .collect()
    }

    /// Send to every authenticated session satisfying `filter`. Per-session
    /// failures are isolated: logged and counted, never aborting the batch
    /// (spec §4.1 Failure semantics).
    pub async fn broadcast(&self, frame: &str, filter: impl Fn(&Session) -> bool) -> usize {
        // Copy-then-release: snapshot the eligible set under no lock held
        // across sends (spec §5).
        let targets: Vec<_> = self
            .sessions
            .iter()
            .filter(|r| r.value().is_authenticated() && filter(r.value()))
            .map(|r| Arc::clone(r.value()))
            .collect();

        let mut delivered = 0;
        for session in targets {
            if session.send(frame.to_owned()).await.is_ok() {
                delivered += 1;
            } else {
                debug!(connection_id = %session.connection_id, "broadcast send failed, skipping");
            }
        }
        delivered
    }

    /// Send to exactly one connection. Returns `true` iff the socket was
    /// open and the send did not fail synchronously (spec §4.1 `sendTo`).
    pub async fn send_to(&self, connection_id: &str, frame: &str) -> bool {
        match self.get(connection_id) {
            Some(session) if session.socket.is_open() => session.send(frame.to_owned()).await.is_ok(),
            _ => false,
        }
    }

    pub async fn close_all(&self, code: u16, reason: &str) {
        let sessions: Vec<_> = self.sessions.iter().map(|r| Arc::clone(r.value())).collect();
        for s in sessions {
            s.close(code, reason).await;
        }
    }

    pub async fn close_by_kind(&self, kind: SessionKind, code: u16, reason: &str) {
        let sessions: Vec<_> =
            self.sessions.iter().filter(|r| r.value().kind == kind).map(|r| Arc::clone(r.value())).collect();
        for s in sessions {
            s.close(code, reason).await;
        }
    }

    pub async fn close_idle(&self, max_idle_ms: i64, code: u16, reason: &str) {
        let now = crate::protocol::now_ms();
        let sessions: Vec<_> = self
            .sessions
            .iter()
            .filter(|r| now - r.value().last_activity_at_ms() > max_idle_ms)
            .map(|r| Arc::clone(r.value()))
            .collect();
        for s in sessions {
            s.close(code, reason).await;
        }
    }

    /// Periodic cleanup pass (spec §4.1): idle timeout, stale unauthenticated
    /// sessions, and sessions unhealthy for too many consecutive misses.
    /// Agents and dashboards carry distinct idle thresholds (spec §6
    /// `connectionTimeoutMs`, "agent vs dashboard defaults").
    pub async fn cleanup_once(&self, agent_connection_timeout_ms: i64, dashboard_connection_timeout_ms: i64) {
        let now = crate::protocol::now_ms();
        let sessions: Vec<_> = self.sessions.iter().map(|r| Arc::clone(r.value())).collect();

        for session in sessions {
            let connection_timeout_ms = match session.kind {
                SessionKind::Agent => agent_connection_timeout_ms,
                SessionKind::Dashboard => dashboard_connection_timeout_ms,
            };
            let idle_for = now - session.last_activity_at_ms();
            let unauth_for_too_long =
                !session.is_authenticated() && (now - session.connected_at_ms) as u128 > UNAUTH_GRACE.as_millis();
            let unhealthy_too_long =
                session.health() == Health::Unhealthy && session.missed_pings() >= UNHEALTHY_MISS_THRESHOLD;

            if idle_for > connection_timeout_ms || unauth_for_too_long || unhealthy_too_long {
                debug!(
                    connection_id = %session.connection_id,
                    idle_for,
                    unauth_for_too_long,
                    unhealthy_too_long,
                    "cleanup evicting session"
                );
                session.close(4000, "cleanup").await;
                self.remove(&session.connection_id).await;
            }
        }
    }

    /// Run the cleanup loop until `shutdown` is cancelled.
    pub async fn run_cleanup_loop(
        self: Arc<Self>,
        cleanup_interval_ms: u64,
        agent_connection_timeout_ms: i64,
        dashboard_connection_timeout_ms: i64,
        shutdown: CancellationToken,
    ) {
        info!("connection pool cleanup loop started");
        let mut timer = tokio::time::interval(Duration::from_millis(cleanup_interval_ms));
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("connection pool cleanup loop shutting down");
                    return;
                }
                _ = timer.tick() => {
                    self.cleanup_once(agent_connection_timeout_ms, dashboard_connection_timeout_ms).await;
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "pool_tests.rs"]
mod tests;
