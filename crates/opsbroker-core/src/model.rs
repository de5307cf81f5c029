// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session data model (spec §3).

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::protocol::now_ms;
use crate::socket::Socket;

pub type ConnectionId = String;

pub fn new_connection_id() -> ConnectionId {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Agent,
    Dashboard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Degraded,
    Unhealthy,
}

impl Health {
    fn to_u8(self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Degraded => 1,
            Self::Unhealthy => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Healthy,
            1 => Self::Degraded,
            _ => Self::Unhealthy,
        }
    }
}

/// Subscription wildcard meaning "every entity of this kind" (spec §3).
pub const WILDCARD: &str = "*";

/// A dashboard's live subscription record (spec §3 `DashboardSubscriptions`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DashboardSubscriptions {
    pub agents: HashSet<String>,
    pub commands: HashSet<String>,
    pub traces: bool,
    pub terminals: bool,
}

impl DashboardSubscriptions {
    /// Build from the `DASHBOARD_INIT`/`DASHBOARD_SUBSCRIBE` payload shape,
    /// where an empty id list means "all" and is stored as the `"*"` sentinel.
    pub fn from_ids(agents: Vec<String>, commands: Vec<String>, traces: bool, terminals: bool) -> Self {
        Self {
            agents: normalize(agents),
            commands: normalize(commands),
            traces,
            terminals,
        }
    }

    pub fn matches_agent(&self, agent_id: &str) -> bool {
        self.agents.contains(WILDCARD) || self.agents.contains(agent_id)
    }

    pub fn matches_command(&self, command_id: &str) -> bool {
        self.commands.contains(WILDCARD) || self.commands.contains(command_id)
    }

    pub fn add_agents(&mut self, ids: Vec<String>) {
        merge(&mut self.agents, ids);
    }

    pub fn add_commands(&mut self, ids: Vec<String>) {
        merge(&mut self.commands, ids);
    }

    pub fn remove_agents(&mut self, ids: &[String]) {
        for id in ids {
            self.agents.remove(id);
        }
    }

    pub fn remove_commands(&mut self, ids: &[String]) {
        for id in ids {
            self.commands.remove(id);
        }
    }
}

fn normalize(ids: Vec<String>) -> HashSet<String> {
    if ids.is_empty() {
        HashSet::from([WILDCARD.to_owned()])
    } else {
        ids.into_iter().collect()
    }
}

fn merge(set: &mut HashSet<String>, ids: Vec<String>) {
    if ids.is_empty() {
        set.insert(WILDCARD.to_owned());
    } else {
        set.extend(ids);
    }
}

/// One live duplex connection (spec §3 `Session`).
pub struct Session {
    pub connection_id: ConnectionId,
    pub kind: SessionKind,
    pub socket: Arc<dyn Socket>,

    agent_id: RwLock<Option<String>>,
    user_id: RwLock<Option<String>>,
    subscriptions: RwLock<DashboardSubscriptions>,

    pub connected_at_ms: i64,
    last_activity_at_ms: AtomicI64,
    last_ping_sent_at_ms: AtomicI64,
    last_pong_at_ms: AtomicI64,

    messages_count: AtomicU64,
    bytes_count: AtomicU64,
    missed_pings: AtomicU32,

    authenticated: AtomicBool,
    health: AtomicU8,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("connection_id", &self.connection_id)
            .field("kind", &self.kind)
            .field("authenticated", &self.is_authenticated())
            .field("health", &self.health())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(connection_id: ConnectionId, kind: SessionKind, socket: Arc<dyn Socket>) -> Arc<Self> {
        let now = now_ms();
        Arc::new(Self {
            connection_id,
            kind,
            socket,
            agent_id: RwLock::new(None),
            user_id: RwLock::new(None),
            subscriptions: RwLock::new(DashboardSubscriptions::default()),
            connected_at_ms: now,
            last_activity_at_ms: AtomicI64::new(now),
            last_ping_sent_at_ms: AtomicI64::new(0),
            last_pong_at_ms: AtomicI64::new(0),
            messages_count: AtomicU64::new(0),
            bytes_count: AtomicU64::new(0),
            missed_pings: AtomicU32::new(0),
            authenticated: AtomicBool::new(false),
            health: AtomicU8::new(Health::Healthy.to_u8()),
        })
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub fn set_authenticated(&self, value: bool) {
        self.authenticated.store(value, Ordering::Release);
    }

    pub fn health(&self) -> Health {
        Health::from_u8(self.health.load(Ordering::Acquire))
    }

    pub fn set_health(&self, health: Health) {
        self.health.store(health.to_u8(), Ordering::Release);
    }

    pub async fn agent_id(&self) -> Option<String> {
        self.agent_id.read().await.clone()
    }

    /// Sets the agent id iff not already set (spec §3 invariant (c)).
    /// Returns `false` if an agent id was already present.
    pub async fn set_agent_id_once(&self, agent_id: String) -> bool {
        let mut guard = self.agent_id.write().await;
        if guard.is_some() {
            return false;
        }
        *guard = Some(agent_id);
        true
    }

    pub async fn user_id(&self) -> Option<String> {
        self.user_id.read().await.clone()
    }

    pub async fn set_user_id(&self, user_id: String) {
        *self.user_id.write().await = Some(user_id);
    }

    pub async fn subscriptions(&self) -> DashboardSubscriptions {
        self.subscriptions.read().await.clone()
    }

    pub async fn with_subscriptions_mut<R>(&self, f: impl FnOnce(&mut DashboardSubscriptions) -> R) -> R {
        let mut guard = self.subscriptions.write().await;
        f(&mut guard)
    }

    pub fn touch_activity(&self) {
        self.last_activity_at_ms.store(now_ms(), Ordering::Release);
    }

    pub fn last_activity_at_ms(&self) -> i64 {
        self.last_activity_at_ms.load(Ordering::Acquire)
    }

    pub fn record_send(&self, bytes: usize) {
        self.messages_count.fetch_add(1, Ordering::Relaxed);
        self.bytes_count.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn messages_count(&self) -> u64 {
        self.messages_count.load(Ordering::Relaxed)
    }

    pub fn bytes_count(&self) -> u64 {
        self.bytes_count.load(Ordering::Relaxed)
    }

    pub fn record_ping_sent(&self) {
        self.last_ping_sent_at_ms.store(now_ms(), Ordering::Release);
    }

    pub fn last_ping_sent_at_ms(&self) -> i64 {
        self.last_ping_sent_at_ms.load(Ordering::Acquire)
    }

    pub fn last_pong_at_ms(&self) -> i64 {
        self.last_pong_at_ms.load(Ordering::Acquire)
    }

    /// Records a pong and returns the measured latency in milliseconds.
    pub fn record_pong(&self) -> i64 {
        let now = now_ms();
        self.last_pong_at_ms.store(now, Ordering::Release);
        self.missed_pings.store(0, Ordering::Release);
        (now - self.last_ping_sent_at_ms()).max(0)
    }

    pub fn missed_pings(&self) -> u32 {
        self.missed_pings.load(Ordering::Acquire)
    }

    pub fn incr_missed_pings(&self) -> u32 {
        self.missed_pings.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Send a serialized frame, recording activity/bytes on success.
    pub async fn send(&self, frame: String) -> Result<(), crate::socket::SocketError> {
        let len = frame.len();
        self.socket.send(frame).await?;
        self.record_send(len);
        Ok(())
    }

    pub async fn close(&self, code: u16, reason: &str) {
        self.socket.close(code, reason).await;
    }

    /// Point-in-time snapshot safe to hand to callers outside the pool lock.
    pub async fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            connection_id: self.connection_id.clone(),
            kind: self.kind,
            agent_id: self.agent_id().await,
            user_id: self.user_id().await,
            authenticated: self.is_authenticated(),
            health: self.health(),
            connected_at_ms: self.connected_at_ms,
            last_activity_at_ms: self.last_activity_at_ms(),
            messages_count: self.messages_count(),
            bytes_count: self.bytes_count(),
            missed_pings: self.missed_pings(),
        }
    }
}

/// Read-only snapshot of a session, safe to clone and hold outside locks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub connection_id: ConnectionId,
    pub kind: SessionKind,
    pub agent_id: Option<String>,
    pub user_id: Option<String>,
    pub authenticated: bool,
    pub health: Health,
    pub connected_at_ms: i64,
    pub last_activity_at_ms: i64,
    pub messages_count: u64,
    pub bytes_count: u64,
    pub missed_pings: u32,
}

#[cfg(test)]
#[path = "model_tests.rs"]
mod tests;
