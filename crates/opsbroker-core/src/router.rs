// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! MessageRouter — envelope validation, authorization, dispatch, and the
//! command→dashboard affinity table (spec §4.4).

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{BrokerError, ErrorCode};
use crate::external::{AgentService, AuditEvent, AuditService, CommandService};
use crate::heartbeat::HeartbeatEngine;
use crate::model::{ConnectionId, DashboardSubscriptions, SessionKind};
use crate::mux::TerminalStreamMux;
use crate::pool::ConnectionPool;
use crate::protocol::{now_ms, Envelope, MessageType};
use crate::token::TokenManager;

/// `priority=5` is the documented "normal" default for a `COMMAND_REQUEST`
/// that doesn't specify one (spec §4.4 dispatch table).
const DEFAULT_PRIORITY: i64 = 5;
const DEFAULT_MAX_RETRIES: i64 = 1;

/// Configuration the router needs beyond what the collaborators already own.
#[derive(Debug, Clone, Copy)]
pub struct RouterConfig {
    pub command_default_time_limit_ms: i64,
    pub command_default_max_retries: i64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self { command_default_time_limit_ms: 300_000, command_default_max_retries: DEFAULT_MAX_RETRIES }
    }
}

/// The owning dashboard and originating agent of a live command, so an
/// agent disconnect can fail exactly the commands it owned (spec §8 scenario 5).
#[derive(Debug, Clone)]
struct AffinityEntry {
    dashboard_id: ConnectionId,
    agent_id: String,
}

pub struct MessageRouter {
    pool: Arc<ConnectionPool>,
    mux: Arc<TerminalStreamMux>,
    heartbeat: Arc<HeartbeatEngine>,
    #[allow(dead_code)]
    tokens: Arc<TokenManager>,
    agents: Arc<dyn AgentService>,
    commands: Arc<dyn CommandService>,
    audit: Arc<dyn AuditService>,
    config: RouterConfig,
    /// `commandId -> (connectionId, agentId)` (spec §3 `CommandAffinity`).
    affinity: DashMap<String, AffinityEntry>,
}

impl MessageRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: Arc<ConnectionPool>,
        mux: Arc<TerminalStreamMux>,
        heartbeat: Arc<HeartbeatEngine>,
        tokens: Arc<TokenManager>,
        agents: Arc<dyn AgentService>,
        commands: Arc<dyn CommandService>,
        audit: Arc<dyn AuditService>,
        config: RouterConfig,
    ) -> Arc<Self> {
        Arc::new(Self { pool, mux, heartbeat, tokens, agents, commands, audit, config, affinity: DashMap::new() })
    }

    fn error_envelope(code: ErrorCode, message: impl Into<String>) -> Envelope {
        let body = BrokerError::new(code, message).to_error_body();
        Envelope::new(
            MessageType::Error.as_str(),
            crate::model::new_connection_id(),
            serde_json::to_value(body).unwrap_or(Value::Null),
        )
    }

    fn ack_envelope(message_id: &str, payload: Value) -> Envelope {
        let mut merged = serde_json::json!({ "messageId": message_id, "success": true });
        if let (Value::Object(m), Value::Object(p)) = (&mut merged, payload) {
            m.extend(p);
        }
        Envelope::new(MessageType::Ack.as_str(), crate::model::new_connection_id(), merged)
    }

    /// Copy-then-release fan-out (spec §5): snapshot authenticated dashboards
    /// whose subscription record satisfies `pred`, release the pool lookup,
    /// then send outside any lock.
    async fn broadcast_matching_dashboards(&self, frame: &str, pred: impl Fn(&DashboardSubscriptions) -> bool) -> usize {
        let dashboards = self.pool.authenticated_dashboards().await;
        let mut targets = Vec::new();
        for session in dashboards {
            if pred(&session.subscriptions().await) {
                targets.push(session);
            }
        }
        let mut delivered = 0;
        for session in targets {
            if session.send(frame.to_owned()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Validate shape + authorization, then dispatch. Always returns a frame
    /// to send back to `session` — an `ERROR` on rejection, an `ACK`/`PONG`
    /// otherwise — never panics on malformed input (spec §7).
    pub async fn handle_dashboard_frame(&self, session: &Arc<crate::model::Session>, raw: &str) -> Envelope {
        let envelope = match Envelope::parse(raw) {
            Ok(e) => e,
            Err(err) => return Self::error_envelope(err.code, err.message),
        };
        session.touch_activity();

        let Some(kind) = MessageType::parse(&envelope.kind) else {
            return Self::error_envelope(ErrorCode::InvalidMessageType, format!("unknown message type {}", envelope.kind));
        };
        if !kind.dashboard_allowed() {
            return Self::error_envelope(ErrorCode::InvalidMessageType, format!("{} not permitted from a dashboard", envelope.kind));
        }

        match kind {
            MessageType::DashboardInit => self.handle_dashboard_init(session, &envelope).await,
            MessageType::DashboardSubscribe => self.handle_dashboard_subscribe(session, &envelope, true).await,
            MessageType::DashboardUnsubscribe => self.handle_dashboard_subscribe(session, &envelope, false).await,
            MessageType::CommandRequest => self.handle_command_request(session, &envelope).await,
            MessageType::CommandCancel => self.handle_command_cancel(session, &envelope).await,
            MessageType::AgentControl => self.handle_agent_control(session, &envelope).await,
            MessageType::EmergencyStop => self.handle_emergency_stop(session, &envelope).await,
            MessageType::Ping => Self::handle_ping(&envelope),
            MessageType::Pong => {
                self.heartbeat.record_pong(&session.connection_id).await;
                Self::ack_envelope(&envelope.id, serde_json::json!({}))
            }
            MessageType::TokenRefresh => Self::ack_envelope(&envelope.id, serde_json::json!({})),
            _ => Self::error_envelope(ErrorCode::InvalidMessageType, format!("{} not permitted from a dashboard", envelope.kind)),
        }
    }

    /// Agent-originated frames: status/heartbeat/command-result/terminal/trace.
    /// Most fan out to dashboards rather than producing a direct reply; `None`
    /// means the handler already sent everything needed.
    pub async fn handle_agent_frame(&self, session: &Arc<crate::model::Session>, raw: &str) -> Option<Envelope> {
        let envelope = match Envelope::parse(raw) {
            Ok(e) => e,
            Err(err) => return Some(Self::error_envelope(err.code, err.message)),
        };
        session.touch_activity();

        let Some(kind) = MessageType::parse(&envelope.kind) else {
            return Some(Self::error_envelope(ErrorCode::InvalidMessageType, format!("unknown message type {}", envelope.kind)));
        };
        if !kind.agent_allowed() {
            return Some(Self::error_envelope(ErrorCode::InvalidMessageType, format!("{} not permitted from an agent", envelope.kind)));
        }

        let agent_id = session.agent_id().await.unwrap_or_default();

        match kind {
            MessageType::AgentConnect => Some(self.handle_agent_connect(session, &envelope).await),
            MessageType::AgentStatus | MessageType::AgentHeartbeat => {
                let frame = envelope.to_text();
                self.broadcast_matching_dashboards(&frame, |s| s.matches_agent(&agent_id)).await;
                None
            }
            MessageType::CommandStatus | MessageType::CommandProgress | MessageType::CommandResult => {
                self.handle_command_status(&agent_id, &envelope).await;
                None
            }
            MessageType::TerminalStream => {
                self.ingest_terminal_stream(&agent_id, &envelope);
                None
            }
            MessageType::TraceStream => {
                let frame = envelope.to_text();
                self.broadcast_matching_dashboards(&frame, |s| s.traces).await;
                None
            }
            MessageType::Ping => Some(Self::handle_ping(&envelope)),
            MessageType::Pong => {
                self.heartbeat.record_pong(&session.connection_id).await;
                None
            }
            _ => Some(Self::error_envelope(ErrorCode::InvalidMessageType, format!("{} not permitted from an agent", envelope.kind))),
        }
    }

    /// `UNAUTH -> AUTH` for an agent session (spec §4.6): binds `agentId`
    /// and acknowledges. Token validation and registration happen earlier,
    /// at the gateway's WS upgrade, since only it holds the raw bearer token.
    async fn handle_agent_connect(&self, session: &Arc<crate::model::Session>, envelope: &Envelope) -> Envelope {
        if session.is_authenticated() {
            return Self::error_envelope(ErrorCode::InitFailed, "already connected");
        }
        let Some(agent_id) = envelope.payload.get("agentId").and_then(Value::as_str) else {
            return Self::error_envelope(ErrorCode::InvalidMessage, "agentId is required");
        };
        if !session.set_agent_id_once(agent_id.to_owned()).await {
            return Self::error_envelope(ErrorCode::InitFailed, "already connected");
        }
        session.set_authenticated(true);
        self.pool.notify_updated(&session.connection_id).await;

        info!(connection_id = %session.connection_id, agent_id, "agent connected");
        Self::ack_envelope(&envelope.id, serde_json::json!({ "agentId": agent_id }))
    }

    async fn handle_dashboard_init(&self, session: &Arc<crate::model::Session>, envelope: &Envelope) -> Envelope {
        if session.is_authenticated() {
            return Self::error_envelope(ErrorCode::InitFailed, "already initialized");
        }

        let Some(user_id) = envelope.payload.get("userId").and_then(Value::as_str) else {
            return Self::error_envelope(ErrorCode::Unauthorized, "missing userId");
        };

        session.set_authenticated(true);
        session.set_user_id(user_id.to_owned()).await;

        let subs = parse_subscriptions(envelope.payload.get("subscriptions"));
        let wants_all_agents = subs.agents.contains(crate::model::WILDCARD);
        session.with_subscriptions_mut(|s| *s = subs).await;
        if wants_all_agents {
            let known = self.agents.list_known_agents().await;
            session
                .with_subscriptions_mut(|s| s.add_agents(known.iter().map(|a| a.agent_id.clone()).collect()))
                .await;
        }
        self.pool.notify_updated(&session.connection_id).await;

        let known_agents = self.agents.list_known_agents().await;
        let mut online = Vec::new();
        for record in &known_agents {
            if self.pool.agent_session(&record.agent_id).await.is_some() {
                online.push(record.agent_id.clone());
            }
        }

        let snapshot_agents: Vec<Value> = known_agents
            .iter()
            .map(|a| {
                serde_json::json!({
                    "agentId": a.agent_id,
                    "name": a.name,
                    "type": a.agent_type.to_uppercase(),
                    "status": if online.contains(&a.agent_id) { "CONNECTED" } else { "DISCONNECTED" },
                })
            })
            .collect();

        let connected = Envelope::new(
            MessageType::DashboardConnected.as_str(),
            crate::model::new_connection_id(),
            serde_json::json!({ "agents": snapshot_agents }),
        );
        let _ = session.send(connected.to_text()).await;

        for record in &known_agents {
            let status = if online.contains(&record.agent_id) { "connected" } else { "disconnected" };
            let frame = Envelope::new(
                MessageType::AgentStatus.as_str(),
                crate::model::new_connection_id(),
                serde_json::json!({ "agentId": record.agent_id, "status": status }),
            );
            let _ = session.send(frame.to_text()).await;
        }

        info!(connection_id = %session.connection_id, user_id, "dashboard initialized");
        Self::ack_envelope(&envelope.id, serde_json::json!({}))
    }

    async fn handle_dashboard_subscribe(&self, session: &Arc<crate::model::Session>, envelope: &Envelope, subscribe: bool) -> Envelope {
        if !session.is_authenticated() {
            return Self::error_envelope(ErrorCode::Unauthorized, "not initialized");
        }

        let agents_present = envelope.payload.get("agents").is_some();
        let commands_present = envelope.payload.get("commands").is_some();
        let agent_ids = string_array(envelope.payload.get("agents"));
        let command_ids = string_array(envelope.payload.get("commands"));
        let traces = envelope.payload.get("traces").and_then(Value::as_bool);
        let terminals = envelope.payload.get("terminals").and_then(Value::as_bool);
        let wants_all_agents = subscribe && agents_present && agent_ids.is_empty();

        session
            .with_subscriptions_mut(|s| {
                if subscribe {
                    if agents_present {
                        s.add_agents(agent_ids.clone());
                    }
                    if commands_present {
                        s.add_commands(command_ids.clone());
                    }
                    if let Some(t) = traces {
                        s.traces = t;
                    }
                    if let Some(t) = terminals {
                        s.terminals = t;
                    }
                } else {
                    if agents_present {
                        s.remove_agents(&agent_ids);
                    }
                    if commands_present {
                        s.remove_commands(&command_ids);
                    }
                    if traces == Some(true) {
                        s.traces = false;
                    }
                    if terminals == Some(true) {
                        s.terminals = false;
                    }
                }
            })
            .await;

        if wants_all_agents {
            let known = self.agents.list_known_agents().await;
            session
                .with_subscriptions_mut(|s| s.add_agents(known.iter().map(|a| a.agent_id.clone()).collect()))
                .await;
        }

        self.pool.notify_updated(&session.connection_id).await;
        let snapshot = session.subscriptions().await;
        Self::ack_envelope(&envelope.id, serde_json::json!({ "subscriptions": snapshot }))
    }

    async fn handle_command_request(&self, session: &Arc<crate::model::Session>, envelope: &Envelope) -> Envelope {
        if !session.is_authenticated() {
            return Self::error_envelope(ErrorCode::Unauthorized, "not initialized");
        }

        let payload = &envelope.payload;
        let (Some(agent_id), Some(command_id), Some(command)) = (
            payload.get("agentId").and_then(Value::as_str),
            payload.get("commandId").and_then(Value::as_str),
            payload.get("command").and_then(Value::as_str),
        ) else {
            return Self::error_envelope(ErrorCode::InvalidMessage, "agentId, commandId, and command are required");
        };

        let args = string_array(payload.get("args"));
        let priority = payload.get("priority").and_then(Value::as_i64).unwrap_or(DEFAULT_PRIORITY);
        let max_retries = payload
            .get("executionConstraints")
            .and_then(|c| c.get("maxRetries"))
            .and_then(Value::as_i64)
            .unwrap_or(self.config.command_default_max_retries);
        let time_limit_ms = payload
            .get("executionConstraints")
            .and_then(|c| c.get("timeLimitMs"))
            .and_then(Value::as_i64)
            .unwrap_or(self.config.command_default_time_limit_ms);

        self.affinity.insert(
            command_id.to_owned(),
            AffinityEntry { dashboard_id: session.connection_id.clone(), agent_id: agent_id.to_owned() },
        );
        session.with_subscriptions_mut(|s| s.add_commands(vec![command_id.to_owned()])).await;

        let user_id = session.user_id().await.unwrap_or_default();
        let agent_payload = serde_json::json!({
            "commandId": command_id,
            "content": command,
            "command": command,
            "type": "NATURAL",
            "priority": priority,
            "args": args,
            "executionConstraints": { "timeLimitMs": time_limit_ms, "maxRetries": max_retries },
            "dashboardId": session.connection_id,
            "userId": user_id,
        });
        let agent_frame = Envelope::new(MessageType::CommandRequest.as_str(), crate::model::new_connection_id(), agent_payload);

        let delivered = match self.pool.agent_session(agent_id).await {
            Some(agent_session) => agent_session.send(agent_frame.to_text()).await.is_ok(),
            None => false,
        };

        if !delivered {
            self.affinity.remove(command_id);
            session.with_subscriptions_mut(|s| s.remove_commands(&[command_id.to_owned()])).await;
            warn!(agent_id, command_id, "command routing failed: agent absent or send failed");
            return Self::error_envelope(ErrorCode::RoutingFailed, format!("agent {agent_id} is not reachable"));
        }

        self.commands.record_command_request(command_id, agent_id, command).await;
        debug!(agent_id, command_id, "command routed to agent");
        Self::ack_envelope(&envelope.id, serde_json::json!({ "commandId": command_id }))
    }

    async fn handle_command_cancel(&self, session: &Arc<crate::model::Session>, envelope: &Envelope) -> Envelope {
        let Some(command_id) = envelope.payload.get("commandId").and_then(Value::as_str) else {
            return Self::error_envelope(ErrorCode::InvalidMessage, "commandId is required");
        };

        let owner = self.affinity.get(command_id).map(|r| r.value().clone());
        let Some(owner) = owner else {
            return Self::error_envelope(ErrorCode::RoutingFailed, "command has no live affinity");
        };
        if owner.dashboard_id != session.connection_id {
            return Self::error_envelope(ErrorCode::Forbidden, "command is not owned by this dashboard");
        }

        let cancel_frame = Envelope::new(
            MessageType::CommandCancel.as_str(),
            crate::model::new_connection_id(),
            serde_json::json!({ "commandId": command_id }),
        );
        let delivered = match self.pool.agent_session(&owner.agent_id).await {
            Some(agent_session) => agent_session.send(cancel_frame.to_text()).await.is_ok(),
            None => false,
        };
        if !delivered {
            return Self::error_envelope(ErrorCode::RoutingFailed, format!("agent {} is not reachable", owner.agent_id));
        }

        Self::ack_envelope(&envelope.id, serde_json::json!({ "commandId": command_id }))
    }

    async fn handle_agent_control(&self, session: &Arc<crate::model::Session>, envelope: &Envelope) -> Envelope {
        if !session.is_authenticated() {
            return Self::error_envelope(ErrorCode::Unauthorized, "not initialized");
        }
        let Some(agent_id) = envelope.payload.get("agentId").and_then(Value::as_str) else {
            return Self::error_envelope(ErrorCode::InvalidMessage, "agentId is required");
        };

        let frame = Envelope::new(MessageType::AgentControl.as_str(), crate::model::new_connection_id(), envelope.payload.clone());
        let delivered = match self.pool.agent_session(agent_id).await {
            Some(agent_session) => agent_session.send(frame.to_text()).await.is_ok(),
            None => false,
        };
        if !delivered {
            return Self::error_envelope(ErrorCode::RoutingFailed, format!("agent {agent_id} is not reachable"));
        }
        Self::ack_envelope(&envelope.id, serde_json::json!({}))
    }

    async fn handle_emergency_stop(&self, session: &Arc<crate::model::Session>, envelope: &Envelope) -> Envelope {
        let frame = Envelope::new(MessageType::EmergencyStop.as_str(), crate::model::new_connection_id(), serde_json::json!({}));
        self.pool.broadcast(&frame.to_text(), |s| s.kind == SessionKind::Agent).await;

        let user_id = session.user_id().await;
        self.audit
            .record(AuditEvent { action: "emergency_stop".into(), actor_user_id: user_id, detail: "broadcast stop to all agents".into() })
            .await;
        warn!(connection_id = %session.connection_id, "emergency stop issued");
        Self::ack_envelope(&envelope.id, serde_json::json!({}))
    }

    fn handle_ping(envelope: &Envelope) -> Envelope {
        let latency = (now_ms() - envelope.timestamp).max(0);
        Envelope::new(
            MessageType::Pong.as_str(),
            crate::model::new_connection_id(),
            serde_json::json!({ "timestamp": envelope.timestamp, "latency": latency }),
        )
    }

    async fn handle_command_status(&self, agent_id: &str, envelope: &Envelope) {
        let Some(command_id) = envelope.payload.get("commandId").and_then(Value::as_str) else {
            return;
        };
        let frame = envelope.to_text();
        let command_id_owned = command_id.to_owned();
        self.broadcast_matching_dashboards(&frame, |s| s.matches_command(&command_id_owned) || s.matches_agent(agent_id)).await;

        let status = envelope.payload.get("status").and_then(Value::as_str).unwrap_or("");
        if matches!(status, "completed" | "failed" | "cancelled") {
            self.affinity.remove(command_id);
            debug!(command_id, status, "command affinity cleared on terminal status");
        }
    }

    fn ingest_terminal_stream(&self, agent_id: &str, envelope: &Envelope) {
        let Some(content) = envelope.payload.get("content").and_then(Value::as_str) else {
            return;
        };
        let command_id = envelope.payload.get("commandId").and_then(Value::as_str).map(String::from);
        let sequence = envelope.payload.get("sequence").and_then(Value::as_i64).unwrap_or(0);
        let stream_type = match envelope.payload.get("streamType").and_then(Value::as_str) {
            Some("stderr") => crate::mux::StreamType::Stderr,
            Some("system") => crate::mux::StreamType::System,
            _ => crate::mux::StreamType::Stdout,
        };

        self.mux.ingest(
            agent_id,
            command_id.as_deref(),
            crate::mux::TerminalFrame { stream_type, content: content.to_owned(), sequence },
        );
    }

    /// Notify subscribers an agent vanished, then fail every command it owned
    /// and clear their affinity (spec §4.6, §8 scenario 5).
    pub async fn handle_agent_disconnected(&self, agent_id: &str) {
        let broadcast_frame = Envelope::new(
            MessageType::AgentDisconnect.as_str(),
            crate::model::new_connection_id(),
            serde_json::json!({ "agentId": agent_id }),
        );
        let agent_id_owned = agent_id.to_owned();
        self.broadcast_matching_dashboards(&broadcast_frame.to_text(), move |s| s.matches_agent(&agent_id_owned)).await;

        let owned_commands: Vec<String> = self
            .affinity
            .iter()
            .filter(|r| r.value().agent_id == agent_id)
            .map(|r| r.key().clone())
            .collect();

        for command_id in owned_commands {
            self.fail_command_for_dashboard(&command_id, "agent_disconnected").await;
        }
    }

    /// Fail and clear one command's affinity, notifying its owning dashboard.
    async fn fail_command_for_dashboard(&self, command_id: &str, reason: &str) {
        if let Some((_, entry)) = self.affinity.remove(command_id) {
            let frame = Envelope::new(
                MessageType::CommandStatus.as_str(),
                crate::model::new_connection_id(),
                serde_json::json!({ "commandId": command_id, "status": "failed", "reason": reason }),
            );
            self.pool.send_to(&entry.dashboard_id, &frame.to_text()).await;
        }
    }

    /// Clear every affinity entry owned by a disconnecting dashboard (spec §4.6).
    pub fn clear_affinity_for_dashboard(&self, connection_id: &str) {
        self.affinity.retain(|_, entry| entry.dashboard_id != connection_id);
    }

    pub fn affinity_owner(&self, command_id: &str) -> Option<ConnectionId> {
        self.affinity.get(command_id).map(|r| r.value().dashboard_id.clone())
    }

    pub fn affinity_len(&self) -> usize {
        self.affinity.len()
    }
}

fn string_array(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default()
}

fn parse_subscriptions(value: Option<&Value>) -> DashboardSubscriptions {
    let Some(value) = value else {
        return DashboardSubscriptions::from_ids(vec![], vec![], false, false);
    };
    let agents = value.get("agents").map(|v| string_array(Some(v)));
    let commands = value.get("commands").map(|v| string_array(Some(v)));
    let traces = value.get("traces").and_then(Value::as_bool).unwrap_or(false);
    let terminals = value.get("terminals").and_then(Value::as_bool).unwrap_or(false);
    DashboardSubscriptions::from_ids(agents.unwrap_or_default(), commands.unwrap_or_default(), traces, terminals)
}

#[cfg(test)]
#[path = "router_tests.rs"]
mod tests;
