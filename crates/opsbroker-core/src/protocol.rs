// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire envelope and the closed `MessageType` set (spec §6).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BrokerError, ErrorCode};

/// `{ type, id, timestamp, payload }` — required shape of every frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub timestamp: i64,
    pub payload: Value,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, id: impl Into<String>, payload: Value) -> Self {
        Self { kind: kind.into(), id: id.into(), timestamp: now_ms(), payload }
    }

    /// Parse and validate the envelope shape from raw text. Does not check
    /// whether `kind` belongs to the closed `MessageType` set — that is a
    /// router/authorization concern, not a shape concern.
    pub fn parse(text: &str) -> Result<Self, BrokerError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| BrokerError::new(ErrorCode::InvalidMessage, format!("malformed JSON: {e}")))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, BrokerError> {
        let obj = value
            .as_object()
            .ok_or_else(|| BrokerError::new(ErrorCode::InvalidMessage, "frame must be a JSON object"))?;

        let kind = obj
            .get("type")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| BrokerError::new(ErrorCode::InvalidMessage, "type must be a non-empty string"))?
            .to_owned();

        let id = obj
            .get("id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| BrokerError::new(ErrorCode::InvalidMessage, "id must be a non-empty string"))?
            .to_owned();

        let timestamp = obj
            .get("timestamp")
            .and_then(Value::as_i64)
            .ok_or_else(|| BrokerError::new(ErrorCode::InvalidMessage, "timestamp must be a number"))?;

        let payload = obj
            .get("payload")
            .filter(|v| v.is_object())
            .cloned()
            .ok_or_else(|| BrokerError::new(ErrorCode::InvalidMessage, "payload must be an object"))?;

        Ok(Self { kind, id, timestamp, payload })
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_owned())
    }
}

/// The closed set of message types the router understands (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    DashboardInit,
    DashboardSubscribe,
    DashboardUnsubscribe,
    DashboardConnected,
    CommandRequest,
    CommandCancel,
    CommandStatus,
    CommandProgress,
    /// Canonical form; `COMMAND_COMPLETE` is accepted as an alias on input.
    CommandResult,
    CommandQueueUpdate,
    AgentConnect,
    AgentControl,
    AgentStatus,
    AgentMetrics,
    AgentHeartbeat,
    AgentDisconnect,
    EmergencyStop,
    TerminalStream,
    TraceStream,
    TokenRefresh,
    Ack,
    Error,
    Ping,
    Pong,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DashboardInit => "DASHBOARD_INIT",
            Self::DashboardSubscribe => "DASHBOARD_SUBSCRIBE",
            Self::DashboardUnsubscribe => "DASHBOARD_UNSUBSCRIBE",
            Self::DashboardConnected => "DASHBOARD_CONNECTED",
            Self::CommandRequest => "COMMAND_REQUEST",
            Self::CommandCancel => "COMMAND_CANCEL",
            Self::CommandStatus => "COMMAND_STATUS",
            Self::CommandProgress => "COMMAND_PROGRESS",
            Self::CommandResult => "COMMAND_RESULT",
            Self::CommandQueueUpdate => "COMMAND_QUEUE_UPDATE",
            Self::AgentConnect => "AGENT_CONNECT",
            Self::AgentControl => "AGENT_CONTROL",
            Self::AgentStatus => "AGENT_STATUS",
            Self::AgentMetrics => "AGENT_METRICS",
            Self::AgentHeartbeat => "AGENT_HEARTBEAT",
            Self::AgentDisconnect => "AGENT_DISCONNECT",
            Self::EmergencyStop => "EMERGENCY_STOP",
            Self::TerminalStream => "TERMINAL_STREAM",
            Self::TraceStream => "TRACE_STREAM",
            Self::TokenRefresh => "TOKEN_REFRESH",
            Self::Ack => "ACK",
            Self::Error => "ERROR",
            Self::Ping => "PING",
            Self::Pong => "PONG",
        }
    }

    /// Parse from the wire string, treating `COMMAND_COMPLETE` as an alias
    /// of `COMMAND_RESULT` per the Open Question resolution in SPEC_FULL.md.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "DASHBOARD_INIT" => Self::DashboardInit,
            "DASHBOARD_SUBSCRIBE" => Self::DashboardSubscribe,
            "DASHBOARD_UNSUBSCRIBE" => Self::DashboardUnsubscribe,
            "DASHBOARD_CONNECTED" => Self::DashboardConnected,
            "COMMAND_REQUEST" => Self::CommandRequest,
            "COMMAND_CANCEL" => Self::CommandCancel,
            "COMMAND_STATUS" => Self::CommandStatus,
            "COMMAND_PROGRESS" => Self::CommandProgress,
            "COMMAND_RESULT" | "COMMAND_COMPLETE" => Self::CommandResult,
            "COMMAND_QUEUE_UPDATE" => Self::CommandQueueUpdate,
            "AGENT_CONNECT" => Self::AgentConnect,
            "AGENT_CONTROL" => Self::AgentControl,
            "AGENT_STATUS" => Self::AgentStatus,
            "AGENT_METRICS" => Self::AgentMetrics,
            "AGENT_HEARTBEAT" => Self::AgentHeartbeat,
            "AGENT_DISCONNECT" => Self::AgentDisconnect,
            "EMERGENCY_STOP" => Self::EmergencyStop,
            "TERMINAL_STREAM" => Self::TerminalStream,
            "TRACE_STREAM" => Self::TraceStream,
            "TOKEN_REFRESH" => Self::TokenRefresh,
            "ACK" => Self::Ack,
            "ERROR" => Self::Error,
            "PING" => Self::Ping,
            "PONG" => Self::Pong,
            _ => return None,
        })
    }

    /// Message types a dashboard is allowed to send (spec §4.4 Authorization).
    pub fn dashboard_allowed(&self) -> bool {
        matches!(
            self,
            Self::DashboardInit
                | Self::DashboardSubscribe
                | Self::DashboardUnsubscribe
                | Self::CommandRequest
                | Self::CommandCancel
                | Self::AgentControl
                | Self::EmergencyStop
                | Self::Ping
                | Self::Pong
                | Self::TokenRefresh
        )
    }

    /// Message types an agent is allowed to send (spec §4.4 Authorization).
    pub fn agent_allowed(&self) -> bool {
        matches!(
            self,
            Self::AgentConnect
                | Self::AgentStatus
                | Self::AgentHeartbeat
                | Self::CommandStatus
                | Self::CommandProgress
                | Self::CommandResult
                | Self::TerminalStream
                | Self::TraceStream
                | Self::Ping
                | Self::Pong
        )
    }
}

/// Current wall-clock time in milliseconds, for envelope timestamps.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
