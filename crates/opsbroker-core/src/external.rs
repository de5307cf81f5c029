// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Contracts for collaborators the core treats as external (spec §1):
//! persistent agent/command/audit stores and the bearer-token authority.
//! In-memory defaults are provided so the crate runs standalone and so
//! tests don't need a real backing store.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, ErrorCode, Result};

/// Outcome of validating or refreshing a bearer token.
#[derive(Debug, Clone)]
pub struct TokenClaims {
    pub user_id: String,
    pub agent_id: Option<String>,
    pub expires_at_ms: i64,
    pub refresh_token: Option<String>,
}

/// Authenticates bearer tokens and refreshes them before expiry (spec §4.3).
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<TokenClaims>;
    async fn refresh(&self, refresh_token: &str) -> Result<(String, TokenClaims)>;
}

/// Known-to-the-system agent, as reported by the persistent agent store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub name: String,
    pub agent_type: String,
}

#[async_trait]
pub trait AgentService: Send + Sync {
    async fn list_known_agents(&self) -> Vec<AgentRecord>;
}

#[async_trait]
pub trait CommandService: Send + Sync {
    async fn record_command_request(&self, command_id: &str, agent_id: &str, command: &str);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub action: String,
    pub actor_user_id: Option<String>,
    pub detail: String,
}

#[async_trait]
pub trait AuditService: Send + Sync {
    async fn record(&self, event: AuditEvent);
}

/// In-memory `TokenValidator` keyed by opaque bearer string, for standalone
/// operation and tests. Tokens are seeded via `insert`; `refresh` always
/// mints a fresh expiry from the refresh token supplied at insertion time.
#[derive(Default)]
pub struct InMemoryTokenValidator {
    tokens: Mutex<HashMap<String, TokenClaims>>,
    refresh_tokens: Mutex<HashMap<String, (String, TokenClaims)>>,
}

impl InMemoryTokenValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: impl Into<String>, claims: TokenClaims) {
        self.tokens.lock().unwrap_or_else(|e| e.into_inner()).insert(token.into(), claims);
    }

    /// Seed what `refresh(refresh_token)` returns: the new bearer token and its claims.
    pub fn seed_refresh(&self, refresh_token: impl Into<String>, new_token: impl Into<String>, claims: TokenClaims) {
        self.refresh_tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(refresh_token.into(), (new_token.into(), claims));
    }
}

#[async_trait]
impl TokenValidator for InMemoryTokenValidator {
    async fn validate(&self, token: &str) -> Result<TokenClaims> {
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(token)
            .cloned()
            .ok_or_else(|| BrokerError::new(ErrorCode::Unauthorized, "unknown or expired token"))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<(String, TokenClaims)> {
        self.refresh_tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(refresh_token)
            .cloned()
            .ok_or_else(|| BrokerError::new(ErrorCode::Unauthorized, "refresh token rejected"))
    }
}

/// In-memory `AgentService` backed by a fixed roster, for standalone
/// operation and tests.
#[derive(Default)]
pub struct InMemoryAgentService {
    agents: Mutex<Vec<AgentRecord>>,
}

impl InMemoryAgentService {
    pub fn new(agents: Vec<AgentRecord>) -> Self {
        Self { agents: Mutex::new(agents) }
    }
}

#[async_trait]
impl AgentService for InMemoryAgentService {
    async fn list_known_agents(&self) -> Vec<AgentRecord> {
        self.agents.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// No-op `CommandService`/`AuditService` for standalone operation: the
/// persistent stores are out of scope (spec §1), so these just discard.
#[derive(Default)]
pub struct NullCommandService;

#[async_trait]
impl CommandService for NullCommandService {
    async fn record_command_request(&self, _command_id: &str, _agent_id: &str, _command: &str) {}
}

#[derive(Default)]
pub struct NullAuditService;

#[async_trait]
impl AuditService for NullAuditService {
    async fn record(&self, _event: AuditEvent) {}
}
