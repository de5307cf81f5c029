// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared gateway state: the core collaborators plus the shutdown signal.

use std::sync::Arc;

use opsbroker_core::external::{AgentService, AuditService, CommandService, TokenValidator};
use opsbroker_core::heartbeat::HeartbeatEngine;
use opsbroker_core::mux::TerminalStreamMux;
use opsbroker_core::pool::ConnectionPool;
use opsbroker_core::router::MessageRouter;
use opsbroker_core::token::TokenManager;
use tokio_util::sync::CancellationToken;

use crate::config::BrokerConfig;

/// Everything a connection handler needs, wired once in [`crate::run`].
pub struct AppState {
    pub pool: Arc<ConnectionPool>,
    pub router: Arc<MessageRouter>,
    pub mux: Arc<TerminalStreamMux>,
    pub heartbeat: Arc<HeartbeatEngine>,
    pub tokens: Arc<TokenManager>,
    pub validator: Arc<dyn TokenValidator>,
    pub config: BrokerConfig,
    pub shutdown: CancellationToken,
}

/// The external collaborators the broker needs. In-memory defaults (spec
/// §1) let the gateway run standalone when the host application doesn't
/// supply its own stores.
pub struct Collaborators {
    pub validator: Arc<dyn TokenValidator>,
    pub agents: Arc<dyn AgentService>,
    pub commands: Arc<dyn CommandService>,
    pub audit: Arc<dyn AuditService>,
}

impl Default for Collaborators {
    fn default() -> Self {
        use opsbroker_core::external::{InMemoryAgentService, InMemoryTokenValidator, NullAuditService, NullCommandService};
        Self {
            validator: Arc::new(InMemoryTokenValidator::new()),
            agents: Arc::new(InMemoryAgentService::new(Vec::new())),
            commands: Arc::new(NullCommandService),
            audit: Arc::new(NullAuditService),
        }
    }
}

impl AppState {
    pub fn new(config: BrokerConfig, collaborators: Collaborators, shutdown: CancellationToken) -> Arc<Self> {
        let pool = ConnectionPool::new(config.max_connections);
        let mux = TerminalStreamMux::new(
            Arc::clone(&pool),
            config.terminal_buffer_size,
            config.terminal_max_buffered_lines,
            config.terminal_flush_interval_ms,
        );
        let heartbeat_config = opsbroker_core::heartbeat::HeartbeatConfig {
            ping_interval_ms: config.ping_interval_ms,
            pong_timeout_ms: config.pong_timeout_ms,
            max_missed_pings: config.max_missed_pings,
        };
        let heartbeat = HeartbeatEngine::new(Arc::clone(&pool), heartbeat_config);
        let tokens = TokenManager::new(
            Arc::clone(&pool),
            Arc::clone(&collaborators.validator),
            config.refresh_threshold_ms,
            config.max_refresh_attempts,
        );
        let router_config = opsbroker_core::router::RouterConfig {
            command_default_time_limit_ms: config.command_default_time_limit_ms as i64,
            command_default_max_retries: config.command_default_max_retries as i64,
        };
        let router = MessageRouter::new(
            Arc::clone(&pool),
            Arc::clone(&mux),
            Arc::clone(&heartbeat),
            Arc::clone(&tokens),
            collaborators.agents,
            collaborators.commands,
            collaborators.audit,
            router_config,
        );

        Arc::new(Self {
            pool,
            router,
            mux,
            heartbeat,
            tokens,
            validator: collaborators.validator,
            config,
            shutdown,
        })
    }
}
