// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

/// Runtime configuration for the opsbroker gateway (spec §6 Configuration).
#[derive(Debug, Clone, clap::Parser)]
pub struct BrokerConfig {
    /// Host to bind on.
    #[arg(long, default_value = "127.0.0.1", env = "OPSBROKER_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8900, env = "OPSBROKER_PORT")]
    pub port: u16,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty, env = "OPSBROKER_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// Maximum number of concurrently tracked sessions.
    #[arg(long, default_value_t = 10_000, env = "OPSBROKER_MAX_CONNECTIONS")]
    pub max_connections: usize,

    /// Maximum accepted inbound message size, in bytes.
    #[arg(long, default_value_t = 1_048_576, env = "OPSBROKER_MAX_PAYLOAD")]
    pub max_payload: usize,

    /// Idle timeout for an authenticated agent session, in milliseconds.
    #[arg(long, default_value_t = 120_000, env = "OPSBROKER_AGENT_TIMEOUT_MS")]
    pub agent_connection_timeout_ms: i64,

    /// Idle timeout for an authenticated dashboard session, in milliseconds.
    #[arg(long, default_value_t = 300_000, env = "OPSBROKER_DASHBOARD_TIMEOUT_MS")]
    pub dashboard_connection_timeout_ms: i64,

    /// How often the pool sweeps for idle/unhealthy sessions, in milliseconds.
    #[arg(long, default_value_t = 15_000, env = "OPSBROKER_CLEANUP_INTERVAL_MS")]
    pub cleanup_interval_ms: u64,

    /// Interval between heartbeat pings, in milliseconds.
    #[arg(long, default_value_t = 30_000, env = "OPSBROKER_PING_INTERVAL_MS")]
    pub ping_interval_ms: u64,

    /// How long to wait for a pong before counting it missed, in milliseconds.
    #[arg(long, default_value_t = 10_000, env = "OPSBROKER_PONG_TIMEOUT_MS")]
    pub pong_timeout_ms: u64,

    /// Consecutive missed pings before a session is evicted.
    #[arg(long, default_value_t = 5, env = "OPSBROKER_MAX_MISSED_PINGS")]
    pub max_missed_pings: u32,

    /// How close to expiry a token must be before a proactive refresh, in milliseconds.
    #[arg(long, default_value_t = 60_000, env = "OPSBROKER_REFRESH_THRESHOLD_MS")]
    pub refresh_threshold_ms: i64,

    /// How often the token refresh sweep runs, in milliseconds.
    #[arg(long, default_value_t = 30_000, env = "OPSBROKER_REFRESH_INTERVAL_MS")]
    pub refresh_interval_ms: u64,

    /// Maximum consecutive refresh attempts before giving up on a token.
    #[arg(long, default_value_t = 3, env = "OPSBROKER_MAX_REFRESH_ATTEMPTS")]
    pub max_refresh_attempts: u32,

    /// Per-stream-key terminal output coalescing buffer size, in bytes.
    #[arg(long, default_value_t = 8192, env = "OPSBROKER_TERMINAL_BUFFER_SIZE")]
    pub terminal_buffer_size: usize,

    /// Terminal buffer flush interval, in milliseconds.
    #[arg(long, default_value_t = 10, env = "OPSBROKER_TERMINAL_FLUSH_INTERVAL_MS")]
    pub terminal_flush_interval_ms: u64,

    /// Maximum buffered terminal lines before the oldest are dropped.
    #[arg(long, default_value_t = 1_000, env = "OPSBROKER_TERMINAL_MAX_BUFFERED_LINES")]
    pub terminal_max_buffered_lines: usize,

    /// Default command execution time limit, in milliseconds.
    #[arg(long, default_value_t = 300_000, env = "OPSBROKER_COMMAND_DEFAULT_TIME_LIMIT_MS")]
    pub command_default_time_limit_ms: u64,

    /// Default maximum command retry count.
    #[arg(long, default_value_t = 1, env = "OPSBROKER_COMMAND_DEFAULT_MAX_RETRIES")]
    pub command_default_max_retries: u32,

    /// How long an unauthenticated connection may linger before eviction, in milliseconds.
    #[arg(long, default_value_t = 30_000, env = "OPSBROKER_AUTH_TIMEOUT_MS")]
    pub auth_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigError(pub &'static str);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

impl std::error::Error for ConfigError {}

impl BrokerConfig {
    /// Rejects nonsensical combinations the flags alone can't prevent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pong_timeout_ms >= self.ping_interval_ms {
            return Err(ConfigError("pong_timeout_ms must be less than ping_interval_ms"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError("max_connections must be greater than zero"));
        }
        if self.terminal_flush_interval_ms == 0 {
            return Err(ConfigError("terminal_flush_interval_ms must be greater than zero"));
        }
        Ok(())
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn terminal_flush_interval(&self) -> Duration {
        Duration::from_millis(self.terminal_flush_interval_ms)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> BrokerConfig {
        BrokerConfig {
            host: "127.0.0.1".into(),
            port: 8900,
            log_format: LogFormat::Pretty,
            max_connections: 10_000,
            max_payload: 1_048_576,
            agent_connection_timeout_ms: 120_000,
            dashboard_connection_timeout_ms: 300_000,
            cleanup_interval_ms: 15_000,
            ping_interval_ms: 30_000,
            pong_timeout_ms: 10_000,
            max_missed_pings: 5,
            refresh_threshold_ms: 60_000,
            refresh_interval_ms: 30_000,
            max_refresh_attempts: 3,
            terminal_buffer_size: 8192,
            terminal_flush_interval_ms: 10,
            terminal_max_buffered_lines: 1_000,
            command_default_time_limit_ms: 300_000,
            command_default_max_retries: 0,
            auth_timeout_ms: 30_000,
        }
    }

    #[test]
    fn default_shaped_config_validates() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn pong_timeout_must_be_below_ping_interval() {
        let mut cfg = base();
        cfg.pong_timeout_ms = cfg.ping_interval_ms;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_max_connections_is_rejected() {
        let mut cfg = base();
        cfg.max_connections = 0;
        assert!(cfg.validate().is_err());
    }
}
