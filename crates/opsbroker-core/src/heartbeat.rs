// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HeartbeatEngine — liveness probing and health classification (spec §4.2).

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::model::Health;
use crate::pool::ConnectionPool;
use crate::protocol::now_ms;

#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    pub ping_interval_ms: u64,
    pub pong_timeout_ms: u64,
    pub max_missed_pings: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { ping_interval_ms: 30_000, pong_timeout_ms: 10_000, max_missed_pings: 5 }
    }
}

pub struct HeartbeatEngine {
    pool: Arc<ConnectionPool>,
    config: HeartbeatConfig,
}

fn classify_latency(latency_ms: i64) -> Health {
    if latency_ms < 1_000 {
        Health::Healthy
    } else if latency_ms < 5_000 {
        Health::Degraded
    } else {
        Health::Unhealthy
    }
}

fn classify_misses(missed: u32) -> Health {
    if missed < 2 {
        Health::Healthy
    } else if missed < 3 {
        Health::Degraded
    } else {
        Health::Unhealthy
    }
}

impl HeartbeatEngine {
    pub fn new(pool: Arc<ConnectionPool>, config: HeartbeatConfig) -> Arc<Self> {
        Arc::new(Self { pool, config })
    }

    /// A pong arrived for `connection_id`: clear its watchdog state and
    /// classify health from round-trip latency (spec §4.2 "On pong").
    pub async fn record_pong(&self, connection_id: &str) {
        let Some(session) = self.pool.get(connection_id) else { return };
        let latency = session.record_pong();
        session.set_health(classify_latency(latency));
        self.pool.notify_health_changed(connection_id).await;
    }

    /// A watchdog armed after a ping fired without an intervening pong
    /// (spec §4.2 "On watchdog fire").
    async fn on_watchdog_fire(&self, connection_id: &str, ping_sent_at: i64) {
        let Some(session) = self.pool.get(connection_id) else { return };
        if session.last_pong_at_ms() >= ping_sent_at {
            // Pong arrived just before this check ran; nothing to do.
            return;
        }

        let missed = session.incr_missed_pings();
        warn!(connection_id, missed, "heartbeat watchdog fired");
        session.set_health(classify_misses(missed));
        self.pool.notify_health_changed(connection_id).await;

        if missed >= self.config.max_missed_pings {
            warn!(connection_id, missed, "closing session after repeated missed heartbeats");
            session.close(4000, "health-check failed").await;
            self.pool.remove(connection_id).await;
        }
    }

    /// Run the probe cycle until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("heartbeat engine started");
        let mut timer = tokio::time::interval(Duration::from_millis(self.config.ping_interval_ms));
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("heartbeat engine shutting down");
                    return;
                }
                _ = timer.tick() => {}
            }

            let mut targets = self.pool.authenticated_agents().await;
            targets.extend(self.pool.authenticated_dashboards().await);

            for session in targets {
                let ping_sent_at = now_ms();
                session.record_ping_sent();
                if session.socket.ping().await.is_err() {
                    debug!(connection_id = %session.connection_id, "ping send failed");
                    continue;
                }

                let engine = Arc::clone(&self);
                let connection_id = session.connection_id.clone();
                let pong_timeout_ms = self.config.pong_timeout_ms;
                let watchdog_shutdown = shutdown.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = watchdog_shutdown.cancelled() => {}
                        _ = tokio::time::sleep(Duration::from_millis(pong_timeout_ms)) => {
                            engine.on_watchdog_fire(&connection_id, ping_sent_at).await;
                        }
                    }
                });
            }
        }
    }
}

#[cfg(test)]
#[path = "heartbeat_tests.rs"]
mod tests;
