// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! TokenManager — bearer token lifecycle and proactive refresh (spec §4.3).

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::external::TokenValidator;
use crate::model::ConnectionId;
use crate::pool::ConnectionPool;
use crate::protocol::{now_ms, Envelope, MessageType};

#[derive(Debug, Clone)]
pub struct TokenRecord {
    pub connection_id: ConnectionId,
    pub token: String,
    pub expires_at_ms: i64,
    pub refresh_token: Option<String>,
    pub user_id: Option<String>,
    pub agent_id: Option<String>,
    refresh_attempts: u32,
}

pub struct TokenManager {
    pool: Arc<ConnectionPool>,
    validator: Arc<dyn TokenValidator>,
    records: DashMap<ConnectionId, TokenRecord>,
    refresh_threshold_ms: i64,
    max_refresh_attempts: u32,
}

impl TokenManager {
    pub fn new(
        pool: Arc<ConnectionPool>,
        validator: Arc<dyn TokenValidator>,
        refresh_threshold_ms: i64,
        max_refresh_attempts: u32,
    ) -> Arc<Self> {
        Arc::new(Self { pool, validator, records: DashMap::new(), refresh_threshold_ms, max_refresh_attempts })
    }

    /// Register a session's token at authentication time (spec §4.3).
    /// At most one record per connection; a second call replaces the first.
    pub fn register(
        &self,
        connection_id: ConnectionId,
        token: String,
        expires_at_ms: i64,
        refresh_token: Option<String>,
        user_id: Option<String>,
        agent_id: Option<String>,
    ) {
        self.records.insert(
            connection_id.clone(),
            TokenRecord { connection_id, token, expires_at_ms, refresh_token, user_id, agent_id, refresh_attempts: 0 },
        );
    }

    /// Remove a session's token record at disconnect time.
    pub fn unregister(&self, connection_id: &str) {
        self.records.remove(connection_id);
    }

    pub fn record(&self, connection_id: &str) -> Option<TokenRecord> {
        self.records.get(connection_id).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// One refresh sweep: for every record within `refresh_threshold_ms` of
    /// expiry, attempt a refresh; after `max_refresh_attempts` consecutive
    /// failures, close the owning session with close code 4002.
    pub async fn sweep_once(&self) {
        let now = now_ms();
        let due: Vec<TokenRecord> = self
            .records
            .iter()
            .filter(|r| r.value().expires_at_ms - now <= self.refresh_threshold_ms)
            .map(|r| r.value().clone())
            .collect();

        for record in due {
            self.refresh_one(record).await;
        }
    }

    async fn refresh_one(&self, record: TokenRecord) {
        let Some(refresh_token) = record.refresh_token.clone() else {
            self.fail_refresh(record).await;
            return;
        };

        match self.validator.refresh(&refresh_token).await {
            Ok((new_token, claims)) => {
                debug!(connection_id = %record.connection_id, "token refreshed");
                let expires_at_ms = claims.expires_at_ms;
                self.records.insert(
                    record.connection_id.clone(),
                    TokenRecord {
                        connection_id: record.connection_id.clone(),
                        token: new_token.clone(),
                        expires_at_ms,
                        refresh_token: claims.refresh_token,
                        user_id: Some(claims.user_id),
                        agent_id: claims.agent_id,
                        refresh_attempts: 0,
                    },
                );

                let envelope = Envelope::new(
                    MessageType::TokenRefresh.as_str(),
                    crate::model::new_connection_id(),
                    serde_json::json!({ "token": new_token, "expiresAtMs": expires_at_ms }),
                );
                self.pool.send_to(&record.connection_id, &envelope.to_text()).await;
            }
            Err(err) => {
                warn!(connection_id = %record.connection_id, error = %err, "token refresh failed");
                self.fail_refresh(record).await;
            }
        }
    }

    async fn fail_refresh(&self, mut record: TokenRecord) {
        record.refresh_attempts += 1;
        if record.refresh_attempts >= self.max_refresh_attempts {
            warn!(connection_id = %record.connection_id, "closing session after repeated refresh failures");
            if let Some(session) = self.pool.get(&record.connection_id) {
                session.close(4002, "token_refresh_failed").await;
            }
            self.pool.remove(&record.connection_id).await;
            self.records.remove(&record.connection_id);
        } else {
            self.records.insert(record.connection_id.clone(), record);
        }
    }

    /// Run the refresh loop until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, refresh_interval_ms: u64, shutdown: CancellationToken) {
        info!("token manager refresh loop started");
        let mut timer = tokio::time::interval(Duration::from_millis(refresh_interval_ms));
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("token manager refresh loop shutting down");
                    return;
                }
                _ = timer.tick() => {
                    self.sweep_once().await;
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "token_tests.rs"]
mod tests;
