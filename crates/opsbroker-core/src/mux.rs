// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! TerminalStreamMux — coalesces high-rate terminal output and fans it out
//! to subscribed dashboards (spec §4.5).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::model::new_connection_id;
use crate::pool::ConnectionPool;
use crate::protocol::{now_ms, Envelope, MessageType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    Stdout,
    Stderr,
    System,
}

#[derive(Debug, Clone)]
pub struct TerminalFrame {
    pub stream_type: StreamType,
    pub content: String,
    pub sequence: i64,
}

struct StreamBuffer {
    agent_id: String,
    command_id: Option<String>,
    frames: VecDeque<TerminalFrame>,
    bytes: usize,
    first_buffered_at_ms: i64,
}

impl StreamBuffer {
    fn new(agent_id: String, command_id: Option<String>) -> Self {
        Self { agent_id, command_id, frames: VecDeque::new(), bytes: 0, first_buffered_at_ms: 0 }
    }
}

fn stream_key(agent_id: &str, command_id: Option<&str>) -> String {
    match command_id {
        Some(c) => c.to_owned(),
        None => format!("agent-session-{agent_id}"),
    }
}

pub struct TerminalStreamMux {
    pool: Arc<ConnectionPool>,
    buffers: DashMap<String, StreamBuffer>,
    buffer_size: usize,
    max_buffered_lines: usize,
    flush_interval_ms: u64,
    overflow_count: AtomicU64,
}

impl TerminalStreamMux {
    pub fn new(
        pool: Arc<ConnectionPool>,
        buffer_size: usize,
        max_buffered_lines: usize,
        flush_interval_ms: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            buffers: DashMap::new(),
            buffer_size,
            max_buffered_lines,
            flush_interval_ms,
            overflow_count: AtomicU64::new(0),
        })
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflow_count.load(Ordering::Relaxed)
    }

    pub fn buffered_keys(&self) -> usize {
        self.buffers.len()
    }

    /// Buffer one terminal frame under its stream key. Oldest frames are
    /// dropped if the per-key bounds are exceeded (spec §3/§4.5 backpressure).
    pub fn ingest(&self, agent_id: &str, command_id: Option<&str>, frame: TerminalFrame) {
        let key = stream_key(agent_id, command_id);
        let mut entry = self
            .buffers
            .entry(key)
            .or_insert_with(|| StreamBuffer::new(agent_id.to_owned(), command_id.map(String::from)));

        if entry.frames.is_empty() {
            entry.first_buffered_at_ms = now_ms();
        }
        entry.bytes += frame.content.len();
        entry.frames.push_back(frame);

        // Never evict the frame just pushed: a single oversized frame still
        // needs a chance to be flushed by the size trigger.
        while entry.frames.len() > 1 && (entry.frames.len() > self.max_buffered_lines || entry.bytes > self.buffer_size) {
            let Some(dropped) = entry.frames.pop_front() else { break };
            entry.bytes = entry.bytes.saturating_sub(dropped.content.len());
            self.overflow_count.fetch_add(1, Ordering::Relaxed);
            warn!(agent_id = %entry.agent_id, "terminal_overflow: dropping oldest buffered frame");
        }
    }

    /// Flush every key whose age or size has crossed its trigger (spec §4.5).
    pub async fn flush_due(&self) {
        let now = now_ms();
        let due_keys: Vec<String> = self
            .buffers
            .iter()
            .filter(|r| {
                let buf = r.value();
                !buf.frames.is_empty()
                    && (buf.bytes >= self.buffer_size
                        || buf.frames.len() >= self.max_buffered_lines
                        || now - buf.first_buffered_at_ms >= self.flush_interval_ms as i64)
            })
            .map(|r| r.key().clone())
            .collect();

        for key in due_keys {
            if let Some((_, buf)) = self.buffers.remove(&key) {
                self.deliver(buf).await;
            }
        }
    }

    async fn deliver(&self, buf: StreamBuffer) {
        if buf.frames.is_empty() {
            return;
        }

        let contents: Vec<String> = buf.frames.iter().map(|f| f.content.clone()).collect();
        let last_sequence = buf.frames.back().map(|f| f.sequence).unwrap_or(0);
        let stream_type = buf.frames.front().map(|f| f.stream_type).unwrap_or(StreamType::Stdout);

        let payload = serde_json::json!({
            "agentId": buf.agent_id,
            "commandId": buf.command_id,
            "streamType": stream_type,
            "content": contents,
            "sequence": last_sequence,
            "timestamp": now_ms(),
        });
        let envelope = Envelope::new(MessageType::TerminalStream.as_str(), new_connection_id(), payload);
        let frame = envelope.to_text();

        // Copy-then-release (spec §4.5/§5): snapshot matching dashboards,
        // then send outside any lock.
        let dashboards = self.pool.authenticated_dashboards().await;
        let mut targets = Vec::new();
        for session in dashboards {
            let subs = session.subscriptions().await;
            let matches = buf.command_id.as_deref().is_some_and(|c| subs.matches_command(c))
                || subs.matches_agent(&buf.agent_id)
                || subs.terminals;
            if matches {
                targets.push(session);
            }
        }

        let mut delivered = 0;
        for session in targets {
            if session.send(frame.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        debug!(agent_id = %buf.agent_id, delivered, "terminal stream flushed");
    }

    /// Run the flush loop until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("terminal stream mux flush loop started");
        let tick_ms = (self.flush_interval_ms / 2).max(1);
        let mut timer = tokio::time::interval(Duration::from_millis(tick_ms));
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("terminal stream mux flush loop shutting down");
                    return;
                }
                _ = timer.tick() => {
                    self.flush_due().await;
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "mux_tests.rs"]
mod tests;
