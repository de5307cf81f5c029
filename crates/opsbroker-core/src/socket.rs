// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire-agnostic socket handle.
//!
//! The core never touches `axum`'s WebSocket type directly — every session
//! is represented by a `Socket` trait object so the pool, router, and mux
//! are testable without a real network connection.

use async_trait::async_trait;

/// A send/close/observe-close handle for one live connection.
///
/// Implementations must make `send` return an error promptly once the
/// underlying transport can no longer deliver bytes — the pool relies on
/// that to treat a failed send as a closed socket (spec §4.1 `sendTo`).
#[async_trait]
pub trait Socket: Send + Sync {
    /// Send one serialized frame. Returns `Err` if the socket was not open
    /// or the send failed synchronously.
    async fn send(&self, frame: String) -> Result<(), SocketError>;

    /// Send a native WebSocket ping control frame (spec §4.2 — distinct
    /// from the application-level `PING`/`PONG` message types).
    async fn ping(&self) -> Result<(), SocketError>;

    /// Close the socket with a WebSocket close code and reason.
    async fn close(&self, code: u16, reason: &str);

    /// Whether the socket is still open, best-effort.
    fn is_open(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketError;

impl std::fmt::Display for SocketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("socket send failed")
    }
}

impl std::error::Error for SocketError {}

#[cfg(any(test, feature = "test-util"))]
pub mod test_util {
    use std::sync::atomic::{AtomicBool, Ordering};

    use tokio::sync::mpsc;

    use super::*;

    /// An in-memory `Socket` backed by an unbounded channel, for unit tests.
    pub struct ChannelSocket {
        tx: mpsc::UnboundedSender<String>,
        open: AtomicBool,
    }

    impl ChannelSocket {
        pub fn new() -> (std::sync::Arc<Self>, mpsc::UnboundedReceiver<String>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (std::sync::Arc::new(Self { tx, open: AtomicBool::new(true) }), rx)
        }

        pub fn force_close(&self) {
            self.open.store(false, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Socket for ChannelSocket {
        async fn send(&self, frame: String) -> Result<(), SocketError> {
            if !self.open.load(Ordering::SeqCst) {
                return Err(SocketError);
            }
            self.tx.send(frame).map_err(|_| SocketError)
        }

        async fn ping(&self) -> Result<(), SocketError> {
            if self.open.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(SocketError)
            }
        }

        async fn close(&self, _code: u16, _reason: &str) {
            self.open.store(false, Ordering::SeqCst);
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
    }
}
