// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `opsbroker_core::socket::Socket` over a real axum WebSocket split sink.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use opsbroker_core::socket::{Socket, SocketError};
use tokio::sync::{mpsc, Mutex};

/// Owns the write half of an upgraded WebSocket. `send`/`close` hand frames
/// to an internal queue drained by a dedicated task so a slow or wedged
/// socket write never blocks the caller holding the session lock.
pub struct AxumSocket {
    tx: mpsc::UnboundedSender<Message>,
    open: AtomicBool,
}

impl AxumSocket {
    /// Split `socket`, spawning the writer pump, and return the handle plus
    /// the still-owned read half for the caller's read loop.
    pub fn new(socket: WebSocket) -> (Arc<Self>, futures_util::stream::SplitStream<WebSocket>) {
        let (write, read) = futures_util::StreamExt::split(socket);
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Arc::new(Self { tx, open: AtomicBool::new(true) });
        tokio::spawn(pump(write, rx));
        (handle, read)
    }
}

async fn pump(sink: SplitSink<WebSocket, Message>, mut rx: mpsc::UnboundedReceiver<Message>) {
    let sink = Mutex::new(sink);
    while let Some(message) = rx.recv().await {
        if sink.lock().await.send(message).await.is_err() {
            break;
        }
    }
}

#[async_trait]
impl Socket for AxumSocket {
    async fn send(&self, frame: String) -> Result<(), SocketError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(SocketError);
        }
        self.tx.send(Message::Text(frame.into())).map_err(|_| SocketError)
    }

    async fn ping(&self) -> Result<(), SocketError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(SocketError);
        }
        self.tx.send(Message::Ping(Vec::new().into())).map_err(|_| SocketError)
    }

    async fn close(&self, _code: u16, _reason: &str) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.tx.send(Message::Close(None));
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
