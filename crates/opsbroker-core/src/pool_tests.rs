// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::model::new_connection_id;
use crate::socket::test_util::ChannelSocket;

fn socket() -> Arc<dyn Socket> {
    ChannelSocket::new().0
}

#[tokio::test]
async fn add_then_remove_is_idempotent() {
    let pool = ConnectionPool::new(10);
    let id = new_connection_id();
    pool.add(id.clone(), SessionKind::Agent, socket(), Value::Null).await.unwrap();
    assert_eq!(pool.len(), 1);
    pool.remove(&id).await;
    pool.remove(&id).await; // idempotent
    assert_eq!(pool.len(), 0);
}

#[tokio::test]
async fn add_fails_when_capacity_exceeded() {
    let pool = ConnectionPool::new(1);
    pool.add(new_connection_id(), SessionKind::Agent, socket(), Value::Null).await.unwrap();
    let err = pool.add(new_connection_id(), SessionKind::Agent, socket(), Value::Null).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::CapacityExceeded);
}

#[tokio::test]
async fn send_to_fails_for_unknown_connection() {
    let pool = ConnectionPool::new(10);
    assert!(!pool.send_to("nope", "frame").await);
}

#[tokio::test]
async fn broadcast_skips_unauthenticated_and_nonmatching() {
    let pool = ConnectionPool::new(10);
    let (s1, mut rx1) = ChannelSocket::new();
    let s1_session = pool.add(new_connection_id(), SessionKind::Agent, s1, Value::Null).await.unwrap();
    s1_session.set_authenticated(true);

    let (s2, _rx2) = ChannelSocket::new();
    pool.add(new_connection_id(), SessionKind::Agent, s2, Value::Null).await.unwrap();
    // s2 stays unauthenticated.

    let delivered = pool.broadcast("hello", |_| true).await;
    assert_eq!(delivered, 1);
    assert_eq!(rx1.recv().await.unwrap(), "hello");
}

#[tokio::test]
async fn broadcast_tolerates_one_failure() {
    let pool = ConnectionPool::new(10);
    let (good, mut good_rx) = ChannelSocket::new();
    let good_session = pool.add(new_connection_id(), SessionKind::Agent, good, Value::Null).await.unwrap();
    good_session.set_authenticated(true);

    let (bad, _rx) = ChannelSocket::new();
    bad.force_close();
    let bad_session = pool.add(new_connection_id(), SessionKind::Agent, bad, Value::Null).await.unwrap();
    bad_session.set_authenticated(true);

    let delivered = pool.broadcast("x", |_| true).await;
    assert_eq!(delivered, 1);
    assert_eq!(good_rx.recv().await.unwrap(), "x");
}

#[tokio::test]
async fn cleanup_evicts_stale_unauthenticated_session() {
    let pool = ConnectionPool::new(10);
    let id = new_connection_id();
    let session = pool.add(id.clone(), SessionKind::Agent, socket(), Value::Null).await.unwrap();
    // Force the session to look old by rewinding connected_at via a crafted clock is not
    // possible (field is immutable); instead exercise the idle-timeout path which uses
    // last_activity_at, fully mutable.
    session.touch_activity();
    pool.cleanup_once(-1, -1).await; // any activity now looks infinitely stale
    assert_eq!(pool.len(), 0);
}

#[tokio::test]
async fn agent_session_resolves_by_agent_id() {
    let pool = ConnectionPool::new(10);
    let id = new_connection_id();
    let session = pool.add(id, SessionKind::Agent, socket(), Value::Null).await.unwrap();
    session.set_agent_id_once("a1".into()).await;
    let found = pool.agent_session("a1").await.unwrap();
    assert_eq!(found.connection_id, session.connection_id);
    assert!(pool.agent_session("a2").await.is_none());
}

#[tokio::test]
async fn pool_count_never_exceeds_max_connections() {
    let pool = ConnectionPool::new(3);
    for _ in 0..3 {
        pool.add(new_connection_id(), SessionKind::Dashboard, socket(), Value::Null).await.unwrap();
    }
    assert!(pool.add(new_connection_id(), SessionKind::Dashboard, socket(), Value::Null).await.is_err());
    assert_eq!(pool.len(), 3);
}
