// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::model::{new_connection_id, DashboardSubscriptions, SessionKind};
use crate::socket::test_util::ChannelSocket;

fn frame(seq: i64, content: &str) -> TerminalFrame {
    TerminalFrame { stream_type: StreamType::Stdout, content: content.to_owned(), sequence: seq }
}

async fn dashboard_with(
    pool: &Arc<ConnectionPool>,
    subs: DashboardSubscriptions,
) -> (Arc<crate::model::Session>, tokio::sync::mpsc::UnboundedReceiver<String>) {
    let (socket, rx) = ChannelSocket::new();
    let session = pool.add(new_connection_id(), SessionKind::Dashboard, socket, serde_json::Value::Null).await.unwrap();
    session.set_authenticated(true);
    session.with_subscriptions_mut(|s| *s = subs).await;
    (session, rx)
}

#[tokio::test]
async fn flush_delivers_batched_frames_to_matching_subscribers_only() {
    let pool = ConnectionPool::new(10);
    // flush_interval_ms=0: the age trigger is satisfied immediately, so the
    // test doesn't depend on real wall-clock elapsing between ingest and flush.
    let mux = TerminalStreamMux::new(Arc::clone(&pool), 8192, 1000, 0);

    let (_d1, mut d1_rx) =
        dashboard_with(&pool, DashboardSubscriptions::from_ids(vec![], vec!["c1".into()], false, false)).await;
    let (_d2, mut d2_rx) = dashboard_with(&pool, DashboardSubscriptions::from_ids(vec![], vec![], false, true)).await;
    // Explicit non-matching ids: an empty list would mean "all" (spec §4.6).
    let (_d3, mut d3_rx) = dashboard_with(
        &pool,
        DashboardSubscriptions::from_ids(vec!["A2".into()], vec!["other-command".into()], false, false),
    )
    .await;

    for seq in 1..=5 {
        mux.ingest("A1", Some("c1"), frame(seq, &format!("line{seq}")));
    }
    mux.flush_due().await;

    let d1_msg = d1_rx.recv().await.unwrap();
    assert!(d1_msg.contains("line1") && d1_msg.contains("line5"));
    let d2_msg = d2_rx.recv().await.unwrap();
    assert!(d2_msg.contains("line1") && d2_msg.contains("line5"));
    assert!(d3_rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn size_threshold_makes_a_key_immediately_flush_due() {
    let pool = ConnectionPool::new(10);
    let mux = TerminalStreamMux::new(Arc::clone(&pool), 10, 1000, 10_000);
    mux.ingest("A1", None, frame(1, "0123456789ABCDEF"));

    // Bytes already exceed buffer_size even though the flush timer hasn't elapsed.
    mux.flush_due().await;
    assert_eq!(mux.buffered_keys(), 0);
}

#[tokio::test(start_paused = true)]
async fn count_threshold_makes_a_key_immediately_flush_due() {
    let pool = ConnectionPool::new(10);
    let mux = TerminalStreamMux::new(Arc::clone(&pool), 1_000_000, 3, 10_000);
    for seq in 1..=3 {
        mux.ingest("A1", None, frame(seq, "x"));
    }
    mux.flush_due().await;
    assert_eq!(mux.buffered_keys(), 0);
}

#[tokio::test]
async fn age_threshold_flushes_a_sparsely_filled_key() {
    // Uses the real wall clock (`now_ms` is not virtualizable by
    // `tokio::time::pause`), so the interval is real but tiny.
    let pool = ConnectionPool::new(10);
    let mux = TerminalStreamMux::new(Arc::clone(&pool), 1_000_000, 1_000, 5);
    mux.ingest("A1", None, frame(1, "x"));
    assert_eq!(mux.buffered_keys(), 1);

    tokio::time::sleep(Duration::from_millis(20)).await;
    mux.flush_due().await;
    assert_eq!(mux.buffered_keys(), 0);
}

#[tokio::test]
async fn overflow_drops_oldest_and_increments_the_counter() {
    let pool = ConnectionPool::new(10);
    let mux = TerminalStreamMux::new(Arc::clone(&pool), 1_000_000, 2, 10_000);
    // Never call flush_due: simulates the flush task lagging behind ingest.
    for seq in 1..=5 {
        mux.ingest("A1", None, frame(seq, "x"));
    }
    assert_eq!(mux.overflow_count(), 3);
}

#[tokio::test]
async fn sequence_delivered_in_a_batch_is_monotonic() {
    let pool = ConnectionPool::new(10);
    let mux = TerminalStreamMux::new(Arc::clone(&pool), 8192, 1000, 0);
    let (_d1, mut rx) = dashboard_with(&pool, DashboardSubscriptions::from_ids(vec![], vec![], false, true)).await;

    for seq in 1..=3 {
        mux.ingest("A1", None, frame(seq, "x"));
    }
    mux.flush_due().await;
    let msg = rx.recv().await.unwrap();
    assert!(msg.contains("\"sequence\":3"));
}
