// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end scenarios (spec §8) driven through the real axum router over
//! a real TCP socket, with in-memory collaborators standing in for the
//! persistent agent/command/audit stores and token authority.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use opsbroker_core::external::{AgentRecord, InMemoryAgentService, InMemoryTokenValidator, NullAuditService, NullCommandService, TokenClaims};
use opsbroker_gateway::config::{BrokerConfig, LogFormat};
use opsbroker_gateway::state::Collaborators;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

fn test_config() -> BrokerConfig {
    BrokerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        log_format: LogFormat::Pretty,
        max_connections: 100,
        max_payload: 1_048_576,
        agent_connection_timeout_ms: 120_000,
        dashboard_connection_timeout_ms: 300_000,
        cleanup_interval_ms: 50,
        ping_interval_ms: 30_000,
        pong_timeout_ms: 10_000,
        max_missed_pings: 5,
        refresh_threshold_ms: 60_000,
        refresh_interval_ms: 30_000,
        max_refresh_attempts: 3,
        terminal_buffer_size: 8192,
        terminal_flush_interval_ms: 5,
        terminal_max_buffered_lines: 1_000,
        command_default_time_limit_ms: 300_000,
        command_default_max_retries: 1,
        auth_timeout_ms: 30_000,
    }
}

fn claims(user_or_agent: &str, agent: bool) -> TokenClaims {
    TokenClaims {
        user_id: if agent { String::new() } else { user_or_agent.to_owned() },
        agent_id: if agent { Some(user_or_agent.to_owned()) } else { None },
        expires_at_ms: opsbroker_core::protocol::now_ms() + 3_600_000,
        refresh_token: None,
    }
}

/// Spin up the gateway on an OS-assigned port and return its `ws://` base URL.
/// The server task is detached; the test process exiting tears it down.
async fn spawn_server(agents: Vec<AgentRecord>, validator: InMemoryTokenValidator) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");

    let collaborators = Collaborators {
        validator: std::sync::Arc::new(validator),
        agents: std::sync::Arc::new(InMemoryAgentService::new(agents)),
        commands: std::sync::Arc::new(NullCommandService),
        audit: std::sync::Arc::new(NullAuditService),
    };

    tokio::spawn(opsbroker_gateway::serve(listener, test_config(), collaborators));
    // Give the listener a moment to start accepting.
    tokio::time::sleep(Duration::from_millis(20)).await;
    format!("ws://{addr}")
}

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(base: &str, path: &str, token: &str) -> WsStream {
    let url = format!("{base}{path}?token={token}");
    let (stream, _response) = tokio_tungstenite::connect_async(url).await.expect("ws connect");
    stream
}

async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.expect("ws send");
}

async fn recv_json(ws: &mut WsStream) -> Value {
    loop {
        match tokio::time::timeout(Duration::from_secs(2), ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => return serde_json::from_str(&text).expect("valid json frame"),
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(err))) => panic!("ws error: {err}"),
            Ok(None) => panic!("ws closed before expected frame"),
            Err(_) => panic!("timed out waiting for a frame"),
        }
    }
}

fn envelope(kind: &str, id: &str, payload: Value) -> Value {
    json!({ "type": kind, "id": id, "timestamp": opsbroker_core::protocol::now_ms(), "payload": payload })
}

/// Scenario 1 (spec §8): a dashboard's `COMMAND_REQUEST` is forwarded to the
/// named agent verbatim plus execution defaults, and the dashboard gets an ack.
#[tokio::test]
async fn happy_command_routes_to_agent_and_acks_dashboard() {
    let validator = InMemoryTokenValidator::new();
    validator.insert("agent-token", claims("A1", true));
    validator.insert("dash-token", claims("user-1", false));
    let base = spawn_server(vec![], validator).await;

    let mut agent_ws = connect(&base, "/ws/agent", "agent-token").await;
    send_json(&mut agent_ws, envelope("AGENT_CONNECT", "m1", json!({ "agentId": "A1" }))).await;
    let ack = recv_json(&mut agent_ws).await;
    assert_eq!(ack["type"], "ACK");

    let mut dash_ws = connect(&base, "/ws/dashboard", "dash-token").await;
    send_json(&mut dash_ws, envelope("DASHBOARD_INIT", "m2", json!({ "userId": "user-1" }))).await;
    let _connected = recv_json(&mut dash_ws).await; // DASHBOARD_CONNECTED
    let init_ack = recv_json(&mut dash_ws).await;
    assert_eq!(init_ack["type"], "ACK");

    send_json(
        &mut dash_ws,
        envelope("COMMAND_REQUEST", "req-1", json!({ "agentId": "A1", "commandId": "c1", "command": "echo hi" })),
    )
    .await;

    let forwarded = recv_json(&mut agent_ws).await;
    assert_eq!(forwarded["type"], "COMMAND_REQUEST");
    assert_eq!(forwarded["payload"]["commandId"], "c1");
    assert_eq!(forwarded["payload"]["content"], "echo hi");
    assert_eq!(forwarded["payload"]["command"], "echo hi");
    assert_eq!(forwarded["payload"]["type"], "NATURAL");
    assert_eq!(forwarded["payload"]["priority"], 5);
    assert_eq!(forwarded["payload"]["executionConstraints"]["timeLimitMs"], 300_000);
    assert_eq!(forwarded["payload"]["executionConstraints"]["maxRetries"], 1);
    assert_eq!(forwarded["payload"]["userId"], "user-1");

    let command_ack = recv_json(&mut dash_ws).await;
    assert_eq!(command_ack["type"], "ACK");
    assert_eq!(command_ack["payload"]["messageId"], "req-1");
    assert_eq!(command_ack["payload"]["success"], true);
}

/// Scenario 3 (spec §8): cancelling a command you don't own is forbidden and
/// never reaches the agent.
#[tokio::test]
async fn cancel_by_non_owning_dashboard_is_forbidden() {
    let validator = InMemoryTokenValidator::new();
    validator.insert("agent-token", claims("A1", true));
    validator.insert("dash1-token", claims("user-1", false));
    validator.insert("dash2-token", claims("user-2", false));
    let base = spawn_server(vec![], validator).await;

    let mut agent_ws = connect(&base, "/ws/agent", "agent-token").await;
    send_json(&mut agent_ws, envelope("AGENT_CONNECT", "m1", json!({ "agentId": "A1" }))).await;
    let _ = recv_json(&mut agent_ws).await;

    let mut dash1 = connect(&base, "/ws/dashboard", "dash1-token").await;
    send_json(&mut dash1, envelope("DASHBOARD_INIT", "m2", json!({ "userId": "user-1" }))).await;
    let _ = recv_json(&mut dash1).await;
    let _ = recv_json(&mut dash1).await;

    send_json(
        &mut dash1,
        envelope("COMMAND_REQUEST", "req-1", json!({ "agentId": "A1", "commandId": "c1", "command": "echo hi" })),
    )
    .await;
    let _ = recv_json(&mut agent_ws).await;
    let _ = recv_json(&mut dash1).await;

    let mut dash2 = connect(&base, "/ws/dashboard", "dash2-token").await;
    send_json(&mut dash2, envelope("DASHBOARD_INIT", "m3", json!({ "userId": "user-2" }))).await;
    let _ = recv_json(&mut dash2).await;
    let _ = recv_json(&mut dash2).await;

    send_json(&mut dash2, envelope("COMMAND_CANCEL", "m4", json!({ "agentId": "A1", "commandId": "c1" }))).await;
    let forbidden = recv_json(&mut dash2).await;
    assert_eq!(forbidden["type"], "ERROR");
    assert_eq!(forbidden["payload"]["code"], "FORBIDDEN");
}

/// Scenario 5 (spec §8): an agent's socket closing abruptly fails its owned
/// command and frees the affinity so a later cancel is `ROUTING_FAILED`,
/// not `FORBIDDEN`.
#[tokio::test]
async fn agent_disconnect_fails_owned_command_and_clears_affinity() {
    let validator = InMemoryTokenValidator::new();
    validator.insert("agent-token", claims("A1", true));
    validator.insert("dash-token", claims("user-1", false));
    let base = spawn_server(vec![], validator).await;

    let mut agent_ws = connect(&base, "/ws/agent", "agent-token").await;
    send_json(&mut agent_ws, envelope("AGENT_CONNECT", "m1", json!({ "agentId": "A1" }))).await;
    let _ = recv_json(&mut agent_ws).await;

    let mut dash_ws = connect(&base, "/ws/dashboard", "dash-token").await;
    send_json(&mut dash_ws, envelope("DASHBOARD_INIT", "m2", json!({ "userId": "user-1" }))).await;
    let _ = recv_json(&mut dash_ws).await;
    let _ = recv_json(&mut dash_ws).await;

    send_json(
        &mut dash_ws,
        envelope("COMMAND_REQUEST", "req-1", json!({ "agentId": "A1", "commandId": "c1", "command": "echo hi" })),
    )
    .await;
    let _ = recv_json(&mut agent_ws).await;
    let _ = recv_json(&mut dash_ws).await;

    agent_ws.close(None).await.expect("close agent socket");
    drop(agent_ws);

    let disconnect_notice = recv_json(&mut dash_ws).await;
    assert_eq!(disconnect_notice["type"], "AGENT_DISCONNECT");
    assert_eq!(disconnect_notice["payload"]["agentId"], "A1");

    let failed_status = recv_json(&mut dash_ws).await;
    assert_eq!(failed_status["type"], "COMMAND_STATUS");
    assert_eq!(failed_status["payload"]["commandId"], "c1");
    assert_eq!(failed_status["payload"]["status"], "failed");
    assert_eq!(failed_status["payload"]["reason"], "agent_disconnected");

    send_json(&mut dash_ws, envelope("COMMAND_CANCEL", "m4", json!({ "agentId": "A1", "commandId": "c1" }))).await;
    let routing_failed = recv_json(&mut dash_ws).await;
    assert_eq!(routing_failed["type"], "ERROR");
    assert_eq!(routing_failed["payload"]["code"], "ROUTING_FAILED");
}

/// Scenario 6 (spec §8): `DASHBOARD_INIT` with `subscriptions.agents=[]`
/// (wildcard) yields a full roster snapshot plus one `AGENT_STATUS` per
/// known agent, before the final ack.
#[tokio::test]
async fn dashboard_init_sends_full_roster_snapshot() {
    let validator = InMemoryTokenValidator::new();
    validator.insert("agent-token", claims("A1", true));
    validator.insert("dash-token", claims("user-1", false));
    let agents = vec![
        AgentRecord { agent_id: "A1".into(), name: "Agent One".into(), agent_type: "claude".into() },
        AgentRecord { agent_id: "A2".into(), name: "Agent Two".into(), agent_type: "claude".into() },
        AgentRecord { agent_id: "A3".into(), name: "Agent Three".into(), agent_type: "claude".into() },
    ];
    let base = spawn_server(agents, validator).await;

    let mut agent_ws = connect(&base, "/ws/agent", "agent-token").await;
    send_json(&mut agent_ws, envelope("AGENT_CONNECT", "m1", json!({ "agentId": "A1" }))).await;
    let _ = recv_json(&mut agent_ws).await;

    let mut dash_ws = connect(&base, "/ws/dashboard", "dash-token").await;
    send_json(
        &mut dash_ws,
        envelope("DASHBOARD_INIT", "m2", json!({ "userId": "user-1", "subscriptions": { "agents": [] } })),
    )
    .await;

    let connected = recv_json(&mut dash_ws).await;
    assert_eq!(connected["type"], "DASHBOARD_CONNECTED");
    let roster = connected["payload"]["agents"].as_array().expect("agents array");
    assert_eq!(roster.len(), 3);

    let mut statuses = std::collections::HashMap::new();
    for _ in 0..3 {
        let status = recv_json(&mut dash_ws).await;
        assert_eq!(status["type"], "AGENT_STATUS");
        statuses.insert(
            status["payload"]["agentId"].as_str().expect("agentId").to_owned(),
            status["payload"]["status"].as_str().expect("status").to_owned(),
        );
    }
    assert_eq!(statuses.get("A1").map(String::as_str), Some("connected"));
    assert_eq!(statuses.get("A2").map(String::as_str), Some("disconnected"));
    assert_eq!(statuses.get("A3").map(String::as_str), Some("disconnected"));

    let ack = recv_json(&mut dash_ws).await;
    assert_eq!(ack["type"], "ACK");
}

/// Health endpoint reports a liveness snapshot without requiring auth.
#[tokio::test]
async fn health_endpoint_reports_connection_counts() {
    let base = spawn_server(vec![], InMemoryTokenValidator::new()).await;
    let http_base = base.replacen("ws://", "http://", 1);
    let body: Value = reqwest::get(format!("{http_base}/api/v1/health"))
        .await
        .expect("health request")
        .json()
        .await
        .expect("health body");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connection_count"], 0);
}
