//! Full daemon on ephemeral ports: producers push records over the ingest
//! socket, clients drive executions over the channel endpoint.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use ptexec_daemon::{Daemon, DaemonConfig, RunningDaemon};
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

type Client = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

async fn start() -> RunningDaemon {
    let config = DaemonConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        ingest_addr: "127.0.0.1:0".parse().unwrap(),
        step_delay_ms: 5,
        ..DaemonConfig::default()
    };
    Daemon::new(config, CancellationToken::new())
        .start()
        .await
        .expect("daemon starts")
}

async fn connect(daemon: &RunningDaemon) -> Client {
    let url = format!("ws://127.0.0.1:{}", daemon.ws_addr.port());
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    assert_eq!(recv(&mut ws).await["type"], "connection_established");
    ws
}

async fn recv(ws: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for frame")
            .expect("stream ended")
            .expect("read error");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected text frame, got {other:?}"),
        }
    }
}

async fn request(ws: &mut Client, value: Value) -> Value {
    ws.send(Message::Text(value.to_string())).await.unwrap();
    recv(ws).await
}

async fn push_records(daemon: &RunningDaemon, lines: &[Value]) {
    let mut producer = TcpStream::connect(daemon.ingest_addr).await.unwrap();
    for line in lines {
        producer.write_all(format!("{line}\n").as_bytes()).await.unwrap();
    }
    producer.flush().await.unwrap();
}

/// Collect execution events until a terminal one arrives.
async fn until_terminal(ws: &mut Client) -> Vec<Value> {
    let mut events = Vec::new();
    loop {
        let event = recv(ws).await;
        let kind = event["type"].as_str().unwrap_or_default().to_string();
        events.push(event);
        if matches!(
            kind.as_str(),
            "execution_completed" | "execution_failed" | "execution_cancelled"
        ) {
            return events;
        }
    }
}

#[tokio::test]
async fn ingested_records_reach_record_subscribers() {
    let daemon = start().await;
    let mut all = connect(&daemon).await;
    let mut only_b = connect(&daemon).await;
    request(&mut all, json!({ "type": "subscribe", "channel": "records" })).await;
    request(&mut only_b, json!({ "type": "subscribe", "channel": "records:sniffer-b" })).await;

    push_records(
        &daemon,
        &[
            json!({ "source": "sniffer-a", "payload": { "messageType": "Paging" } }),
            json!({ "source": "sniffer-b", "level": "warn", "payload": { "messageType": "RRCReject" } }),
        ],
    )
    .await;

    let first = recv(&mut all).await;
    let second = recv(&mut all).await;
    assert_eq!(first["type"], "record");
    assert_eq!(first["record"]["source"], "sniffer-a");
    assert_eq!(second["record"]["source"], "sniffer-b");
    assert!(first["record"]["seq"].as_u64() < second["record"]["seq"].as_u64());

    let only = recv(&mut only_b).await;
    assert_eq!(only["record"]["source"], "sniffer-b");
    assert_eq!(only["record"]["level"], "warn");

    daemon.shutdown().await;
}

#[tokio::test]
async fn live_tool_records_drive_a_routed_execution() {
    let daemon = start().await;
    push_records(
        &daemon,
        &[
            json!({ "source": "sniffer-a", "payload": { "layer": "RRC", "direction": "UL", "messageType": "RRCSetupRequest" } }),
            json!({ "source": "sniffer-a", "payload": { "layer": "RRC", "direction": "DL", "messageType": "RRCSetup" } }),
            json!({ "source": "sniffer-a", "payload": { "layer": "RRC", "direction": "UL", "messageType": "RRCSetupComplete", "verdict": "FAIL" } }),
        ],
    )
    .await;
    let merger = std::sync::Arc::clone(daemon.daemon().merger());
    for _ in 0..100 {
        if merger.len() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(merger.len(), 3);

    let mut ws = connect(&daemon).await;
    request(&mut ws, json!({ "type": "authenticate", "userId": "alice" })).await;
    ws.send(Message::Text(
        json!({ "type": "start_execution", "testCaseId": "tc-rrc", "params": { "tool": "sniffer-a" } })
            .to_string(),
    ))
    .await
    .unwrap();

    let events = until_terminal(&mut ws).await;
    let kinds: Vec<&str> = events.iter().filter_map(|e| e["type"].as_str()).collect();
    assert_eq!(
        kinds,
        [
            "execution_queued",
            "execution_started",
            "execution_step",
            "execution_step",
            "execution_step",
            "execution_completed"
        ]
    );
    let steps: Vec<&str> = events
        .iter()
        .filter(|e| e["type"] == "execution_step")
        .filter_map(|e| e["step"]["messageType"].as_str())
        .collect();
    assert_eq!(steps, ["RRCSetupRequest", "RRCSetup", "RRCSetupComplete"]);

    let done = events.last().unwrap();
    assert_eq!(done["status"], "FAILED");
    assert_eq!(done["summary"]["failedSteps"], 1);

    let stats = daemon.daemon().router().routing_stats();
    assert_eq!(stats["sniffer-a"].real, 1);
    assert!(daemon.daemon().router().failover_history().is_empty());

    daemon.shutdown().await;
}

#[tokio::test]
async fn unknown_tool_falls_back_to_synthetic_steps() {
    let daemon = start().await;
    let mut ws = connect(&daemon).await;
    request(&mut ws, json!({ "type": "authenticate", "userId": "alice" })).await;
    ws.send(Message::Text(
        json!({ "type": "start_execution", "testCaseId": "tc", "params": { "tool": "nobody" } })
            .to_string(),
    ))
    .await
    .unwrap();

    let events = until_terminal(&mut ws).await;
    assert_eq!(events.last().unwrap()["type"], "execution_completed");
    assert_eq!(events.last().unwrap()["status"], "PASSED");
    let stats = daemon.daemon().router().routing_stats();
    assert_eq!(stats["nobody"].mock, 1);

    let execution_id = events[0]["executionId"].as_str().unwrap();
    let stored = daemon.daemon().engine().get(execution_id).expect("retained");
    assert_eq!(stored.steps.len(), 8);

    daemon.shutdown().await;
}
