//! End-to-end viewer sessions over a real socket.
mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use common::{default_table, sample, state_with, test_config, FakeCollector, FakeTerminator};
use futures_util::{SinkExt, StreamExt};
use pulsetop_agent::config::AgentConfig;
use pulsetop_agent::server::serve;
use pulsetop_agent::state::AppState;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start(state: AppState) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, state, std::future::pending()));
    addr
}

async fn agent(config: AgentConfig) -> (SocketAddr, AppState, Arc<FakeCollector>, Arc<FakeTerminator>) {
    let collector = FakeCollector::new(sample(33.0), default_table());
    let terminator = FakeTerminator::new(collector.clone());
    let state = state_with(config, collector.clone(), None, terminator.clone());
    state.cache.prime().await;
    let addr = start(state.clone()).await;
    (addr, state, collector, terminator)
}

async fn connect(addr: SocketAddr) -> Client {
    let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.expect("connect");
    ws
}

async fn next_event(ws: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("event within 5s")
            .expect("stream open")
            .expect("frame");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).expect("json event");
        }
    }
}

/// Skip broadcast snapshots until an event of type `ty` arrives.
async fn wait_for(ws: &mut Client, ty: &str) -> Value {
    loop {
        let ev = next_event(ws).await;
        if ev["type"] == ty {
            return ev;
        }
    }
}

async fn send(ws: &mut Client, v: Value) {
    ws.send(Message::Text(v.to_string())).await.unwrap();
}

#[tokio::test]
async fn connect_delivers_system_and_processes() {
    let (addr, _state, _, _) = agent(test_config()).await;
    let mut ws = connect(addr).await;

    let system = next_event(&mut ws).await;
    assert_eq!(system["type"], "system");
    assert_eq!(system["data"]["hostname"], "testhost");
    assert_eq!(system["data"]["used_percent"], "60.0");

    let procs = next_event(&mut ws).await;
    assert_eq!(procs["type"], "processes");
    let list = procs["data"]["processes"].as_array().unwrap();
    assert_eq!(list[0]["pid"], 300);
    assert_eq!(procs["data"]["process_count"], 4);
}

#[tokio::test]
async fn kill_is_acknowledged_then_resolved() {
    let (addr, state, _, terminator) = agent(test_config()).await;
    let mut ws = connect(addr).await;

    send(&mut ws, json!({"type": "kill", "pid": 300, "request_id": "r-42"})).await;
    let ack = wait_for(&mut ws, "kill_ack").await;
    assert_eq!(ack["data"]["request_id"], "r-42");
    assert_eq!(ack["data"]["pid"], 300);

    let outcome = wait_for(&mut ws, "kill_outcome").await;
    assert_eq!(outcome["data"]["request_id"], "r-42");
    assert_eq!(outcome["data"]["status"], "succeeded");
    assert!(outcome["data"].get("reason").is_none());

    assert_eq!(terminator.call_count(), 1);
    assert!(state.cache.peek_processes().unwrap().value.find(300).is_none());
}

#[tokio::test]
async fn kill_of_unknown_pid_fails_with_reason() {
    let (addr, _state, _, terminator) = agent(test_config()).await;
    terminator.fail_with(pulsetop_agent::error::KillError::NotFound(999_999));
    let mut ws = connect(addr).await;

    send(&mut ws, json!({"type": "kill", "pid": 999_999})).await;
    let ack = wait_for(&mut ws, "kill_ack").await;
    let request_id = ack["data"]["request_id"].as_str().unwrap().to_string();
    assert!(!request_id.is_empty(), "agent assigns an id when the viewer omits one");

    let outcome = wait_for(&mut ws, "kill_outcome").await;
    assert_eq!(outcome["data"]["request_id"], request_id.as_str());
    assert_eq!(outcome["data"]["status"], "failed");
    assert!(outcome["data"]["reason"]
        .as_str()
        .unwrap()
        .contains("process not found"));
}

#[tokio::test]
async fn non_integer_pid_is_acknowledged_and_rejected() {
    let (addr, _state, _, terminator) = agent(test_config()).await;
    let mut ws = connect(addr).await;

    for (i, pid) in [json!("abc"), json!("42"), json!(12.5), json!(u64::MAX)]
        .into_iter()
        .enumerate()
    {
        let request_id = format!("bad-{i}");
        send(&mut ws, json!({"type": "kill", "pid": pid.clone(), "request_id": &request_id})).await;

        let ack = wait_for(&mut ws, "kill_ack").await;
        assert_eq!(ack["data"]["request_id"], request_id.as_str());
        assert_eq!(ack["data"]["pid"], pid);

        let outcome = wait_for(&mut ws, "kill_outcome").await;
        assert_eq!(outcome["data"]["request_id"], request_id.as_str());
        assert_eq!(outcome["data"]["status"], "failed");
        assert!(outcome["data"]["reason"]
            .as_str()
            .unwrap()
            .starts_with("invalid pid"));
    }
    assert_eq!(terminator.call_count(), 0);
}

#[tokio::test]
async fn slow_kill_resolves_with_a_timeout_outcome() {
    let config = AgentConfig {
        kill_wait: Duration::from_millis(200),
        kill_timeout: Duration::from_secs(5),
        ..test_config()
    };
    let (addr, _state, _, terminator) = agent(config).await;
    terminator.hang_for(Duration::from_secs(2));
    let mut ws = connect(addr).await;

    send(&mut ws, json!({"type": "kill", "pid": 100, "request_id": "slow"})).await;
    wait_for(&mut ws, "kill_ack").await;
    let outcome = wait_for(&mut ws, "kill_outcome").await;
    assert_eq!(outcome["data"]["status"], "failed");
    assert_eq!(outcome["data"]["reason"], "timeout waiting for kill outcome");
}

#[tokio::test]
async fn refresh_request_sends_the_snapshot_to_the_requester() {
    let (addr, _state, _, _) = agent(test_config()).await;
    let mut ws = connect(addr).await;
    wait_for(&mut ws, "processes").await;

    // Garbage is ignored; the session stays usable.
    ws.send(Message::Text("not json".into())).await.unwrap();
    send(&mut ws, json!({"type": "refresh", "kind": "system"})).await;
    let system = wait_for(&mut ws, "system").await;
    assert_eq!(system["data"]["cpu_total"], 33.0);
}

#[tokio::test]
async fn closing_the_socket_deregisters_the_session() {
    let (addr, state, _, _) = agent(test_config()).await;
    let mut ws = connect(addr).await;
    wait_for(&mut ws, "processes").await;
    assert_eq!(state.hub.session_count(), 1);

    ws.close(None).await.unwrap();
    for _ in 0..50 {
        if state.hub.session_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(state.hub.session_count(), 0);
}

async fn get_healthz(addr: SocketAddr) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /healthz HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut body = String::new();
    stream.read_to_string(&mut body).await.unwrap();
    body
}

#[tokio::test]
async fn healthz_reports_readiness() {
    let collector = FakeCollector::new(sample(33.0), default_table());
    let terminator = FakeTerminator::new(collector.clone());
    let state = state_with(test_config(), collector, None, terminator);
    let addr = start(state.clone()).await;

    let before = get_healthz(addr).await;
    assert!(before.starts_with("HTTP/1.1 503"), "{before}");

    state.cache.prime().await;
    let after = get_healthz(addr).await;
    assert!(after.starts_with("HTTP/1.1 200"), "{after}");
    assert!(after.ends_with("ok"));
}
