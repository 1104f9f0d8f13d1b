use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::time;
use tokio_tungstenite::tungstenite;

use relay_api::backend::memory::MemoryBackend;
use relay_api::backend::BackendApi;
use relay_api::config::Config;
use relay_api::AppState;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Helper: start an actual TCP server for WebSocket testing.
/// Returns (addr, state, backend). The server runs in the background.
async fn start_server(config: Config) -> (SocketAddr, AppState, Arc<MemoryBackend>) {
    let memory = Arc::new(MemoryBackend::new());
    let state = AppState::new(config, memory.clone());
    let app = relay_api::routes::router().with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, state, memory)
}

/// Short windows so the suite runs quickly.
fn test_config() -> Config {
    Config {
        aggregation_window_ms: 150,
        disconnect_grace_ms: 300,
        ..Config::default()
    }
}

/// Helper: connect to the gateway, IDENTIFY, and wait for READY.
async fn connect_and_identify(
    addr: SocketAddr,
    username: &str,
    groups: &[&str],
    dm_ids: &[&str],
) -> WsStream {
    let url = format!("ws://{addr}/gateway");
    let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("ws connect");

    let (mut write, read) = ws_stream.split();
    let identify = json!({
        "op": 2,
        "d": {
            "user_id": format!("usr_{}", username.to_lowercase()),
            "username": username,
            "groups": groups,
            "dm_ids": dm_ids,
        }
    });
    write
        .send(tungstenite::Message::Text(identify.to_string().into()))
        .await
        .expect("send identify");

    let mut stream = read.reunite(write).expect("reunite");
    let ready = recv_event(&mut stream, "ready").await;
    assert_eq!(ready["user"]["username"], username);
    assert!(ready["heartbeat_interval_ms"].as_u64().unwrap() > 0);
    stream
}

/// Send a DISPATCH frame (op=0) with a named event.
async fn send_dispatch(stream: &mut WsStream, event: &str, data: serde_json::Value) {
    let frame = json!({ "op": 0, "t": event, "d": data });
    stream
        .send(tungstenite::Message::Text(frame.to_string().into()))
        .await
        .expect("send dispatch");
}

/// Read frames until one dispatches the named event.
async fn recv_event(stream: &mut WsStream, event: &str) -> serde_json::Value {
    loop {
        let msg = time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {event}"))
            .expect("stream ended")
            .expect("ws read error");
        let tungstenite::Message::Text(text) = msg else {
            continue;
        };
        let frame: serde_json::Value = serde_json::from_str(&text).expect("parse frame");
        if frame["op"] == 0 && frame["t"] == event {
            return frame["d"].clone();
        }
    }
}

/// Assert that none of the named events arrive within `wait`.
async fn assert_no_events(stream: &mut WsStream, events: &[&str], wait: Duration) {
    let deadline = time::Instant::now() + wait;
    loop {
        let remaining = deadline.saturating_duration_since(time::Instant::now());
        if remaining.is_zero() {
            return;
        }
        match time::timeout(remaining, stream.next()).await {
            Err(_) | Ok(None) => return,
            Ok(Some(Ok(tungstenite::Message::Text(text)))) => {
                let frame: serde_json::Value = serde_json::from_str(&text).expect("parse frame");
                let t = frame["t"].as_str().unwrap_or_default();
                assert!(
                    !events.contains(&t),
                    "unexpected {t} event: {frame}"
                );
            }
            Ok(Some(_)) => continue,
        }
    }
}

// ---------------------------------------------------------------------------

#[tokio::test]
async fn dm_message_reaches_peer_and_preserves_local_id() {
    let (addr, _state, _memory) = start_server(test_config()).await;
    let dm = "dm:alice|bob";

    let mut alice_phone = connect_and_identify(addr, "alice", &[], &[dm]).await;
    let mut alice_desktop = connect_and_identify(addr, "alice", &[], &[dm]).await;
    let mut bob = connect_and_identify(addr, "bob", &[], &[]).await;

    send_dispatch(&mut bob, "dm:join", json!({ "scope_id": dm })).await;
    let history = recv_event(&mut bob, "dm:history").await;
    assert_eq!(history["dm_id"], dm);

    send_dispatch(
        &mut alice_phone,
        "dm:send",
        json!({ "scope_id": dm, "text": "hi", "local_id": "loc-1" }),
    )
    .await;

    let event = recv_event(&mut bob, "dm:message").await;
    assert_eq!(event["dm_id"], dm);
    assert_eq!(event["username"], "alice");
    assert_eq!(event["text"], "hi");

    // Any other live session of the sender sees the same event with the
    // client's local id intact.
    let event = recv_event(&mut alice_desktop, "dm:message").await;
    assert_eq!(event["text"], "hi");
    assert_eq!(event["local_id"], "loc-1");
}

#[tokio::test]
async fn dm_send_reaches_peer_who_never_joined() {
    let (addr, _state, _memory) = start_server(test_config()).await;
    let dm = "dm:alice|bob";

    let mut alice = connect_and_identify(addr, "alice", &[], &[dm]).await;
    // Bob is online but never joins the thread client-side.
    let mut bob = connect_and_identify(addr, "bob", &[], &[]).await;

    send_dispatch(
        &mut alice,
        "dm:send",
        json!({ "scope_id": dm, "text": "you there?" }),
    )
    .await;

    let event = recv_event(&mut bob, "dm:message").await;
    assert_eq!(event["dm_id"], dm);
    assert_eq!(event["text"], "you there?");
}

#[tokio::test]
async fn group_join_churn_aggregates_into_one_notice() {
    let (addr, _state, _memory) = start_server(test_config()).await;

    let mut ana = connect_and_identify(addr, "Ana", &[], &[]).await;
    let mut ben = connect_and_identify(addr, "Ben", &[], &[]).await;
    let mut cid = connect_and_identify(addr, "Cid", &[], &[]).await;

    for stream in [&mut ana, &mut ben, &mut cid] {
        send_dispatch(stream, "group:join", json!({ "scope_id": "general" })).await;
        recv_event(stream, "group:history").await;
    }

    // Exactly one system message enumerates all three joiners.
    let notice = recv_event(&mut ana, "system:message").await;
    let text = notice["text"].as_str().unwrap();
    assert!(text.ends_with(" joined"), "unexpected notice: {text}");
    for name in ["Ana", "Ben", "Cid"] {
        assert!(text.contains(name), "missing {name} in {text}");
    }
    assert_eq!(notice["system"], true);

    assert_no_events(&mut ana, &["system:message"], Duration::from_millis(400)).await;
}

#[tokio::test]
async fn group_message_flow_end_to_end() {
    let (addr, _state, memory) = start_server(test_config()).await;

    let mut alice = connect_and_identify(addr, "alice", &["general"], &[]).await;
    let mut bob = connect_and_identify(addr, "bob", &["general"], &[]).await;

    send_dispatch(
        &mut alice,
        "group:send",
        json!({ "scope_id": "general", "text": "hello room", "local_id": "loc-9" }),
    )
    .await;

    let event = recv_event(&mut bob, "group:message").await;
    assert_eq!(event["group_id"], "general");
    assert_eq!(event["username"], "alice");
    assert_eq!(event["text"], "hello room");

    // The message was persisted with the backend's durable id.
    let stored = memory.latest_messages("general", 10).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, event["id"].as_str().unwrap());

    // An invalid scope comes back as a scoped error event, not a close.
    send_dispatch(
        &mut alice,
        "group:send",
        json!({ "scope_id": "dm:alice|bob", "text": "oops" }),
    )
    .await;
    let err = recv_event(&mut alice, "group:error").await;
    assert_eq!(err["code"], "invalid_scope");
}

#[tokio::test]
async fn disconnect_after_grace_emits_leave_and_offline_once() {
    let (addr, _state, _memory) = start_server(test_config()).await;

    let mut bob = connect_and_identify(addr, "bob", &["general"], &[]).await;
    let alice = connect_and_identify(addr, "alice", &["general"], &[]).await;
    drop(alice);

    let offline = recv_event(&mut bob, "presence:offline").await;
    assert_eq!(offline["username"], "alice");

    let notice = recv_event(&mut bob, "system:message").await;
    assert_eq!(notice["text"], "alice left");

    assert_no_events(
        &mut bob,
        &["presence:offline", "system:message"],
        Duration::from_millis(400),
    )
    .await;
}

#[tokio::test]
async fn reconnect_within_grace_is_publicly_invisible() {
    let (addr, state, _memory) = start_server(test_config()).await;

    let mut bob = connect_and_identify(addr, "bob", &["general"], &[]).await;
    let alice_old = connect_and_identify(addr, "alice", &["general"], &[]).await;
    drop(alice_old);

    let _alice_new = connect_and_identify(addr, "alice", &["general"], &[]).await;

    assert_no_events(
        &mut bob,
        &["presence:offline", "system:message"],
        Duration::from_millis(800),
    )
    .await;
    assert_eq!(state.registry.pending_count(), 0);
    assert!(state.presence.is_online("alice"));
}

#[tokio::test]
async fn like_notification_carries_profile_summary() {
    let (addr, _state, memory) = start_server(test_config()).await;
    memory.insert_profile(banter_common::model::ProfileSummary {
        username: "alice".to_string(),
        display_name: Some("Alice".to_string()),
        avatar: None,
        bubble_color: Some("#aa00ff".to_string()),
        tagline: None,
    });

    let mut alice = connect_and_identify(addr, "alice", &[], &[]).await;
    let mut bob = connect_and_identify(addr, "bob", &[], &[]).await;

    send_dispatch(&mut alice, "like:send", json!({ "username": "bob" })).await;

    let event = recv_event(&mut bob, "like:received").await;
    assert_eq!(event["from"], "alice");
    assert_eq!(event["profile"]["display_name"], "Alice");
    assert!(memory.has_like("alice", "bob"));
}

#[tokio::test]
async fn health_and_metrics_routes_respond() {
    let (addr, _state, _memory) = start_server(test_config()).await;

    let mut alice = connect_and_identify(addr, "alice", &["general"], &[]).await;
    send_dispatch(
        &mut alice,
        "group:send",
        json!({ "scope_id": "general", "text": "counted" }),
    )
    .await;
    recv_event(&mut alice, "group:message").await;

    let client = reqwest::Client::new();
    let health: serde_json::Value = client
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .expect("health request")
        .json()
        .await
        .expect("health body");
    assert_eq!(health["status"], "ok");

    let text = client
        .get(format!("http://{addr}/metrics"))
        .send()
        .await
        .expect("metrics request")
        .text()
        .await
        .expect("metrics body");
    assert!(text.contains("relay_backend_message_write_latency_milliseconds_bucket"));

    let summary: serde_json::Value = client
        .get(format!("http://{addr}/metrics/summary"))
        .send()
        .await
        .expect("summary request")
        .json()
        .await
        .expect("summary body");
    assert_eq!(summary["backend"]["message_write"]["count"], 1);
    assert_eq!(summary["breaker_open"], false);
}
