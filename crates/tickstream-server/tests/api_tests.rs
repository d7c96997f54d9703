//! Integration tests for the stream server.
//!
//! The HTTP endpoints are exercised through the `Router` directly via
//! `tower::ServiceExt`. The stream endpoint is exercised over a real
//! socket with a `tokio-tungstenite` client.

#![allow(clippy::unwrap_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tickstream_cache::SnapshotCache;
use tickstream_core::config::StreamConfig;
use tickstream_core::source::TickSource;
use tickstream_core::synthetic::SyntheticMutator;
use tickstream_server::router::build_router;
use tickstream_server::server::ServerConfig;
use tickstream_server::startup::spawn_server;
use tickstream_server::{AppState, CheapestResume, StreamHub, StreamMetrics, spawn_scheduler};
use tokio_tungstenite::tungstenite::Message;
use tower::ServiceExt;

struct Fixture {
    source: Arc<TickSource>,
    cache: Arc<SnapshotCache>,
    state: Arc<AppState>,
}

fn make_fixture(config: &StreamConfig) -> Fixture {
    let source = Arc::new(TickSource::new(
        config.server.stream_id.clone(),
        Box::new(SyntheticMutator::new(7, 64)),
    ));
    let cache = Arc::new(SnapshotCache::new(
        Arc::clone(&source),
        config.cache.clone(),
    ));
    let hub = Arc::new(StreamHub::new(
        Arc::clone(&source),
        Arc::clone(&cache),
        config,
        Box::new(CheapestResume),
        Arc::new(StreamMetrics::default()),
    ));
    hub.attach_to_source();
    Fixture {
        source,
        cache,
        state: Arc::new(AppState::new(hub)),
    }
}

async fn get_json(state: Arc<AppState>, uri: &str) -> (StatusCode, Value) {
    let app = build_router(state);
    let resp = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = resp.status();
    let body = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

// ---------------------------------------------------------------------------
// HTTP endpoints
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_reports_head_and_cache() {
    let f = make_fixture(&StreamConfig::default());
    for _ in 0..3 {
        f.source.advance();
    }
    f.cache.build_now().await.unwrap();

    let (status, json) = get_json(Arc::clone(&f.state), "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["streamId"], "tickstream");
    assert_eq!(json["headTick"], 3);
    assert_eq!(json["sessions"], 0);
    assert_eq!(json["snapshot"]["cached"], true);
    assert_eq!(json["snapshot"]["lastTickId"], 3);
    assert_eq!(json["limits"]["stalenessLimit"], 100);
}

#[tokio::test]
async fn metrics_are_flat_counters() {
    let f = make_fixture(&StreamConfig::default());
    f.source.advance();
    f.cache.build_now().await.unwrap();

    let (status, json) = get_json(Arc::clone(&f.state), "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["snapshot_builds_total"], 1);
    assert_eq!(json["snapshot_errors_total"], 0);
    assert_eq!(json["stream_head_tick"], 1);
    assert_eq!(json["sessions_active"], 0);
    assert_eq!(json["messages_sent_total"], 0);
    assert_eq!(json["ping_rtt_ms_max"], 0);
    assert!(json["snapshot_cache_size_bytes"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn unknown_path_is_json_404() {
    let f = make_fixture(&StreamConfig::default());
    let (status, json) = get_json(Arc::clone(&f.state), "/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["status"], 404);
    assert!(json["error"].as_str().unwrap().contains("/nope"));
}

// ---------------------------------------------------------------------------
// Stream endpoint over a real socket
// ---------------------------------------------------------------------------

type Client = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn connect(state: Arc<AppState>) -> (Client, tickstream_server::ServerHandle) {
    let config = ServerConfig {
        host: String::from("127.0.0.1"),
        port: 0,
    };
    let server = spawn_server(&config, state).await.unwrap();
    let url = format!("ws://{}/stream", server.addr());
    let (client, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    (client, server)
}

async fn next_json(client: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

#[tokio::test]
async fn hello_gets_welcome_then_snapshot() {
    let f = make_fixture(&StreamConfig::default());
    for _ in 0..5 {
        f.source.advance();
    }
    f.cache.build_now().await.unwrap();
    let scheduler = spawn_scheduler(Arc::clone(&f.state.hub));
    let (mut client, server) = connect(Arc::clone(&f.state)).await;

    let hello = r#"{"type":"hello","streamId":"tickstream","wantWindow":16}"#;
    client.send(Message::Text(hello.into())).await.unwrap();

    let welcome = next_json(&mut client).await;
    assert_eq!(welcome["type"], "welcome");
    assert_eq!(welcome["maxWindow"], 16);

    let snapshot = next_json(&mut client).await;
    assert_eq!(snapshot["type"], "snapshot");
    assert_eq!(snapshot["tickId"], 5);

    // A later tick arrives as a delta.
    f.source.advance();
    let delta = next_json(&mut client).await;
    assert_eq!(delta["type"], "delta");
    assert_eq!(delta["tickId"], 6);

    client.close(None).await.unwrap();
    scheduler.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn message_before_hello_gets_bye() {
    let f = make_fixture(&StreamConfig::default());
    let (mut client, server) = connect(Arc::clone(&f.state)).await;

    let credit = r#"{"type":"credit","n":4,"lastApplied":0}"#;
    client.send(Message::Text(credit.into())).await.unwrap();

    let bye = next_json(&mut client).await;
    assert_eq!(bye["type"], "bye");
    assert_eq!(bye["reason"], "expected hello");
    assert_eq!(f.state.hub.metrics().snapshot().protocol_violations, 1);

    server.shutdown().await;
}

/// Wait until the hub holds `n` sessions; detaching happens after `bye`.
async fn wait_for_sessions(state: &AppState, n: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while state.hub.session_count() != n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

async fn say_hello(client: &mut Client, state: &AppState) {
    let hello = r#"{"type":"hello","streamId":"tickstream","wantWindow":8}"#;
    client.send(Message::Text(hello.into())).await.unwrap();
    let welcome = next_json(client).await;
    assert_eq!(welcome["type"], "welcome");
    wait_for_sessions(state, 1).await;
}

#[tokio::test]
async fn second_hello_gets_bye_and_detaches() {
    let f = make_fixture(&StreamConfig::default());
    let (mut client, server) = connect(Arc::clone(&f.state)).await;
    say_hello(&mut client, &f.state).await;

    let hello = r#"{"type":"hello","streamId":"tickstream","wantWindow":8}"#;
    client.send(Message::Text(hello.into())).await.unwrap();

    let bye = next_json(&mut client).await;
    assert_eq!(bye["type"], "bye");
    assert_eq!(bye["reason"], "already connected");
    assert_eq!(f.state.hub.metrics().snapshot().protocol_violations, 1);
    wait_for_sessions(&f.state, 0).await;

    server.shutdown().await;
}

#[tokio::test]
async fn malformed_frame_after_hello_gets_bye_and_detaches() {
    let f = make_fixture(&StreamConfig::default());
    let (mut client, server) = connect(Arc::clone(&f.state)).await;
    say_hello(&mut client, &f.state).await;

    let credit = r#"{"type":"credit","n":"lots","lastApplied":0}"#;
    client.send(Message::Text(credit.into())).await.unwrap();

    let bye = next_json(&mut client).await;
    assert_eq!(bye["type"], "bye");
    assert_eq!(bye["reason"], "invalid message");
    assert_eq!(f.state.hub.metrics().snapshot().protocol_violations, 1);
    wait_for_sessions(&f.state, 0).await;

    server.shutdown().await;
}

#[tokio::test]
async fn wrong_stream_gets_bye() {
    let f = make_fixture(&StreamConfig::default());
    let (mut client, server) = connect(Arc::clone(&f.state)).await;

    let hello = r#"{"type":"hello","streamId":"other","wantWindow":16}"#;
    client.send(Message::Text(hello.into())).await.unwrap();

    let bye = next_json(&mut client).await;
    assert_eq!(bye["type"], "bye");
    assert_eq!(bye["reason"], "unknown stream");
    assert_eq!(f.state.hub.session_count(), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn malformed_frame_gets_bye() {
    let f = make_fixture(&StreamConfig::default());
    let (mut client, server) = connect(Arc::clone(&f.state)).await;

    client
        .send(Message::Text("{not json".into()))
        .await
        .unwrap();

    let bye = next_json(&mut client).await;
    assert_eq!(bye["reason"], "invalid message");

    server.shutdown().await;
}
