//! Bridge request/response between live nodes, over both transports

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use frame_bridge::bridge::Bridge;
use frame_bridge::config::{BridgeTransportKind, NetworkConfig};
use frame_bridge::error::BridgeError;
use frame_bridge::utils::Metrics;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Text {
    text: String,
}

fn text(s: &str) -> Text {
    Text { text: s.to_string() }
}

fn node(kind: BridgeTransportKind) -> Bridge {
    let config = NetworkConfig::default_with_overrides(|c| {
        c.server.shutdown_timeout = Duration::from_secs(1);
        c.pool.poll_timeout = Duration::from_millis(10);
        c.pool.scan_interval = Duration::from_millis(1);
        c.bridge.listen_endpoint = "127.0.0.1:0".to_string();
        c.bridge.transport = kind;
        c.bridge.request_timeout = Duration::from_secs(5);
        c.bridge.sweep_interval = Duration::from_millis(10);
    });
    Bridge::new(&config, Arc::new(Metrics::new())).unwrap()
}

/// Two started nodes that accept each other.
async fn pair(kind: BridgeTransportKind) -> (Bridge, Bridge) {
    let a = node(kind);
    let b = node(kind);
    a.start().await.unwrap();
    b.start().await.unwrap();
    a.allow_peer(b.public_endpoint());
    b.allow_peer(a.public_endpoint());
    (a, b)
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn request_response(kind: BridgeTransportKind) {
    let (a, b) = pair(kind).await;
    b.add_handler("echo", |request: Text, _origin| {
        assert_eq!(request.text, "REQUEST");
        Ok(text("RESPONSE"))
    })
    .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let received = Arc::new(Mutex::new(None));
    let (calls_cb, received_cb) = (Arc::clone(&calls), Arc::clone(&received));
    a.request(
        b.public_endpoint(),
        "echo",
        &text("REQUEST"),
        None,
        move |result: Result<Text, BridgeError>| {
            calls_cb.fetch_add(1, Ordering::SeqCst);
            *received_cb.lock().unwrap() = Some(result);
        },
    )
    .unwrap();

    wait_until(|| calls.load(Ordering::SeqCst) > 0).await;
    // Give a duplicate completion a chance to show up
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(received.lock().unwrap().take(), Some(Ok(text("RESPONSE"))));
    assert_eq!(a.pending_count(), 0);
    assert_eq!(a.metrics().snapshot().responses_matched, 1);

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_udp_request_response() {
    request_response(BridgeTransportKind::Udp).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tcp_request_response() {
    request_response(BridgeTransportKind::Tcp).await;
}

async fn no_handler(kind: BridgeTransportKind) {
    let (a, b) = pair(kind).await;

    let started = Instant::now();
    let result: Result<Text, _> = a
        .call(b.public_endpoint(), "missing", &text("REQUEST"), None)
        .await;

    assert_eq!(result, Err(BridgeError::NoHandler("missing".to_string())));
    // Well before the 5s request timeout
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(b.metrics().snapshot().no_handler_replies, 1);
    assert_eq!(a.metrics().snapshot().request_timeouts, 0);

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_udp_no_handler_reply() {
    no_handler(BridgeTransportKind::Udp).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tcp_no_handler_reply() {
    no_handler(BridgeTransportKind::Tcp).await;
}

async fn timeout_then_late_response(kind: BridgeTransportKind) {
    let (a, b) = pair(kind).await;
    b.add_handler("slow", |request: Text, _origin| {
        std::thread::sleep(Duration::from_millis(300));
        Ok(request)
    })
    .unwrap();

    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&outcomes);
    a.request(
        b.public_endpoint(),
        "slow",
        &text("REQUEST"),
        Some(Duration::from_millis(100)),
        move |result: Result<Text, BridgeError>| sink.lock().unwrap().push(result),
    )
    .unwrap();

    wait_until(|| a.metrics().snapshot().responses_discarded == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(*outcomes.lock().unwrap(), vec![Err(BridgeError::Timeout)]);
    let snapshot = a.metrics().snapshot();
    assert_eq!(snapshot.request_timeouts, 1);
    assert_eq!(snapshot.responses_discarded, 1);
    assert_eq!(snapshot.responses_matched, 0);
    assert_eq!(a.pending_count(), 0);

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_udp_timeout_beats_late_response() {
    timeout_then_late_response(BridgeTransportKind::Udp).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tcp_timeout_beats_late_response() {
    timeout_then_late_response(BridgeTransportKind::Tcp).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_handler_error_reaches_caller() {
    let (a, b) = pair(BridgeTransportKind::Udp).await;
    b.add_handler("fail", |_: Text, _origin| -> frame_bridge::Result<Text> {
        Err(frame_bridge::ProtocolError::Handler("refused".into()))
    })
    .unwrap();
    b.add_handler("panic", |_: Text, _origin| -> frame_bridge::Result<Text> {
        panic!("handler exploded")
    })
    .unwrap();

    let failed: Result<Text, _> = a.call(b.public_endpoint(), "fail", &text("x"), None).await;
    assert!(matches!(failed, Err(BridgeError::HandlerFailed(msg)) if msg.contains("refused")));

    let panicked: Result<Text, _> = a.call(b.public_endpoint(), "panic", &text("x"), None).await;
    assert!(matches!(panicked, Err(BridgeError::HandlerFailed(msg)) if msg.contains("exploded")));

    // The node keeps serving after both
    b.add_handler("echo", |t: Text, _origin| Ok(t)).unwrap();
    let echoed: Result<Text, _> = a.call(b.public_endpoint(), "echo", &text("ok"), None).await;
    assert_eq!(echoed, Ok(text("ok")));

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unlisted_origin_is_ignored() {
    let (a, b) = pair(BridgeTransportKind::Udp).await;
    b.add_handler("echo", |t: Text, _origin| Ok(t)).unwrap();

    let stranger = node(BridgeTransportKind::Udp);
    stranger.start().await.unwrap();
    stranger.allow_peer(b.public_endpoint());

    let result: Result<Text, _> = stranger
        .call(b.public_endpoint(), "echo", &text("hi"), Some(Duration::from_millis(150)))
        .await;
    assert_eq!(result, Err(BridgeError::Timeout));

    stranger.stop().await.unwrap();
    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_notify_reaches_listener() {
    let (a, b) = pair(BridgeTransportKind::Tcp).await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    b.add_listener(move |message: Text, origin| sink.lock().unwrap().push((message, origin)));

    a.send(b.public_endpoint(), &text("ping")).unwrap();
    wait_until(|| !seen.lock().unwrap().is_empty()).await;

    assert_eq!(
        *seen.lock().unwrap(),
        vec![(text("ping"), a.public_endpoint())]
    );
    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tcp_send_failure_completes_with_transport_error() {
    let a = node(BridgeTransportKind::Tcp);
    a.start().await.unwrap();

    // Reserve a port, then free it so nothing listens there
    let vacant = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap();

    let result: Result<Text, _> = a.call(vacant, "echo", &text("hi"), None).await;
    assert!(matches!(result, Err(BridgeError::Transport(_))));
    assert_eq!(a.pending_count(), 0);
    assert_eq!(a.metrics().snapshot().transport_errors, 1);

    a.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unreachable_peer_does_not_delay_others() {
    let (a, b) = pair(BridgeTransportKind::Tcp).await;
    b.add_handler("echo", |t: Text, _origin| Ok(t)).unwrap();

    // A listener that never accepts, with its backlog filled, leaves
    // further connects hanging until the connect timeout
    let socket = tokio::net::TcpSocket::new_v4().unwrap();
    socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let stalled = socket.listen(0).unwrap();
    let unreachable = stalled.local_addr().unwrap();
    let mut backlog = Vec::new();
    for _ in 0..16 {
        match tokio::time::timeout(
            Duration::from_millis(100),
            tokio::net::TcpStream::connect(unreachable),
        )
        .await
        {
            Ok(Ok(stream)) => backlog.push(stream),
            _ => break,
        }
    }

    a.send(unreachable, &text("lost")).unwrap();
    let started = Instant::now();
    let echoed: Result<Text, _> = a
        .call(b.public_endpoint(), "echo", &text("ok"), Some(Duration::from_millis(1000)))
        .await;

    assert_eq!(echoed, Ok(text("ok")));
    assert!(started.elapsed() < Duration::from_secs(1));

    a.stop().await.unwrap();
    b.stop().await.unwrap();
    drop(backlog);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_fails_pending_requests() {
    let a = node(BridgeTransportKind::Udp);
    a.start().await.unwrap();

    // A UDP send to a silent port succeeds, leaving the request pending
    let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let outcome = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&outcome);
    a.request(
        silent.local_addr().unwrap(),
        "echo",
        &text("hi"),
        None,
        move |result: Result<Text, BridgeError>| *sink.lock().unwrap() = Some(result),
    )
    .unwrap();
    wait_until(|| a.metrics().snapshot().frames_sent > 0).await;

    a.stop().await.unwrap();
    assert!(matches!(
        outcome.lock().unwrap().take(),
        Some(Err(BridgeError::Transport(_)))
    ));
    assert_eq!(a.pending_count(), 0);
}
