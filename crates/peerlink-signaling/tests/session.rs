use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use peerlink_core::{ConnectionState, Endpoint, PeerId};
use peerlink_signaling::{ChannelObserver, SessionSettings, SignalingClient, SignalingEvent};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().with_env_filter("debug").try_init();
}

// ── Scripted server ───────────────────────────────────────────────────────────

struct Request {
    target: String,
    body: Vec<u8>,
}

/// Read one request off `stream`; `None` once the client closes.
async fn read_request(stream: &mut TcpStream, pending: &mut Vec<u8>) -> Option<Request> {
    loop {
        if let Some(eoh) = pending.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&pending[..eoh]).to_string();
            let length: usize = head
                .lines()
                .filter_map(|l| l.split_once(':'))
                .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                .and_then(|(_, v)| v.trim().parse().ok())
                .unwrap_or(0);
            let total = eoh + 4 + length;
            while pending.len() < total {
                let mut chunk = [0u8; 1024];
                let n = stream.read(&mut chunk).await.ok()?;
                if n == 0 {
                    return None;
                }
                pending.extend_from_slice(&chunk[..n]);
            }
            let target = head.split_whitespace().nth(1).unwrap_or_default().to_owned();
            let body = pending[eoh + 4..total].to_vec();
            pending.drain(..total);
            return Some(Request { target, body });
        }

        let mut chunk = [0u8; 1024];
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        pending.extend_from_slice(&chunk[..n]);
    }
}

fn reply(status: &str, pragma: Option<u32>, body: &str) -> Vec<u8> {
    let pragma = pragma.map(|p| format!("Pragma: {}\r\n", p)).unwrap_or_default();
    format!(
        "HTTP/1.0 {}\r\nServer: scripted\r\n{}Content-Length: {}\r\n\r\n{}",
        status,
        pragma,
        body.len(),
        body
    )
    .into_bytes()
}

/// Behaves like the rendezvous server for a client that gets id 3 while
/// bob (id 8) is online. The first wait delivers a message from bob; later
/// waits hang until the client goes away.
async fn serve_happy_path(listener: TcpListener, relayed: mpsc::UnboundedSender<(String, Vec<u8>)>) {
    let waits = Arc::new(AtomicUsize::new(0));
    loop {
        let Ok((mut stream, _)) = listener.accept().await else { return };
        let waits = waits.clone();
        let relayed = relayed.clone();
        tokio::spawn(async move {
            let mut pending = Vec::new();
            while let Some(request) = read_request(&mut stream, &mut pending).await {
                let target = request.target.as_str();
                if target.starts_with("/sign_in?") {
                    let _ = stream.write_all(&reply("200 Added", Some(3), "alice,3,1\nbob,8,1\n")).await;
                    return;
                } else if target.starts_with("/wait?peer_id=3") {
                    if waits.fetch_add(1, Ordering::SeqCst) == 0 {
                        let _ = stream.write_all(&reply("200 OK", Some(8), "hello")).await;
                    }
                } else if target.starts_with("/message?") {
                    let _ = relayed.send((request.target.clone(), request.body));
                    let _ = stream.write_all(&reply("200 OK", None, "")).await;
                    return;
                } else if target.starts_with("/sign_out?") {
                    let _ = stream.write_all(&reply("200 OK", None, "")).await;
                    return;
                }
            }
        });
    }
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<SignalingEvent>) -> SignalingEvent {
    tokio::time::timeout(EVENT_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for signaling event")
        .expect("event channel closed")
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn sign_in_relay_and_sign_out() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("Failed to bind random port");
    let port = listener.local_addr().unwrap().port();
    let (relayed_tx, mut relayed_rx) = mpsc::unbounded_channel();
    tokio::spawn(serve_happy_path(listener, relayed_tx));

    let (observer, mut events) = ChannelObserver::new();
    let client = SignalingClient::spawn(observer, SessionSettings::default());
    client.connect(Endpoint::new("127.0.0.1", port), "carol").await.unwrap();

    assert_eq!(
        next_event(&mut events).await,
        SignalingEvent::PeerConnected { id: PeerId(8), name: "bob".into() }
    );
    assert_eq!(next_event(&mut events).await, SignalingEvent::SignedIn { self_id: PeerId(3) });
    assert_eq!(
        next_event(&mut events).await,
        SignalingEvent::MessageFromPeer { id: PeerId(8), payload: Bytes::from_static(b"hello") }
    );

    let snapshot = client.snapshot().await.unwrap();
    assert_eq!(snapshot.state, ConnectionState::Connected);
    assert_eq!(snapshot.self_id, Some(PeerId(3)));
    assert_eq!(snapshot.peers.len(), 1);

    client.send_to_peer(PeerId(8), "offer").await.unwrap();
    assert_eq!(next_event(&mut events).await, SignalingEvent::MessageSent { status: 200 });
    let (target, body) = relayed_rx.recv().await.unwrap();
    assert_eq!(target, "/message?peer_id=3&to=8");
    assert_eq!(body, b"offer");

    client.sign_out().await.unwrap();
    assert_eq!(next_event(&mut events).await, SignalingEvent::Disconnected);
    assert_eq!(client.snapshot().await.unwrap().state, ConnectionState::Disconnected);

    client.shutdown().await;
}

#[tokio::test]
async fn refused_sign_in_is_retried() {
    init_tracing();
    // Reserve a port, then free it so the first attempt is refused.
    let port = {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        probe.local_addr().unwrap().port()
    };

    let (observer, mut events) = ChannelObserver::new();
    let settings = SessionSettings { reconnect_delay: Duration::from_millis(500), ..Default::default() };
    let client = SignalingClient::spawn(observer, settings);
    client.connect(Endpoint::new("127.0.0.1", port), "carol").await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.snapshot().await.unwrap().state, ConnectionState::SigningIn);
    assert!(events.try_recv().is_err());

    let listener = TcpListener::bind(("127.0.0.1", port)).await.expect("port still free");
    let (relayed_tx, _relayed_rx) = mpsc::unbounded_channel();
    tokio::spawn(serve_happy_path(listener, relayed_tx));

    assert!(matches!(next_event(&mut events).await, SignalingEvent::PeerConnected { .. }));
    assert_eq!(next_event(&mut events).await, SignalingEvent::SignedIn { self_id: PeerId(3) });

    client.close();
    client.shutdown().await;
}

#[tokio::test]
async fn rejected_sign_in_disconnects_once() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let mut pending = Vec::new();
            if read_request(&mut stream, &mut pending).await.is_some() {
                let _ = stream.write_all(&reply("500 Internal Server Error", None, "")).await;
            }
        }
    });

    let (observer, mut events) = ChannelObserver::new();
    let client = SignalingClient::spawn(observer, SessionSettings::default());
    client.connect(Endpoint::new("127.0.0.1", port), "carol").await.unwrap();

    assert_eq!(next_event(&mut events).await, SignalingEvent::Disconnected);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(events.try_recv().is_err());
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    assert_eq!(client.snapshot().await.unwrap().state, ConnectionState::Disconnected);

    client.shutdown().await;
}

#[tokio::test]
async fn operations_require_a_session() {
    let (observer, _events) = ChannelObserver::new();
    let client = SignalingClient::spawn(observer, SessionSettings::default());
    assert!(client.send_to_peer(PeerId(1), "x").await.is_err());
    assert!(client.connect(Endpoint::new("", 0), "carol").await.is_err());
    assert!(client.sign_out().await.is_ok());
    client.shutdown().await;
}
