/// Integration tests for connection heartbeats over TCP.
///
/// These tests verify:
/// - A peer that stops answering heartbeats gets its connection closed
/// - Requests in flight on a closed connection fail with ConnectionClosed
/// - Heartbeats keep a connection with a slow handler alive
/// - Heartbeats reach request handlers only when forwarding is enabled
use async_trait::async_trait;
use clustertopo::heartbeat::HEARTBEAT_SUBJECT;
use clustertopo::messaging::{MessagingService, RequestHandler};
use clustertopo::network::{self, Listener, ProtocolMessage, ProtocolReply, ProtocolRequest};
use clustertopo::{HeartbeatConfig, MemberId, MessagingConfig, TopologyError, TopologyResult};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::{Instant, sleep};

fn local() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn heartbeat(forward: bool) -> HeartbeatConfig {
    HeartbeatConfig::new()
        .interval(Duration::from_millis(50))
        .timeout(Duration::from_millis(250))
        .forward_heartbeats(forward)
}

async fn service(id: &str, heartbeat: HeartbeatConfig) -> MessagingService {
    MessagingService::bind(
        MemberId::from(id),
        local(),
        MessagingConfig::new()
            .request_timeout(Duration::from_secs(5))
            .heartbeat(heartbeat),
    )
    .await
    .unwrap()
}

struct Echo;

#[async_trait]
impl RequestHandler for Echo {
    async fn handle(&self, request: ProtocolRequest) -> TopologyResult<Vec<u8>> {
        Ok(request.payload)
    }
}

struct Slow(Duration);

#[async_trait]
impl RequestHandler for Slow {
    async fn handle(&self, request: ProtocolRequest) -> TopologyResult<Vec<u8>> {
        sleep(self.0).await;
        Ok(request.payload)
    }
}

#[derive(Default)]
struct Counting(AtomicUsize);

#[async_trait]
impl RequestHandler for Counting {
    async fn handle(&self, request: ProtocolRequest) -> TopologyResult<Vec<u8>> {
        assert!(request.payload.is_empty());
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn test_silent_peer_is_disconnected() {
    // A peer that accepts and reads but never replies to anything.
    let listener = Listener::bind(local()).await.unwrap();
    let addr = listener.local_addr();
    let peer = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (mut reader, _writer) = network::split(stream);
        let mut heartbeats = 0;
        while let Ok(Some(message)) = reader.read_message().await {
            if let ProtocolMessage::Request(request) = message {
                if request.subject == HEARTBEAT_SUBJECT {
                    assert!(request.payload.is_empty());
                    heartbeats += 1;
                }
            }
        }
        heartbeats
    });

    let client = service("1", heartbeat(false)).await;
    let started = Instant::now();
    let result = client.send_and_receive(addr, "echo", b"hello".to_vec()).await;

    assert!(matches!(result, Err(TopologyError::ConnectionClosed)), "{:?}", result);
    assert!(started.elapsed() < Duration::from_secs(5));

    // The peer saw heartbeats, then the connection went away.
    let heartbeats = peer.await.unwrap();
    assert!(heartbeats >= 1);
}

#[tokio::test]
async fn test_heartbeats_keep_slow_request_alive() {
    let server = service("0", heartbeat(false)).await;
    server.register_handler("slow", Arc::new(Slow(Duration::from_millis(800))));
    let client = service("1", heartbeat(false)).await;

    let reply = client
        .send_and_receive(server.local_addr(), "slow", b"done".to_vec())
        .await
        .unwrap();
    assert_eq!(reply, b"done".to_vec());
}

#[tokio::test]
async fn test_client_without_heartbeats_is_not_disconnected() {
    let server = service("0", heartbeat(false)).await;
    server.register_handler("echo", Arc::new(Echo));

    // A raw client that never sends a heartbeat and stays quiet past the timeout.
    let stream = network::connect(server.local_addr()).await.unwrap();
    let (mut reader, mut writer) = network::split(stream);
    sleep(Duration::from_millis(750)).await;

    let request = ProtocolRequest {
        id: 1,
        sender: MemberId::from("raw"),
        subject: "echo".to_string(),
        payload: b"still here".to_vec(),
    };
    writer
        .write_message(&ProtocolMessage::Request(request))
        .await
        .unwrap();

    match reader.read_message().await.unwrap() {
        Some(ProtocolMessage::Reply(reply)) => {
            assert_eq!(reply, ProtocolReply::ok(1, b"still here".to_vec()));
        }
        other => panic!("expected a reply, got {:?}", other),
    }
}

#[tokio::test]
async fn test_heartbeats_are_not_forwarded_by_default() {
    let server = service("0", heartbeat(false)).await;
    let counter = Arc::new(Counting::default());
    server.register_handler(HEARTBEAT_SUBJECT, Arc::clone(&counter) as Arc<dyn RequestHandler>);
    server.register_handler("slow", Arc::new(Slow(Duration::from_millis(400))));
    let client = service("1", heartbeat(false)).await;

    client
        .send_and_receive(server.local_addr(), "slow", Vec::new())
        .await
        .unwrap();
    assert_eq!(counter.0.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_heartbeats_are_forwarded_when_enabled() {
    let server = service("0", heartbeat(true)).await;
    let counter = Arc::new(Counting::default());
    server.register_handler(HEARTBEAT_SUBJECT, Arc::clone(&counter) as Arc<dyn RequestHandler>);
    server.register_handler("slow", Arc::new(Slow(Duration::from_millis(400))));
    let client = service("1", heartbeat(true)).await;

    // The request keeps the connection busy long enough for several heartbeats.
    client
        .send_and_receive(server.local_addr(), "slow", Vec::new())
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while counter.0.load(Ordering::SeqCst) == 0 {
        assert!(Instant::now() < deadline, "no heartbeat reached the handler");
        sleep(Duration::from_millis(10)).await;
    }
}
