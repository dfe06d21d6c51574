//! End-to-end tests - room, peers and tunnels together
//!
//! These tests verify the complete flow:
//! 1. Peers attach to a room over in-memory duplex pipes
//! 2. A peer announces itself and shows up in the endpoint feed
//! 3. Another peer opens a tunnel to it through the room
//! 4. Bytes, end-of-stream and nested RPC flow through the tunnel

use muxroom_client::{IncomingTunnel, PeerServices, RoomClient};
use muxroom_proto::{EndpointEvent, PeerId, TunnelHandle};
use muxroom_room::{RoomConfig, RoomServer};
use muxroom_rpc::{rpc_error, Connection, Manifest, RpcError};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::info;

const ROOM: &str = "@room.ed25519";
const ALICE: &str = "@alice.ed25519";
const BOB: &str = "@bob.ed25519";

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn start_room() -> RoomServer {
    RoomServer::new(RoomConfig::new(ROOM).with_name("e2e")).unwrap()
}

/// Connect a peer serving the default peer services to `room`
fn join(room: &RoomServer, id: &str) -> (RoomClient, mpsc::Receiver<IncomingTunnel>) {
    let (manifest, incoming) = PeerServices::new().into_manifest().unwrap();
    let (room_end, peer_end) = tokio::io::duplex(64 * 1024);
    room.attach(room_end, PeerId::from(id)).unwrap();
    let connection = Connection::builder(PeerId::from(ROOM), Arc::new(manifest)).open(peer_end);
    info!("✓ {} joined the room", id);
    (RoomClient::new(connection), incoming)
}

async fn accept(incoming: &mut mpsc::Receiver<IncomingTunnel>) -> IncomingTunnel {
    timeout(Duration::from_secs(5), incoming.recv())
        .await
        .expect("Timeout waiting for incoming tunnel")
        .expect("Peer services stopped")
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Timeout waiting for condition");
}

// ============================================================================
// TESTS
// ============================================================================

#[tokio::test]
async fn test_announce_and_leave_round_trip() {
    init_tracing();
    let room = start_room();
    let (alice, _a) = join(&room, ALICE);

    alice.announce().await.unwrap();
    assert_eq!(room.registry().peers(), vec![PeerId::from(ALICE)]);

    let mut endpoints = alice.endpoints().await.unwrap();
    let first = timeout(Duration::from_secs(5), endpoints.recv()).await.unwrap();
    assert_eq!(first, Some(Ok(EndpointEvent::Joined(PeerId::from(ALICE)))));
    assert_eq!(endpoints.peers().count(), 1);

    alice.leave().await.unwrap();
    assert!(room.registry().is_empty());
    let next = timeout(Duration::from_secs(5), endpoints.recv()).await.unwrap();
    assert_eq!(next, Some(Ok(EndpointEvent::Left(PeerId::from(ALICE)))));
}

#[tokio::test]
async fn test_is_room_and_ping() {
    init_tracing();
    let room = start_room();
    let (alice, _a) = join(&room, ALICE);

    assert!(alice.is_room().await.unwrap());

    let first = alice.ping().await.unwrap();
    let second = alice.ping().await.unwrap();
    assert!(first > 0);
    assert!(second >= first);

    let metadata = alice.metadata().await.unwrap();
    assert_eq!(metadata.name, "e2e");
    assert!(metadata.features.iter().any(|f| f == "tunnel"));
}

#[tokio::test]
async fn test_hello_through_tunnel() {
    init_tracing();
    let room = start_room();
    let (alice, mut incoming) = join(&room, ALICE);
    let (bob, _b) = join(&room, BOB);
    alice.announce().await.unwrap();

    let handle = TunnelHandle::new(PeerId::from(ROOM), PeerId::from(ALICE));
    let mut outgoing = bob.connect(&handle).await.unwrap();
    let mut tunnel = accept(&mut incoming).await;
    assert_eq!(tunnel.origin, PeerId::from(BOB));
    info!("✓ Tunnel accepted");

    outgoing.write_all(b"hello").await.unwrap();
    outgoing.shutdown().await.unwrap();

    let mut received = Vec::new();
    timeout(Duration::from_secs(5), tunnel.stream.read_to_end(&mut received))
        .await
        .expect("Timeout waiting for end of tunnel")
        .unwrap();
    assert_eq!(received, b"hello");
    info!("✓ Received hello and end-of-stream");

    let relay = room.relay();
    wait_until(|| relay.active_sessions().is_empty()).await;

    // The session was released; the peer is reachable again
    let mut again = bob.connect(&handle).await.unwrap();
    let mut tunnel = accept(&mut incoming).await;
    tunnel.stream.write_all(b"again").await.unwrap();

    let mut buf = [0u8; 5];
    timeout(Duration::from_secs(5), again.read_exact(&mut buf))
        .await
        .expect("Timeout reading second tunnel")
        .unwrap();
    assert_eq!(&buf, b"again");
}

#[tokio::test]
async fn test_connect_to_unannounced_peer() {
    init_tracing();
    let room = start_room();
    let (alice, _a) = join(&room, ALICE);
    let (bob, _b) = join(&room, BOB);
    alice.announce().await.unwrap();
    let before = room.registry().peers();

    let mut stream = bob
        .connect_to(&PeerId::from("@nobody.ed25519"))
        .await
        .unwrap();
    let mut buf = [0u8; 8];
    let err = timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .unwrap()
        .unwrap_err();

    assert_eq!(
        rpc_error(&err),
        Some(&RpcError::PeerNotFound("@nobody.ed25519".into()))
    );
    assert_eq!(room.registry().peers(), before);
}

#[tokio::test]
async fn test_reconnect_replaces_endpoint() {
    init_tracing();
    let room = start_room();
    let (first, _old) = join(&room, ALICE);
    first.announce().await.unwrap();

    // Second connection from the same peer, as after a network change
    let (second, mut incoming) = join(&room, ALICE);
    second.announce().await.unwrap();
    first.connection().close().await;

    let registry = room.registry();
    let second_id = second.connection().id();
    wait_until(|| {
        registry
            .get(&PeerId::from(ALICE))
            .map(|d| d.connection_id() == second_id)
            .unwrap_or(false)
    })
    .await;

    let (bob, _b) = join(&room, BOB);
    let mut stream = bob.connect_to(&PeerId::from(ALICE)).await.unwrap();
    let mut tunnel = accept(&mut incoming).await;

    stream.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(Duration::from_secs(5), tunnel.stream.read_exact(&mut buf))
        .await
        .expect("Timeout reading tunnel")
        .unwrap();
    assert_eq!(&buf, b"ping");
}

#[tokio::test]
async fn test_rpc_over_tunnel() {
    init_tracing();
    let room = start_room();
    let (alice, mut incoming) = join(&room, ALICE);
    let (bob, _b) = join(&room, BOB);
    alice.announce().await.unwrap();

    let outgoing = bob.connect_to(&PeerId::from(ALICE)).await.unwrap();
    let tunnel = accept(&mut incoming).await;

    // Alice serves peer services to Bob directly over the tunnel
    let (services, _nested) = PeerServices::new().into_manifest().unwrap();
    let _served = Connection::builder(tunnel.origin.clone(), Arc::new(services)).open(tunnel.stream);
    let nested = RoomClient::new(
        Connection::builder(PeerId::from(ALICE), Arc::new(Manifest::new())).open(outgoing),
    );

    let now = timeout(Duration::from_secs(5), nested.ping())
        .await
        .expect("Timeout pinging over tunnel")
        .unwrap();
    assert!(now > 0);

    let err = nested.is_room().await.unwrap_err();
    assert!(matches!(err, RpcError::MethodNotFound(_)));
    info!("✓ Nested connection works over the tunnel");
}
