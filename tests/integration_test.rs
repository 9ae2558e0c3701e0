//! Integration tests for the network server over loopback
//!
//! These tests verify the end-to-end behavior of:
//! - Connection requests and association over stream sockets
//! - Framed replies through the writer engine
//! - Admission refusals (banned addresses, per-IP ceiling)
//! - Session close on peer disconnect and server shutdown
//! - Raw message exchange over WebSocket

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

use rustscape_net::config::NetworkConfig;
use rustscape_net::error::RefusedConnection;
use rustscape_net::net::codec::{
    BinaryPacketDecoder, BinaryPacketEncoder, ZlibCompressor,
};
use rustscape_net::net::event::{ChannelEventHandler, DisconnectReason, NetworkEvent};
use rustscape_net::net::packet::{Packet, TransportType};
use rustscape_net::net::session::AssociatedState;
use rustscape_net::server::NetworkServer;
use rustscape_net::state::NetworkState;

const WAIT: Duration = Duration::from_secs(5);

fn local_config() -> NetworkConfig {
    let mut config = NetworkConfig::default();
    config.bind_address = IpAddr::from([127, 0, 0, 1]);
    config.socket_port = 0;
    config.websocket_port = 0;
    config.reader_workers = 2;
    config.writer_workers = 2;
    config.orphan_allowance_ms = 60_000;
    config
}

async fn start(config: NetworkConfig) -> (NetworkServer, mpsc::UnboundedReceiver<NetworkEvent>) {
    let (events, rx) = ChannelEventHandler::new();
    let (shutdown_tx, _) = broadcast::channel(1);
    let state = NetworkState::new(config, Arc::new(events), shutdown_tx).unwrap();
    let server = NetworkServer::start(Arc::new(state)).await.unwrap();
    (server, rx)
}

/// Wait for the first event accepted by `select`, skipping the rest
async fn next_event<T>(
    rx: &mut mpsc::UnboundedReceiver<NetworkEvent>,
    mut select: impl FnMut(NetworkEvent) -> Option<T>,
) -> T {
    timeout(WAIT, async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if let Some(found) = select(event) {
                return found;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn frame(payload: &[u8]) -> Vec<u8> {
    BinaryPacketEncoder::new().encode(payload, false).to_vec()
}

async fn read_frame(client: &mut TcpStream) -> Vec<u8> {
    let decoder = BinaryPacketDecoder::new().with_compressor(Arc::new(ZlibCompressor::new()));
    let mut buf = BytesMut::new();
    timeout(WAIT, async {
        loop {
            if let Some(payload) = decoder.decode(&mut buf).unwrap() {
                return payload.to_vec();
            }
            let mut chunk = [0u8; 1024];
            let n = client.read(&mut chunk).await.unwrap();
            assert!(n > 0, "server closed the connection");
            buf.extend_from_slice(&chunk[..n]);
        }
    })
    .await
    .expect("timed out waiting for frame")
}

#[tokio::test]
async fn test_socket_request_message_and_reply() {
    let (server, mut events) = start(local_config()).await;
    let mut client = TcpStream::connect(server.socket_addr().unwrap()).await.unwrap();

    client.write_all(&frame(b"hello")).await.unwrap();
    let (session, request) = next_event(&mut events, |event| match event {
        NetworkEvent::ConnectionRequest { session, frame } => Some((session, frame)),
        _ => None,
    })
    .await;
    assert_eq!(&request[..], b"hello");
    assert_eq!(session.transport_type(), TransportType::Tcp);

    session.set_associated_state(AssociatedState::Done);
    client.write_all(&frame(b"ping")).await.unwrap();
    let (transport, message) = next_event(&mut events, |event| match event {
        NetworkEvent::Message { transport, frame, .. } => Some((transport, frame)),
        _ => None,
    })
    .await;
    assert_eq!(transport, TransportType::Tcp);
    assert_eq!(&message[..], b"ping");
    assert_eq!(server.state().reader_statistic.read_packets(), 2);

    server
        .writer()
        .send(&session, Packet::new(&b"pong"[..]).with_transport(TransportType::Tcp))
        .unwrap();
    assert_eq!(read_frame(&mut client).await, b"pong");

    // Large replies arrive compressed and intact
    let large: Vec<u8> = (0..10_000u32).map(|i| (i % 7) as u8).collect();
    server
        .writer()
        .send(&session, Packet::new(large.clone()).with_transport(TransportType::Tcp))
        .unwrap();
    assert_eq!(read_frame(&mut client).await, large);

    server.shutdown().await;
}

#[tokio::test]
async fn test_banned_address_refused() {
    let mut config = local_config();
    config.banned_addresses = vec![IpAddr::from([127, 0, 0, 1])];
    let (server, mut events) = start(config).await;

    let _client = TcpStream::connect(server.socket_addr().unwrap()).await.unwrap();
    let error = next_event(&mut events, |event| match event {
        NetworkEvent::ConnectionRefused { error, .. } => Some(error),
        _ => None,
    })
    .await;
    assert!(matches!(error, RefusedConnection::Banned(_)));
    assert_eq!(server.session_manager().count(), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_connection_ceiling_refused() {
    let mut config = local_config();
    config.max_connections_per_ip = 1;
    let (server, mut events) = start(config).await;
    let addr = server.socket_addr().unwrap();

    let _first = TcpStream::connect(addr).await.unwrap();
    next_event(&mut events, |event| match event {
        NetworkEvent::SessionCreated(session) => Some(session),
        _ => None,
    })
    .await;

    let _second = TcpStream::connect(addr).await.unwrap();
    let error = next_event(&mut events, |event| match event {
        NetworkEvent::ConnectionRefused { error, .. } => Some(error),
        _ => None,
    })
    .await;
    assert!(matches!(error, RefusedConnection::TooManyConnections { max: 1, .. }));
    assert_eq!(server.session_manager().count(), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_peer_disconnect_closes_session() {
    let (server, mut events) = start(local_config()).await;
    let client = TcpStream::connect(server.socket_addr().unwrap()).await.unwrap();

    let created = next_event(&mut events, |event| match event {
        NetworkEvent::SessionCreated(session) => Some(session),
        _ => None,
    })
    .await;
    drop(client);

    let (closed, reason) = next_event(&mut events, |event| match event {
        NetworkEvent::SessionClosed { session, reason } => Some((session, reason)),
        _ => None,
    })
    .await;
    assert_eq!(closed.id, created.id);
    assert_eq!(reason, DisconnectReason::ConnectionLost);
    assert!(server.session_manager().get(created.id).is_none());
    assert_eq!(
        server
            .state()
            .connection_filter
            .connection_count(IpAddr::from([127, 0, 0, 1])),
        0
    );

    server.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_sessions() {
    let (server, mut events) = start(local_config()).await;
    let _client = TcpStream::connect(server.socket_addr().unwrap()).await.unwrap();
    next_event(&mut events, |event| match event {
        NetworkEvent::SessionCreated(session) => Some(session),
        _ => None,
    })
    .await;

    server.shutdown().await;
    let reason = next_event(&mut events, |event| match event {
        NetworkEvent::SessionClosed { reason, .. } => Some(reason),
        _ => None,
    })
    .await;
    assert_eq!(reason, DisconnectReason::ServerShutdown);
}

#[tokio::test]
async fn test_websocket_round_trip() {
    let (server, mut events) = start(local_config()).await;
    let url = format!("ws://{}", server.websocket_addr().unwrap());
    let (mut client, _) = tokio_tungstenite::connect_async(url).await.unwrap();

    client.send(Message::Binary(b"hello".to_vec())).await.unwrap();
    let (session, request) = next_event(&mut events, |event| match event {
        NetworkEvent::ConnectionRequest { session, frame } => Some((session, frame)),
        _ => None,
    })
    .await;
    assert_eq!(&request[..], b"hello");
    assert!(session.is_websocket());

    session.set_associated_state(AssociatedState::Done);
    server
        .writer()
        .send(&session, Packet::new(&b"pong"[..]).with_transport(TransportType::WebSocket))
        .unwrap();

    let reply = timeout(WAIT, client.next())
        .await
        .expect("timed out waiting for reply")
        .unwrap()
        .unwrap();
    assert_eq!(reply, Message::Binary(b"pong".to_vec()));

    client.close(None).await.unwrap();
    let reason = next_event(&mut events, |event| match event {
        NetworkEvent::SessionClosed { reason, .. } => Some(reason),
        _ => None,
    })
    .await;
    assert_eq!(reason, DisconnectReason::ClientRequest);

    server.shutdown().await;
}
