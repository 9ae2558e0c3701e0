//! Listener accept loops
//!
//! Every accepted peer passes the connection filter before a session is
//! created for it. Refusals are reported to the application and the socket
//! is dropped.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::event::DisconnectReason;
use super::reader::{serve_websocket, InboundHandler, ReaderEngine};
use super::session::SessionManager;
use super::transport::{
    SocketHandle, WebSocketChannel, WebSocketHandle, WebSocketOutbound, WEBSOCKET_OUTBOUND_CAPACITY,
};
use crate::error::{NetworkError, Result};

/// Time allowed for the WebSocket upgrade
pub const WEBSOCKET_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Accept stream socket connections until shutdown
pub async fn accept_socket_connections(
    listener: TcpListener,
    session_manager: Arc<SessionManager>,
    reader: Arc<ReaderEngine>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        if let Err(e) = admit_socket(&session_manager, &reader, stream, addr) {
                            warn!(address = %addr, error = %e, "Failed to admit socket connection");
                        }
                    }
                    Err(e) => {
                        error!("Failed to accept socket connection: {}", e);
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Socket connection acceptor shutting down");
                break;
            }
        }
    }
}

/// Returns true if the filter admitted `addr`
fn admit(session_manager: &SessionManager, addr: SocketAddr) -> bool {
    match session_manager.connection_filter().validate_and_add(addr.ip()) {
        Ok(()) => true,
        Err(refused) => {
            warn!(address = %addr, reason = %refused, "Connection refused");
            session_manager.events().on_connection_refused(addr, &refused);
            false
        }
    }
}

fn admit_socket(
    session_manager: &SessionManager,
    reader: &ReaderEngine,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<()> {
    if !admit(session_manager, addr) {
        return Ok(());
    }

    if let Err(e) = stream.set_nodelay(true) {
        debug!(address = %addr, error = %e, "Failed to set TCP_NODELAY");
    }
    let stream = Arc::new(stream);
    let handle = match SocketHandle::tcp(stream.clone()) {
        Ok(handle) => handle,
        Err(e) => {
            session_manager.connection_filter().remove(addr.ip());
            return Err(e.into());
        }
    };

    let session = session_manager.create_stream_session(handle);
    debug!(session_id = session.id, address = %addr, "Socket connection accepted");
    session_manager.events().on_session_created(&session);

    if let Err(e) = reader.register(session.clone(), stream) {
        session_manager.close(&session, DisconnectReason::ServerShutdown);
        return Err(e);
    }
    Ok(())
}

/// Accept WebSocket connections until shutdown. Each connection upgrades and
/// runs its reader on its own task.
pub async fn accept_websocket_connections(
    listener: TcpListener,
    session_manager: Arc<SessionManager>,
    handler: Arc<InboundHandler>,
    shutdown_tx: broadcast::Sender<()>,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        if !admit(&session_manager, addr) {
                            continue;
                        }
                        let session_manager = session_manager.clone();
                        let handler = handler.clone();
                        let shutdown = shutdown_tx.subscribe();
                        tokio::spawn(async move {
                            if let Err(e) = handle_websocket(session_manager, handler, stream, addr, shutdown).await {
                                warn!(address = %addr, error = %e, "WebSocket connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept WebSocket connection: {}", e);
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("WebSocket connection acceptor shutting down");
                break;
            }
        }
    }
}

async fn handle_websocket(
    session_manager: Arc<SessionManager>,
    handler: Arc<InboundHandler>,
    stream: TcpStream,
    addr: SocketAddr,
    shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(address = %addr, error = %e, "Failed to set TCP_NODELAY");
    }

    let upgraded = match timeout(WEBSOCKET_HANDSHAKE_TIMEOUT, accept_async(stream)).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            session_manager.connection_filter().remove(addr.ip());
            return Err(NetworkError::WebSocket(e.to_string()).into());
        }
        Err(_) => {
            session_manager.connection_filter().remove(addr.ip());
            return Err(NetworkError::Timeout.into());
        }
    };

    let (sink, stream) = upgraded.split();
    let (channel, outbound) = WebSocketChannel::new(addr, WEBSOCKET_OUTBOUND_CAPACITY);

    let session = session_manager.create_websocket_session(WebSocketHandle::new(channel.clone()));
    debug!(session_id = session.id, address = %addr, "WebSocket connection accepted");
    session_manager.events().on_session_created(&session);

    tokio::spawn(drain_websocket(sink, outbound));
    serve_websocket(handler, session, stream, channel, shutdown).await;
    Ok(())
}

/// Forward queued messages to the socket until a close frame or channel end
async fn drain_websocket(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut outbound: WebSocketOutbound,
) {
    while let Some(message) = outbound.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            debug!(error = %e, "WebSocket write failed");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}
