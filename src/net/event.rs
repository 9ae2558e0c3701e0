//! Events raised by the network core towards the application

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::trace;

use super::packet::TransportType;
use super::session::Session;
use crate::error::RefusedConnection;

/// Why a session was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DisconnectReason {
    /// The client asked to leave, or a packet marked as last was delivered
    ClientRequest,
    /// Read or write failure, or the peer went away
    ConnectionLost,
    /// Malformed frame
    ProtocolError,
    /// No activity within the idle threshold
    Idle,
    /// Never associated within the orphan allowance
    Orphan,
    /// Frozen session whose reconnection window ran out
    ReconnectionExpired,
    /// Identity handed over to a newer session of the same client
    Reconnection,
    /// Closed by the application
    Kicked,
    /// Server is shutting down
    ServerShutdown,
}

impl DisconnectReason {
    pub fn name(&self) -> &'static str {
        match self {
            DisconnectReason::ClientRequest => "client request",
            DisconnectReason::ConnectionLost => "connection lost",
            DisconnectReason::ProtocolError => "protocol error",
            DisconnectReason::Idle => "idle",
            DisconnectReason::Orphan => "orphan",
            DisconnectReason::ReconnectionExpired => "reconnection expired",
            DisconnectReason::Reconnection => "reconnection",
            DisconnectReason::Kicked => "kicked",
            DisconnectReason::ServerShutdown => "server shutdown",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Application-side sink for network events.
///
/// Handlers are called from reader and acceptor tasks and must not block.
pub trait NetworkEventHandler: Send + Sync {
    /// A primary transport was accepted and its session registered
    fn on_session_created(&self, _session: &Arc<Session>) {}

    /// A frame arrived while the session is not associated yet
    fn on_connection_request(&self, session: &Arc<Session>, frame: Bytes);

    /// A frame arrived on an associated session
    fn on_message(&self, session: &Arc<Session>, transport: TransportType, frame: Bytes);

    /// The session lost its transport but is kept for reconnection
    fn on_session_frozen(&self, _session: &Arc<Session>) {}

    /// Raised exactly once per session
    fn on_session_closed(&self, session: &Arc<Session>, reason: DisconnectReason);

    /// The acceptor refused a peer before a session existed
    fn on_connection_refused(&self, _address: SocketAddr, _error: &RefusedConnection) {}

    /// A datagram arrived from a peer no session is bound to
    fn on_datagram_request(&self, _socket: &Arc<UdpSocket>, _peer: SocketAddr, _payload: Bytes) {}
}

/// Owned form of every callback on [`NetworkEventHandler`]
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    SessionCreated(Arc<Session>),
    ConnectionRequest {
        session: Arc<Session>,
        frame: Bytes,
    },
    Message {
        session: Arc<Session>,
        transport: TransportType,
        frame: Bytes,
    },
    SessionFrozen(Arc<Session>),
    SessionClosed {
        session: Arc<Session>,
        reason: DisconnectReason,
    },
    ConnectionRefused {
        address: SocketAddr,
        error: RefusedConnection,
    },
    DatagramRequest {
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        payload: Bytes,
    },
}

/// Forwards every event into an unbounded channel, for applications that
/// consume events from their own task
#[derive(Debug, Clone)]
pub struct ChannelEventHandler {
    tx: mpsc::UnboundedSender<NetworkEvent>,
}

impl ChannelEventHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<NetworkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: NetworkEvent) {
        if self.tx.send(event).is_err() {
            trace!("Event receiver dropped");
        }
    }
}

impl NetworkEventHandler for ChannelEventHandler {
    fn on_session_created(&self, session: &Arc<Session>) {
        self.forward(NetworkEvent::SessionCreated(session.clone()));
    }

    fn on_connection_request(&self, session: &Arc<Session>, frame: Bytes) {
        self.forward(NetworkEvent::ConnectionRequest {
            session: session.clone(),
            frame,
        });
    }

    fn on_message(&self, session: &Arc<Session>, transport: TransportType, frame: Bytes) {
        self.forward(NetworkEvent::Message {
            session: session.clone(),
            transport,
            frame,
        });
    }

    fn on_session_frozen(&self, session: &Arc<Session>) {
        self.forward(NetworkEvent::SessionFrozen(session.clone()));
    }

    fn on_session_closed(&self, session: &Arc<Session>, reason: DisconnectReason) {
        self.forward(NetworkEvent::SessionClosed {
            session: session.clone(),
            reason,
        });
    }

    fn on_connection_refused(&self, address: SocketAddr, error: &RefusedConnection) {
        self.forward(NetworkEvent::ConnectionRefused {
            address,
            error: error.clone(),
        });
    }

    fn on_datagram_request(&self, socket: &Arc<UdpSocket>, peer: SocketAddr, payload: Bytes) {
        self.forward(NetworkEvent::DatagramRequest {
            socket: socket.clone(),
            peer,
            payload,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_reason_display() {
        assert_eq!(DisconnectReason::ProtocolError.to_string(), "protocol error");
        assert_eq!(DisconnectReason::ConnectionLost.to_string(), "connection lost");
    }

    #[test]
    fn test_channel_handler_forwards_refusals() {
        let (handler, mut rx) = ChannelEventHandler::new();
        let address: SocketAddr = "10.1.1.1:5000".parse().unwrap();
        let error = RefusedConnection::Banned(address.ip());

        handler.on_connection_refused(address, &error);

        match rx.try_recv() {
            Ok(NetworkEvent::ConnectionRefused { address: a, error: e }) => {
                assert_eq!(a, address);
                assert_eq!(e, error);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
