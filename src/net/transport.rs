//! Transport abstraction module
//!
//! A session rides on exactly one primary transport, either a stream socket
//! or a WebSocket, and may later gain a datagram peer binding and a KCP
//! tunnel. Writers never block on a transport: stream sockets expose
//! non-blocking `try_write` plus a writable-readiness future, WebSockets are
//! fed through an unbounded channel drained by a sink task.

use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use socket2::SockRef;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::trace;

use super::packet::TransportType;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a primary transport handle, used as an index key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    pub fn next() -> Self {
        ChannelId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Non-blocking stream socket as seen by the writer engine
pub trait SocketChannel: Send + Sync {
    fn peer_addr(&self) -> SocketAddr;

    /// Write as much of `buf` as the socket accepts right now.
    /// `WouldBlock` means nothing was accepted.
    fn try_write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Resolves once the socket may accept more bytes
    fn writable(&self) -> BoxFuture<'_, io::Result<()>>;

    /// Close both directions; the reader observes end of stream
    fn shutdown(&self);
}

/// TCP stream shared between the reader and writer engines
pub struct TcpChannel {
    stream: Arc<TcpStream>,
    peer: SocketAddr,
}

impl TcpChannel {
    pub fn new(stream: Arc<TcpStream>) -> io::Result<Self> {
        let peer = stream.peer_addr()?;
        Ok(Self { stream, peer })
    }

    pub fn stream(&self) -> &Arc<TcpStream> {
        &self.stream
    }
}

impl SocketChannel for TcpChannel {
    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        self.stream.try_write(buf)
    }

    fn writable(&self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(self.stream.writable())
    }

    fn shutdown(&self) {
        if let Err(e) = SockRef::from(self.stream.as_ref()).shutdown(Shutdown::Both) {
            trace!(address = %self.peer, error = %e, "Socket shutdown failed");
        }
    }
}

/// Primary stream socket of a session
#[derive(Clone)]
pub struct SocketHandle {
    id: ChannelId,
    channel: Arc<dyn SocketChannel>,
}

impl SocketHandle {
    pub fn new(channel: Arc<dyn SocketChannel>) -> Self {
        Self {
            id: ChannelId::next(),
            channel,
        }
    }

    /// Handle over a tokio TCP stream
    pub fn tcp(stream: Arc<TcpStream>) -> io::Result<Self> {
        Ok(Self::new(Arc::new(TcpChannel::new(stream)?)))
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn channel(&self) -> &Arc<dyn SocketChannel> {
        &self.channel
    }
}

/// Messages a WebSocket sink task may hold before writers are pushed back
pub const WEBSOCKET_OUTBOUND_CAPACITY: usize = 64;

/// Outbound side of an accepted WebSocket connection.
///
/// Messages go through a bounded channel drained by the connection's sink
/// task. A full channel is reported as `WouldBlock` so the packet stays in
/// the session queue.
#[derive(Debug, Clone)]
pub struct WebSocketChannel {
    peer: SocketAddr,
    outbound: mpsc::Sender<Message>,
    closing: Arc<watch::Sender<bool>>,
}

impl WebSocketChannel {
    /// Channel for `peer` plus the receiving end for its sink task
    pub fn new(peer: SocketAddr, capacity: usize) -> (Self, WebSocketOutbound) {
        let (outbound, messages) = mpsc::channel(capacity.max(1));
        let (closing, closing_rx) = watch::channel(false);
        (
            Self {
                peer,
                outbound,
                closing: Arc::new(closing),
            },
            WebSocketOutbound {
                messages,
                closing: closing_rx,
            },
        )
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Queue a binary message for the sink task without waiting
    pub fn try_send(&self, data: Bytes) -> io::Result<()> {
        self.try_send_message(Message::Binary(data.to_vec()))
    }

    pub fn try_send_message(&self, message: Message) -> io::Result<()> {
        if *self.closing.borrow() {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        self.outbound.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => io::ErrorKind::WouldBlock.into(),
            TrySendError::Closed(_) => io::ErrorKind::BrokenPipe.into(),
        })
    }

    /// Resolves once the sink task has room for another message
    pub fn writable(&self) -> BoxFuture<'static, io::Result<()>> {
        let outbound = self.outbound.clone();
        Box::pin(async move {
            outbound
                .reserve_owned()
                .await
                .map(drop)
                .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
        })
    }

    /// Ask the sink task to flush, send a close frame and stop
    pub fn close(&self) {
        self.closing.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

/// Receiving end of a [`WebSocketChannel`], owned by the sink task
#[derive(Debug)]
pub struct WebSocketOutbound {
    messages: mpsc::Receiver<Message>,
    closing: watch::Receiver<bool>,
}

impl WebSocketOutbound {
    /// Next message to write. After a close request the queued messages are
    /// flushed and then a close frame is returned.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            if *self.closing.borrow() {
                return self.try_recv();
            }
            tokio::select! {
                biased;
                message = self.messages.recv() => return message,
                changed = self.closing.changed() => {
                    if changed.is_err() {
                        return self.messages.recv().await;
                    }
                }
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        match self.messages.try_recv() {
            Ok(message) => Some(message),
            Err(_) if *self.closing.borrow() => Some(Message::Close(None)),
            Err(_) => None,
        }
    }
}

/// Primary WebSocket transport of a session
#[derive(Debug, Clone)]
pub struct WebSocketHandle {
    id: ChannelId,
    channel: WebSocketChannel,
}

impl WebSocketHandle {
    pub fn new(channel: WebSocketChannel) -> Self {
        Self {
            id: ChannelId::next(),
            channel,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn channel(&self) -> &WebSocketChannel {
        &self.channel
    }
}

/// The primary transport a session was created over
#[derive(Clone)]
pub enum Transport {
    Socket(SocketHandle),
    WebSocket(WebSocketHandle),
}

impl Transport {
    pub fn id(&self) -> ChannelId {
        match self {
            Transport::Socket(handle) => handle.id(),
            Transport::WebSocket(handle) => handle.id(),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        match self {
            Transport::Socket(handle) => handle.channel().peer_addr(),
            Transport::WebSocket(handle) => handle.channel().peer_addr(),
        }
    }

    pub fn transport_type(&self) -> TransportType {
        match self {
            Transport::Socket(_) => TransportType::Tcp,
            Transport::WebSocket(_) => TransportType::WebSocket,
        }
    }

    pub fn is_socket(&self) -> bool {
        matches!(self, Transport::Socket(_))
    }

    pub fn is_websocket(&self) -> bool {
        matches!(self, Transport::WebSocket(_))
    }

    pub fn close(&self) {
        match self {
            Transport::Socket(handle) => handle.channel().shutdown(),
            Transport::WebSocket(handle) => handle.channel().close(),
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("type", &self.transport_type())
            .field("id", &self.id())
            .field("peer", &self.peer_addr())
            .finish()
    }
}

/// A datagram peer bound to a stream session after an attach handshake
#[derive(Debug, Clone)]
pub struct DatagramBinding {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl DatagramBinding {
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Self { socket, peer }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }

    pub fn try_send(&self, buf: &[u8]) -> io::Result<usize> {
        self.socket.try_send_to(buf, self.peer)
    }
}

/// Reliable-UDP tunnel attached to a stream session.
///
/// The tunnel owns its own segmentation and retransmission; the writer only
/// hands it whole messages.
pub trait KcpChannel: Send + Sync {
    /// Conversation id, the tunnel's index key
    fn conv(&self) -> u32;

    fn send(&self, data: &[u8]) -> io::Result<()>;

    fn close(&self);
}
