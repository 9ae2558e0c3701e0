//! Shared fixtures for unit tests

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::event::{ChannelEventHandler, NetworkEvent};
use super::filter::ConnectionFilter;
use super::session::{Session, SessionManager};
use super::transport::{
    SocketChannel, SocketHandle, WebSocketChannel, WebSocketHandle, WebSocketOutbound,
    WEBSOCKET_OUTBOUND_CAPACITY,
};

pub fn test_address() -> SocketAddr {
    "127.0.0.1:12345".parse().unwrap()
}

/// Socket whose accepted byte counts are scripted per call.
///
/// Each `try_write` pops the next limit; `Some(0)` yields `WouldBlock`, an
/// exhausted script accepts everything.
pub struct ScriptedChannel {
    peer: SocketAddr,
    limits: Mutex<VecDeque<usize>>,
    written: Mutex<Vec<u8>>,
    fail_writes: AtomicBool,
    shut_down: AtomicBool,
}

impl ScriptedChannel {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            limits: Mutex::new(VecDeque::new()),
            written: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn script(&self, limits: impl IntoIterator<Item = usize>) {
        self.limits.lock().extend(limits);
    }

    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    pub fn written(&self) -> Vec<u8> {
        self.written.lock().clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

impl SocketChannel for ScriptedChannel {
    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer"));
        }
        let limit = self.limits.lock().pop_front().unwrap_or(usize::MAX);
        let accepted = buf.len().min(limit);
        if accepted == 0 && !buf.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        self.written.lock().extend_from_slice(&buf[..accepted]);
        Ok(accepted)
    }

    fn writable(&self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

pub fn test_manager() -> (Arc<SessionManager>, mpsc::UnboundedReceiver<NetworkEvent>) {
    test_manager_with(|manager| manager)
}

/// Manager customised through its builder methods
pub fn test_manager_with(
    configure: impl FnOnce(SessionManager) -> SessionManager,
) -> (Arc<SessionManager>, mpsc::UnboundedReceiver<NetworkEvent>) {
    let (handler, events) = ChannelEventHandler::new();
    let manager = SessionManager::new(Arc::new(ConnectionFilter::new()), Arc::new(handler));
    (Arc::new(configure(manager)), events)
}

pub fn stream_session(manager: &SessionManager) -> (Arc<Session>, Arc<ScriptedChannel>) {
    let channel = Arc::new(ScriptedChannel::new(test_address()));
    let session = manager.create_stream_session(SocketHandle::new(channel.clone()));
    (session, channel)
}

pub fn websocket_session(manager: &SessionManager) -> (Arc<Session>, WebSocketOutbound) {
    websocket_session_with_capacity(manager, WEBSOCKET_OUTBOUND_CAPACITY)
}

pub fn websocket_session_with_capacity(
    manager: &SessionManager,
    capacity: usize,
) -> (Arc<Session>, WebSocketOutbound) {
    let (channel, outbound) = WebSocketChannel::new(test_address(), capacity);
    let session = manager.create_websocket_session(WebSocketHandle::new(channel));
    (session, outbound)
}

/// Drain every event received so far
pub fn drain(events: &mut mpsc::UnboundedReceiver<NetworkEvent>) -> Vec<NetworkEvent> {
    std::iter::from_fn(|| events.try_recv().ok()).collect()
}
