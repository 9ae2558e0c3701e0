//! Session management module
//!
//! Manages client sessions including:
//! - Session lifecycle (creation, association, freezing, closing)
//! - Per-session state (transports, timestamps, counters, outbound queue)
//! - Thread-safe session registry with lookups by id and by transport

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use parking_lot::{Mutex, MutexGuard, RwLock};
use tokio::net::UdpSocket;
use tracing::{debug, info};

use super::event::{DisconnectReason, NetworkEventHandler};
use super::filter::ConnectionFilter;
use super::packet::TransportType;
use super::queue::{DefaultPacketQueuePolicy, PacketQueue, PacketQueuePolicy, DEFAULT_PACKET_QUEUE_SIZE};
use super::transport::{
    ChannelId, DatagramBinding, KcpChannel, SocketHandle, Transport, WebSocketHandle,
};
use crate::error::{NetworkError, Result};

/// Unique session identifier
pub type SessionId = u64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Grace period for a session to become associated
pub const DEFAULT_ORPHAN_ALLOWANCE: Duration = Duration::from_millis(3000);

/// Default idle threshold (5 minutes)
pub const DEFAULT_MAX_IDLE: Duration = Duration::from_secs(300);

/// Association progress of a session with an application-level identity.
/// Gates whether inbound frames are connection requests or messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssociatedState {
    /// No identity yet
    None,
    /// Connection request accepted, association in progress
    Doing,
    /// Associated
    Done,
}

impl AssociatedState {
    pub fn name(&self) -> &'static str {
        match self {
            AssociatedState::None => "None",
            AssociatedState::Doing => "Doing",
            AssociatedState::Done => "Done",
        }
    }
}

impl fmt::Display for AssociatedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Timeouts applied to every session of a manager. A zero duration disables the check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub max_idle: Duration,
    pub reconnection_window: Duration,
    pub orphan_allowance: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_idle: DEFAULT_MAX_IDLE,
            reconnection_window: Duration::ZERO,
            orphan_allowance: DEFAULT_ORPHAN_ALLOWANCE,
        }
    }
}

/// A connected client session
pub struct Session {
    /// Unique session identifier
    pub id: SessionId,
    /// Remote address of the primary transport
    pub address: SocketAddr,
    /// Time of session creation
    pub created_at: Instant,
    /// Primary transport
    transport: Transport,
    /// Application-assigned name (player or account)
    name: RwLock<Option<String>>,
    activated: AtomicBool,
    closed: AtomicBool,
    associated: RwLock<AssociatedState>,
    /// Set when the transport was lost inside the reconnection window
    frozen_at: RwLock<Option<Instant>>,
    admission_released: AtomicBool,
    datagram: RwLock<Option<DatagramBinding>>,
    kcp: RwLock<Option<Arc<dyn KcpChannel>>>,
    kcp_enabled: AtomicBool,
    last_read: RwLock<Instant>,
    last_write: RwLock<Instant>,
    last_activity: RwLock<Instant>,
    read_bytes: AtomicU64,
    written_bytes: AtomicU64,
    read_messages: AtomicU64,
    dropped_packets: AtomicU64,
    settings: SessionSettings,
    packet_queue: PacketQueue,
    /// Partial inbound frames of a stream transport
    read_buffer: Mutex<BytesMut>,
    /// Outstanding writer ticket or pending writable wait
    ticketed: AtomicBool,
    awaiting_writable: AtomicBool,
}

impl Session {
    pub(crate) fn new(transport: Transport, packet_queue: PacketQueue, settings: SessionSettings) -> Self {
        let now = Instant::now();
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            address: transport.peer_addr(),
            created_at: now,
            transport,
            name: RwLock::new(None),
            activated: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            associated: RwLock::new(AssociatedState::None),
            frozen_at: RwLock::new(None),
            admission_released: AtomicBool::new(false),
            datagram: RwLock::new(None),
            kcp: RwLock::new(None),
            kcp_enabled: AtomicBool::new(false),
            last_read: RwLock::new(now),
            last_write: RwLock::new(now),
            last_activity: RwLock::new(now),
            read_bytes: AtomicU64::new(0),
            written_bytes: AtomicU64::new(0),
            read_messages: AtomicU64::new(0),
            dropped_packets: AtomicU64::new(0),
            settings,
            packet_queue,
            read_buffer: Mutex::new(BytesMut::new()),
            ticketed: AtomicBool::new(false),
            awaiting_writable: AtomicBool::new(false),
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Transport type of the primary transport
    pub fn transport_type(&self) -> TransportType {
        self.transport.transport_type()
    }

    pub fn is_websocket(&self) -> bool {
        self.transport.is_websocket()
    }

    pub fn ip(&self) -> IpAddr {
        self.address.ip()
    }

    pub fn name(&self) -> Option<String> {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write() = Some(name.into());
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    // --- lifecycle ---

    pub fn is_activated(&self) -> bool {
        self.activated.load(Ordering::Acquire)
    }

    /// Returns true if the session was active
    pub(crate) fn deactivate(&self) -> bool {
        self.activated.swap(false, Ordering::AcqRel)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns true for the first caller only
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Returns true for the first caller only
    pub(crate) fn release_admission(&self) -> bool {
        !self.admission_released.swap(true, Ordering::AcqRel)
    }

    pub fn associated_state(&self) -> AssociatedState {
        *self.associated.read()
    }

    pub fn set_associated_state(&self, state: AssociatedState) {
        let mut current = self.associated.write();
        let previous = *current;
        if previous != state {
            debug!(session_id = self.id, from = %previous, to = %state, "Association state changed");
            *current = state;
        }
    }

    /// Atomically move from `from` to `to`; false if the session was elsewhere
    pub fn transition_associated_state(&self, from: AssociatedState, to: AssociatedState) -> bool {
        let mut current = self.associated.write();
        if *current != from {
            return false;
        }
        debug!(session_id = self.id, from = %from, to = %to, "Association state changed");
        *current = to;
        true
    }

    pub fn is_associated(&self) -> bool {
        self.associated_state() == AssociatedState::Done
    }

    /// Freeze after a transport loss. False if already frozen or closed.
    pub(crate) fn freeze(&self) -> bool {
        let mut frozen_at = self.frozen_at.write();
        if frozen_at.is_some() || self.is_closed() {
            return false;
        }
        *frozen_at = Some(Instant::now());
        self.activated.store(false, Ordering::Release);
        true
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen_at.read().is_some()
    }

    pub fn frozen_at(&self) -> Option<Instant> {
        *self.frozen_at.read()
    }

    // --- timing checks ---

    pub fn is_idle(&self) -> bool {
        self.is_idle_at(Instant::now())
    }

    pub fn is_idle_at(&self, now: Instant) -> bool {
        let max_idle = self.settings.max_idle;
        !max_idle.is_zero() && now.saturating_duration_since(self.last_activity_time()) > max_idle
    }

    /// Never associated within the orphan allowance
    pub fn is_orphan(&self) -> bool {
        self.is_orphan_at(Instant::now())
    }

    pub fn is_orphan_at(&self, now: Instant) -> bool {
        let allowance = self.settings.orphan_allowance;
        !allowance.is_zero()
            && !self.is_associated()
            && now.saturating_duration_since(self.created_at) > allowance
    }

    pub fn is_reconnection_expired_at(&self, now: Instant) -> bool {
        self.frozen_at()
            .is_some_and(|at| now.saturating_duration_since(at) > self.settings.reconnection_window)
    }

    // --- secondary transports ---

    pub fn datagram(&self) -> Option<DatagramBinding> {
        self.datagram.read().clone()
    }

    pub fn contains_udp(&self) -> bool {
        self.datagram.read().is_some()
    }

    pub fn kcp(&self) -> Option<Arc<dyn KcpChannel>> {
        self.kcp.read().clone()
    }

    pub fn contains_kcp(&self) -> bool {
        self.kcp.read().is_some()
    }

    pub fn is_kcp_enabled(&self) -> bool {
        self.kcp_enabled.load(Ordering::Relaxed)
    }

    pub fn set_kcp_enabled(&self, enabled: bool) {
        self.kcp_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Shut down every transport of this session
    pub(crate) fn close_transports(&self) {
        self.transport.close();
        if let Some(kcp) = self.kcp.read().as_ref() {
            kcp.close();
        }
    }

    // --- activity and counters ---

    pub fn last_read_time(&self) -> Instant {
        *self.last_read.read()
    }

    pub fn last_write_time(&self) -> Instant {
        *self.last_write.read()
    }

    pub fn last_activity_time(&self) -> Instant {
        *self.last_activity.read()
    }

    /// Update last activity time
    pub fn touch(&self) {
        *self.last_activity.write() = Instant::now();
    }

    pub(crate) fn mark_read(&self, bytes: usize) {
        let now = Instant::now();
        *self.last_read.write() = now;
        *self.last_activity.write() = now;
        self.read_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn mark_written(&self, bytes: usize) {
        let now = Instant::now();
        *self.last_write.write() = now;
        *self.last_activity.write() = now;
        self.written_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn read_bytes(&self) -> u64 {
        self.read_bytes.load(Ordering::Relaxed)
    }

    pub fn written_bytes(&self) -> u64 {
        self.written_bytes.load(Ordering::Relaxed)
    }

    pub fn read_messages(&self) -> u64 {
        self.read_messages.load(Ordering::Relaxed)
    }

    pub(crate) fn increase_read_messages(&self) {
        self.read_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped_packets(&self) -> u64 {
        self.dropped_packets.load(Ordering::Relaxed)
    }

    pub(crate) fn add_dropped_packets(&self, count: u64) {
        self.dropped_packets.fetch_add(count, Ordering::Relaxed);
    }

    pub fn packet_queue(&self) -> &PacketQueue {
        &self.packet_queue
    }

    pub(crate) fn read_buffer(&self) -> MutexGuard<'_, BytesMut> {
        self.read_buffer.lock()
    }

    // --- writer ticket state ---

    /// Claim the ticket; true if the caller must push one
    pub(crate) fn try_ticket(&self) -> bool {
        !self.ticketed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn clear_ticket(&self) {
        self.ticketed.store(false, Ordering::Release);
    }

    pub(crate) fn is_awaiting_writable(&self) -> bool {
        self.awaiting_writable.load(Ordering::Acquire)
    }

    /// Returns true if no writable wait was pending
    pub(crate) fn begin_writable_wait(&self) -> bool {
        !self.awaiting_writable.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn end_writable_wait(&self) {
        self.awaiting_writable.store(false, Ordering::Release);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("transport", &self.transport_type())
            .field("associated", &self.associated_state())
            .field("activated", &self.is_activated())
            .field("frozen", &self.is_frozen())
            .field("queued", &self.packet_queue.len())
            .finish()
    }
}

#[derive(Default)]
struct SessionIndex {
    by_id: HashMap<SessionId, Arc<Session>>,
    by_socket: HashMap<ChannelId, Arc<Session>>,
    by_websocket: HashMap<ChannelId, Arc<Session>>,
    by_datagram: HashMap<SocketAddr, Arc<Session>>,
    by_kcp: HashMap<u32, Arc<Session>>,
}

/// Registry and factory for sessions.
///
/// Index mutations happen under one write lock; [`list_readonly`] hands out
/// an immutable snapshot rebuilt on every membership change.
///
/// [`list_readonly`]: SessionManager::list_readonly
pub struct SessionManager {
    index: RwLock<SessionIndex>,
    snapshot: RwLock<Arc<[Arc<Session>]>>,
    connection_filter: Arc<ConnectionFilter>,
    events: Arc<dyn NetworkEventHandler>,
    packet_queue_size: usize,
    packet_queue_policy: Arc<dyn PacketQueuePolicy>,
    settings: SessionSettings,
}

impl SessionManager {
    pub fn new(connection_filter: Arc<ConnectionFilter>, events: Arc<dyn NetworkEventHandler>) -> Self {
        Self {
            index: RwLock::new(SessionIndex::default()),
            snapshot: RwLock::new(Arc::from(Vec::new())),
            connection_filter,
            events,
            packet_queue_size: DEFAULT_PACKET_QUEUE_SIZE,
            packet_queue_policy: Arc::new(DefaultPacketQueuePolicy),
            settings: SessionSettings::default(),
        }
    }

    /// Queue capacity and policy for sessions created from now on
    pub fn with_packet_queue(mut self, size: usize, policy: Arc<dyn PacketQueuePolicy>) -> Self {
        self.packet_queue_size = size;
        self.packet_queue_policy = policy;
        self
    }

    pub fn with_settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn connection_filter(&self) -> &Arc<ConnectionFilter> {
        &self.connection_filter
    }

    pub fn events(&self) -> &Arc<dyn NetworkEventHandler> {
        &self.events
    }

    pub fn create_stream_session(&self, handle: SocketHandle) -> Arc<Session> {
        self.register(Transport::Socket(handle))
    }

    pub fn create_websocket_session(&self, handle: WebSocketHandle) -> Arc<Session> {
        self.register(Transport::WebSocket(handle))
    }

    fn register(&self, transport: Transport) -> Arc<Session> {
        let queue = PacketQueue::new(self.packet_queue_size, self.packet_queue_policy.clone());
        let session = Arc::new(Session::new(transport, queue, self.settings));

        {
            let mut index = self.index.write();
            index.by_id.insert(session.id, session.clone());
            match session.transport() {
                Transport::Socket(handle) => {
                    index.by_socket.insert(handle.id(), session.clone());
                }
                Transport::WebSocket(handle) => {
                    index.by_websocket.insert(handle.id(), session.clone());
                }
            }
            self.refresh_snapshot(&index);
        }

        info!(
            session_id = session.id,
            address = %session.address,
            transport = %session.transport_type(),
            "Session created"
        );
        session
    }

    /// Bind a datagram peer to a stream session
    pub fn bind_datagram(
        &self,
        session: &Arc<Session>,
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
    ) -> Result<()> {
        if !session.transport().is_socket() {
            return Err(NetworkError::InvalidArgument(format!(
                "session {} is not a stream session",
                session.id
            ))
            .into());
        }

        let mut index = self.index.write();
        if !session.is_activated() || !index.by_id.contains_key(&session.id) {
            return Err(NetworkError::SessionNotFound(session.id).into());
        }
        if let Some(owner) = index.by_datagram.get(&peer) {
            if owner.id != session.id {
                return Err(NetworkError::InvalidArgument(format!(
                    "peer {} is already bound to session {}",
                    peer, owner.id
                ))
                .into());
            }
        }

        let mut binding = session.datagram.write();
        if let Some(previous) = binding.as_ref() {
            if previous.peer() != peer {
                index.by_datagram.remove(&previous.peer());
            }
        }
        *binding = Some(DatagramBinding::new(socket, peer));
        index.by_datagram.insert(peer, session.clone());

        debug!(session_id = session.id, peer = %peer, "Datagram peer bound");
        Ok(())
    }

    pub fn unbind_datagram(&self, session: &Session) {
        let mut index = self.index.write();
        if let Some(binding) = session.datagram.write().take() {
            Self::remove_owned(&mut index.by_datagram, &binding.peer(), session.id);
            debug!(session_id = session.id, peer = %binding.peer(), "Datagram peer unbound");
        }
    }

    /// Attach a KCP tunnel to a stream session
    pub fn bind_kcp(&self, session: &Arc<Session>, channel: Arc<dyn KcpChannel>) -> Result<()> {
        if !session.transport().is_socket() {
            return Err(NetworkError::InvalidArgument(format!(
                "session {} is not a stream session",
                session.id
            ))
            .into());
        }

        let conv = channel.conv();
        let mut index = self.index.write();
        if !session.is_activated() || !index.by_id.contains_key(&session.id) {
            return Err(NetworkError::SessionNotFound(session.id).into());
        }
        if let Some(owner) = index.by_kcp.get(&conv) {
            if owner.id != session.id {
                return Err(NetworkError::InvalidArgument(format!(
                    "conversation {} is already bound to session {}",
                    conv, owner.id
                ))
                .into());
            }
        }

        let mut kcp = session.kcp.write();
        if let Some(previous) = kcp.as_ref() {
            if previous.conv() != conv {
                index.by_kcp.remove(&previous.conv());
            }
        }
        *kcp = Some(channel);
        index.by_kcp.insert(conv, session.clone());
        session.set_kcp_enabled(true);

        debug!(session_id = session.id, conv, "KCP tunnel bound");
        Ok(())
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.index.read().by_id.get(&id).cloned()
    }

    pub fn get_by_socket(&self, id: ChannelId) -> Option<Arc<Session>> {
        self.index.read().by_socket.get(&id).cloned()
    }

    pub fn get_by_websocket(&self, id: ChannelId) -> Option<Arc<Session>> {
        self.index.read().by_websocket.get(&id).cloned()
    }

    pub fn get_by_datagram(&self, peer: &SocketAddr) -> Option<Arc<Session>> {
        self.index.read().by_datagram.get(peer).cloned()
    }

    pub fn get_by_kcp(&self, conv: u32) -> Option<Arc<Session>> {
        self.index.read().by_kcp.get(&conv).cloned()
    }

    /// Frozen session carrying the application name `name`, if any
    pub fn get_frozen_by_name(&self, name: &str) -> Option<Arc<Session>> {
        self.list_readonly()
            .iter()
            .find(|session| session.is_frozen() && session.name().as_deref() == Some(name))
            .cloned()
    }

    /// Point-in-time view of all registered sessions, ordered by id
    pub fn list_readonly(&self) -> Arc<[Arc<Session>]> {
        self.snapshot.read().clone()
    }

    /// Number of registered sessions, frozen ones included
    pub fn count(&self) -> usize {
        self.index.read().by_id.len()
    }

    /// Remove every index entry of a session. Idempotent; returns whether
    /// the session was still registered.
    pub fn remove(&self, session: &Session) -> bool {
        let mut index = self.index.write();
        let removed = index.by_id.remove(&session.id).is_some();
        Self::remove_transport_entries(&mut index, session);
        if removed {
            self.refresh_snapshot(&index);
            debug!(session_id = session.id, remaining = index.by_id.len(), "Session removed");
        }
        removed
    }

    /// Close a session: deactivate it, release its admission slot, drop its
    /// pending packets, shut its transports, unregister it and raise exactly
    /// one closed event.
    pub fn close(&self, session: &Arc<Session>, reason: DisconnectReason) {
        if !session.mark_closed() {
            return;
        }

        session.deactivate();
        self.release_admission(session);
        session.packet_queue().clear();
        session.close_transports();
        self.remove(session);

        info!(
            session_id = session.id,
            address = %session.address,
            reason = %reason,
            "Session closed"
        );
        self.events.on_session_closed(session, reason);
    }

    /// Handle the loss of a session's primary transport.
    ///
    /// Associated sessions with a reconnection window are frozen and kept
    /// by id; everything else is closed with `reason`.
    pub fn connection_lost(&self, session: &Arc<Session>, reason: DisconnectReason) {
        if session.is_frozen() {
            return;
        }
        if session.settings().reconnection_window.is_zero() || !session.is_associated() {
            self.close(session, reason);
            return;
        }
        if !session.freeze() {
            return;
        }

        self.release_admission(session);
        session.packet_queue().clear();
        session.close_transports();
        {
            let mut index = self.index.write();
            Self::remove_transport_entries(&mut index, session);
        }

        info!(
            session_id = session.id,
            address = %session.address,
            window_secs = session.settings().reconnection_window.as_secs(),
            "Session frozen awaiting reconnection"
        );
        self.events.on_session_frozen(session);
    }

    /// Hand the identity of `stale` over to `replacement`, a newer session of
    /// the same client. `replacement` inherits the name and becomes
    /// associated; `stale` is closed with [`DisconnectReason::Reconnection`].
    pub fn reconnect(&self, stale: &Arc<Session>, replacement: &Arc<Session>) -> Result<()> {
        if stale.id == replacement.id {
            return Err(NetworkError::InvalidArgument(format!(
                "session {} cannot replace itself",
                stale.id
            ))
            .into());
        }
        if stale.is_closed() {
            return Err(NetworkError::SessionNotFound(stale.id).into());
        }
        if !replacement.is_activated() {
            return Err(NetworkError::SessionInactive(replacement.id).into());
        }

        if replacement.name().is_none() {
            if let Some(name) = stale.name() {
                replacement.set_name(name);
            }
        }
        replacement.set_associated_state(AssociatedState::Done);

        info!(
            session_id = replacement.id,
            previous_session_id = stale.id,
            frozen = stale.is_frozen(),
            "Session reconnected"
        );
        self.close(stale, DisconnectReason::Reconnection);
        Ok(())
    }

    /// Close active sessions past the idle threshold
    pub fn close_idle_sessions(&self) -> usize {
        let now = Instant::now();
        self.close_where(DisconnectReason::Idle, |s| s.is_activated() && s.is_idle_at(now))
    }

    /// Close active sessions that never associated within the orphan allowance
    pub fn close_orphan_sessions(&self) -> usize {
        let now = Instant::now();
        self.close_where(DisconnectReason::Orphan, |s| s.is_activated() && s.is_orphan_at(now))
    }

    /// Close frozen sessions whose reconnection window has run out
    pub fn close_expired_frozen_sessions(&self) -> usize {
        let now = Instant::now();
        self.close_where(DisconnectReason::ReconnectionExpired, |s| {
            s.is_reconnection_expired_at(now)
        })
    }

    pub fn close_all(&self, reason: DisconnectReason) -> usize {
        self.close_where(reason, |_| true)
    }

    fn close_where(&self, reason: DisconnectReason, predicate: impl Fn(&Session) -> bool) -> usize {
        let mut closed = 0;
        for session in self.list_readonly().iter() {
            if !session.is_closed() && predicate(session.as_ref()) {
                self.close(session, reason);
                closed += 1;
            }
        }
        closed
    }

    fn release_admission(&self, session: &Session) {
        if session.release_admission() {
            self.connection_filter.remove(session.ip());
        }
    }

    fn remove_transport_entries(index: &mut SessionIndex, session: &Session) {
        match session.transport() {
            Transport::Socket(handle) => {
                Self::remove_owned(&mut index.by_socket, &handle.id(), session.id);
            }
            Transport::WebSocket(handle) => {
                Self::remove_owned(&mut index.by_websocket, &handle.id(), session.id);
            }
        }
        if let Some(binding) = session.datagram.read().as_ref() {
            Self::remove_owned(&mut index.by_datagram, &binding.peer(), session.id);
        }
        if let Some(kcp) = session.kcp.read().as_ref() {
            Self::remove_owned(&mut index.by_kcp, &kcp.conv(), session.id);
        }
    }

    /// Remove `key` only if it still points at `owner`
    fn remove_owned<K: std::hash::Hash + Eq>(
        map: &mut HashMap<K, Arc<Session>>,
        key: &K,
        owner: SessionId,
    ) {
        if map.get(key).is_some_and(|s| s.id == owner) {
            map.remove(key);
        }
    }

    fn refresh_snapshot(&self, index: &SessionIndex) {
        let mut sessions: Vec<Arc<Session>> = index.by_id.values().cloned().collect();
        sessions.sort_by_key(|s| s.id);
        *self.snapshot.write() = Arc::from(sessions);
    }
}
