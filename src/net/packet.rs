//! Outbound packet value object
//!
//! A packet is created by the application, framed once (stream transports),
//! copied per extra recipient and consumed exactly once by the writer.

use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::session::Session;

static NEXT_PACKET_ID: AtomicU64 = AtomicU64::new(1);

/// Transport a packet travels on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportType {
    /// Primary stream socket, framed by the binary codec
    Tcp,
    /// Bound datagram peer
    Udp,
    /// Primary WebSocket connection
    WebSocket,
    /// Reliable-UDP tunnel
    Kcp,
}

impl TransportType {
    pub fn name(&self) -> &'static str {
        match self {
            TransportType::Tcp => "tcp",
            TransportType::Udp => "udp",
            TransportType::WebSocket => "websocket",
            TransportType::Kcp => "kcp",
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Packet priority. Higher values leave the queue first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Priority(pub u8);

impl Priority {
    pub const NON_URGENT: Priority = Priority(1);
    pub const NORMAL: Priority = Priority(2);
    pub const URGENT: Priority = Priority(3);
    pub const GUARANTEED: Priority = Priority(4);

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Queue ordering key: priority descending, then id ascending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketOrder {
    pub priority: Priority,
    pub id: u64,
}

impl Ord for PacketOrder {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for PacketOrder {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// An outbound message
#[derive(Clone)]
pub struct Packet {
    id: u64,
    created_at: Instant,
    data: Bytes,
    transport: TransportType,
    priority: Priority,
    encrypted: bool,
    last: bool,
    recipients: Vec<Arc<Session>>,
    fragment: Option<Bytes>,
}

impl Packet {
    /// Create a TCP packet with normal priority
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            id: NEXT_PACKET_ID.fetch_add(1, Ordering::Relaxed),
            created_at: Instant::now(),
            data: data.into(),
            transport: TransportType::Tcp,
            priority: Priority::default(),
            encrypted: false,
            last: false,
            recipients: Vec::new(),
            fragment: None,
        }
    }

    pub fn with_transport(mut self, transport: TransportType) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_encryption(mut self, encrypted: bool) -> Self {
        self.encrypted = encrypted;
        self
    }

    /// Close the recipient session once this packet is fully written
    pub fn mark_as_last(mut self) -> Self {
        self.last = true;
        self
    }

    pub fn with_recipient(mut self, session: Arc<Session>) -> Self {
        self.recipients.push(session);
        self
    }

    pub fn with_recipients(mut self, sessions: impl IntoIterator<Item = Arc<Session>>) -> Self {
        self.recipients.extend(sessions);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn transport(&self) -> TransportType {
        self.transport
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn is_last(&self) -> bool {
        self.last
    }

    pub fn recipients(&self) -> &[Arc<Session>] {
        &self.recipients
    }

    pub fn order(&self) -> PacketOrder {
        PacketOrder {
            priority: self.priority,
            id: self.id,
        }
    }

    /// Unsent remainder of a partial write, if any
    pub fn fragment(&self) -> Option<&Bytes> {
        self.fragment.as_ref()
    }

    pub fn is_fragmented(&self) -> bool {
        self.fragment.is_some()
    }

    /// Bytes still owed to the transport: the fragment when one is outstanding,
    /// otherwise the whole payload
    pub fn pending(&self) -> &Bytes {
        self.fragment.as_ref().unwrap_or(&self.data)
    }

    pub(crate) fn set_fragment(&mut self, remaining: Bytes) {
        self.fragment = Some(remaining);
    }

    pub(crate) fn replace_data(&mut self, data: Bytes) {
        self.data = data;
        self.fragment = None;
    }

    pub(crate) fn take_recipients(&mut self) -> Vec<Arc<Session>> {
        std::mem::take(&mut self.recipients)
    }

    /// Copy for an additional recipient. The copy gets a fresh id and shares the payload.
    pub fn copy_for_recipient(&self) -> Packet {
        Packet {
            id: NEXT_PACKET_ID.fetch_add(1, Ordering::Relaxed),
            created_at: self.created_at,
            data: self.data.clone(),
            transport: self.transport,
            priority: self.priority,
            encrypted: self.encrypted,
            last: self.last,
            recipients: Vec::new(),
            fragment: None,
        }
    }
}

impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Packet {}

impl Ord for Packet {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.order().cmp(&other.order())
    }
}

impl PartialOrd for Packet {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("id", &self.id)
            .field("transport", &self.transport)
            .field("priority", &self.priority)
            .field("len", &self.data.len())
            .field("encrypted", &self.encrypted)
            .field("last", &self.last)
            .field("recipients", &self.recipients.len())
            .field("fragment", &self.fragment.as_ref().map(|f| f.len()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_before_id() {
        let low = Packet::new(&b"low"[..]).with_priority(Priority(5));
        let high = Packet::new(&b"high"[..]).with_priority(Priority(9));
        assert!(high < low);

        let first = Packet::new(&b"a"[..]);
        let second = Packet::new(&b"b"[..]);
        assert!(first < second);
    }

    #[test]
    fn test_default_packet() {
        let packet = Packet::new(&b"hello"[..]);
        assert_eq!(packet.transport(), TransportType::Tcp);
        assert_eq!(packet.priority(), Priority::NORMAL);
        assert!(!packet.is_encrypted());
        assert!(!packet.is_last());
        assert_eq!(packet.pending().as_ref(), b"hello");
    }

    #[test]
    fn test_copy_for_recipient() {
        let packet = Packet::new(&b"shared"[..])
            .with_priority(Priority::URGENT)
            .with_encryption(true)
            .mark_as_last();
        let copy = packet.copy_for_recipient();

        assert_ne!(copy.id(), packet.id());
        assert!(copy.id() > packet.id());
        assert_eq!(copy.data(), packet.data());
        assert_eq!(copy.priority(), Priority::URGENT);
        assert!(copy.is_encrypted());
        assert!(copy.is_last());
        assert!(copy.recipients().is_empty());
    }

    #[test]
    fn test_fragment_tracks_remainder() {
        let mut packet = Packet::new(&b"abcdef"[..]);
        assert!(!packet.is_fragmented());

        let remaining = packet.pending().slice(4..);
        packet.set_fragment(remaining);
        assert!(packet.is_fragmented());
        assert_eq!(packet.pending().as_ref(), b"ef");
        assert_eq!(packet.data().as_ref(), b"abcdef");
    }
}
