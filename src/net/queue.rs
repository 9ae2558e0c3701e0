//! Per-session outbound packet queue
//!
//! Bounded and ordered by priority then id. A pluggable policy may veto a
//! packet before insertion; full-queue and policy rejections are reported as
//! distinct errors so callers can count them separately.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use super::packet::{Packet, PacketOrder, Priority};
use crate::error::PacketQueueError;

/// Default capacity of a session queue
pub const DEFAULT_PACKET_QUEUE_SIZE: usize = 100;

/// Queue occupancy handed to a policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueUsage {
    pub size: usize,
    pub max_size: usize,
}

impl QueueUsage {
    pub fn percentage_used(&self) -> f32 {
        if self.max_size == 0 {
            return 100.0;
        }
        self.size as f32 * 100.0 / self.max_size as f32
    }
}

/// Admission policy consulted before a packet is inserted
pub trait PacketQueuePolicy: Send + Sync + fmt::Debug {
    fn apply(&self, usage: QueueUsage, packet: &Packet) -> Result<(), PacketQueueError>;
}

/// Sheds low-priority traffic as the queue fills up
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPacketQueuePolicy;

impl DefaultPacketQueuePolicy {
    pub const NON_URGENT_THRESHOLD: f32 = 80.0;
    pub const URGENT_THRESHOLD: f32 = 90.0;
}

impl PacketQueuePolicy for DefaultPacketQueuePolicy {
    fn apply(&self, usage: QueueUsage, packet: &Packet) -> Result<(), PacketQueueError> {
        let used = usage.percentage_used();
        let priority = packet.priority();

        if used >= Self::URGENT_THRESHOLD && priority < Priority::URGENT {
            return Err(PacketQueueError::PolicyViolation(format!(
                "queue {:.0}% used, priority {} below urgent",
                used, priority
            )));
        }
        if used >= Self::NON_URGENT_THRESHOLD && priority < Priority::NORMAL {
            return Err(PacketQueueError::PolicyViolation(format!(
                "queue {:.0}% used, priority {} below normal",
                used, priority
            )));
        }
        Ok(())
    }
}

/// Never vetoes; only the capacity limit applies
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllPolicy;

impl PacketQueuePolicy for AcceptAllPolicy {
    fn apply(&self, _usage: QueueUsage, _packet: &Packet) -> Result<(), PacketQueueError> {
        Ok(())
    }
}

/// Bounded, priority-ordered outbound buffer of one session
pub struct PacketQueue {
    packets: Mutex<BTreeMap<PacketOrder, Packet>>,
    size_hint: AtomicUsize,
    max_size: usize,
    policy: Arc<dyn PacketQueuePolicy>,
}

impl PacketQueue {
    pub fn new(max_size: usize, policy: Arc<dyn PacketQueuePolicy>) -> Self {
        Self {
            packets: Mutex::new(BTreeMap::new()),
            size_hint: AtomicUsize::new(0),
            max_size,
            policy,
        }
    }

    /// Queue with the default policy
    pub fn with_capacity(max_size: usize) -> Self {
        Self::new(max_size, Arc::new(DefaultPacketQueuePolicy))
    }

    /// Insert a packet. Fails when full, then when the policy vetoes it.
    pub fn put(&self, packet: Packet) -> Result<(), PacketQueueError> {
        let mut packets = self.packets.lock();
        if packets.len() >= self.max_size {
            return Err(PacketQueueError::Full {
                max_size: self.max_size,
            });
        }

        let usage = QueueUsage {
            size: packets.len(),
            max_size: self.max_size,
        };
        self.policy.apply(usage, &packet)?;

        packets.insert(packet.order(), packet);
        self.size_hint.store(packets.len(), Ordering::Release);
        Ok(())
    }

    /// Copy of the head packet
    pub fn peek(&self) -> Option<Packet> {
        self.packets.lock().values().next().cloned()
    }

    /// Remove and return the head packet
    pub fn take(&self) -> Option<Packet> {
        self.lock().take()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Hold the queue lock, for callers that need to inspect and mutate the head in place
    pub fn lock(&self) -> PacketQueueGuard<'_> {
        PacketQueueGuard {
            size_hint: &self.size_hint,
            packets: self.packets.lock(),
        }
    }

    pub fn len(&self) -> usize {
        self.size_hint.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.max_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn percentage_used(&self) -> f32 {
        QueueUsage {
            size: self.len(),
            max_size: self.max_size,
        }
        .percentage_used()
    }

    pub fn policy(&self) -> &Arc<dyn PacketQueuePolicy> {
        &self.policy
    }
}

impl fmt::Debug for PacketQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketQueue")
            .field("len", &self.len())
            .field("max_size", &self.max_size)
            .field("policy", &self.policy)
            .finish()
    }
}

/// Locked view of a packet queue
pub struct PacketQueueGuard<'a> {
    size_hint: &'a AtomicUsize,
    packets: MutexGuard<'a, BTreeMap<PacketOrder, Packet>>,
}

impl PacketQueueGuard<'_> {
    pub fn peek(&self) -> Option<&Packet> {
        self.packets.values().next()
    }

    pub fn peek_mut(&mut self) -> Option<&mut Packet> {
        self.packets.values_mut().next()
    }

    pub fn take(&mut self) -> Option<Packet> {
        let packet = self.packets.pop_first().map(|(_, packet)| packet);
        self.size_hint.store(self.packets.len(), Ordering::Release);
        packet
    }

    pub fn clear(&mut self) {
        self.packets.clear();
        self.size_hint.store(0, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }
}
