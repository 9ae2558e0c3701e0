//! Reader and writer statistics

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters maintained by the reader engine
#[derive(Debug, Default)]
pub struct NetworkReaderStatistic {
    read_bytes: AtomicU64,
    read_packets: AtomicU64,
    read_dropped_packets: AtomicU64,
}

impl NetworkReaderStatistic {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_read_bytes(&self, bytes: u64) {
        self.read_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn update_read_packets(&self, packets: u64) {
        self.read_packets.fetch_add(packets, Ordering::Relaxed);
    }

    pub fn update_read_dropped_packets(&self, packets: u64) {
        self.read_dropped_packets.fetch_add(packets, Ordering::Relaxed);
    }

    pub fn read_bytes(&self) -> u64 {
        self.read_bytes.load(Ordering::Relaxed)
    }

    pub fn read_packets(&self) -> u64 {
        self.read_packets.load(Ordering::Relaxed)
    }

    pub fn read_dropped_packets(&self) -> u64 {
        self.read_dropped_packets.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ReaderSnapshot {
        ReaderSnapshot {
            read_bytes: self.read_bytes(),
            read_packets: self.read_packets(),
            read_dropped_packets: self.read_dropped_packets(),
        }
    }
}

/// Counters maintained by the writer engine
#[derive(Debug, Default)]
pub struct NetworkWriterStatistic {
    written_bytes: AtomicU64,
    written_packets: AtomicU64,
    dropped_by_policy: AtomicU64,
    dropped_by_full: AtomicU64,
    dropped_other: AtomicU64,
}

impl NetworkWriterStatistic {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_written_bytes(&self, bytes: u64) {
        self.written_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn update_written_packets(&self, packets: u64) {
        self.written_packets.fetch_add(packets, Ordering::Relaxed);
    }

    pub fn update_dropped_by_policy(&self, packets: u64) {
        self.dropped_by_policy.fetch_add(packets, Ordering::Relaxed);
    }

    pub fn update_dropped_by_full(&self, packets: u64) {
        self.dropped_by_full.fetch_add(packets, Ordering::Relaxed);
    }

    /// Packets lost on a secondary transport or addressed to a missing one
    pub fn update_dropped_other(&self, packets: u64) {
        self.dropped_other.fetch_add(packets, Ordering::Relaxed);
    }

    pub fn written_bytes(&self) -> u64 {
        self.written_bytes.load(Ordering::Relaxed)
    }

    pub fn written_packets(&self) -> u64 {
        self.written_packets.load(Ordering::Relaxed)
    }

    pub fn dropped_by_policy(&self) -> u64 {
        self.dropped_by_policy.load(Ordering::Relaxed)
    }

    pub fn dropped_by_full(&self) -> u64 {
        self.dropped_by_full.load(Ordering::Relaxed)
    }

    pub fn dropped_other(&self) -> u64 {
        self.dropped_other.load(Ordering::Relaxed)
    }

    /// Snapshot including the encoder's fallback count
    pub fn snapshot(&self, encode_fallbacks: u64) -> WriterSnapshot {
        WriterSnapshot {
            written_bytes: self.written_bytes(),
            written_packets: self.written_packets(),
            dropped_by_policy: self.dropped_by_policy(),
            dropped_by_full: self.dropped_by_full(),
            dropped_other: self.dropped_other(),
            encode_fallbacks,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReaderSnapshot {
    pub read_bytes: u64,
    pub read_packets: u64,
    pub read_dropped_packets: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WriterSnapshot {
    pub written_bytes: u64,
    pub written_packets: u64,
    pub dropped_by_policy: u64,
    pub dropped_by_full: u64,
    pub dropped_other: u64,
    pub encode_fallbacks: u64,
}
