//! Frame encoder

use std::borrow::Cow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::warn;

use super::header::{HeaderFlags, MAX_SHORT_PAYLOAD};
use super::{BinaryPacketCompressor, BinaryPacketEncryptor};
use crate::net::packet::Packet;

/// Payloads larger than this are compressed when a compressor is configured
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 3000;

/// Builds wire frames from application payloads.
///
/// A failing compressor or encryptor does not fail the encode: the frame is
/// sent without that stage and with the matching header bit cleared. Each
/// such fallback is logged and counted.
pub struct BinaryPacketEncoder {
    compressor: Option<Arc<dyn BinaryPacketCompressor>>,
    encryptor: Option<Arc<dyn BinaryPacketEncryptor>>,
    compression_threshold: usize,
    fallbacks: AtomicU64,
}

impl BinaryPacketEncoder {
    /// Encoder without compression or encryption
    pub fn new() -> Self {
        Self {
            compressor: None,
            encryptor: None,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            fallbacks: AtomicU64::new(0),
        }
    }

    pub fn with_compressor(mut self, compressor: Arc<dyn BinaryPacketCompressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    pub fn with_encryptor(mut self, encryptor: Arc<dyn BinaryPacketEncryptor>) -> Self {
        self.encryptor = Some(encryptor);
        self
    }

    pub fn with_compression_threshold(mut self, threshold: usize) -> Self {
        self.compression_threshold = threshold;
        self
    }

    pub fn compression_threshold(&self) -> usize {
        self.compression_threshold
    }

    /// Number of frames sent without a stage they asked for
    pub fn fallback_count(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }

    /// Frame a packet's payload. The packet itself is left untouched.
    pub fn encode_packet(&self, packet: &Packet) -> Bytes {
        self.encode(packet.data(), packet.is_encrypted())
    }

    /// Frame `payload`, encrypting it first when `encrypt` is set and then
    /// compressing it when it exceeds the threshold
    pub fn encode(&self, payload: &[u8], encrypt: bool) -> Bytes {
        let mut flags = HeaderFlags::empty();
        let mut body = Cow::Borrowed(payload);

        if encrypt {
            match &self.encryptor {
                Some(encryptor) => match encryptor.encrypt(&body) {
                    Ok(encrypted) => {
                        body = Cow::Owned(encrypted);
                        flags |= HeaderFlags::ENCRYPTED;
                    }
                    Err(e) => {
                        self.fallbacks.fetch_add(1, Ordering::Relaxed);
                        warn!(error = %e, "Encryption failed, sending frame unencrypted");
                    }
                },
                None => {
                    self.fallbacks.fetch_add(1, Ordering::Relaxed);
                    warn!("No encryptor configured, sending frame unencrypted");
                }
            }
        }

        if body.len() > self.compression_threshold {
            if let Some(compressor) = &self.compressor {
                match compressor.compress(&body) {
                    Ok(compressed) => {
                        body = Cow::Owned(compressed);
                        flags |= HeaderFlags::COMPRESSED;
                    }
                    Err(e) => {
                        self.fallbacks.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            error = %e,
                            size = body.len(),
                            "Compression failed, sending frame uncompressed"
                        );
                    }
                }
            }
        }

        if !body.is_empty() {
            flags |= HeaderFlags::HAS_DATA;
        }
        if body.len() > MAX_SHORT_PAYLOAD {
            flags |= HeaderFlags::BIG_SIZE;
        }

        let mut frame = BytesMut::with_capacity(flags.prefix_len() + body.len());
        frame.put_u8(flags.bits());
        if flags.is_big_size() {
            frame.put_u32(body.len() as u32);
        } else {
            frame.put_u16(body.len() as u16);
        }
        frame.extend_from_slice(&body);
        frame.freeze()
    }
}

impl Default for BinaryPacketEncoder {
    fn default() -> Self {
        Self::new()
    }
}
