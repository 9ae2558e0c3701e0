//! Frame decoder

use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};

use super::header::HeaderFlags;
use super::{BinaryPacketCompressor, BinaryPacketEncryptor};
use crate::error::ProtocolError;

/// Largest payload length a peer may declare
pub const DEFAULT_MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Strict inverse of [`BinaryPacketEncoder`](super::BinaryPacketEncoder)
#[derive(Clone)]
pub struct BinaryPacketDecoder {
    compressor: Option<Arc<dyn BinaryPacketCompressor>>,
    encryptor: Option<Arc<dyn BinaryPacketEncryptor>>,
    max_frame_size: usize,
}

impl BinaryPacketDecoder {
    pub fn new() -> Self {
        Self {
            compressor: None,
            encryptor: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
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

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Decode one frame from the front of a stream buffer.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched when the frame is not
    /// complete yet. On success the frame's bytes are consumed.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
        let Some(&first) = buf.first() else {
            return Ok(None);
        };
        let flags = HeaderFlags::from_byte(first)?;
        let prefix_len = flags.prefix_len();
        if buf.len() < prefix_len {
            return Ok(None);
        }

        let declared = self.declared_length(flags, &buf[1..prefix_len])?;
        if buf.len() < prefix_len + declared {
            buf.reserve(prefix_len + declared - buf.len());
            return Ok(None);
        }

        buf.advance(prefix_len);
        let body = buf.split_to(declared).freeze();
        self.unwrap_payload(flags, body).map(Some)
    }

    /// Decode a buffer that holds exactly one frame
    pub fn decode_frame(&self, frame: &[u8]) -> Result<Bytes, ProtocolError> {
        let Some(&first) = frame.first() else {
            return Err(ProtocolError::TruncatedHeader {
                needed: 1,
                available: 0,
            });
        };
        let flags = HeaderFlags::from_byte(first)?;
        let prefix_len = flags.prefix_len();
        if frame.len() < prefix_len {
            return Err(ProtocolError::TruncatedHeader {
                needed: prefix_len,
                available: frame.len(),
            });
        }

        let declared = self.declared_length(flags, &frame[1..prefix_len])?;
        let available = frame.len() - prefix_len;
        if declared != available {
            return Err(ProtocolError::LengthMismatch {
                declared,
                available,
            });
        }

        self.unwrap_payload(flags, Bytes::copy_from_slice(&frame[prefix_len..]))
    }

    fn declared_length(&self, flags: HeaderFlags, field: &[u8]) -> Result<usize, ProtocolError> {
        let declared = if flags.is_big_size() {
            u32::from_be_bytes([field[0], field[1], field[2], field[3]]) as usize
        } else {
            u16::from_be_bytes([field[0], field[1]]) as usize
        };

        if declared > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: declared,
                max: self.max_frame_size,
            });
        }
        if !flags.has_data() && declared != 0 {
            return Err(ProtocolError::UnexpectedPayload(declared));
        }
        Ok(declared)
    }

    fn unwrap_payload(&self, flags: HeaderFlags, body: Bytes) -> Result<Bytes, ProtocolError> {
        let mut payload = body;

        if flags.is_compressed() {
            let compressor = self
                .compressor
                .as_ref()
                .ok_or(ProtocolError::MissingCompressor)?;
            payload = Bytes::from(compressor.decompress(&payload)?);
        }

        if flags.is_encrypted() {
            let encryptor = self
                .encryptor
                .as_ref()
                .ok_or(ProtocolError::MissingEncryptor)?;
            payload = Bytes::from(encryptor.decrypt(&payload)?);
        }

        Ok(payload)
    }
}

impl Default for BinaryPacketDecoder {
    fn default() -> Self {
        Self::new()
    }
}
