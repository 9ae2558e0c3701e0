//! Zlib compression strategy

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use super::BinaryPacketCompressor;
use crate::error::CodecError;

/// Upper bound on a decompressed payload
pub const DEFAULT_MAX_DECOMPRESSED_SIZE: usize = 16 * 1024 * 1024;

/// Zlib (deflate) compressor backed by flate2
#[derive(Debug, Clone)]
pub struct ZlibCompressor {
    level: Compression,
    max_decompressed_size: usize,
}

impl ZlibCompressor {
    pub fn new() -> Self {
        Self {
            level: Compression::default(),
            max_decompressed_size: DEFAULT_MAX_DECOMPRESSED_SIZE,
        }
    }

    pub fn with_level(mut self, level: u32) -> Self {
        self.level = Compression::new(level.min(9));
        self
    }

    /// Refuse payloads that inflate past `max` bytes
    pub fn with_max_decompressed_size(mut self, max: usize) -> Self {
        self.max_decompressed_size = max;
        self
    }
}

impl Default for ZlibCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl BinaryPacketCompressor for ZlibCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), self.level);
        encoder
            .write_all(data)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| CodecError::Compression(e.to_string()))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        ZlibDecoder::new(data)
            .take(self.max_decompressed_size as u64 + 1)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;

        if out.len() > self.max_decompressed_size {
            return Err(CodecError::Decompression(format!(
                "payload exceeds {} bytes",
                self.max_decompressed_size
            )));
        }
        Ok(out)
    }
}
