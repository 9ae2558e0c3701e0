//! Binary wire codec
//!
//! Frame layout: `[header u8][length u16 BE | u32 BE][payload]`.
//!
//! The header carries four flags (see [`HeaderFlags`]). Encoding encrypts
//! first and compresses second; decoding reverses that order. Compressor and
//! encryptor are pluggable strategies.

pub mod compression;
pub mod decoder;
pub mod encoder;
pub mod header;

pub use compression::ZlibCompressor;
pub use decoder::{BinaryPacketDecoder, DEFAULT_MAX_FRAME_SIZE};
pub use encoder::{BinaryPacketEncoder, DEFAULT_COMPRESSION_THRESHOLD};
pub use header::HeaderFlags;

use crate::error::CodecError;

/// Compression strategy used by the codec
pub trait BinaryPacketCompressor: Send + Sync {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
}

/// Encryption strategy used by the codec
pub trait BinaryPacketEncryptor: Send + Sync {
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
}
