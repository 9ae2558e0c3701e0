//! Error handling module
//!
//! Defines custom error types for the Rustscape network core.

use std::io;
use std::net::IpAddr;

use thiserror::Error;

/// Main error type for the Rustscape network core
#[derive(Error, Debug)]
pub enum RustscapeError {
    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Wire protocol errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Outbound queue backpressure
    #[error("Packet queue error: {0}")]
    Queue(#[from] PacketQueueError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Network-specific errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection timeout")]
    Timeout,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Session not found: {0}")]
    SessionNotFound(u64),

    #[error("Session {0} is not active")]
    SessionInactive(u64),
}

/// Wire protocol errors. All of them are fatal for the connection that produced them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Reserved header bits set: {0:#04x}")]
    ReservedHeaderBits(u8),

    #[error("Truncated frame header: need {needed} bytes, got {available}")]
    TruncatedHeader { needed: usize, available: usize },

    #[error("Frame length mismatch: declared {declared}, available {available}")]
    LengthMismatch { declared: usize, available: usize },

    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Frame without data flag declares {0} payload bytes")]
    UnexpectedPayload(usize),

    #[error("Compressed frame received but no compressor is configured")]
    MissingCompressor,

    #[error("Encrypted frame received but no encryptor is configured")]
    MissingEncryptor,

    #[error("Codec failure: {0}")]
    Codec(#[from] CodecError),
}

/// Errors raised by compressor and encryptor strategies
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Compression failed: {0}")]
    Compression(String),

    #[error("Decompression failed: {0}")]
    Decompression(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),
}

/// Outbound queue rejections. The packet is dropped, the session is kept.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketQueueError {
    #[error("Packet queue is full (max size: {max_size})")]
    Full { max_size: usize },

    #[error("Packet rejected by queue policy: {0}")]
    PolicyViolation(String),
}

/// Admission refusals, raised before a session exists
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefusedConnection {
    #[error("IP {0} is banned")]
    Banned(IpAddr),

    #[error("Too many connections from {ip} (max: {max})")]
    TooManyConnections { ip: IpAddr, max: usize },
}

/// Result type alias for Rustscape operations
pub type Result<T> = std::result::Result<T, RustscapeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = NetworkError::ConnectionClosed;
        assert_eq!(err.to_string(), "Connection closed");

        let err = ProtocolError::ReservedHeaderBits(0x10);
        assert_eq!(err.to_string(), "Reserved header bits set: 0x10");

        let err = PacketQueueError::Full { max_size: 2 };
        assert_eq!(err.to_string(), "Packet queue is full (max size: 2)");

        let err = RefusedConnection::TooManyConnections {
            ip: "10.0.0.1".parse().unwrap(),
            max: 2,
        };
        assert_eq!(err.to_string(), "Too many connections from 10.0.0.1 (max: 2)");
    }

    #[test]
    fn test_error_conversion() {
        let err: RustscapeError = PacketQueueError::PolicyViolation("low priority".into()).into();
        assert!(matches!(err, RustscapeError::Queue(_)));

        let err: ProtocolError = CodecError::Decryption("bad key".into()).into();
        assert_eq!(err.to_string(), "Codec failure: Decryption failed: bad key");
    }
}
