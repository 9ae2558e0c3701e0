//! Frame header flags

use bitflags::bitflags;

use crate::error::ProtocolError;

/// Largest payload that fits the short (u16) length field
pub const MAX_SHORT_PAYLOAD: usize = u16::MAX as usize;

bitflags! {
    /// Header byte of a frame, low bit first. The upper four bits are reserved.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HeaderFlags: u8 {
        const HAS_DATA   = 0b0000_0001;
        const COMPRESSED = 0b0000_0010;
        const BIG_SIZE   = 0b0000_0100;
        const ENCRYPTED  = 0b0000_1000;
    }
}

impl HeaderFlags {
    /// Parse a header byte, rejecting reserved bits
    pub fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        Self::from_bits(byte).ok_or(ProtocolError::ReservedHeaderBits(byte))
    }

    /// Width of the length field that follows the header byte
    pub fn length_bytes(&self) -> usize {
        if self.contains(HeaderFlags::BIG_SIZE) {
            4
        } else {
            2
        }
    }

    /// Header byte plus length field
    pub fn prefix_len(&self) -> usize {
        1 + self.length_bytes()
    }

    pub fn has_data(&self) -> bool {
        self.contains(HeaderFlags::HAS_DATA)
    }

    pub fn is_compressed(&self) -> bool {
        self.contains(HeaderFlags::COMPRESSED)
    }

    pub fn is_big_size(&self) -> bool {
        self.contains(HeaderFlags::BIG_SIZE)
    }

    pub fn is_encrypted(&self) -> bool {
        self.contains(HeaderFlags::ENCRYPTED)
    }
}
