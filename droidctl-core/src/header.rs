//! The fixed 24-byte ADB message header.
//!
//! ```text
//! offset  size  field
//!      0     4  command      (LE)
//!      4     4  arg0         (LE)
//!      8     4  arg1         (LE)
//!     12     4  data_length  (LE)
//!     16     4  data_check   (LE, byte sum of payload)
//!     20     4  magic        (command ^ 0xffffffff)
//! ```

use crate::error::AdbError;
use crate::message::Command;

/// Size of an encoded header in bytes.
pub const HEADER_SIZE: usize = 24;

/// A decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub command: Command,
    pub arg0: u32,
    pub arg1: u32,
    pub data_length: u32,
    pub data_check: u32,
}

impl MessageHeader {
    /// Serialize to the wire layout.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&(self.command as u32).to_le_bytes());
        out[4..8].copy_from_slice(&self.arg0.to_le_bytes());
        out[8..12].copy_from_slice(&self.arg1.to_le_bytes());
        out[12..16].copy_from_slice(&self.data_length.to_le_bytes());
        out[16..20].copy_from_slice(&self.data_check.to_le_bytes());
        out[20..24].copy_from_slice(&self.command.magic().to_le_bytes());
        out
    }

    /// Parse and validate a header.
    ///
    /// Fails on an unknown command word or a magic mismatch.
    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Result<Self, AdbError> {
        let word = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        let raw_command = word(0);
        let magic = word(20);
        if raw_command ^ 0xffff_ffff != magic {
            return Err(AdbError::InvalidMagic {
                command: raw_command,
                magic,
            });
        }
        Ok(Self {
            command: Command::try_from(raw_command)?,
            arg0: word(4),
            arg1: word(8),
            data_length: word(12),
            data_check: word(16),
        })
    }
}

/// Byte-sum checksum used by the `data_check` field.
pub fn checksum(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |acc, b| acc.wrapping_add(*b as u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let header = MessageHeader {
            command: Command::Open,
            arg0: 7,
            arg1: 0,
            data_length: 6,
            data_check: checksum(b"sync:\0"),
        };
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..4], b"OPEN");
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 7);
        assert_eq!(u32::from_le_bytes(bytes[12..16].try_into().unwrap()), 6);
        assert_eq!(
            u32::from_le_bytes(bytes[20..24].try_into().unwrap()),
            Command::Open.magic()
        );
        assert_eq!(MessageHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn bad_magic_rejected() {
        let mut bytes = MessageHeader {
            command: Command::Okay,
            arg0: 1,
            arg1: 2,
            data_length: 0,
            data_check: 0,
        }
        .to_bytes();
        bytes[23] ^= 0x01;
        assert!(matches!(
            MessageHeader::from_bytes(&bytes),
            Err(AdbError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn unknown_command_rejected() {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(b"XXXX");
        let magic = u32::from_le_bytes(*b"XXXX") ^ 0xffff_ffff;
        bytes[20..24].copy_from_slice(&magic.to_le_bytes());
        assert!(matches!(
            MessageHeader::from_bytes(&bytes),
            Err(AdbError::UnknownVariant { .. })
        ));
    }

    #[test]
    fn checksum_is_byte_sum() {
        assert_eq!(checksum(&[]), 0);
        assert_eq!(checksum(&[1, 2, 3, 250]), 256);
    }
}
