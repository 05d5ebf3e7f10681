//! ADB command words and AUTH sub-types.
//!
//! Uses proper enums with `TryFrom`; unknown values are errors, never panics.

use crate::error::AdbError;
use std::fmt;

// ── Protocol constants ───────────────────────────────────────────

/// Protocol version advertised in `CNXN`. Peers at this version may
/// skip the payload checksum.
pub const A_VERSION: u32 = 0x0100_0001;

/// Oldest protocol version (checksums mandatory).
pub const A_VERSION_MIN: u32 = 0x0100_0000;

/// Version carried in the `STLS` exchange.
pub const A_STLS_VERSION: u32 = 0x0100_0000;

/// Maximum payload we advertise and accept (1 MiB).
pub const MAX_PAYLOAD: usize = 1024 * 1024;

// ── Command ──────────────────────────────────────────────────────

/// Every command word used on an ADB transport.
///
/// Each value is the little-endian encoding of its four ASCII letters.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Sync request (USB only, unused by TCP transports).
    Sync = 0x434e_5953,
    /// Connection handshake.
    Cnxn = 0x4e58_4e43,
    /// Authentication exchange.
    Auth = 0x4854_5541,
    /// Open a logical stream to a service.
    Open = 0x4e45_504f,
    /// Stream accepted / write acknowledged.
    Okay = 0x5941_4b4f,
    /// Close a logical stream.
    Clse = 0x4553_4c43,
    /// Stream payload.
    Wrte = 0x4554_5257,
    /// Upgrade the transport to TLS.
    Stls = 0x534c_5453,
}

impl Command {
    /// The value that must appear in the header's `magic` field.
    pub fn magic(self) -> u32 {
        (self as u32) ^ 0xffff_ffff
    }
}

impl TryFrom<u32> for Command {
    type Error = AdbError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0x434e_5953 => Ok(Command::Sync),
            0x4e58_4e43 => Ok(Command::Cnxn),
            0x4854_5541 => Ok(Command::Auth),
            0x4e45_504f => Ok(Command::Open),
            0x5941_4b4f => Ok(Command::Okay),
            0x4553_4c43 => Ok(Command::Clse),
            0x4554_5257 => Ok(Command::Wrte),
            0x534c_5453 => Ok(Command::Stls),
            _ => Err(AdbError::UnknownVariant {
                type_name: "Command",
                value: value as u64,
            }),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Sync => "SYNC",
            Command::Cnxn => "CNXN",
            Command::Auth => "AUTH",
            Command::Open => "OPEN",
            Command::Okay => "OKAY",
            Command::Clse => "CLSE",
            Command::Wrte => "WRTE",
            Command::Stls => "STLS",
        };
        f.write_str(name)
    }
}

// ── AuthType ─────────────────────────────────────────────────────

/// `arg0` of an `AUTH` message.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthType {
    /// Device → host: random token to sign.
    Token = 1,
    /// Host → device: signature over the token.
    Signature = 2,
    /// Host → device: public key for the user to accept.
    RsaPublicKey = 3,
}

impl TryFrom<u32> for AuthType {
    type Error = AdbError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(AuthType::Token),
            2 => Ok(AuthType::Signature),
            3 => Ok(AuthType::RsaPublicKey),
            _ => Err(AdbError::UnknownVariant {
                type_name: "AuthType",
                value: value as u64,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_words_spell_ascii() {
        assert_eq!(&(Command::Cnxn as u32).to_le_bytes(), b"CNXN");
        assert_eq!(&(Command::Okay as u32).to_le_bytes(), b"OKAY");
        assert_eq!(&(Command::Wrte as u32).to_le_bytes(), b"WRTE");
        assert_eq!(&(Command::Stls as u32).to_le_bytes(), b"STLS");
    }

    #[test]
    fn command_try_from_roundtrip() {
        for cmd in [
            Command::Sync,
            Command::Cnxn,
            Command::Auth,
            Command::Open,
            Command::Okay,
            Command::Clse,
            Command::Wrte,
            Command::Stls,
        ] {
            assert_eq!(Command::try_from(cmd as u32).unwrap(), cmd);
        }
    }

    #[test]
    fn command_unknown_is_error() {
        let err = Command::try_from(0xdead_beef).unwrap_err();
        assert!(matches!(err, AdbError::UnknownVariant { type_name: "Command", .. }));
    }

    #[test]
    fn magic_is_complement() {
        assert_eq!(Command::Cnxn.magic(), 0xb1a7_b1bc);
    }

    #[test]
    fn auth_type_parse() {
        assert_eq!(AuthType::try_from(1).unwrap(), AuthType::Token);
        assert!(AuthType::try_from(9).is_err());
    }

    #[test]
    fn display_names() {
        assert_eq!(Command::Clse.to_string(), "CLSE");
    }
}
