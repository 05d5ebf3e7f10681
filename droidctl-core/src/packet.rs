//! A complete ADB message: header fields plus payload.

use std::fmt;

use bytes::Bytes;

use crate::header::{MessageHeader, checksum};
use crate::message::{A_STLS_VERSION, AuthType, Command};

/// One ADB message.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    pub command: Command,
    pub arg0: u32,
    pub arg1: u32,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(command: Command, arg0: u32, arg1: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            command,
            arg0,
            arg1,
            payload: payload.into(),
        }
    }

    /// `CNXN(version, max_payload, banner)`.
    pub fn connect(version: u32, max_payload: u32, banner: &str) -> Self {
        Self::new(Command::Cnxn, version, max_payload, banner.as_bytes().to_vec())
    }

    /// `STLS(A_STLS_VERSION, 0)`.
    pub fn stls() -> Self {
        Self::new(Command::Stls, A_STLS_VERSION, 0, Bytes::new())
    }

    /// `AUTH(kind, 0, data)`.
    pub fn auth(kind: AuthType, data: impl Into<Bytes>) -> Self {
        Self::new(Command::Auth, kind as u32, 0, data)
    }

    /// `OPEN(local_id, 0, destination\0)`.
    pub fn open(local_id: u32, destination: &str) -> Self {
        let mut payload = Vec::with_capacity(destination.len() + 1);
        payload.extend_from_slice(destination.as_bytes());
        payload.push(0);
        Self::new(Command::Open, local_id, 0, payload)
    }

    /// `OKAY(local_id, remote_id)`.
    pub fn okay(local_id: u32, remote_id: u32) -> Self {
        Self::new(Command::Okay, local_id, remote_id, Bytes::new())
    }

    /// `WRTE(local_id, remote_id, data)`.
    pub fn write(local_id: u32, remote_id: u32, data: impl Into<Bytes>) -> Self {
        Self::new(Command::Wrte, local_id, remote_id, data)
    }

    /// `CLSE(local_id, remote_id)`.
    pub fn close(local_id: u32, remote_id: u32) -> Self {
        Self::new(Command::Clse, local_id, remote_id, Bytes::new())
    }

    /// Header describing this packet.
    pub fn header(&self) -> MessageHeader {
        MessageHeader {
            command: self.command,
            arg0: self.arg0,
            arg1: self.arg1,
            data_length: self.payload.len() as u32,
            data_check: checksum(&self.payload),
        }
    }

    /// Payload interpreted as text with trailing NULs removed.
    pub fn payload_str(&self) -> String {
        let trimmed = match self.payload.iter().rposition(|b| *b != 0) {
            Some(end) => &self.payload[..=end],
            None => &[][..],
        };
        String::from_utf8_lossy(trimmed).into_owned()
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("command", &self.command)
            .field("arg0", &format_args!("{:#x}", self.arg0))
            .field("arg1", &format_args!("{:#x}", self.arg1))
            .field("len", &self.payload.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_is_nul_terminated() {
        let pkt = Packet::open(3, "shell:ls");
        assert_eq!(pkt.arg0, 3);
        assert_eq!(pkt.arg1, 0);
        assert_eq!(&pkt.payload[..], b"shell:ls\0");
        assert_eq!(pkt.payload_str(), "shell:ls");
    }

    #[test]
    fn header_reflects_payload() {
        let pkt = Packet::write(1, 9, &b"abc"[..]);
        let h = pkt.header();
        assert_eq!(h.command, Command::Wrte);
        assert_eq!(h.data_length, 3);
        assert_eq!(h.data_check, 97 + 98 + 99);
    }

    #[test]
    fn stls_carries_version() {
        let pkt = Packet::stls();
        assert_eq!(pkt.command, Command::Stls);
        assert_eq!(pkt.arg0, A_STLS_VERSION);
    }

    #[test]
    fn payload_str_of_empty() {
        assert_eq!(Packet::okay(1, 2).payload_str(), "");
    }
}
