//! Shell protocol v2 framing and interactive shell streams.
//!
//! # Wire Protocol
//!
//! ```text
//! Host ──[OPEN "shell,v2,raw:<cmd>"]──────────────► Device
//!
//! Device ──[WRTE: id=1 stdout | len u32 LE | data]─► Host   (repeated)
//! Device ──[WRTE: id=2 stderr | len u32 LE | data]─► Host   (repeated)
//! Device ──[WRTE: id=3 exit   | len=1      | code]─► Host
//!
//! Host ──[WRTE: id=0 stdin | len | data]──────────► Device
//! Host ──[WRTE: id=4 close-stdin | len=0]─────────► Device
//! Host ──[WRTE: id=5 window-size | "RxC,XxY\0"]───► Device
//! ```
//!
//! Packet boundaries are independent of `WRTE` boundaries; the decoder
//! reassembles across them.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::AdbError;
use crate::network::AdbStream;
use crate::protocol::service::ShellProtocol;

/// `id` byte plus `u32` length.
pub const SHELL_HEADER_SIZE: usize = 5;

const MAX_SHELL_PACKET: usize = 16 * 1024 * 1024;

// ── Packet ids ───────────────────────────────────────────────────

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShellPacketId {
    Stdin = 0,
    Stdout = 1,
    Stderr = 2,
    Exit = 3,
    CloseStdin = 4,
    WindowSizeChange = 5,
}

impl TryFrom<u8> for ShellPacketId {
    type Error = AdbError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Stdin),
            1 => Ok(Self::Stdout),
            2 => Ok(Self::Stderr),
            3 => Ok(Self::Exit),
            4 => Ok(Self::CloseStdin),
            5 => Ok(Self::WindowSizeChange),
            _ => Err(AdbError::UnknownVariant {
                type_name: "ShellPacketId",
                value: value as u64,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellPacket {
    pub id: ShellPacketId,
    pub data: Bytes,
}

impl ShellPacket {
    pub fn new(id: ShellPacketId, data: impl Into<Bytes>) -> Self {
        Self {
            id,
            data: data.into(),
        }
    }

    /// Encode into a standalone buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SHELL_HEADER_SIZE + self.data.len());
        out.push(self.id as u8);
        out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.data);
        out
    }
}

/// `tokio_util` codec for shell v2 packets.
#[derive(Debug, Default, Clone)]
pub struct ShellCodec;

impl Decoder for ShellCodec {
    type Item = ShellPacket;
    type Error = AdbError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < SHELL_HEADER_SIZE {
            return Ok(None);
        }
        let id = ShellPacketId::try_from(src[0])?;
        let len = u32::from_le_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if len > MAX_SHELL_PACKET {
            return Err(AdbError::PayloadTooLarge {
                size: len,
                max: MAX_SHELL_PACKET,
            });
        }
        if src.len() < SHELL_HEADER_SIZE + len {
            src.reserve(SHELL_HEADER_SIZE + len - src.len());
            return Ok(None);
        }
        src.advance(SHELL_HEADER_SIZE);
        let data = src.split_to(len).freeze();
        Ok(Some(ShellPacket { id, data }))
    }
}

impl Encoder<ShellPacket> for ShellCodec {
    type Error = AdbError;

    fn encode(&mut self, item: ShellPacket, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(SHELL_HEADER_SIZE + item.data.len());
        dst.put_u8(item.id as u8);
        dst.put_u32_le(item.data.len() as u32);
        dst.put_slice(&item.data);
        Ok(())
    }
}

// ── Results ──────────────────────────────────────────────────────

/// One decoded piece of shell output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    Stdout(Bytes),
    Stderr(Bytes),
    Exit(i32),
}

/// Collected result of a one-shot shell command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellResponse {
    /// Standard output.
    pub output: String,
    /// Standard error (always empty for legacy shells, which merge it).
    pub error_output: String,
    pub exit_code: i32,
}

impl ShellResponse {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout followed by stderr.
    pub fn all_output(&self) -> String {
        let mut all = self.output.clone();
        all.push_str(&self.error_output);
        all
    }
}

// ── ShellStream ──────────────────────────────────────────────────

/// An open shell service, framed according to its protocol.
pub struct ShellStream {
    stream: AdbStream,
    protocol: ShellProtocol,
    codec: ShellCodec,
    buf: BytesMut,
    exit_code: Option<i32>,
}

impl ShellStream {
    pub fn new(stream: AdbStream, protocol: ShellProtocol) -> Self {
        Self {
            stream,
            protocol,
            codec: ShellCodec,
            buf: BytesMut::new(),
            exit_code: None,
        }
    }

    pub fn protocol(&self) -> ShellProtocol {
        self.protocol
    }

    /// Exit status, once seen.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Next stdout/stderr/exit event; `None` once the stream closes.
    pub async fn next_event(&mut self) -> Result<Option<ShellEvent>, AdbError> {
        if self.protocol == ShellProtocol::V1 {
            return Ok(self.stream.read_chunk().await?.map(ShellEvent::Stdout));
        }
        loop {
            if let Some(packet) = self.codec.decode(&mut self.buf)? {
                match packet.id {
                    ShellPacketId::Stdout => return Ok(Some(ShellEvent::Stdout(packet.data))),
                    ShellPacketId::Stderr => return Ok(Some(ShellEvent::Stderr(packet.data))),
                    ShellPacketId::Exit => {
                        let code = packet.data.first().copied().unwrap_or(0) as i32;
                        self.exit_code = Some(code);
                        return Ok(Some(ShellEvent::Exit(code)));
                    }
                    // Host-bound streams carry nothing else.
                    _ => continue,
                }
            }
            match self.stream.read_chunk().await? {
                Some(chunk) => self.buf.extend_from_slice(&chunk),
                None if self.buf.is_empty() => return Ok(None),
                None => return Err(AdbError::protocol("shell stream ended mid-packet")),
            }
        }
    }

    pub async fn write_stdin(&mut self, data: &[u8]) -> Result<(), AdbError> {
        match self.protocol {
            ShellProtocol::V1 => self.stream.write_all(data).await,
            ShellProtocol::V2 => {
                let packet = ShellPacket::new(ShellPacketId::Stdin, Bytes::copy_from_slice(data));
                self.stream.write_all(&packet.to_bytes()).await
            }
        }
    }

    /// Signal end of input. Legacy shells have no way to express this.
    pub async fn close_stdin(&mut self) -> Result<(), AdbError> {
        match self.protocol {
            ShellProtocol::V1 => Ok(()),
            ShellProtocol::V2 => {
                let packet = ShellPacket::new(ShellPacketId::CloseStdin, Bytes::new());
                self.stream.write_all(&packet.to_bytes()).await
            }
        }
    }

    /// Report a terminal size change (pty shells).
    pub async fn resize(&mut self, rows: u16, cols: u16) -> Result<(), AdbError> {
        if self.protocol == ShellProtocol::V1 {
            return Ok(());
        }
        let text = format!("{rows}x{cols},0x0\0");
        let packet = ShellPacket::new(ShellPacketId::WindowSizeChange, text.into_bytes());
        self.stream.write_all(&packet.to_bytes()).await
    }

    /// Read until the stream closes, gathering output and exit status.
    ///
    /// A v2 stream that closes without an exit packet is a protocol error.
    pub async fn collect(mut self) -> Result<ShellResponse, AdbError> {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Some(event) = self.next_event().await? {
            match event {
                ShellEvent::Stdout(data) => stdout.extend_from_slice(&data),
                ShellEvent::Stderr(data) => stderr.extend_from_slice(&data),
                // adbd closes right after the exit packet.
                ShellEvent::Exit(_) => {}
            }
        }
        let exit_code = match (self.protocol, self.exit_code) {
            (_, Some(code)) => code,
            (ShellProtocol::V1, None) => 0,
            (ShellProtocol::V2, None) => {
                return Err(AdbError::protocol("shell closed without an exit status"));
            }
        };
        Ok(ShellResponse {
            output: String::from_utf8_lossy(&stdout).into_owned(),
            error_output: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }

    pub fn close(&self) {
        self.stream.close();
    }

    pub fn into_inner(self) -> AdbStream {
        self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_layout() {
        let bytes = ShellPacket::new(ShellPacketId::Stdout, &b"hi"[..]).to_bytes();
        assert_eq!(bytes, vec![1, 2, 0, 0, 0, b'h', b'i']);
    }

    #[test]
    fn decoder_reassembles_split_packets() {
        let mut wire = BytesMut::new();
        let mut codec = ShellCodec;
        codec
            .encode(ShellPacket::new(ShellPacketId::Stdout, &b"hello"[..]), &mut wire)
            .unwrap();
        codec
            .encode(ShellPacket::new(ShellPacketId::Exit, vec![3u8]), &mut wire)
            .unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&wire[..3]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&wire[3..]);

        let out = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(out.id, ShellPacketId::Stdout);
        assert_eq!(&out.data[..], b"hello");
        let exit = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(exit.id, ShellPacketId::Exit);
        assert_eq!(&exit.data[..], &[3]);
        assert!(buf.is_empty());
    }

    #[test]
    fn unknown_id_is_error() {
        let mut buf = BytesMut::from(&[9u8, 0, 0, 0, 0][..]);
        assert!(ShellCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn response_helpers() {
        let r = ShellResponse {
            output: "out\n".into(),
            error_output: "err\n".into(),
            exit_code: 0,
        };
        assert!(r.success());
        assert_eq!(r.all_output(), "out\nerr\n");
    }
}
