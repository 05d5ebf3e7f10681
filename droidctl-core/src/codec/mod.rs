//! Framed I/O for ADB messages via `tokio_util::codec`.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::AdbError;
use crate::header::{HEADER_SIZE, MessageHeader, checksum};
use crate::message::MAX_PAYLOAD;
use crate::packet::Packet;

/// Decoder/encoder for [`Packet`] values.
///
/// Incoming checksums are verified only when non-zero: peers at
/// `A_VERSION` (0x01000001) are allowed to send zero.
#[derive(Debug, Clone)]
pub struct AdbCodec {
    max_payload: usize,
    /// Header parsed while waiting for the rest of its payload.
    pending: Option<MessageHeader>,
}

impl AdbCodec {
    pub fn new() -> Self {
        Self::with_max_payload(MAX_PAYLOAD)
    }

    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            max_payload,
            pending: None,
        }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }
}

impl Default for AdbCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for AdbCodec {
    type Item = Packet;
    type Error = AdbError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.pending {
            Some(h) => h,
            None => {
                if src.len() < HEADER_SIZE {
                    return Ok(None);
                }
                let mut raw = [0u8; HEADER_SIZE];
                raw.copy_from_slice(&src[..HEADER_SIZE]);
                let header = MessageHeader::from_bytes(&raw)?;
                if header.data_length as usize > self.max_payload {
                    return Err(AdbError::PayloadTooLarge {
                        size: header.data_length as usize,
                        max: self.max_payload,
                    });
                }
                src.advance(HEADER_SIZE);
                header
            }
        };

        let len = header.data_length as usize;
        if src.len() < len {
            self.pending = Some(header);
            src.reserve(len - src.len());
            return Ok(None);
        }
        self.pending = None;

        let payload = src.split_to(len).freeze();
        if header.data_check != 0 {
            let actual = checksum(&payload);
            if actual != header.data_check {
                return Err(AdbError::ChecksumMismatch {
                    expected: header.data_check,
                    actual,
                });
            }
        }

        Ok(Some(Packet {
            command: header.command,
            arg0: header.arg0,
            arg1: header.arg1,
            payload,
        }))
    }
}

impl Encoder<Packet> for AdbCodec {
    type Error = AdbError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > self.max_payload {
            return Err(AdbError::PayloadTooLarge {
                size: item.payload.len(),
                max: self.max_payload,
            });
        }
        dst.reserve(HEADER_SIZE + item.payload.len());
        dst.put_slice(&item.header().to_bytes());
        dst.put_slice(&item.payload);
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────
