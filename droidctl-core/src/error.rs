//! Domain-specific error types for ADB sessions and screen mirroring.
//!
//! All fallible operations return `Result<T, AdbError>`.
//! No panics on malformed input from the device: every failure is typed,
//! and [`AdbError::class`] maps it onto one of the four caller-facing
//! categories (connection, stream, protocol, decoder).

use std::time::Duration;
use thiserror::Error;

/// Coarse category of an [`AdbError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Transport could not be established, died, or authentication failed.
    Connection,
    /// A logical stream could not be opened or closed unexpectedly.
    Stream,
    /// Malformed or unexpected data on the wire.
    Protocol,
    /// The video decoder rejected configuration or input.
    Decoder,
    /// Local failures (files, key material, channels).
    Other,
}

/// The canonical error type for the crate.
#[derive(Debug, Error)]
pub enum AdbError {
    // ── Connection Errors ────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    /// The device could not be reached at the given address.
    #[error("cannot connect to {address}: {reason}")]
    Unreachable { address: String, reason: String },

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The handshake did not complete.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// TLS negotiation or record processing failed.
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    /// The session is closed; carries the reason it died.
    #[error("session closed: {0}")]
    SessionClosed(String),

    // ── Stream Errors ────────────────────────────────────────────
    /// The device refused to open the requested service.
    #[error("device rejected service {0:?}")]
    StreamRejected(String),

    /// The logical stream was closed by either side.
    #[error("stream closed")]
    StreamClosed,

    // ── Protocol Errors ──────────────────────────────────────────
    /// Header magic did not match the command word.
    #[error("invalid magic: command {command:#010x}, magic {magic:#010x}")]
    InvalidMagic { command: u32, magic: u32 },

    /// The payload failed checksum verification.
    #[error("checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u64 },

    /// The payload exceeds the negotiated maximum.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A packet or sub-protocol message violated protocol rules.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The device answered a sync or shell request with a failure message.
    #[error("device reported failure: {0}")]
    DeviceFailure(String),

    /// Pairing exchange failed (wrong code, malformed peer message).
    #[error("pairing failed: {0}")]
    Pairing(String),

    // ── Decoder Errors ───────────────────────────────────────────
    /// The video decoder failed to configure, accept input or render.
    #[error("decoder error: {0}")]
    Decoder(String),

    // ── Local Errors ─────────────────────────────────────────────
    /// RSA key material could not be generated, parsed or used.
    #[error("key error: {0}")]
    Key(String),

    /// The client certificate could not be generated or loaded.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// An mpsc/oneshot channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// UTF-8 conversion failed.
    #[error("invalid utf-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl AdbError {
    /// Category of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Io(_)
            | Self::Unreachable { .. }
            | Self::Timeout(_)
            | Self::Handshake(_)
            | Self::Tls(_)
            | Self::SessionClosed(_) => ErrorClass::Connection,
            Self::StreamRejected(_) | Self::StreamClosed => ErrorClass::Stream,
            Self::InvalidMagic { .. }
            | Self::ChecksumMismatch { .. }
            | Self::UnknownVariant { .. }
            | Self::PayloadTooLarge { .. }
            | Self::ProtocolViolation(_)
            | Self::DeviceFailure(_)
            | Self::Pairing(_)
            | Self::InvalidUtf8(_) => ErrorClass::Protocol,
            Self::Decoder(_) => ErrorClass::Decoder,
            Self::Key(_) | Self::Certificate(_) | Self::ChannelClosed | Self::Other(_) => {
                ErrorClass::Other
            }
        }
    }

    /// Shorthand for [`AdbError::ProtocolViolation`].
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    /// Shorthand for [`AdbError::Decoder`].
    pub fn decoder(msg: impl Into<String>) -> Self {
        Self::Decoder(msg.into())
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for AdbError {
    fn from(s: String) -> Self {
        AdbError::Other(s)
    }
}

impl From<&str> for AdbError {
    fn from(s: &str) -> Self {
        AdbError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for AdbError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        AdbError::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for AdbError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        AdbError::ChannelClosed
    }
}

impl From<rsa::Error> for AdbError {
    fn from(e: rsa::Error) -> Self {
        AdbError::Key(e.to_string())
    }
}

impl From<rcgen::Error> for AdbError {
    fn from(e: rcgen::Error) -> Self {
        AdbError::Certificate(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = AdbError::InvalidMagic {
            command: 0x4e584e43,
            magic: 0,
        };
        assert!(e.to_string().contains("magic"));

        let e = AdbError::PayloadTooLarge {
            size: 2_000_000,
            max: 1_048_576,
        };
        assert!(e.to_string().contains("2000000"));
        assert!(e.to_string().contains("1048576"));
    }

    #[test]
    fn classes() {
        assert_eq!(AdbError::Timeout(Duration::from_secs(1)).class(), ErrorClass::Connection);
        assert_eq!(AdbError::StreamRejected("tcp:1".into()).class(), ErrorClass::Stream);
        assert_eq!(AdbError::StreamClosed.class(), ErrorClass::Stream);
        assert_eq!(AdbError::protocol("bad").class(), ErrorClass::Protocol);
        assert_eq!(AdbError::decoder("no codec").class(), ErrorClass::Decoder);
        assert_eq!(AdbError::ChannelClosed.class(), ErrorClass::Other);
    }

    #[test]
    fn from_string() {
        let e: AdbError = "something broke".into();
        assert!(matches!(e, AdbError::Other(_)));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: AdbError = io_err.into();
        assert!(matches!(e, AdbError::Io(_)));
        assert_eq!(e.class(), ErrorClass::Connection);
    }
}
