//! Lifecycle of one device transport.
//!
//! Transitions are named after what happened on the wire and fail with a
//! protocol error when the session is in the wrong phase.

use std::time::{Duration, Instant};

use crate::error::AdbError;

/// Where an [`AdbSession`](crate::network::AdbSession) is in its life.
///
/// ```text
///  Disconnected ─dial─► Connecting ─link_up─► Handshaking ─online─► Connected
///       ▲                   │                     │                     │
///       │                 closed               closing               closing
///       │                   ▼                     ▼                     ▼
///       └──────closed────────────────────── Disconnecting ◄─────────────┘
/// ```
///
/// `reset` jumps to `Disconnected` from anywhere when the socket dies.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Disconnected,
    /// TCP connect in flight.
    Connecting,
    /// Socket up, exchanging CNXN / AUTH / STLS.
    Handshaking,
    /// Device sent its CNXN banner; streams may be opened.
    Connected { since: Instant, tls: bool },
    /// `close()` is tearing streams down.
    Disconnecting,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Connected { tls: true, .. } => "connected (tls)",
            Self::Connected { .. } => "connected",
            Self::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

impl SessionPhase {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    pub fn is_disconnected(&self) -> bool {
        *self == Self::Disconnected
    }

    /// Time spent online, `None` unless connected.
    pub fn uptime(&self) -> Option<Duration> {
        match self {
            Self::Connected { since, .. } => Some(since.elapsed()),
            _ => None,
        }
    }

    pub fn dial(&mut self) -> Result<(), AdbError> {
        let ok = self.is_disconnected();
        self.step(ok, Self::Connecting, "dial")
    }

    pub fn link_up(&mut self) -> Result<(), AdbError> {
        let ok = *self == Self::Connecting;
        self.step(ok, Self::Handshaking, "link_up")
    }

    pub fn online(&mut self, tls: bool) -> Result<(), AdbError> {
        let ok = *self == Self::Handshaking;
        let next = Self::Connected {
            since: Instant::now(),
            tls,
        };
        self.step(ok, next, "online")
    }

    pub fn closing(&mut self) -> Result<(), AdbError> {
        let ok = matches!(self, Self::Handshaking | Self::Connected { .. });
        self.step(ok, Self::Disconnecting, "closing")
    }

    /// Also used when a connect attempt fails before going online.
    pub fn closed(&mut self) -> Result<(), AdbError> {
        let ok = matches!(
            self,
            Self::Connecting | Self::Handshaking | Self::Disconnecting
        );
        self.step(ok, Self::Disconnected, "closed")
    }

    /// Transport died underneath us.
    pub fn reset(&mut self) {
        *self = Self::Disconnected;
    }

    fn step(&mut self, allowed: bool, next: Self, event: &str) -> Result<(), AdbError> {
        if !allowed {
            return Err(AdbError::protocol(format!(
                "session event `{event}` is invalid while {self}"
            )));
        }
        *self = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn online(tls: bool) -> SessionPhase {
        SessionPhase::Connected {
            since: Instant::now(),
            tls,
        }
    }

    #[test]
    fn connect_then_close() {
        let mut phase = SessionPhase::default();
        phase.dial().unwrap();
        phase.link_up().unwrap();
        phase.online(false).unwrap();
        assert!(phase.is_connected());
        assert!(phase.uptime().is_some());

        phase.closing().unwrap();
        assert_eq!(phase, SessionPhase::Disconnecting);
        phase.closed().unwrap();
        assert!(phase.is_disconnected());
        assert!(phase.uptime().is_none());
    }

    #[test]
    fn cannot_dial_while_online() {
        let mut phase = online(true);
        let err = phase.dial().unwrap_err();
        assert!(err.to_string().contains("connected (tls)"));
        assert!(phase.is_connected());
    }

    #[test]
    fn online_requires_handshake() {
        let mut phase = SessionPhase::Connecting;
        assert!(phase.online(false).is_err());
        assert_eq!(phase, SessionPhase::Connecting);
    }

    #[test]
    fn rejected_handshake_goes_straight_to_disconnected() {
        let mut phase = SessionPhase::Handshaking;
        phase.closed().unwrap();
        assert!(phase.is_disconnected());
    }

    #[test]
    fn closed_is_not_valid_from_connected() {
        let mut phase = online(false);
        assert!(phase.closed().is_err());
        phase.reset();
        assert!(phase.is_disconnected());
    }
}
