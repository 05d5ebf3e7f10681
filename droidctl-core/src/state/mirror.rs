//! Mirroring session lifecycle.
//!
//! ```text
//!  Idle ──► Preparing ──► Deploying ──► Connecting ──► Streaming ──► Stopped
//!              │              │              │              │
//!              └──────────────┴──────┬───────┴──────────────┘
//!                                    ▼
//!                                 Failed
//! ```
//!
//! `Stopped` and `Failed` are terminal. A stop request is honoured from
//! every non-terminal phase.

use crate::error::AdbError;

/// The current phase of a mirroring session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MirrorPhase {
    #[default]
    Idle,
    /// Surface acquired; clearing stale agents and sizing the video.
    Preparing,
    /// Pushing the agent binary.
    Deploying,
    /// Agent launched; opening video and control streams.
    Connecting,
    /// Decoder running.
    Streaming,
    /// Ended by a stop request or end of stream.
    Stopped,
    /// Ended by an error.
    Failed { reason: String },
}

impl std::fmt::Display for MirrorPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Preparing => write!(f, "Preparing"),
            Self::Deploying => write!(f, "Deploying"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Streaming => write!(f, "Streaming"),
            Self::Stopped => write!(f, "Stopped"),
            Self::Failed { reason } => write!(f, "Failed: {reason}"),
        }
    }
}

impl MirrorPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed { .. })
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming)
    }

    fn advance(&mut self, from: &MirrorPhase, to: MirrorPhase) -> Result<(), AdbError> {
        if self == from {
            *self = to;
            Ok(())
        } else {
            Err(AdbError::protocol(format!("cannot enter {to}: currently {self}")))
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Valid from: `Idle`.
    pub fn begin_prepare(&mut self) -> Result<(), AdbError> {
        self.advance(&Self::Idle, Self::Preparing)
    }

    /// Valid from: `Preparing`.
    pub fn begin_deploy(&mut self) -> Result<(), AdbError> {
        self.advance(&Self::Preparing, Self::Deploying)
    }

    /// Valid from: `Deploying`.
    pub fn begin_connect(&mut self) -> Result<(), AdbError> {
        self.advance(&Self::Deploying, Self::Connecting)
    }

    /// Valid from: `Connecting`.
    pub fn begin_streaming(&mut self) -> Result<(), AdbError> {
        self.advance(&Self::Connecting, Self::Streaming)
    }

    /// Move to `Stopped` unless already terminal.
    ///
    /// Returns `false` when the phase was already terminal.
    pub fn stop(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        *self = Self::Stopped;
        true
    }

    /// Move to `Failed` unless already terminal.
    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        *self = Self::Failed {
            reason: reason.into(),
        };
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_lifecycle() {
        let mut phase = MirrorPhase::default();
        phase.begin_prepare().unwrap();
        phase.begin_deploy().unwrap();
        phase.begin_connect().unwrap();
        phase.begin_streaming().unwrap();
        assert!(phase.is_streaming());
        assert!(phase.stop());
        assert_eq!(phase, MirrorPhase::Stopped);
    }

    #[test]
    fn skipping_a_phase_is_rejected() {
        let mut phase = MirrorPhase::Idle;
        assert!(phase.begin_deploy().is_err());
        assert_eq!(phase, MirrorPhase::Idle);
    }

    #[test]
    fn stop_from_every_non_terminal_phase() {
        for start in [
            MirrorPhase::Idle,
            MirrorPhase::Preparing,
            MirrorPhase::Deploying,
            MirrorPhase::Connecting,
            MirrorPhase::Streaming,
        ] {
            let mut phase = start;
            assert!(phase.stop());
            assert_eq!(phase, MirrorPhase::Stopped);
        }
    }

    #[test]
    fn terminal_phases_stick() {
        let mut phase = MirrorPhase::Connecting;
        assert!(phase.fail("stream refused"));
        assert!(!phase.stop());
        assert!(!phase.fail("again"));
        assert_eq!(phase.to_string(), "Failed: stream refused");
    }
}
