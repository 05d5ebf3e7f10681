//! Lifecycle state machines for transport sessions and mirroring.

pub mod mirror;
pub mod session;

pub use mirror::MirrorPhase;
pub use session::SessionPhase;
