//! # droidctl-core
//!
//! ADB transport and screen-mirroring library for Android devices reached
//! over the network.
//!
//! This crate contains:
//! - **Wire types**: `MessageHeader`, `Packet`, `Command` and `AdbCodec` for framed TCP I/O
//! - **Auth**: RSA device keys, TLS client identity and SPAKE2 pairing
//! - **Network**: `AdbSession`, a multiplexed device connection, and its `AdbStream`s
//! - **Protocol**: shell v2, sync and mirroring-agent control messages
//! - **Command / Device**: `CommandChannel` shell helpers and `DeviceQuery`
//! - **Registry**: `ConnectionRegistry` of live sessions keyed by address
//! - **Mirror**: `MirrorController` with its decoder, surface and input seams
//! - **State**: session and mirroring state machines
//! - **Error**: `AdbError`, a `thiserror`-based error hierarchy

pub mod auth;
pub mod codec;
pub mod command;
pub mod device;
pub mod error;
pub mod header;
pub mod message;
pub mod mirror;
pub mod network;
pub mod packet;
pub mod protocol;
pub mod registry;
pub mod state;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use auth::{AdbIdentity, AdbKeyPair, CertificateStore, FileCertificateStore, get_or_create_identity};
pub use codec::AdbCodec;
pub use command::CommandChannel;
pub use device::{DeviceFullInfo, DeviceInfo, DeviceQuery, KeyCode, MemorySummary, ProcessInfo};
pub use error::{AdbError, ErrorClass};
pub use header::{HEADER_SIZE, MessageHeader};
pub use message::{Command, MAX_PAYLOAD};
pub use network::{AdbSession, AdbStream, ConnectOptions, ConnectionInfo, DeviceBanner};
pub use packet::Packet;
pub use registry::{ConnectionRegistry, ManagedSession};
pub use state::{MirrorPhase, SessionPhase};

pub use mirror::{
    FrameStats, InputInjector, MirrorController, MirrorOptions, MirrorStatus, QualityPreset,
    RenderSurface, VideoDecoder, VideoSize,
};
