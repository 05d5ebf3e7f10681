//! Service-level protocols carried inside logical streams.
//!
//! - **service**: destination strings (`shell,v2,raw:`, `sync:`, `localabstract:`...)
//! - **shell**: shell v2 packet framing and interactive shells
//! - **sync**: file push/pull/stat/list
//! - **control**: mirroring agent control messages (touch injection)

pub mod control;
pub mod service;
pub mod shell;
pub mod sync;

pub use control::{TouchAction, TouchEvent};
pub use service::{Service, ShellMode, ShellProtocol, quote};
pub use shell::{ShellEvent, ShellResponse, ShellStream};
pub use sync::{DirEntry, RemoteStat, SyncClient};
