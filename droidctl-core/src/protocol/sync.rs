//! File sync sub-protocol (`sync:` service).
//!
//! # Wire Protocol
//!
//! ```text
//! request  = id[4] | len u32 LE | path
//!
//! STAT path ──► STAT | mode u32 | size u32 | mtime u32
//! LIST path ──► (DENT | mode | size | mtime | namelen | name)* DONE | 0 | 0 | 0 | 0
//! SEND "path,mode" ──► (DATA | len | bytes)* DONE | mtime ──► OKAY | 0
//! RECV path ──► (DATA | len | bytes)* DONE | 0
//! any failure ──► FAIL | len | message
//! QUIT ──► (stream closed)
//! ```
//!
//! All integers little-endian; `DATA` chunks are at most 64 KiB.

use std::path::Path;
use std::time::{Duration, UNIX_EPOCH};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::AdbError;
use crate::network::{AdbSession, AdbStream};
use crate::protocol::service::Service;

/// Largest `DATA` chunk.
pub const SYNC_DATA_MAX: usize = 64 * 1024;

/// Longest remote path accepted by `adbd`.
pub const SYNC_PATH_MAX: usize = 1024;

const S_IFMT: u32 = 0o170_000;
const S_IFDIR: u32 = 0o040_000;
const S_IFREG: u32 = 0o100_000;
const S_IFLNK: u32 = 0o120_000;

// ── Message ids ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncId {
    Stat,
    List,
    Send,
    Recv,
    Quit,
    Dent,
    Data,
    Done,
    Okay,
    Fail,
}

impl SyncId {
    pub fn as_bytes(self) -> &'static [u8; 4] {
        match self {
            Self::Stat => b"STAT",
            Self::List => b"LIST",
            Self::Send => b"SEND",
            Self::Recv => b"RECV",
            Self::Quit => b"QUIT",
            Self::Dent => b"DENT",
            Self::Data => b"DATA",
            Self::Done => b"DONE",
            Self::Okay => b"OKAY",
            Self::Fail => b"FAIL",
        }
    }
}

impl TryFrom<[u8; 4]> for SyncId {
    type Error = AdbError;

    fn try_from(value: [u8; 4]) -> Result<Self, Self::Error> {
        match &value {
            b"STAT" => Ok(Self::Stat),
            b"LIST" => Ok(Self::List),
            b"SEND" => Ok(Self::Send),
            b"RECV" => Ok(Self::Recv),
            b"QUIT" => Ok(Self::Quit),
            b"DENT" => Ok(Self::Dent),
            b"DATA" => Ok(Self::Data),
            b"DONE" => Ok(Self::Done),
            b"OKAY" => Ok(Self::Okay),
            b"FAIL" => Ok(Self::Fail),
            _ => Err(AdbError::UnknownVariant {
                type_name: "SyncId",
                value: u32::from_le_bytes(value) as u64,
            }),
        }
    }
}

/// Encode a request: id, length and body.
pub fn encode_request(id: SyncId, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + body.len());
    out.extend_from_slice(id.as_bytes());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(body);
    out
}

fn le_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

// ── Stat / listing ───────────────────────────────────────────────

/// Result of `STAT`. A missing path reports all zeros.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemoteStat {
    pub mode: u32,
    pub size: u32,
    pub mtime: u32,
}

impl RemoteStat {
    pub fn exists(&self) -> bool {
        self.mode != 0
    }

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }
}

/// One `LIST` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub stat: RemoteStat,
}

// ── SyncClient ───────────────────────────────────────────────────

/// A `sync:` stream. Requests run one at a time.
pub struct SyncClient {
    stream: AdbStream,
}

impl SyncClient {
    pub async fn open(session: &AdbSession) -> Result<Self, AdbError> {
        Ok(Self::new(session.open_service(&Service::Sync).await?))
    }

    pub fn new(stream: AdbStream) -> Self {
        Self { stream }
    }

    async fn request(&mut self, id: SyncId, body: &[u8]) -> Result<(), AdbError> {
        if body.len() > SYNC_PATH_MAX && id != SyncId::Data {
            return Err(AdbError::protocol(format!(
                "sync path too long: {} bytes",
                body.len()
            )));
        }
        self.stream.write_all(&encode_request(id, body)).await
    }

    /// Read an `id | u32` pair.
    async fn read_header(&mut self) -> Result<(SyncId, u32), AdbError> {
        let mut raw = [0u8; 8];
        self.stream.read_exact(&mut raw).await?;
        let id = SyncId::try_from([raw[0], raw[1], raw[2], raw[3]])?;
        Ok((id, le_u32(&raw, 4)))
    }

    async fn read_failure(&mut self, len: u32) -> AdbError {
        let mut msg = vec![0u8; len.min(SYNC_DATA_MAX as u32) as usize];
        match self.stream.read_exact(&mut msg).await {
            Ok(()) => AdbError::DeviceFailure(String::from_utf8_lossy(&msg).into_owned()),
            Err(e) => e,
        }
    }

    pub async fn stat(&mut self, path: &str) -> Result<RemoteStat, AdbError> {
        self.request(SyncId::Stat, path.as_bytes()).await?;
        let mut raw = [0u8; 16];
        self.stream.read_exact(&mut raw).await?;
        if &raw[0..4] != SyncId::Stat.as_bytes() {
            return Err(AdbError::protocol("unexpected reply to STAT"));
        }
        Ok(RemoteStat {
            mode: le_u32(&raw, 4),
            size: le_u32(&raw, 8),
            mtime: le_u32(&raw, 12),
        })
    }

    pub async fn list(&mut self, path: &str) -> Result<Vec<DirEntry>, AdbError> {
        self.request(SyncId::List, path.as_bytes()).await?;
        let mut entries = Vec::new();
        loop {
            let mut raw = [0u8; 20];
            self.stream.read_exact(&mut raw).await?;
            match SyncId::try_from([raw[0], raw[1], raw[2], raw[3]])? {
                SyncId::Dent => {
                    let mut name = vec![0u8; le_u32(&raw, 16) as usize];
                    self.stream.read_exact(&mut name).await?;
                    let name = String::from_utf8_lossy(&name).into_owned();
                    if name == "." || name == ".." {
                        continue;
                    }
                    entries.push(DirEntry {
                        name,
                        stat: RemoteStat {
                            mode: le_u32(&raw, 4),
                            size: le_u32(&raw, 8),
                            mtime: le_u32(&raw, 12),
                        },
                    });
                }
                SyncId::Done => return Ok(entries),
                SyncId::Fail => return Err(self.read_failure(le_u32(&raw, 4)).await),
                other => {
                    return Err(AdbError::protocol(format!("unexpected {other:?} in LIST")));
                }
            }
        }
    }

    /// Upload everything `source` yields to `remote_path`.
    ///
    /// `mode` holds permission bits; `mtime` is seconds since the epoch.
    /// Returns the number of bytes sent.
    pub async fn push<R>(
        &mut self,
        source: &mut R,
        remote_path: &str,
        mode: u32,
        mtime: u32,
    ) -> Result<u64, AdbError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let header = format!("{remote_path},{}", S_IFREG | (mode & 0o7777));
        self.request(SyncId::Send, header.as_bytes()).await?;

        let mut buf = vec![0u8; SYNC_DATA_MAX];
        let mut total = 0u64;
        loop {
            let n = source.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            self.stream
                .write_all(&encode_request(SyncId::Data, &buf[..n]))
                .await?;
            total += n as u64;
        }

        let mut done = Vec::with_capacity(8);
        done.extend_from_slice(SyncId::Done.as_bytes());
        done.extend_from_slice(&mtime.to_le_bytes());
        self.stream.write_all(&done).await?;

        match self.read_header().await? {
            (SyncId::Okay, _) => {
                debug!(remote_path, total, "push complete");
                Ok(total)
            }
            (SyncId::Fail, len) => Err(self.read_failure(len).await),
            (other, _) => Err(AdbError::protocol(format!("unexpected {other:?} after SEND"))),
        }
    }

    /// Download `remote_path` into `sink`. Returns the number of bytes written.
    pub async fn pull<W>(&mut self, remote_path: &str, sink: &mut W) -> Result<u64, AdbError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        self.request(SyncId::Recv, remote_path.as_bytes()).await?;
        let mut total = 0u64;
        let mut buf = Vec::new();
        loop {
            match self.read_header().await? {
                (SyncId::Data, len) => {
                    if len as usize > SYNC_DATA_MAX {
                        return Err(AdbError::PayloadTooLarge {
                            size: len as usize,
                            max: SYNC_DATA_MAX,
                        });
                    }
                    buf.resize(len as usize, 0);
                    self.stream.read_exact(&mut buf).await?;
                    sink.write_all(&buf).await?;
                    total += len as u64;
                }
                (SyncId::Done, _) => break,
                (SyncId::Fail, len) => return Err(self.read_failure(len).await),
                (other, _) => {
                    return Err(AdbError::protocol(format!("unexpected {other:?} in RECV")));
                }
            }
        }
        sink.flush().await?;
        debug!(remote_path, total, "pull complete");
        Ok(total)
    }

    /// End the sync session.
    pub async fn quit(mut self) -> Result<(), AdbError> {
        self.request(SyncId::Quit, &[]).await?;
        self.stream.close();
        Ok(())
    }
}

// ── File helpers ─────────────────────────────────────────────────

/// Permission bits of a local file. Without unix modes, 0o644 (or 0o444
/// when read-only).
#[cfg(unix)]
pub fn local_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
pub fn local_mode(metadata: &std::fs::Metadata) -> u32 {
    if metadata.permissions().readonly() { 0o444 } else { 0o644 }
}

/// Push a local file, keeping its modification time.
///
/// `mode: None` sends the local file's own permission bits.
pub async fn push_file(
    session: &AdbSession,
    local: &Path,
    remote_path: &str,
    mode: Option<u32>,
) -> Result<u64, AdbError> {
    let mut file = tokio::fs::File::open(local).await?;
    let metadata = file.metadata().await?;
    let mode = mode.unwrap_or_else(|| local_mode(&metadata));
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0);
    let mut sync = SyncClient::open(session).await?;
    let total = sync.push(&mut file, remote_path, mode, mtime).await?;
    sync.quit().await?;
    Ok(total)
}

/// Push in-memory bytes.
pub async fn push_bytes(
    session: &AdbSession,
    data: &[u8],
    remote_path: &str,
    mode: u32,
) -> Result<u64, AdbError> {
    let mtime = std::time::SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0);
    let mut source = data;
    let mut sync = SyncClient::open(session).await?;
    let total = sync.push(&mut source, remote_path, mode, mtime).await?;
    sync.quit().await?;
    Ok(total)
}

/// Pull a remote file into a local path (created or truncated). The remote
/// permission bits and modification time are copied onto the local file.
pub async fn pull_file(session: &AdbSession, remote_path: &str, local: &Path) -> Result<u64, AdbError> {
    let mut sync = SyncClient::open(session).await?;
    let stat = sync.stat(remote_path).await?;
    let mut file = tokio::fs::File::create(local).await?;
    let total = sync.pull(remote_path, &mut file).await?;
    sync.quit().await?;
    if stat.exists() {
        apply_remote_stat(file, &stat).await?;
    }
    Ok(total)
}

async fn apply_remote_stat(file: tokio::fs::File, stat: &RemoteStat) -> Result<(), AdbError> {
    let file = file.into_std().await;
    let modified = UNIX_EPOCH + Duration::from_secs(u64::from(stat.mtime));
    let mode = stat.permissions();
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        file.set_modified(modified)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(mode))?;
        }
        #[cfg(not(unix))]
        let _ = mode;
        Ok(())
    })
    .await
    .map_err(|e| AdbError::Other(format!("metadata update failed: {e}")))??;
    Ok(())
}
