//! Scripted in-process device: speaks the ADB transport over localhost TCP
//! and answers the handful of services the library uses.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use droidctl_core::auth::{AdbIdentity, CertificateOptions};
use droidctl_core::message::{A_VERSION, MAX_PAYLOAD};
use droidctl_core::protocol::shell::{ShellPacket, ShellPacketId};
use droidctl_core::{AdbCodec, Command, ConnectOptions, ConnectionInfo, Packet};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

pub const BANNER: &str =
    "device::ro.product.model=Pixel 6;ro.product.device=oriole;features=shell_v2,cmd,stat_v2";

// ── Helpers ──────────────────────────────────────────────────────

/// One identity per test binary; RSA key generation is slow.
pub fn identity() -> &'static AdbIdentity {
    static IDENTITY: OnceLock<AdbIdentity> = OnceLock::new();
    IDENTITY.get_or_init(|| {
        AdbIdentity::generate(&CertificateOptions::default())
            .unwrap()
            .0
    })
}

pub fn fast_options() -> ConnectOptions {
    ConnectOptions::default()
        .with_connect_timeout(Duration::from_secs(5))
        .with_socket_timeout(Some(Duration::from_secs(5)))
}

// ── Device behaviour ─────────────────────────────────────────────

/// How the fake device behaves and what it saw.
#[derive(Default)]
pub struct DeviceState {
    /// Chunks sent on the video stream right after it opens.
    pub video_chunks: Vec<Vec<u8>>,
    /// Leave the video stream open after the chunks.
    pub keep_video_open: bool,
    /// Reject this many video opens before accepting.
    pub video_open_failures: usize,
    /// `wm size` output.
    pub wm_size: String,
    /// `pm install` never answers.
    pub install_hangs: bool,

    pub commands: Mutex<Vec<String>>,
    pub files: Mutex<HashMap<String, Vec<u8>>>,
    /// Mode and mtime per file, as sent with `SEND` or set by a test.
    pub meta: Mutex<HashMap<String, (u32, u32)>>,
    pub control: Mutex<Vec<u8>>,
    pub video_attempts: Mutex<usize>,
    pub agent_running: Mutex<bool>,
    /// Cancel to drop every connection without a goodbye.
    pub kill: CancellationToken,
}

impl DeviceState {
    pub fn new() -> Self {
        Self {
            wm_size: "Physical size: 1080x2400\n".to_string(),
            ..Default::default()
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    /// Store a file as if it were already on the device.
    pub fn put_file(&self, path: &str, data: &[u8], mode: u32, mtime: u32) {
        self.files.lock().unwrap().insert(path.to_string(), data.to_vec());
        self.meta.lock().unwrap().insert(path.to_string(), (mode, mtime));
    }

    /// `(mode, mtime)` of a stored file.
    pub fn file_meta(&self, path: &str) -> Option<(u32, u32)> {
        self.meta.lock().unwrap().get(path).copied()
    }

    fn stat_words(&self, path: &str, size: usize) -> [u32; 3] {
        let (mode, mtime) = self.file_meta(path).unwrap_or((0o100_644, 0));
        [mode, size as u32, mtime]
    }

    pub fn control_bytes(&self) -> Vec<u8> {
        self.control.lock().unwrap().clone()
    }

    /// Canned output and exit code for a one-shot command; `None` keeps
    /// the shell open (the agent launcher).
    fn respond(&self, command: &str) -> Option<(String, i32)> {
        if command.starts_with("CLASSPATH=") {
            *self.agent_running.lock().unwrap() = true;
            return None;
        }
        let reply = match command {
            "echo 1" => ("1\n".to_string(), 0),
            "echo ok" => ("ok\n".to_string(), 0),
            "wm size" => (self.wm_size.clone(), 0),
            "getprop ro.product.model" => ("Pixel 6\n".to_string(), 0),
            "getprop ro.product.manufacturer" => ("Google\n".to_string(), 0),
            "getprop ro.build.version.release" => ("14\n".to_string(), 0),
            "getprop ro.build.version.sdk" => ("34\n".to_string(), 0),
            c if c.starts_with("pkill") => {
                let was_running = std::mem::take(&mut *self.agent_running.lock().unwrap());
                (String::new(), if was_running { 0 } else { 1 })
            }
            c if c.starts_with("chmod") => (String::new(), 0),
            c if c.starts_with("pm install") => {
                if self.install_hangs {
                    return None;
                }
                ("Performing Streamed Install\nSuccess\n".to_string(), 0)
            }
            c if c.starts_with("rm -f ") => {
                let path = c["rm -f ".len()..].trim_matches('\'');
                self.files.lock().unwrap().remove(path);
                self.meta.lock().unwrap().remove(path);
                (String::new(), 0)
            }
            c if c.starts_with("getprop") => (String::new(), 0),
            _ => (format!("/system/bin/sh: {command}: not found\n"), 127),
        };
        Some(reply)
    }
}

pub struct FakeDevice {
    pub info: ConnectionInfo,
    pub state: Arc<DeviceState>,
}

impl FakeDevice {
    pub async fn start(state: DeviceState) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let info = ConnectionInfo::new(addr.ip().to_string(), addr.port());
        let state = Arc::new(state);
        let shared = Arc::clone(&state);
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                tokio::spawn(serve(tcp, Arc::clone(&shared)));
            }
        });
        Self { info, state }
    }

    /// Drop every connection abruptly.
    pub fn kill(&self) {
        self.state.kill.cancel();
    }
}

// ── Transport ────────────────────────────────────────────────────

enum Kind {
    Launcher,
    Sync(SyncState),
    Video,
    Control,
}

#[derive(Default)]
struct SyncState {
    buf: Vec<u8>,
    /// Path, mode and data of an upload in progress.
    receiving: Option<(String, u32, Vec<u8>)>,
}

type Conn = Framed<TcpStream, AdbCodec>;

async fn serve(tcp: TcpStream, state: Arc<DeviceState>) {
    let mut conn = Framed::new(tcp, AdbCodec::new());

    // Host speaks first.
    match conn.next().await {
        Some(Ok(p)) if p.command == Command::Cnxn => {}
        _ => return,
    }
    if conn
        .send(Packet::connect(A_VERSION, MAX_PAYLOAD as u32, BANNER))
        .await
        .is_err()
    {
        return;
    }

    let mut streams: HashMap<u32, (u32, Kind)> = HashMap::new();
    let mut next_id = 100u32;
    let mut video_served = false;

    loop {
        let packet = tokio::select! {
            _ = state.kill.cancelled() => return,
            p = conn.next() => match p {
                Some(Ok(p)) => p,
                _ => return,
            },
        };
        let result = match packet.command {
            Command::Open => {
                next_id += 1;
                open(&mut conn, &state, &mut streams, &mut video_served, next_id, packet).await
            }
            Command::Wrte => {
                let (host_id, local) = (packet.arg0, packet.arg1);
                if conn.send(Packet::okay(local, host_id)).await.is_err() {
                    return;
                }
                write(&mut conn, &state, &mut streams, local, packet.payload).await
            }
            Command::Clse => {
                streams.remove(&packet.arg1);
                Ok(())
            }
            _ => Ok(()),
        };
        if result.is_err() {
            return;
        }
    }
}

async fn open(
    conn: &mut Conn,
    state: &DeviceState,
    streams: &mut HashMap<u32, (u32, Kind)>,
    video_served: &mut bool,
    local: u32,
    packet: Packet,
) -> Result<(), droidctl_core::AdbError> {
    let host_id = packet.arg0;
    let destination = packet.payload_str();

    if let Some(command) = destination.strip_prefix("shell,v2,raw:") {
        state.commands.lock().unwrap().push(command.to_string());
        conn.send(Packet::okay(local, host_id)).await?;
        match state.respond(command) {
            Some((output, code)) => {
                if !output.is_empty() {
                    let out = ShellPacket::new(ShellPacketId::Stdout, output.into_bytes());
                    conn.send(Packet::write(local, host_id, out.to_bytes())).await?;
                }
                let exit = ShellPacket::new(ShellPacketId::Exit, vec![code as u8]);
                conn.send(Packet::write(local, host_id, exit.to_bytes())).await?;
                conn.send(Packet::close(local, host_id)).await?;
            }
            None => {
                streams.insert(local, (host_id, Kind::Launcher));
            }
        }
        return Ok(());
    }

    match destination.as_str() {
        "sync:" => {
            conn.send(Packet::okay(local, host_id)).await?;
            streams.insert(local, (host_id, Kind::Sync(SyncState::default())));
        }
        "localabstract:scrcpy" => {
            let agent_up = *state.agent_running.lock().unwrap();
            if *video_served {
                // Second socket of a session: control.
                if agent_up {
                    conn.send(Packet::okay(local, host_id)).await?;
                    streams.insert(local, (host_id, Kind::Control));
                } else {
                    conn.send(Packet::close(0, host_id)).await?;
                }
                return Ok(());
            }
            let attempt = {
                let mut attempts = state.video_attempts.lock().unwrap();
                *attempts += 1;
                *attempts
            };
            if !agent_up || attempt <= state.video_open_failures {
                conn.send(Packet::close(0, host_id)).await?;
                return Ok(());
            }
            *video_served = true;
            conn.send(Packet::okay(local, host_id)).await?;
            for chunk in &state.video_chunks {
                conn.send(Packet::write(local, host_id, chunk.clone())).await?;
            }
            if state.keep_video_open {
                streams.insert(local, (host_id, Kind::Video));
            } else {
                conn.send(Packet::close(local, host_id)).await?;
            }
        }
        _ => conn.send(Packet::close(0, host_id)).await?,
    }
    Ok(())
}

async fn write(
    conn: &mut Conn,
    state: &DeviceState,
    streams: &mut HashMap<u32, (u32, Kind)>,
    local: u32,
    data: Bytes,
) -> Result<(), droidctl_core::AdbError> {
    let Some((host_id, kind)) = streams.get_mut(&local) else {
        return Ok(());
    };
    let host_id = *host_id;
    match kind {
        Kind::Control => state.control.lock().unwrap().extend_from_slice(&data),
        Kind::Sync(sync) => {
            sync.buf.extend_from_slice(&data);
            let (replies, quit) = sync_step(sync, state);
            for reply in replies {
                conn.send(Packet::write(local, host_id, reply)).await?;
            }
            if quit {
                streams.remove(&local);
                conn.send(Packet::close(local, host_id)).await?;
            }
        }
        Kind::Launcher | Kind::Video => {}
    }
    Ok(())
}

// ── Sync service ─────────────────────────────────────────────────

fn le(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn record(id: &[u8; 4], words: &[u32], tail: &[u8]) -> Vec<u8> {
    let mut out = id.to_vec();
    for w in words {
        out.extend_from_slice(&w.to_le_bytes());
    }
    out.extend_from_slice(tail);
    out
}

/// Consume every complete request in the buffer.
fn sync_step(sync: &mut SyncState, state: &DeviceState) -> (Vec<Vec<u8>>, bool) {
    let mut replies = Vec::new();
    loop {
        if sync.buf.len() < 8 {
            return (replies, false);
        }
        let id: [u8; 4] = [sync.buf[0], sync.buf[1], sync.buf[2], sync.buf[3]];
        let len = le(&sync.buf, 4) as usize;

        if let Some((path, mode, data)) = sync.receiving.as_mut() {
            match &id {
                b"DATA" => {
                    if sync.buf.len() < 8 + len {
                        return (replies, false);
                    }
                    data.extend_from_slice(&sync.buf[8..8 + len]);
                    sync.buf.drain(..8 + len);
                }
                _ => {
                    // DONE | mtime
                    sync.buf.drain(..8);
                    let (path, mode, data) = (std::mem::take(path), *mode, std::mem::take(data));
                    sync.receiving = None;
                    state.put_file(&path, &data, mode, len as u32);
                    replies.push(record(b"OKAY", &[0], &[]));
                }
            }
            continue;
        }

        if sync.buf.len() < 8 + len {
            return (replies, false);
        }
        let body = String::from_utf8_lossy(&sync.buf[8..8 + len]).into_owned();
        sync.buf.drain(..8 + len);
        let files = state.files.lock().unwrap();
        match &id {
            b"STAT" => {
                let reply = match files.get(&body) {
                    Some(data) => record(b"STAT", &state.stat_words(&body, data.len()), &[]),
                    None => record(b"STAT", &[0, 0, 0], &[]),
                };
                replies.push(reply);
            }
            b"SEND" => {
                let (path, mode) = match body.rsplit_once(',') {
                    Some((p, m)) => (p, m.parse().unwrap_or(0o100_644)),
                    None => (body.as_str(), 0o100_644),
                };
                sync.receiving = Some((path.to_string(), mode, Vec::new()));
            }
            b"LIST" => {
                let prefix = format!("{}/", body.trim_end_matches('/'));
                let mut names: Vec<_> = files
                    .iter()
                    .filter_map(|(p, d)| {
                        p.strip_prefix(&prefix)
                            .map(|n| (n.to_string(), state.stat_words(p, d.len())))
                    })
                    .collect();
                names.sort();
                for (name, [mode, size, mtime]) in names {
                    replies.push(record(
                        b"DENT",
                        &[mode, size, mtime, name.len() as u32],
                        name.as_bytes(),
                    ));
                }
                replies.push(record(b"DONE", &[0, 0, 0, 0], &[]));
            }
            b"RECV" => match files.get(&body) {
                Some(data) => {
                    for chunk in data.chunks(64 * 1024) {
                        replies.push(record(b"DATA", &[chunk.len() as u32], chunk));
                    }
                    replies.push(record(b"DONE", &[0], &[]));
                }
                None => {
                    let msg = b"No such file or directory";
                    replies.push(record(b"FAIL", &[msg.len() as u32], msg));
                }
            },
            _ => return (replies, true),
        }
    }
}
