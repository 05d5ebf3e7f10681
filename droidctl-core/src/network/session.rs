//! One authenticated transport to one device.
//!
//! The session owns a reader task and a writer task over the framed
//! socket. Callers open logical streams with [`AdbSession::open_stream`];
//! the reader task routes `OKAY` / `WRTE` / `CLSE` to the right stream by
//! local id. When the socket dies every open stream fails and further
//! opens are refused with the recorded reason.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::auth::cert::AdbIdentity;
use crate::auth::pairing;
use crate::codec::AdbCodec;
use crate::error::AdbError;
use crate::message::Command;
use crate::network::handshake::{self, DeviceBanner, Handshake};
use crate::network::stream::{AdbStream, StreamSlot};
use crate::network::{BoxedIo, ConnectOptions, ConnectionInfo};
use crate::packet::Packet;
use crate::protocol::service::Service;
use crate::state::SessionPhase;

type PacketSink = SplitSink<Framed<BoxedIo, AdbCodec>, Packet>;
type PacketStream = SplitStream<Framed<BoxedIo, AdbCodec>>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── Shared state ─────────────────────────────────────────────────

/// State shared between the session handle, its I/O tasks and streams.
pub(crate) struct Shared {
    outbound: mpsc::UnboundedSender<Packet>,
    streams: Mutex<HashMap<u32, StreamSlot>>,
    shutdown: CancellationToken,
    failure: Mutex<Option<String>>,
    phase: Mutex<SessionPhase>,
}

impl Shared {
    pub(crate) fn send(&self, packet: Packet) -> Result<(), AdbError> {
        if self.is_shut_down() {
            return Err(self.closed_error());
        }
        trace!(?packet, "queue");
        self.outbound.send(packet).map_err(|_| self.closed_error())
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub(crate) fn failure(&self) -> Option<String> {
        lock(&self.failure).clone()
    }

    fn closed_error(&self) -> AdbError {
        AdbError::SessionClosed(
            self.failure()
                .unwrap_or_else(|| "session is shut down".to_string()),
        )
    }

    /// Remove a stream's slot. Returns whether it was still registered.
    pub(crate) fn remove_stream(&self, local_id: u32) -> bool {
        lock(&self.streams).remove(&local_id).is_some()
    }

    /// Route one inbound packet.
    fn dispatch(&self, packet: Packet) {
        trace!(?packet, "recv");
        match packet.command {
            Command::Okay => {
                let (remote_id, local_id) = (packet.arg0, packet.arg1);
                let mut streams = lock(&self.streams);
                match streams.get_mut(&local_id) {
                    Some(slot) => match slot.pending_open.take() {
                        Some(opened) => {
                            slot.remote_id = remote_id;
                            let _ = opened.send(Ok(remote_id));
                        }
                        None => {
                            let _ = slot.ack_tx.send(());
                        }
                    },
                    None => debug!(local_id, "OKAY for unknown stream"),
                }
            }
            Command::Wrte => {
                let (remote_id, local_id) = (packet.arg0, packet.arg1);
                let delivered = lock(&self.streams)
                    .get(&local_id)
                    .map(|slot| slot.data_tx.send(Ok(packet.payload)).is_ok())
                    .unwrap_or(false);
                if !delivered {
                    debug!(local_id, "WRTE for unknown or abandoned stream");
                    self.remove_stream(local_id);
                    let _ = self.send(Packet::close(local_id, remote_id));
                }
            }
            Command::Clse => {
                let local_id = packet.arg1;
                if let Some(mut slot) = lock(&self.streams).remove(&local_id) {
                    match slot.pending_open.take() {
                        Some(opened) => {
                            let _ = opened.send(Err(AdbError::StreamRejected(slot.destination)));
                        }
                        None => debug!(local_id, destination = %slot.destination, "closed by device"),
                    }
                }
            }
            Command::Open => {
                // Reverse connections are not offered.
                let _ = self.send(Packet::close(0, packet.arg0));
            }
            other => warn!("unexpected {other} after handshake"),
        }
    }

    /// Mark the transport dead and fail every stream.
    fn fail(&self, reason: String) {
        {
            let mut failure = lock(&self.failure);
            if failure.is_none() {
                *failure = Some(reason.clone());
            }
        }
        lock(&self.phase).reset();
        let slots: Vec<StreamSlot> = lock(&self.streams).drain().map(|(_, slot)| slot).collect();
        for mut slot in slots {
            match slot.pending_open.take() {
                Some(opened) => {
                    let _ = opened.send(Err(AdbError::SessionClosed(reason.clone())));
                }
                None => {
                    let _ = slot.data_tx.send(Err(AdbError::SessionClosed(reason.clone())));
                }
            }
        }
        self.shutdown.cancel();
    }
}

// ── I/O tasks ────────────────────────────────────────────────────

async fn write_loop(
    mut sink: PacketSink,
    mut outbound: mpsc::UnboundedReceiver<Packet>,
    shared: Arc<Shared>,
) {
    loop {
        tokio::select! {
            // Drain queued packets (e.g. final CLSEs) before honouring shutdown.
            biased;
            packet = outbound.recv() => match packet {
                Some(packet) => {
                    if let Err(e) = sink.send(packet).await {
                        shared.fail(format!("write failed: {e}"));
                        break;
                    }
                }
                None => break,
            },
            _ = shared.shutdown.cancelled() => break,
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(mut stream: PacketStream, shared: Arc<Shared>) {
    let reason = loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break None,
            item = stream.next() => match item {
                Some(Ok(packet)) => shared.dispatch(packet),
                Some(Err(e)) => break Some(format!("read failed: {e}")),
                None => break Some("connection closed by device".to_string()),
            },
        }
    };
    if let Some(reason) = reason {
        warn!("session lost: {reason}");
        shared.fail(reason);
    }
}

// ── AdbSession ───────────────────────────────────────────────────

/// An authenticated, multiplexed connection to one device.
pub struct AdbSession {
    target: ConnectionInfo,
    banner: DeviceBanner,
    protocol_version: u32,
    max_payload: usize,
    socket_timeout: Option<Duration>,
    next_local_id: AtomicU32,
    closing: AtomicBool,
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for AdbSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdbSession")
            .field("target", &self.target)
            .field("phase", &self.phase())
            .finish()
    }
}

impl AdbSession {
    /// Connect, authenticate (RSA or TLS) and start the I/O tasks.
    ///
    /// TCP connect plus handshake are bounded by `options.connect_timeout`.
    pub async fn connect(
        target: &ConnectionInfo,
        identity: &AdbIdentity,
        options: &ConnectOptions,
    ) -> Result<Self, AdbError> {
        let mut phase = SessionPhase::default();
        phase.dial()?;
        info!(%target, "connecting");

        let deadline = options.connect_timeout;
        let attempt = tokio::time::timeout(deadline, async {
            let tcp = TcpStream::connect(target.to_string())
                .await
                .map_err(|e| AdbError::Unreachable {
                    address: target.to_string(),
                    reason: e.to_string(),
                })?;
            tcp.set_nodelay(true)?;
            phase.link_up()?;
            let framed = Framed::new(
                Box::new(tcp) as BoxedIo,
                AdbCodec::with_max_payload(options.max_payload),
            );
            handshake::perform(framed, target, identity, options).await
        })
        .await;

        let handshake = match attempt {
            Ok(Ok(handshake)) => handshake,
            Ok(Err(e)) => {
                let _ = phase.closed();
                warn!(%target, "connect failed: {e}");
                return Err(e);
            }
            Err(_) => {
                let _ = phase.closed();
                warn!(%target, "connect timed out after {deadline:?}");
                return Err(AdbError::Timeout(deadline));
            }
        };
        phase.online(handshake.tls)?;
        Ok(Self::start(target.clone(), handshake, options, phase))
    }

    fn start(
        target: ConnectionInfo,
        handshake: Handshake,
        options: &ConnectOptions,
        phase: SessionPhase,
    ) -> Self {
        let Handshake {
            framed,
            banner,
            protocol_version,
            max_payload,
            ..
        } = handshake;
        let (sink, stream) = framed.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            outbound: outbound_tx,
            streams: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            failure: Mutex::new(None),
            phase: Mutex::new(phase),
        });

        let writer = tokio::spawn(write_loop(sink, outbound_rx, Arc::clone(&shared)));
        let reader = tokio::spawn(read_loop(stream, Arc::clone(&shared)));

        Self {
            target,
            banner,
            protocol_version,
            max_payload,
            socket_timeout: options.socket_timeout,
            next_local_id: AtomicU32::new(1),
            closing: AtomicBool::new(false),
            shared,
            tasks: Mutex::new(vec![reader, writer]),
        }
    }

    /// Pair with a device's pairing service. Never errors: failure of
    /// any kind (including a wrong code) is `false`.
    pub async fn pair(
        target: &ConnectionInfo,
        code: &str,
        identity: &AdbIdentity,
        options: &ConnectOptions,
    ) -> bool {
        match pairing::pair(target, code, identity, options.connect_timeout).await {
            Ok(_) => true,
            Err(e) => {
                warn!(%target, "pairing failed: {e}");
                false
            }
        }
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn target(&self) -> &ConnectionInfo {
        &self.target
    }

    pub fn banner(&self) -> &DeviceBanner {
        &self.banner
    }

    pub fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    /// Largest `WRTE` payload this session sends.
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    pub fn socket_timeout(&self) -> Option<Duration> {
        self.socket_timeout
    }

    pub fn supports_feature(&self, feature: &str) -> bool {
        self.banner.has_feature(feature)
    }

    pub fn phase(&self) -> SessionPhase {
        lock(&self.shared.phase).clone()
    }

    /// Whether the transport has shut down (closed locally or died).
    pub fn is_closed(&self) -> bool {
        self.shared.is_shut_down()
    }

    /// Why the transport shut down, if it has.
    pub fn failure_reason(&self) -> Option<String> {
        self.shared.failure()
    }

    // ── Streams ──────────────────────────────────────────────────

    /// Open a logical stream to `destination` (e.g. `"shell,v2,raw:ls"`).
    ///
    /// Fails with a stream error if the device rejects the service and
    /// with a connection error if the session is dead.
    pub async fn open_stream(&self, destination: &str) -> Result<AdbStream, AdbError> {
        if self.shared.is_shut_down() {
            return Err(self.shared.closed_error());
        }
        let local_id = self.next_local_id.fetch_add(1, Ordering::Relaxed);
        let (opened_tx, opened_rx) = oneshot::channel();
        let (slot, channels) = StreamSlot::new(destination, opened_tx);
        lock(&self.shared.streams).insert(local_id, slot);

        // The session may have died between the check and the insert.
        if self.shared.is_shut_down() {
            self.shared.remove_stream(local_id);
            return Err(self.shared.closed_error());
        }
        if let Err(e) = self.shared.send(Packet::open(local_id, destination)) {
            self.shared.remove_stream(local_id);
            return Err(e);
        }

        let reply = match self.socket_timeout {
            Some(t) => match tokio::time::timeout(t, opened_rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    self.shared.remove_stream(local_id);
                    return Err(AdbError::Timeout(t));
                }
            },
            None => opened_rx.await,
        };
        let remote_id = match reply {
            Ok(Ok(remote_id)) => remote_id,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(self.shared.closed_error()),
        };

        debug!(local_id, remote_id, destination, "stream opened");
        Ok(AdbStream::new(
            local_id,
            remote_id,
            destination.to_string(),
            Arc::clone(&self.shared),
            channels,
            self.max_payload,
            self.socket_timeout,
        ))
    }

    /// Open a stream to a typed service.
    pub async fn open_service(&self, service: &Service) -> Result<AdbStream, AdbError> {
        self.open_stream(&service.to_destination()).await
    }

    // ── Liveness / shutdown ──────────────────────────────────────

    /// Probe with `echo 1`, bounded by the socket timeout.
    ///
    /// Any failure, including a dead transport, is `false`.
    pub async fn is_alive(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        let probe = crate::command::run_shell(self, "echo 1");
        let result = match self.socket_timeout {
            Some(t) => tokio::time::timeout(t, probe)
                .await
                .unwrap_or(Err(AdbError::Timeout(t))),
            None => probe.await,
        };
        match result {
            Ok(response) => response.output.trim() == "1",
            Err(e) => {
                debug!(target = %self.target, "liveness probe failed: {e}");
                false
            }
        }
    }

    /// Close every stream and the transport. Idempotent.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = lock(&self.shared.phase).closing();

        let slots: Vec<(u32, StreamSlot)> = lock(&self.shared.streams).drain().collect();
        for (local_id, mut slot) in slots {
            match slot.pending_open.take() {
                Some(opened) => {
                    let _ = opened.send(Err(AdbError::SessionClosed("session closed".into())));
                }
                None => {
                    let _ = self.shared.send(Packet::close(local_id, slot.remote_id));
                }
            }
        }

        {
            let mut failure = lock(&self.shared.failure);
            if failure.is_none() {
                *failure = Some("session closed".to_string());
            }
        }
        self.shared.shutdown.cancel();

        let tasks = std::mem::take(&mut *lock(&self.tasks));
        for mut task in tasks {
            if tokio::time::timeout(Duration::from_secs(2), &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }

        let mut phase = lock(&self.shared.phase);
        if phase.closed().is_err() {
            phase.reset();
        }
        info!(target = %self.target, "session closed");
    }
}

impl Drop for AdbSession {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}
