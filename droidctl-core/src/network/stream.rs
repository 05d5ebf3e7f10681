//! Logical streams multiplexed over one session.
//!
//! Each stream has one outstanding `WRTE` at a time: the writer waits
//! for the device's `OKAY` before sending the next chunk. Incoming `WRTE`
//! payloads are acknowledged when the reader takes them, so a slow
//! consumer only stalls its own stream.
//!
//! A stream can be split into a reader and a writer half. `CLSE` is sent
//! once, on explicit [`close`](AdbStream::close) or when the last half is
//! dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::{Buf, Bytes};
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use crate::error::AdbError;
use crate::network::session::Shared;
use crate::packet::Packet;

// ── Slot (session side) ──────────────────────────────────────────

/// Session-side bookkeeping for one stream.
pub(crate) struct StreamSlot {
    pub destination: String,
    pub remote_id: u32,
    /// Resolved by the first `OKAY` (remote id) or `CLSE` (rejection).
    pub pending_open: Option<oneshot::Sender<Result<u32, AdbError>>>,
    pub data_tx: mpsc::UnboundedSender<Result<Bytes, AdbError>>,
    pub ack_tx: mpsc::UnboundedSender<()>,
}

/// Receiving ends handed to the stream once it is open.
pub(crate) struct StreamChannels {
    pub data_rx: mpsc::UnboundedReceiver<Result<Bytes, AdbError>>,
    pub ack_rx: mpsc::UnboundedReceiver<()>,
}

impl StreamSlot {
    pub fn new(
        destination: &str,
        pending_open: oneshot::Sender<Result<u32, AdbError>>,
    ) -> (Self, StreamChannels) {
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        (
            Self {
                destination: destination.to_string(),
                remote_id: 0,
                pending_open: Some(pending_open),
                data_tx,
                ack_tx,
            },
            StreamChannels { data_rx, ack_rx },
        )
    }
}

// ── Handle ───────────────────────────────────────────────────────

/// Shared by both halves; sends `CLSE` exactly once.
pub(crate) struct StreamHandle {
    local_id: u32,
    remote_id: u32,
    shared: Arc<Shared>,
    closed: AtomicBool,
}

impl StreamHandle {
    fn send(&self, packet: Packet) -> Result<(), AdbError> {
        self.shared.send(packet)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // If the slot is gone the device closed first (or the session
        // died) and no CLSE is owed.
        if self.shared.remove_stream(self.local_id) && !self.shared.is_shut_down() {
            trace!(local_id = self.local_id, "closing stream");
            let _ = self.send(Packet::close(self.local_id, self.remote_id));
        }
    }

    fn error_after_close(&self) -> AdbError {
        match self.shared.failure() {
            Some(reason) => AdbError::SessionClosed(reason),
            None => AdbError::StreamClosed,
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.close();
    }
}

// ── Reader ───────────────────────────────────────────────────────

/// Receiving half of a stream.
pub struct AdbStreamReader {
    handle: Arc<StreamHandle>,
    data_rx: mpsc::UnboundedReceiver<Result<Bytes, AdbError>>,
    pending: Bytes,
    eof: bool,
}

impl AdbStreamReader {
    /// Next chunk as delivered by the device; `None` at end of stream.
    ///
    /// Buffered bytes left by [`read`](Self::read) are returned first.
    pub async fn read_chunk(&mut self) -> Result<Option<Bytes>, AdbError> {
        if !self.pending.is_empty() {
            return Ok(Some(std::mem::take(&mut self.pending)));
        }
        if self.eof {
            return Ok(None);
        }
        match self.data_rx.recv().await {
            Some(Ok(chunk)) => {
                // Acknowledge as the data is consumed.
                if !self.handle.is_closed() {
                    let _ = self
                        .handle
                        .send(Packet::okay(self.handle.local_id, self.handle.remote_id));
                }
                Ok(Some(chunk))
            }
            Some(Err(e)) => {
                self.eof = true;
                Err(e)
            }
            None => {
                self.eof = true;
                Ok(None)
            }
        }
    }

    /// Read up to `buf.len()` bytes. `Ok(0)` means end of stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, AdbError> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pending.is_empty() {
            match self.read_chunk().await? {
                Some(chunk) => self.pending = chunk,
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        Ok(n)
    }

    /// Fill `buf` completely; end of stream first is an error.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), AdbError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(AdbError::StreamClosed);
            }
            filled += n;
        }
        Ok(())
    }

    /// Collect everything until the device closes the stream.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, AdbError> {
        let mut out = Vec::new();
        while let Some(chunk) = self.read_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    pub fn close(&self) {
        self.handle.close();
    }
}

// ── Writer ───────────────────────────────────────────────────────

/// Sending half of a stream.
pub struct AdbStreamWriter {
    handle: Arc<StreamHandle>,
    ack_rx: mpsc::UnboundedReceiver<()>,
    max_payload: usize,
    ack_timeout: Option<Duration>,
}

impl AdbStreamWriter {
    /// Send `data`, split into payload-sized `WRTE`s, waiting for each `OKAY`.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), AdbError> {
        for chunk in data.chunks(self.max_payload.max(1)) {
            if self.handle.is_closed() {
                return Err(AdbError::StreamClosed);
            }
            self.handle.send(Packet::write(
                self.handle.local_id,
                self.handle.remote_id,
                Bytes::copy_from_slice(chunk),
            ))?;
            let ack = match self.ack_timeout {
                Some(t) => tokio::time::timeout(t, self.ack_rx.recv())
                    .await
                    .map_err(|_| AdbError::Timeout(t))?,
                None => self.ack_rx.recv().await,
            };
            if ack.is_none() {
                return Err(self.handle.error_after_close());
            }
        }
        Ok(())
    }

    pub fn close(&self) {
        self.handle.close();
    }
}

// ── AdbStream ────────────────────────────────────────────────────

/// A bidirectional logical stream to one device service.
pub struct AdbStream {
    reader: AdbStreamReader,
    writer: AdbStreamWriter,
    destination: String,
}

impl std::fmt::Debug for AdbStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdbStream")
            .field("destination", &self.destination)
            .field("local_id", &self.reader.handle.local_id)
            .field("remote_id", &self.reader.handle.remote_id)
            .finish()
    }
}

impl AdbStream {
    pub(crate) fn new(
        local_id: u32,
        remote_id: u32,
        destination: String,
        shared: Arc<Shared>,
        channels: StreamChannels,
        max_payload: usize,
        ack_timeout: Option<Duration>,
    ) -> Self {
        let handle = Arc::new(StreamHandle {
            local_id,
            remote_id,
            shared,
            closed: AtomicBool::new(false),
        });
        Self {
            reader: AdbStreamReader {
                handle: Arc::clone(&handle),
                data_rx: channels.data_rx,
                pending: Bytes::new(),
                eof: false,
            },
            writer: AdbStreamWriter {
                handle,
                ack_rx: channels.ack_rx,
                max_payload,
                ack_timeout,
            },
            destination,
        }
    }

    pub fn local_id(&self) -> u32 {
        self.reader.handle.local_id
    }

    pub fn remote_id(&self) -> u32 {
        self.reader.handle.remote_id
    }

    /// The service string this stream was opened with.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, AdbError> {
        self.reader.read(buf).await
    }

    pub async fn read_chunk(&mut self) -> Result<Option<Bytes>, AdbError> {
        self.reader.read_chunk().await
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), AdbError> {
        self.reader.read_exact(buf).await
    }

    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, AdbError> {
        self.reader.read_to_end().await
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), AdbError> {
        self.writer.write_all(data).await
    }

    /// Send `CLSE` now. Later reads drain what already arrived.
    pub fn close(&self) {
        self.reader.handle.close();
    }

    pub fn is_closed(&self) -> bool {
        self.reader.handle.is_closed()
    }

    pub fn split(self) -> (AdbStreamReader, AdbStreamWriter) {
        (self.reader, self.writer)
    }
}
