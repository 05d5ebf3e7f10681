//! Touch injection onto the agent's control stream.
//!
//! Callers never block: events go onto an unbounded queue and a single
//! consumer task writes them, in order, one 28-byte record at a time. A
//! failed write loses that one event; the consumer keeps going and the
//! failure is counted.

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::AdbError;
use crate::mirror::resolution::VideoSize;
use crate::network::AdbStream;
use crate::network::session::lock;
use crate::protocol::control::{TouchAction, TouchEvent};

/// Write side of the control stream.
#[async_trait]
pub trait ControlSink: Send + 'static {
    async fn send(&mut self, message: &[u8]) -> Result<(), AdbError>;

    async fn close(&mut self) {}
}

#[async_trait]
impl ControlSink for AdbStream {
    async fn send(&mut self, message: &[u8]) -> Result<(), AdbError> {
        self.write_all(message).await
    }

    async fn close(&mut self) {
        AdbStream::close(self);
    }
}

// ── InputInjector ────────────────────────────────────────────────

pub struct InputInjector {
    queue: Mutex<Option<mpsc::UnboundedSender<TouchEvent>>>,
    sent: Arc<AtomicU64>,
    errors: Arc<AtomicU64>,
    cancel: CancellationToken,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl InputInjector {
    /// Start the consumer task. It stops when `cancel` fires or the
    /// injector is closed, and closes `sink` on the way out.
    pub fn spawn<S: ControlSink>(sink: S, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let sent = Arc::new(AtomicU64::new(0));
        let errors = Arc::new(AtomicU64::new(0));
        let consumer = tokio::spawn(consume(
            sink,
            rx,
            cancel.clone(),
            Arc::clone(&sent),
            Arc::clone(&errors),
        ));
        Self {
            queue: Mutex::new(Some(tx)),
            sent,
            errors,
            cancel,
            consumer: Mutex::new(Some(consumer)),
        }
    }

    /// Queue one event. Returns `false` once the injector is closed.
    pub fn inject(&self, event: TouchEvent) -> bool {
        match lock(&self.queue).as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Queue a touch at `(x, y)` in video coordinates.
    pub fn inject_touch(
        &self,
        action: TouchAction,
        x: i32,
        y: i32,
        video_width: u16,
        video_height: u16,
        pressure: f32,
    ) -> bool {
        self.inject(TouchEvent::new(action, x, y, video_width, video_height, pressure))
    }

    /// Queue a touch given in on-screen view coordinates.
    pub fn inject_view_touch(
        &self,
        action: TouchAction,
        view_x: f32,
        view_y: f32,
        view_width: f32,
        view_height: f32,
        video: VideoSize,
        pressure: f32,
    ) -> bool {
        self.inject(TouchEvent::from_view(
            action,
            view_x,
            view_y,
            view_width,
            view_height,
            video.width.min(u16::MAX as u32) as u16,
            video.height.min(u16::MAX as u32) as u16,
            pressure,
        ))
    }

    /// Events written successfully.
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Events lost to write failures.
    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.queue).is_none()
    }

    /// Stop accepting events, let the consumer flush what is queued, then
    /// close the sink. Idempotent.
    pub async fn close(&self) {
        lock(&self.queue).take();
        let consumer = lock(&self.consumer).take();
        if let Some(mut task) = consumer {
            if tokio::time::timeout(Duration::from_secs(2), &mut task)
                .await
                .is_err()
            {
                self.cancel.cancel();
                task.abort();
            }
        }
    }
}

impl Drop for InputInjector {
    fn drop(&mut self) {
        lock(&self.queue).take();
    }
}

async fn consume<S: ControlSink>(
    mut sink: S,
    mut rx: mpsc::UnboundedReceiver<TouchEvent>,
    cancel: CancellationToken,
    sent: Arc<AtomicU64>,
    errors: Arc<AtomicU64>,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        match sink.send(&event.encode()).await {
            Ok(()) => {
                sent.fetch_add(1, Ordering::Relaxed);
                trace!(action = ?event.action, x = event.x, y = event.y, "touch");
            }
            Err(e) => {
                errors.fetch_add(1, Ordering::Relaxed);
                debug!("touch event lost: {e}");
            }
        }
    }
    sink.close().await;
}
