//! Mirroring session orchestration.
//!
//! # Sequence
//!
//! ```text
//! Preparing   kill stale agent, read `wm size`, negotiate video size
//! Deploying   push agent (unless present), chmod
//! Connecting  launch agent, open localabstract:scrcpy twice
//!             (1st = video, retried; 2nd = control)
//! Streaming   configure decoder, pump video until EOF / stop / error
//! ```
//!
//! Every exit path runs the same release step exactly once: decoder, video
//! stream, input injector, agent launcher, render surface.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::CommandChannel;
use crate::error::AdbError;
use crate::mirror::agent::{self, AGENT_SOCKET, AgentOptions, LaunchParams};
use crate::mirror::decoder::{DEFAULT_MAX_DIMENSION, VideoDecoder, VideoFormat};
use crate::mirror::input::InputInjector;
use crate::mirror::pipeline::{DecodePipeline, FrameStats, PipelineEnd, PipelineOptions};
use crate::mirror::resolution::{self, DEFAULT_DISPLAY_SIZE, QualityPreset, VideoSize};
use crate::mirror::surface::RenderSurface;
use crate::network::AdbStream;
use crate::network::session::lock;
use crate::protocol::control::{TouchAction, TouchEvent};
use crate::protocol::service::Service;
use crate::protocol::shell::ShellEvent;
use crate::state::MirrorPhase;

// ── Options ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MirrorOptions {
    pub preset: QualityPreset,
    /// Overrides the preset's bit rate.
    pub bit_rate: Option<u32>,
    pub agent: AgentOptions,
    /// Attempts at opening the video stream.
    pub open_attempts: u32,
    pub open_retry_delay: Duration,
    /// Pause after killing a stale agent.
    pub kill_settle: Duration,
    /// Pause after launching the agent, before the first open.
    pub launch_settle: Duration,
    pub max_decoder_dimension: u32,
    pub pipeline: PipelineOptions,
}

impl MirrorOptions {
    pub fn new(agent: AgentOptions) -> Self {
        Self {
            preset: QualityPreset::default(),
            bit_rate: None,
            agent,
            open_attempts: 5,
            open_retry_delay: Duration::from_millis(300),
            kill_settle: Duration::from_millis(500),
            launch_settle: Duration::from_millis(800),
            max_decoder_dimension: DEFAULT_MAX_DIMENSION,
            pipeline: PipelineOptions::default(),
        }
    }

    pub fn with_preset(mut self, preset: QualityPreset) -> Self {
        self.preset = preset;
        self
    }

    pub fn with_bit_rate(mut self, bit_rate: u32) -> Self {
        self.bit_rate = Some(bit_rate);
        self
    }

    pub fn with_open_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.open_attempts = attempts.max(1);
        self.open_retry_delay = delay;
        self
    }

    pub fn with_settle_delays(mut self, after_kill: Duration, after_launch: Duration) -> Self {
        self.kill_settle = after_kill;
        self.launch_settle = after_launch;
        self
    }

    pub fn bit_rate(&self) -> u32 {
        self.bit_rate.unwrap_or_else(|| self.preset.bit_rate())
    }
}

/// Phase plus a human-readable line for the UI.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MirrorStatus {
    pub phase: MirrorPhase,
    pub message: String,
}

// ── Resources ────────────────────────────────────────────────────

/// Everything a session acquires, released exactly once.
struct MirrorResources<D: VideoDecoder> {
    surface_acquired: bool,
    agent_launched: bool,
    agent_task: Option<JoinHandle<()>>,
    video: Option<AdbStream>,
    injector: Option<Arc<InputInjector>>,
    pipeline: Option<DecodePipeline<D>>,
    released: bool,
}

impl<D: VideoDecoder> MirrorResources<D> {
    fn new() -> Self {
        Self {
            surface_acquired: false,
            agent_launched: false,
            agent_task: None,
            video: None,
            injector: None,
            pipeline: None,
            released: false,
        }
    }

    async fn release<S>(&mut self, surface: &S, channel: &CommandChannel)
    where
        S: RenderSurface<Target = D::Target>,
    {
        if self.released {
            return;
        }
        self.released = true;

        if let Some(mut pipeline) = self.pipeline.take() {
            pipeline.release();
        }
        if let Some(video) = self.video.take() {
            video.close();
        }
        if let Some(injector) = self.injector.take() {
            injector.close().await;
        }
        if let Some(task) = self.agent_task.take() {
            task.abort();
        }
        if self.agent_launched && !channel.session().is_closed() {
            let kill = agent::kill_stale(channel);
            if tokio::time::timeout(Duration::from_secs(2), kill).await.is_err() {
                debug!("agent kill timed out");
            }
        }
        if self.surface_acquired {
            surface.release();
        }
        debug!("mirror resources released");
    }
}

// ── MirrorController ─────────────────────────────────────────────

/// Drives one mirroring session against one device session.
///
/// A controller runs once; start a new one to mirror again.
pub struct MirrorController {
    channel: CommandChannel,
    options: MirrorOptions,
    cancel: CancellationToken,
    started: AtomicBool,
    status_tx: watch::Sender<MirrorStatus>,
    video_size_tx: watch::Sender<Option<VideoSize>>,
    stats_tx: Mutex<Option<watch::Sender<FrameStats>>>,
    stats_rx: watch::Receiver<FrameStats>,
    injector: Mutex<Option<Arc<InputInjector>>>,
}

impl MirrorController {
    pub fn new(channel: CommandChannel, options: MirrorOptions) -> Self {
        let (status_tx, _) = watch::channel(MirrorStatus {
            phase: MirrorPhase::Idle,
            message: "Idle".to_string(),
        });
        let (video_size_tx, _) = watch::channel(None);
        let (stats_tx, stats_rx) = watch::channel(FrameStats::default());
        Self {
            channel,
            options,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            status_tx,
            video_size_tx,
            stats_tx: Mutex::new(Some(stats_tx)),
            stats_rx,
            injector: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &MirrorOptions {
        &self.options
    }

    pub fn status(&self) -> MirrorStatus {
        self.status_tx.borrow().clone()
    }

    pub fn status_receiver(&self) -> watch::Receiver<MirrorStatus> {
        self.status_tx.subscribe()
    }

    /// Negotiated video size, once known.
    pub fn video_size(&self) -> Option<VideoSize> {
        *self.video_size_tx.borrow()
    }

    pub fn video_size_receiver(&self) -> watch::Receiver<Option<VideoSize>> {
        self.video_size_tx.subscribe()
    }

    pub fn stats_receiver(&self) -> watch::Receiver<FrameStats> {
        self.stats_rx.clone()
    }

    /// Token observed by the read loop and the input consumer.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request a stop. Safe to call any number of times, from any task.
    pub fn stop(&self) {
        self.cancel.cancel();
        if !self.started.load(Ordering::SeqCst) {
            self.status_tx.send_modify(|status| {
                if status.phase.stop() {
                    status.message = "Stopped".to_string();
                }
            });
        }
    }

    // ── Input ────────────────────────────────────────────────────

    /// Touch at video coordinates. `false` when not streaming.
    pub fn inject_touch(&self, action: TouchAction, x: i32, y: i32, pressure: f32) -> bool {
        let Some(size) = self.video_size() else {
            return false;
        };
        let event = TouchEvent::new(
            action,
            x,
            y,
            size.width.min(u16::MAX as u32) as u16,
            size.height.min(u16::MAX as u32) as u16,
            pressure,
        );
        match lock(&self.injector).as_ref() {
            Some(injector) => injector.inject(event),
            None => false,
        }
    }

    /// Touch at on-screen view coordinates, scaled into video space.
    pub fn inject_view_touch(
        &self,
        action: TouchAction,
        view_x: f32,
        view_y: f32,
        view_width: f32,
        view_height: f32,
        pressure: f32,
    ) -> bool {
        let Some(size) = self.video_size() else {
            return false;
        };
        match lock(&self.injector).as_ref() {
            Some(injector) => injector.inject_view_touch(
                action,
                view_x,
                view_y,
                view_width,
                view_height,
                size,
                pressure,
            ),
            None => false,
        }
    }

    /// Touch events lost to control-stream write failures.
    pub fn input_error_count(&self) -> u64 {
        lock(&self.injector)
            .as_ref()
            .map(|i| i.error_count())
            .unwrap_or(0)
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Run the whole session on the current task until the video stream
    /// ends, [`stop`](Self::stop) is called, or something fails.
    ///
    /// Resources are released before this returns, whatever the outcome.
    /// The final phase is `Stopped` for end of stream and stop requests
    /// and `Failed` for errors.
    pub async fn run<D, S>(&self, surface: &S, decoder: D) -> Result<PipelineEnd, AdbError>
    where
        D: VideoDecoder,
        S: RenderSurface<Target = D::Target>,
    {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(AdbError::Other("mirror controller already used".into()));
        }

        let mut resources = MirrorResources::<D>::new();
        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Ok(PipelineEnd::Cancelled),
            result = self.drive(surface, decoder, &mut resources) => result,
        };

        lock(&self.injector).take();
        resources.release(surface, &self.channel).await;

        match &outcome {
            Ok(end) => {
                let message = match end {
                    PipelineEnd::EndOfStream => "Video stream ended",
                    PipelineEnd::Cancelled => "Stopped",
                };
                info!(%message, "mirroring stopped");
                self.status_tx.send_modify(|status| {
                    if status.phase.stop() {
                        status.message = message.to_string();
                    }
                });
            }
            Err(e) => {
                warn!("mirroring failed: {e}");
                let reason = e.to_string();
                self.status_tx.send_modify(|status| {
                    if status.phase.fail(reason.clone()) {
                        status.message = format!("Error: {reason}");
                    }
                });
            }
        }
        outcome
    }

    fn transition(
        &self,
        step: impl FnOnce(&mut MirrorPhase) -> Result<(), AdbError>,
        message: impl Into<String>,
    ) -> Result<(), AdbError> {
        let mut result = Ok(());
        let message = message.into();
        self.status_tx.send_modify(|status| {
            result = step(&mut status.phase);
            if result.is_ok() {
                debug!(phase = %status.phase, "mirror phase");
                status.message = message;
            }
        });
        result
    }

    async fn drive<D, S>(
        &self,
        surface: &S,
        decoder: D,
        resources: &mut MirrorResources<D>,
    ) -> Result<PipelineEnd, AdbError>
    where
        D: VideoDecoder,
        S: RenderSurface<Target = D::Target>,
    {
        // ── Preparing ────────────────────────────────────────────
        self.transition(MirrorPhase::begin_prepare, "Preparing")?;
        let target = surface.acquire()?;
        resources.surface_acquired = true;

        agent::kill_stale(&self.channel).await;
        tokio::time::sleep(self.options.kill_settle).await;

        let display_size = match self.channel.shell("wm size").await {
            Ok(r) => resolution::parse_wm_size(&r.all_output()),
            Err(e) => {
                debug!("wm size failed: {e}");
                None
            }
        }
        .unwrap_or_else(|| {
            warn!("display size unavailable, assuming {DEFAULT_DISPLAY_SIZE}");
            DEFAULT_DISPLAY_SIZE
        });
        let negotiated = resolution::negotiate(display_size, self.options.preset.short_side());
        let video_size = negotiated.video;
        info!(
            display = %display_size,
            %video_size,
            max_size = negotiated.max_size,
            "negotiated video size"
        );
        self.video_size_tx.send_replace(Some(video_size));
        surface.on_resize(video_size.width, video_size.height);

        // ── Deploying ────────────────────────────────────────────
        self.transition(MirrorPhase::begin_deploy, "Deploying agent")?;
        agent::deploy(&self.channel, &self.options.agent).await?;

        // ── Connecting ───────────────────────────────────────────
        self.transition(MirrorPhase::begin_connect, "Connecting")?;
        let command = agent::launch_command(
            &self.options.agent,
            LaunchParams {
                max_size: negotiated.max_size,
                bit_rate: self.options.bit_rate(),
            },
        );
        debug!(%command, "launching agent");
        let mut launcher = self.channel.open_shell(&command, false).await?;
        resources.agent_launched = true;
        resources.agent_task = Some(tokio::spawn(async move {
            loop {
                match launcher.next_event().await {
                    Ok(Some(ShellEvent::Stdout(data) | ShellEvent::Stderr(data))) => {
                        debug!(target: "droidctl::agent", "{}", String::from_utf8_lossy(&data).trim_end());
                    }
                    Ok(Some(ShellEvent::Exit(code))) => {
                        debug!(code, "agent exited");
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!("agent output closed: {e}");
                        break;
                    }
                }
            }
        }));
        tokio::time::sleep(self.options.launch_settle).await;

        let video = self.open_video().await?;
        resources.video = Some(video);

        let service = Service::LocalAbstract(AGENT_SOCKET.to_string());
        let control = self.channel.session().open_service(&service).await?;
        let injector = Arc::new(InputInjector::spawn(control, self.cancel.child_token()));
        resources.injector = Some(Arc::clone(&injector));
        *lock(&self.injector) = Some(injector);

        // ── Streaming ────────────────────────────────────────────
        let format = VideoFormat::avc(video_size, self.options.max_decoder_dimension);
        let mut pipeline = DecodePipeline::new(decoder, format, self.options.pipeline);
        let stats_tx = lock(&self.stats_tx).take();
        if let Some(stats_tx) = stats_tx {
            pipeline = pipeline.publish_to(stats_tx);
        }
        let pipeline = resources.pipeline.insert(pipeline);
        pipeline.start(target)?;
        self.transition(MirrorPhase::begin_streaming, format!("Streaming {video_size}"))?;

        let Some(video) = resources.video.as_mut() else {
            return Err(AdbError::StreamClosed);
        };
        pipeline.run(video, &self.cancel).await
    }

    /// Open the video stream, retrying while the agent binds its socket.
    async fn open_video(&self) -> Result<AdbStream, AdbError> {
        let service = Service::LocalAbstract(AGENT_SOCKET.to_string());
        let attempts = self.options.open_attempts.max(1);
        let mut last_error = AdbError::StreamRejected(service.to_destination());
        for attempt in 1..=attempts {
            match self.channel.session().open_service(&service).await {
                Ok(stream) => {
                    debug!(attempt, "video stream open");
                    return Ok(stream);
                }
                Err(e) => {
                    debug!(attempt, "video stream not ready: {e}");
                    if self.channel.session().is_closed() {
                        return Err(e);
                    }
                    last_error = e;
                    if attempt < attempts {
                        tokio::time::sleep(self.options.open_retry_delay).await;
                    }
                }
            }
        }
        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::agent::AgentSource;

    #[test]
    fn option_defaults() {
        let opts = MirrorOptions::new(AgentOptions::new(AgentSource::Bytes(Arc::new(vec![]))));
        assert_eq!(opts.open_attempts, 5);
        assert_eq!(opts.open_retry_delay, Duration::from_millis(300));
        assert_eq!(opts.bit_rate(), 2_000_000);
        assert_eq!(opts.max_decoder_dimension, 1920);

        let high = opts.clone().with_preset(QualityPreset::High);
        assert_eq!(high.bit_rate(), 4_000_000);
        assert_eq!(high.with_bit_rate(1_000_000).bit_rate(), 1_000_000);
        assert_eq!(opts.with_open_retry(0, Duration::ZERO).open_attempts, 1);
    }
}
