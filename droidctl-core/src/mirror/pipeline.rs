//! Raw elementary stream → decoder → render target.
//!
//! Each read from the video stream is submitted as one decoder input unit
//! with a synthetic timestamp (raw mode carries none), then every ready
//! output is released for rendering. Ordering and buffering are left to the
//! decoder; the pipeline copies nothing beyond its single read buffer.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::AdbError;
use crate::mirror::decoder::{VideoDecoder, VideoFormat};
use crate::network::AdbStream;

pub const DEFAULT_READ_BUFFER_SIZE: usize = 512 * 1024;

/// ~30 fps.
pub const DEFAULT_FRAME_INTERVAL_US: u64 = 33_333;

// ── Source ───────────────────────────────────────────────────────

/// Byte source for the video elementary stream.
#[async_trait]
pub trait VideoSource: Send {
    /// Read into `buf`. `Ok(0)` is end of stream.
    async fn read_video(&mut self, buf: &mut [u8]) -> Result<usize, AdbError>;
}

#[async_trait]
impl VideoSource for AdbStream {
    async fn read_video(&mut self, buf: &mut [u8]) -> Result<usize, AdbError> {
        self.read(buf).await
    }
}

// ── FrameStats ───────────────────────────────────────────────────

/// Decode progress published to observers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameStats {
    /// Input units accepted by the decoder.
    pub chunks_queued: u64,
    /// Reads discarded because the decoder had no free input slot.
    pub chunks_dropped: u64,
    /// Output buffers released for rendering.
    pub frames_rendered: u64,
    /// Bytes read from the video stream.
    pub total_bytes: u64,
    /// Smoothed render rate.
    pub fps: f64,
    pub width: u32,
    pub height: u32,
}

/// Why [`DecodePipeline::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineEnd {
    EndOfStream,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOptions {
    pub read_buffer_size: usize,
    pub frame_interval_us: u64,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            frame_interval_us: DEFAULT_FRAME_INTERVAL_US,
        }
    }
}

fn decoder_error(e: AdbError) -> AdbError {
    match e {
        AdbError::Decoder(_) => e,
        other => AdbError::Decoder(other.to_string()),
    }
}

// ── DecodePipeline ───────────────────────────────────────────────

pub struct DecodePipeline<D: VideoDecoder> {
    decoder: Option<D>,
    format: VideoFormat,
    options: PipelineOptions,
    started: bool,
    next_pts_us: u64,
    stats: FrameStats,
    render_intervals: VecDeque<Duration>,
    last_render: Option<Instant>,
    stats_tx: watch::Sender<FrameStats>,
}

impl<D: VideoDecoder> DecodePipeline<D> {
    pub fn new(decoder: D, format: VideoFormat, options: PipelineOptions) -> Self {
        let stats = FrameStats {
            width: format.width,
            height: format.height,
            ..Default::default()
        };
        let (stats_tx, _) = watch::channel(stats.clone());
        Self {
            decoder: Some(decoder),
            format,
            options,
            started: false,
            next_pts_us: 0,
            stats,
            render_intervals: VecDeque::with_capacity(64),
            last_render: None,
            stats_tx,
        }
    }

    /// Publish stats on an existing channel instead of the internal one.
    pub fn publish_to(mut self, stats_tx: watch::Sender<FrameStats>) -> Self {
        stats_tx.send_replace(self.stats.clone());
        self.stats_tx = stats_tx;
        self
    }

    pub fn format(&self) -> &VideoFormat {
        &self.format
    }

    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }

    pub fn stats_receiver(&self) -> watch::Receiver<FrameStats> {
        self.stats_tx.subscribe()
    }

    pub fn is_released(&self) -> bool {
        self.decoder.is_none()
    }

    /// Configure the decoder with the negotiated format and start it.
    pub fn start(&mut self, target: D::Target) -> Result<(), AdbError> {
        let decoder = self
            .decoder
            .as_mut()
            .ok_or_else(|| AdbError::decoder("decoder already released"))?;
        decoder.configure(&self.format, target).map_err(decoder_error)?;
        decoder.start().map_err(decoder_error)?;
        self.started = true;
        debug!(width = self.format.width, height = self.format.height, "decoder started");
        Ok(())
    }

    /// Pump `source` into the decoder until end of stream or cancellation.
    pub async fn run<V>(
        &mut self,
        source: &mut V,
        cancel: &CancellationToken,
    ) -> Result<PipelineEnd, AdbError>
    where
        V: VideoSource + ?Sized,
    {
        if !self.started {
            return Err(AdbError::decoder("decoder not started"));
        }
        let mut buf = vec![0u8; self.options.read_buffer_size.max(1)];
        loop {
            let n = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(PipelineEnd::Cancelled),
                read = source.read_video(&mut buf) => read?,
            };
            if n == 0 {
                debug!("video stream ended");
                return Ok(PipelineEnd::EndOfStream);
            }
            self.feed(&buf[..n])?;
        }
    }

    /// Submit one input unit and drain all ready output.
    pub fn feed(&mut self, data: &[u8]) -> Result<(), AdbError> {
        let decoder = self
            .decoder
            .as_mut()
            .ok_or_else(|| AdbError::decoder("decoder already released"))?;

        self.stats.total_bytes += data.len() as u64;
        if decoder
            .queue_input(data, self.next_pts_us)
            .map_err(decoder_error)?
        {
            self.next_pts_us += self.options.frame_interval_us;
            self.stats.chunks_queued += 1;
        } else {
            trace!(bytes = data.len(), "no input slot, chunk dropped");
            self.stats.chunks_dropped += 1;
        }

        let mut rendered = 0u64;
        while let Some(output) = decoder.dequeue_output().map_err(decoder_error)? {
            decoder.release_output(output, true).map_err(decoder_error)?;
            rendered += 1;
        }
        if rendered > 0 {
            self.stats.frames_rendered += rendered;
            self.record_render();
        }
        self.stats_tx.send_replace(self.stats.clone());
        Ok(())
    }

    fn record_render(&mut self) {
        let now = Instant::now();
        if let Some(last) = self.last_render {
            self.render_intervals.push_back(now.duration_since(last));
            if self.render_intervals.len() > 60 {
                self.render_intervals.pop_front();
            }
            let avg = self
                .render_intervals
                .iter()
                .map(Duration::as_secs_f64)
                .sum::<f64>()
                / self.render_intervals.len() as f64;
            self.stats.fps = if avg > 0.0 { 1.0 / avg } else { 0.0 };
        }
        self.last_render = Some(now);
    }

    /// Stop and release the decoder. Only the first call does anything.
    pub fn release(&mut self) -> bool {
        let Some(mut decoder) = self.decoder.take() else {
            return false;
        };
        if self.started {
            if let Err(e) = decoder.stop() {
                warn!("decoder stop failed: {e}");
            }
        }
        decoder.release();
        debug!("decoder released");
        true
    }
}

impl<D: VideoDecoder> Drop for DecodePipeline<D> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::decoder::OutputBuffer;
    use crate::mirror::resolution::VideoSize;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Log {
        configured: Option<VideoFormat>,
        inputs: Vec<(usize, u64)>,
        rendered: u64,
        stops: u32,
        releases: u32,
    }

    struct FakeDecoder {
        log: Arc<Mutex<Log>>,
        ready: VecDeque<OutputBuffer>,
        refuse_input: bool,
    }

    impl FakeDecoder {
        fn new(log: Arc<Mutex<Log>>) -> Self {
            Self {
                log,
                ready: VecDeque::new(),
                refuse_input: false,
            }
        }
    }

    impl VideoDecoder for FakeDecoder {
        type Target = ();

        fn configure(&mut self, format: &VideoFormat, _: ()) -> Result<(), AdbError> {
            self.log.lock().unwrap().configured = Some(format.clone());
            Ok(())
        }

        fn start(&mut self) -> Result<(), AdbError> {
            Ok(())
        }

        fn queue_input(&mut self, data: &[u8], pts_us: u64) -> Result<bool, AdbError> {
            if self.refuse_input {
                return Ok(false);
            }
            let mut log = self.log.lock().unwrap();
            assert!(log.configured.is_some(), "input before configure");
            log.inputs.push((data.len(), pts_us));
            self.ready.push_back(OutputBuffer {
                index: log.inputs.len(),
                pts_us,
                size: data.len(),
            });
            Ok(true)
        }

        fn dequeue_output(&mut self) -> Result<Option<OutputBuffer>, AdbError> {
            Ok(self.ready.pop_front())
        }

        fn release_output(&mut self, _: OutputBuffer, render: bool) -> Result<(), AdbError> {
            assert!(render);
            self.log.lock().unwrap().rendered += 1;
            Ok(())
        }

        fn stop(&mut self) -> Result<(), AdbError> {
            self.log.lock().unwrap().stops += 1;
            Ok(())
        }

        fn release(&mut self) {
            self.log.lock().unwrap().releases += 1;
        }
    }

    struct ChunkSource(VecDeque<Vec<u8>>);

    #[async_trait]
    impl VideoSource for ChunkSource {
        async fn read_video(&mut self, buf: &mut [u8]) -> Result<usize, AdbError> {
            match self.0.pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None => Ok(0),
            }
        }
    }

    fn format() -> VideoFormat {
        VideoFormat::avc(VideoSize { width: 720, height: 1600 }, 1920)
    }

    #[tokio::test]
    async fn chunks_become_inputs_with_increasing_pts() {
        let log = Arc::new(Mutex::new(Log::default()));
        let mut pipeline = DecodePipeline::new(FakeDecoder::new(Arc::clone(&log)), format(), PipelineOptions::default());
        let stats = pipeline.stats_receiver();
        pipeline.start(()).unwrap();

        let mut source = ChunkSource(vec![vec![0u8; 10], vec![1u8; 20], vec![2u8; 5]].into());
        let end = pipeline.run(&mut source, &CancellationToken::new()).await.unwrap();
        assert_eq!(end, PipelineEnd::EndOfStream);

        let log = log.lock().unwrap();
        assert_eq!(log.configured.as_ref().unwrap().size(), VideoSize { width: 720, height: 1600 });
        assert_eq!(log.inputs, vec![(10, 0), (20, 33_333), (5, 66_666)]);
        assert_eq!(log.rendered, 3);
        let s = stats.borrow().clone();
        assert_eq!(s.chunks_queued, 3);
        assert_eq!(s.frames_rendered, 3);
        assert_eq!(s.total_bytes, 35);
    }

    #[tokio::test]
    async fn run_before_start_is_decoder_error() {
        let log = Arc::new(Mutex::new(Log::default()));
        let mut pipeline = DecodePipeline::new(FakeDecoder::new(log), format(), PipelineOptions::default());
        let mut source = ChunkSource(VecDeque::new());
        let err = pipeline.run(&mut source, &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::Decoder);
    }

    #[tokio::test]
    async fn cancelled_before_read() {
        let log = Arc::new(Mutex::new(Log::default()));
        let mut pipeline = DecodePipeline::new(FakeDecoder::new(log), format(), PipelineOptions::default());
        pipeline.start(()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut source = ChunkSource(vec![vec![1u8; 4]].into());
        assert_eq!(pipeline.run(&mut source, &cancel).await.unwrap(), PipelineEnd::Cancelled);
    }

    #[test]
    fn full_decoder_drops_chunk_without_advancing_pts() {
        let log = Arc::new(Mutex::new(Log::default()));
        let mut decoder = FakeDecoder::new(Arc::clone(&log));
        decoder.refuse_input = true;
        let mut pipeline = DecodePipeline::new(decoder, format(), PipelineOptions::default());
        pipeline.start(()).unwrap();
        pipeline.feed(&[0u8; 8]).unwrap();
        assert_eq!(pipeline.stats().chunks_dropped, 1);
        assert_eq!(pipeline.stats().chunks_queued, 0);
    }

    #[test]
    fn release_happens_once() {
        let log = Arc::new(Mutex::new(Log::default()));
        let mut pipeline = DecodePipeline::new(FakeDecoder::new(Arc::clone(&log)), format(), PipelineOptions::default());
        pipeline.start(()).unwrap();
        assert!(pipeline.release());
        assert!(!pipeline.release());
        drop(pipeline);
        let log = log.lock().unwrap();
        assert_eq!((log.stops, log.releases), (1, 1));
    }
}
