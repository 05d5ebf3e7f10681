//! Headless mirroring: the "decoder" writes the raw H.264 elementary
//! stream to a file instead of rendering it.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use droidctl_core::AdbError;
use droidctl_core::mirror::decoder::{OutputBuffer, VideoDecoder, VideoFormat};
use droidctl_core::mirror::surface::RenderSurface;
use tracing::{debug, info};

// ── Surface ──────────────────────────────────────────────────────

/// Hands out an output path in place of a window.
pub struct FileSurface {
    path: PathBuf,
    acquired: AtomicBool,
}

impl FileSurface {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            acquired: AtomicBool::new(false),
        }
    }
}

impl RenderSurface for FileSurface {
    type Target = PathBuf;

    fn acquire(&self) -> Result<PathBuf, AdbError> {
        if self.acquired.swap(true, Ordering::SeqCst) {
            return Err(AdbError::Other("output already in use".into()));
        }
        Ok(self.path.clone())
    }

    fn release(&self) {
        self.acquired.store(false, Ordering::SeqCst);
    }

    fn on_resize(&self, width: u32, height: u32) {
        info!(width, height, "video size");
    }
}

// ── Decoder ──────────────────────────────────────────────────────

/// Writes every input unit straight to the target file.
#[derive(Default)]
pub struct RecordingDecoder {
    out: Option<BufWriter<File>>,
    path: PathBuf,
    started: bool,
    /// One pending output per accepted input.
    ready: Vec<OutputBuffer>,
    written: u64,
}

impl RecordingDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>, AdbError> {
        self.out
            .as_mut()
            .ok_or_else(|| AdbError::decoder("recorder not configured"))
    }
}

impl VideoDecoder for RecordingDecoder {
    type Target = PathBuf;

    fn configure(&mut self, format: &VideoFormat, target: PathBuf) -> Result<(), AdbError> {
        let file = File::create(&target)
            .map_err(|e| AdbError::decoder(format!("{}: {e}", target.display())))?;
        info!(
            path = %target.display(),
            mime = %format.mime,
            width = format.width,
            height = format.height,
            "recording"
        );
        self.out = Some(BufWriter::new(file));
        self.path = target;
        Ok(())
    }

    fn start(&mut self) -> Result<(), AdbError> {
        self.writer()?;
        self.started = true;
        Ok(())
    }

    fn queue_input(&mut self, data: &[u8], pts_us: u64) -> Result<bool, AdbError> {
        if !self.started {
            return Err(AdbError::decoder("recorder not started"));
        }
        self.writer()?
            .write_all(data)
            .map_err(|e| AdbError::decoder(e.to_string()))?;
        self.written += data.len() as u64;
        self.ready.push(OutputBuffer {
            index: self.ready.len(),
            pts_us,
            size: data.len(),
        });
        Ok(true)
    }

    fn dequeue_output(&mut self) -> Result<Option<OutputBuffer>, AdbError> {
        Ok(self.ready.pop())
    }

    fn release_output(&mut self, _buffer: OutputBuffer, _render: bool) -> Result<(), AdbError> {
        Ok(())
    }

    fn stop(&mut self) -> Result<(), AdbError> {
        self.started = false;
        if let Some(out) = self.out.as_mut() {
            out.flush().map_err(|e| AdbError::decoder(e.to_string()))?;
        }
        Ok(())
    }

    fn release(&mut self) {
        if let Some(mut out) = self.out.take() {
            let _ = out.flush();
        }
        self.ready.clear();
        debug!(path = %self.path.display(), bytes = self.written, "recorder released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use droidctl_core::mirror::resolution::VideoSize;

    #[test]
    fn writes_stream_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.h264");
        let surface = FileSurface::new(&path);
        let target = surface.acquire().unwrap();
        assert!(surface.acquire().is_err());

        let mut rec = RecordingDecoder::new();
        let format = VideoFormat::avc(VideoSize { width: 720, height: 1600 }, 1920);
        rec.configure(&format, target).unwrap();
        rec.start().unwrap();
        assert!(rec.queue_input(b"\x00\x00\x00\x01abc", 0).unwrap());
        assert!(rec.queue_input(b"def", 33_333).unwrap());
        assert_eq!(rec.dequeue_output().unwrap().map(|b| b.pts_us), Some(33_333));
        rec.stop().unwrap();
        rec.release();
        surface.release();

        assert_eq!(rec.bytes_written(), 10);
        assert_eq!(std::fs::read(&path).unwrap(), b"\x00\x00\x00\x01abcdef");
        assert!(surface.acquire().is_ok());
    }

    #[test]
    fn input_before_start_is_an_error() {
        let mut rec = RecordingDecoder::new();
        assert!(rec.queue_input(b"x", 0).is_err());
    }
}
