//! Video decoder abstraction.
//!
//! Modeled on the buffer-queue decoders platforms expose (configure, start,
//! queue input units, dequeue and release output). Implementations own all
//! frame buffering; the pipeline never holds decoded frames itself.

use crate::error::AdbError;
use crate::mirror::resolution::VideoSize;

pub const MIME_AVC: &str = "video/avc";

/// Ceiling handed to the decoder so a mid-stream size change (rotation,
/// agent downsizing) fits in the buffers it allocated up front.
pub const DEFAULT_MAX_DIMENSION: u32 = 1920;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFormat {
    pub mime: String,
    pub width: u32,
    pub height: u32,
    pub max_width: u32,
    pub max_height: u32,
}

impl VideoFormat {
    pub fn avc(size: VideoSize, max_dimension: u32) -> Self {
        Self {
            mime: MIME_AVC.to_string(),
            width: size.width,
            height: size.height,
            max_width: max_dimension.max(size.width),
            max_height: max_dimension.max(size.height),
        }
    }

    pub fn size(&self) -> VideoSize {
        VideoSize {
            width: self.width,
            height: self.height,
        }
    }
}

/// A decoded frame still owned by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputBuffer {
    pub index: usize,
    pub pts_us: u64,
    pub size: usize,
}

pub trait VideoDecoder: Send {
    type Target: Send;

    /// Must be called before [`start`](Self::start) with the exact
    /// negotiated frame size.
    fn configure(&mut self, format: &VideoFormat, target: Self::Target) -> Result<(), AdbError>;

    fn start(&mut self) -> Result<(), AdbError>;

    /// Submit one input unit. `Ok(false)` means no input slot was free and
    /// the data was not consumed.
    fn queue_input(&mut self, data: &[u8], pts_us: u64) -> Result<bool, AdbError>;

    /// Next ready output, if any. Never blocks for long.
    fn dequeue_output(&mut self) -> Result<Option<OutputBuffer>, AdbError>;

    /// Hand an output back, rendering it to the target when `render` is set.
    fn release_output(&mut self, buffer: OutputBuffer, render: bool) -> Result<(), AdbError>;

    fn stop(&mut self) -> Result<(), AdbError>;

    /// Free decoder resources. Called once, after `stop`.
    fn release(&mut self);
}
