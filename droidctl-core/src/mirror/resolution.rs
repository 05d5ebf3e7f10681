//! Video size negotiation.
//!
//! The agent takes a single `max_size` (longest side). We pick it so the
//! device's short side lands on the preset's target, then predict the exact
//! frame size the agent will produce so the decoder can be configured before
//! the first byte arrives. H.264 needs both dimensions on a multiple of 8.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::AdbError;

/// Used when `wm size` cannot be read.
pub const DEFAULT_DISPLAY_SIZE: DisplaySize = DisplaySize {
    width: 1080,
    height: 2400,
};

/// Round down to a multiple of 8.
pub fn align8(value: u32) -> u32 {
    value & !7
}

// ── Presets ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreset {
    /// 720p-class, 2 Mbit/s.
    #[default]
    Standard,
    /// 1080p-class, 4 Mbit/s.
    High,
}

impl QualityPreset {
    /// Target length of the short side, in pixels.
    pub fn short_side(self) -> u32 {
        match self {
            Self::Standard => 720,
            Self::High => 1080,
        }
    }

    /// Encoder bit rate, bits per second.
    pub fn bit_rate(self) -> u32 {
        match self {
            Self::Standard => 2_000_000,
            Self::High => 4_000_000,
        }
    }
}

impl fmt::Display for QualityPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standard => write!(f, "standard"),
            Self::High => write!(f, "high"),
        }
    }
}

impl FromStr for QualityPreset {
    type Err = AdbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "standard" | "720" | "720p" => Ok(Self::Standard),
            "high" | "1080" | "1080p" => Ok(Self::High),
            other => Err(AdbError::Other(format!("unknown quality preset {other:?}"))),
        }
    }
}

// ── Sizes ────────────────────────────────────────────────────────

/// Physical (or overridden) display size as reported by `wm size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DisplaySize {
    pub width: u32,
    pub height: u32,
}

impl DisplaySize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_portrait(&self) -> bool {
        self.height > self.width
    }
}

impl fmt::Display for DisplaySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Negotiated video frame size; both dimensions are multiples of 8.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VideoSize {
    pub width: u32,
    pub height: u32,
}

impl fmt::Display for VideoSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Result of [`negotiate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    /// `max_size` for the agent; 0 means "no downscale".
    pub max_size: u32,
    pub video: VideoSize,
}

/// Scale `display` so its short side becomes `short_side`.
///
/// Displays already at or below the target are left at native size.
pub fn negotiate(display: DisplaySize, short_side: u32) -> Negotiated {
    let DisplaySize { width, height } = display;
    let short = width.min(height);
    let long = width.max(height);

    let max_size = if short_side > 0 && short_side < short {
        align8((long as u64 * short_side as u64 / short as u64) as u32)
    } else {
        0
    };

    let (w, h) = if max_size == 0 {
        (width, height)
    } else if height > width {
        (
            (max_size as u64 * width as u64 / height as u64) as u32,
            max_size,
        )
    } else {
        (
            max_size,
            (max_size as u64 * height as u64 / width.max(1) as u64) as u32,
        )
    };

    Negotiated {
        max_size,
        video: VideoSize {
            width: align8(w),
            height: align8(h),
        },
    }
}

static WM_SIZE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)x(\d+)").expect("size pattern"));

/// Parse `wm size` output, preferring an `Override size:` line.
///
/// ```text
/// Physical size: 1440x3120
/// Override size: 1080x2340
/// ```
pub fn parse_wm_size(output: &str) -> Option<DisplaySize> {
    let parse_line = |line: &str| -> Option<DisplaySize> {
        let caps = WM_SIZE.captures(line)?;
        let width = caps.get(1)?.as_str().parse().ok()?;
        let height = caps.get(2)?.as_str().parse().ok()?;
        (width > 0 && height > 0).then_some(DisplaySize { width, height })
    };
    output
        .lines()
        .filter(|l| l.contains("Override"))
        .find_map(parse_line)
        .or_else(|| output.lines().find_map(parse_line))
}
