use std::fmt;

use crate::foundation::error::{FramecastError, FramecastResult};

/// Bytes per packed RGB565 pixel.
pub const BYTES_PER_PIXEL: usize = 2;

/// Target frame size in pixels. Cache capacity and eviction are scoped per resolution.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct Resolution {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Resolution {
    /// Create a validated resolution with non-zero sides.
    pub fn new(width: u32, height: u32) -> FramecastResult<Self> {
        if width == 0 || height == 0 {
            return Err(FramecastError::validation(
                "resolution width/height must be non-zero",
            ));
        }
        Ok(Self { width, height })
    }

    /// Exact length of one packed frame at this resolution.
    pub fn frame_len(self) -> usize {
        self.width as usize * self.height as usize * BYTES_PER_PIXEL
    }

    /// Parse the `_<w>x<h>.gif` hint some source filenames carry.
    pub fn from_filename_hint(filename: &str) -> Option<Self> {
        let stem = filename.strip_suffix(".gif")?;
        let (_, dims) = stem.rsplit_once('_')?;
        let (w, h) = dims.split_once('x')?;
        if w.is_empty() || h.is_empty() {
            return None;
        }
        if !w.bytes().all(|b| b.is_ascii_digit()) || !h.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Self::new(w.parse().ok()?, h.parse().ok()?).ok()
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Inclusive frame range `[from, to]` as negotiated on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FrameSpan {
    /// First frame sent.
    pub from: u32,
    /// Last frame sent (inclusive).
    pub to: u32,
}

impl FrameSpan {
    /// Clamp a requested range into `[0, n_frames - 1]`.
    ///
    /// An unspecified or out-of-range upper bound becomes the last frame, an out-of-range lower
    /// bound becomes 0, and an upper bound below the lower one is reset to the last frame.
    pub fn clamp(from: Option<u32>, to: Option<u32>, n_frames: u32) -> FramecastResult<Self> {
        if n_frames == 0 {
            return Err(FramecastError::validation("animation has no frames"));
        }
        let last = n_frames - 1;
        let from = from.filter(|&f| f <= last).unwrap_or(0);
        let to = match to {
            Some(t) if t <= last && t >= from => t,
            _ => last,
        };
        Ok(Self { from, to })
    }

    /// Number of frames in the span.
    pub fn len_frames(self) -> u32 {
        self.to - self.from + 1
    }
}

impl fmt::Display for FrameSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.from, self.to)
    }
}
