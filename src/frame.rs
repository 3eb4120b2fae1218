//! Captured frame container.
//!
//! `RawFrame` is an opaque handle to one captured buffer. Bytes are private to the
//! crate: there is no `Clone`, no `AsRef<[u8]>`, and no serialization. The only
//! consumer of the pixels is the image converter, which turns a frame into a
//! `GpuImage` and then lets the frame go.

use serde::Deserialize;
use std::str::FromStr;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

/// Pixel layout of a captured buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// 32-bit packed B, G, R, A.
    #[default]
    Bgra32,
    /// 32-bit packed R, G, B, A.
    Rgba32,
    /// 24-bit packed R, G, B.
    Rgb24,
    /// Full-resolution Y plane followed by interleaved half-resolution UV.
    Nv12,
}

impl PixelFormat {
    /// Expected buffer length for a frame of this format, `None` on overflow.
    pub fn frame_len(self, width: u32, height: u32) -> Option<usize> {
        let pixels = (width as usize).checked_mul(height as usize)?;
        match self {
            PixelFormat::Bgra32 | PixelFormat::Rgba32 => pixels.checked_mul(4),
            PixelFormat::Rgb24 => pixels.checked_mul(3),
            PixelFormat::Nv12 => {
                // Chroma is subsampled 2x2, rounding up on odd dimensions.
                let (cw, ch) = nv12_chroma_dims(width, height);
                pixels.checked_add(cw.checked_mul(ch)?.checked_mul(2)?)
            }
        }
    }

    /// V4L2 fourcc for this layout.
    pub fn fourcc(self) -> [u8; 4] {
        match self {
            // V4L2_PIX_FMT_ABGR32 stores B, G, R, A in memory.
            PixelFormat::Bgra32 => *b"AR24",
            PixelFormat::Rgba32 => *b"AB24",
            PixelFormat::Rgb24 => *b"RGB3",
            PixelFormat::Nv12 => *b"NV12",
        }
    }
}

/// Chroma plane size (in UV pairs) for an NV12 frame.
pub(crate) fn nv12_chroma_dims(width: u32, height: u32) -> (usize, usize) {
    ((width as usize).div_ceil(2), (height as usize).div_ceil(2))
}

impl FromStr for PixelFormat {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "bgra32" => Ok(PixelFormat::Bgra32),
            "rgba32" => Ok(PixelFormat::Rgba32),
            "rgb24" => Ok(PixelFormat::Rgb24),
            "nv12" => Ok(PixelFormat::Nv12),
            other => Err(anyhow!("unknown pixel format '{}'", other)),
        }
    }
}

/// Rotation to apply so the image is upright for inference.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    #[default]
    Upright,
    #[serde(rename = "rotated_90", alias = "rotated90")]
    Rotated90,
    #[serde(rename = "rotated_180", alias = "rotated180")]
    Rotated180,
    #[serde(rename = "rotated_270", alias = "rotated270")]
    Rotated270,
}

impl Orientation {
    /// Dimensions after the rotation is applied.
    pub fn oriented_dims(self, width: u32, height: u32) -> (u32, u32) {
        match self {
            Orientation::Upright | Orientation::Rotated180 => (width, height),
            Orientation::Rotated90 | Orientation::Rotated270 => (height, width),
        }
    }
}

impl FromStr for Orientation {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "upright" | "portrait" => Ok(Orientation::Upright),
            "rotated_90" | "rotated90" => Ok(Orientation::Rotated90),
            "rotated_180" | "rotated180" => Ok(Orientation::Rotated180),
            "rotated_270" | "rotated270" => Ok(Orientation::Rotated270),
            other => Err(anyhow!("unknown orientation '{}'", other)),
        }
    }
}

/// Opaque captured frame.
pub struct RawFrame {
    /// Private pixel data.
    data: Vec<u8>,

    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub orientation: Orientation,

    /// Per-device capture counter.
    pub sequence: u64,

    captured_at: Instant,
}

// Explicitly NOT implementing Clone: a frame is consumed by at most one conversion.

impl RawFrame {
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        format: PixelFormat,
        orientation: Orientation,
        sequence: u64,
    ) -> Self {
        Self {
            data,
            width,
            height,
            format,
            orientation,
            sequence,
            captured_at: Instant::now(),
        }
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Metadata that outlives the frame itself.
    pub fn metadata(&self) -> FrameMeta {
        FrameMeta {
            sequence: self.sequence,
            width: self.width,
            height: self.height,
            captured_at: self.captured_at,
        }
    }

    /// Internal: pixels for the converter only.
    pub(crate) fn pixels(&self) -> &[u8] {
        &self.data
    }
}

/// Copyable description of a frame, carried alongside its inference request.
#[derive(Clone, Copy, Debug)]
pub struct FrameMeta {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub captured_at: Instant,
}
