//! Error taxonomy for the frame pipeline.
//!
//! - `SetupError`: fatal, discovered while building or starting the pipeline.
//!   Reported once; the pipeline never starts.
//! - `ConversionError`: per-frame and recoverable. The frame is dropped and the
//!   scheduler returns to idle.
//!
//! Engine failures are `EngineError` (see `engine`) and are handled exactly like
//! conversion failures once the pipeline is running.

use thiserror::Error;

use crate::engine::EngineError;
use crate::frame::PixelFormat;
use crate::gpu::{AllocationError, GpuFeature};
use crate::source::AuthorizationStatus;

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("no capture device available: {0}")]
    NoCaptureDevice(String),

    #[error("failed to configure capture device {device}: {reason}")]
    DeviceConfiguration { device: String, reason: String },

    #[error("camera access not authorized ({0:?})")]
    AccessDenied(AuthorizationStatus),

    #[error("no GPU device available")]
    NoGpuDevice,

    #[error("GPU device {device} lacks required features {missing:?}")]
    UnsupportedGpu {
        device: String,
        missing: Vec<GpuFeature>,
    },

    #[error("inference engine setup failed: {0}")]
    Engine(#[from] EngineError),

    #[error("failed to spawn pipeline thread: {0}")]
    Thread(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("frame has zero dimension ({width}x{height})")]
    EmptyFrame { width: u32, height: u32 },

    #[error("frame dimensions {width}x{height} overflow for {format:?}")]
    DimensionsOverflow {
        width: u32,
        height: u32,
        format: PixelFormat,
    },

    #[error("{format:?} frame length mismatch: expected {expected}, got {actual}")]
    LengthMismatch {
        format: PixelFormat,
        expected: usize,
        actual: usize,
    },

    #[error("GPU image allocation failed: {0}")]
    Allocation(#[from] AllocationError),
}
