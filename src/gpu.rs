//! GPU device and command-queue context.
//!
//! The device, its command queue and the image allocator are long-lived
//! resources. They live in one explicitly constructed `GpuContext` that is
//! created at startup, shared by `Arc` with the converter and the scheduler, and
//! torn down when the last handle drops.
//!
//! Every `GpuImage` is accounted for in the context's ledger: allocation is
//! checked against the configured budget and release happens exactly once, in
//! `Drop`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use crate::error::SetupError;

const DEFAULT_MAX_LIVE_IMAGES: usize = 2;
const DEFAULT_MEMORY_BUDGET_BYTES: usize = 64 * 1024 * 1024;

/// Device features the pipeline relies on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GpuFeature {
    /// 32-bit float image storage.
    Float32Images,
    /// A queue that accepts compute command buffers.
    ComputeQueue,
}

const REQUIRED_FEATURES: &[GpuFeature] = &[GpuFeature::Float32Images, GpuFeature::ComputeQueue];

/// Description of a discovered device.
#[derive(Clone, Debug)]
pub struct DeviceDescriptor {
    pub name: String,
    pub features: Vec<GpuFeature>,
}

impl DeviceDescriptor {
    /// Host-memory device. Supports every feature the pipeline needs.
    pub fn host() -> Self {
        Self {
            name: "host".to_string(),
            features: REQUIRED_FEATURES.to_vec(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct GpuConfig {
    /// Maximum number of images alive at once.
    pub max_live_images: usize,
    /// Maximum bytes held by live images.
    pub memory_budget_bytes: usize,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            max_live_images: DEFAULT_MAX_LIVE_IMAGES,
            memory_budget_bytes: DEFAULT_MEMORY_BUDGET_BYTES,
        }
    }
}

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("live image limit {limit} reached")]
    ImageLimit { limit: usize },

    #[error("requested {requested} bytes, {available} available")]
    MemoryBudget { requested: usize, available: usize },

    #[error("image dimensions {width}x{height} overflow")]
    Overflow { width: u32, height: u32 },
}

/// Snapshot of the allocation ledger.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct GpuStats {
    pub live_images: usize,
    pub live_bytes: usize,
    pub allocated: u64,
    pub released: u64,
    pub submissions: u64,
}

#[derive(Default)]
struct LedgerState {
    live_images: usize,
    live_bytes: usize,
    allocated: u64,
    released: u64,
}

struct Ledger {
    state: Mutex<LedgerState>,
    config: GpuConfig,
}

impl Ledger {
    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        // Counters stay consistent even if a holder panicked.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reserve(&self, bytes: usize) -> Result<u64, AllocationError> {
        let mut state = self.lock();
        if state.live_images >= self.config.max_live_images {
            return Err(AllocationError::ImageLimit {
                limit: self.config.max_live_images,
            });
        }
        let available = self.config.memory_budget_bytes.saturating_sub(state.live_bytes);
        if bytes > available {
            return Err(AllocationError::MemoryBudget {
                requested: bytes,
                available,
            });
        }
        state.live_images += 1;
        state.live_bytes += bytes;
        state.allocated += 1;
        Ok(state.allocated)
    }

    fn release(&self, bytes: usize) {
        let mut state = self.lock();
        state.live_images = state.live_images.saturating_sub(1);
        state.live_bytes = state.live_bytes.saturating_sub(bytes);
        state.released += 1;
    }
}

/// Device plus command queue plus image allocator.
pub struct GpuContext {
    device: DeviceDescriptor,
    ledger: Arc<Ledger>,
    queue: Mutex<()>,
    submissions: AtomicU64,
}

impl GpuContext {
    /// Open a context on the given device.
    ///
    /// Fails when no device was found or the device lacks a required feature.
    pub fn open(device: Option<DeviceDescriptor>, config: GpuConfig) -> Result<Arc<Self>, SetupError> {
        let device = device.ok_or(SetupError::NoGpuDevice)?;
        let missing: Vec<GpuFeature> = REQUIRED_FEATURES
            .iter()
            .copied()
            .filter(|feature| !device.features.contains(feature))
            .collect();
        if !missing.is_empty() {
            return Err(SetupError::UnsupportedGpu {
                device: device.name,
                missing,
            });
        }
        log::info!(
            "gpu context opened on {} (max {} live images, {} KiB budget)",
            device.name,
            config.max_live_images,
            config.memory_budget_bytes / 1024
        );
        Ok(Arc::new(Self {
            device,
            ledger: Arc::new(Ledger {
                state: Mutex::new(LedgerState::default()),
                config,
            }),
            queue: Mutex::new(()),
            submissions: AtomicU64::new(0),
        }))
    }

    /// Host-memory context with the given budget.
    pub fn host(config: GpuConfig) -> Result<Arc<Self>, SetupError> {
        Self::open(Some(DeviceDescriptor::host()), config)
    }

    pub fn device_name(&self) -> &str {
        &self.device.name
    }

    /// Allocate a planar RGB `f32` image.
    pub fn allocate_image(&self, width: u32, height: u32) -> Result<GpuImage, AllocationError> {
        let len = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or(AllocationError::Overflow { width, height })?;
        let bytes = len
            .checked_mul(std::mem::size_of::<f32>())
            .ok_or(AllocationError::Overflow { width, height })?;
        let id = self.ledger.reserve(bytes)?;
        Ok(GpuImage {
            id,
            width,
            height,
            data: vec![0.0; len],
            bytes,
            ledger: self.ledger.clone(),
        })
    }

    /// Submit work to the command queue and wait for it to complete.
    ///
    /// The queue executes one command buffer at a time.
    pub fn submit<R>(&self, work: impl FnOnce() -> R) -> R {
        let _queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        self.submissions.fetch_add(1, Ordering::Relaxed);
        work()
    }

    pub fn stats(&self) -> GpuStats {
        let state = self.ledger.lock();
        GpuStats {
            live_images: state.live_images,
            live_bytes: state.live_bytes,
            allocated: state.allocated,
            released: state.released,
            submissions: self.submissions.load(Ordering::Relaxed),
        }
    }
}

/// Device-resident image, planar R, G, B `f32` in `[0, 1]`.
///
/// Not `Clone`: each image is released exactly once, when it drops.
pub struct GpuImage {
    id: u64,
    width: u32,
    height: u32,
    data: Vec<f32>,
    bytes: usize,
    ledger: Arc<Ledger>,
}

impl GpuImage {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// All three planes, R then G then B.
    pub fn planes(&self) -> &[f32] {
        &self.data
    }

    /// One channel plane (0 = R, 1 = G, 2 = B).
    pub fn plane(&self, channel: usize) -> &[f32] {
        let plane = self.width as usize * self.height as usize;
        &self.data[channel * plane..(channel + 1) * plane]
    }

    pub(crate) fn planes_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }
}

impl std::fmt::Debug for GpuImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuImage")
            .field("id", &self.id)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        self.ledger.release(self.bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_releases_exactly_once() -> anyhow::Result<()> {
        let ctx = GpuContext::host(GpuConfig::default())?;
        let image = ctx.allocate_image(4, 4)?;
        assert_eq!(ctx.stats().live_images, 1);
        assert_eq!(ctx.stats().live_bytes, 4 * 4 * 3 * 4);
        drop(image);

        let stats = ctx.stats();
        assert_eq!(stats.live_images, 0);
        assert_eq!(stats.live_bytes, 0);
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.released, 1);
        Ok(())
    }

    #[test]
    fn image_limit_is_enforced() -> anyhow::Result<()> {
        let ctx = GpuContext::host(GpuConfig {
            max_live_images: 1,
            ..GpuConfig::default()
        })?;
        let first = ctx.allocate_image(2, 2)?;
        assert!(matches!(
            ctx.allocate_image(2, 2),
            Err(AllocationError::ImageLimit { limit: 1 })
        ));
        drop(first);
        assert!(ctx.allocate_image(2, 2).is_ok());
        Ok(())
    }

    #[test]
    fn memory_budget_is_enforced() -> anyhow::Result<()> {
        let ctx = GpuContext::host(GpuConfig {
            max_live_images: 4,
            memory_budget_bytes: 100,
        })?;
        assert!(matches!(
            ctx.allocate_image(4, 4),
            Err(AllocationError::MemoryBudget { requested: 192, available: 100 })
        ));
        assert_eq!(ctx.stats().allocated, 0);
        Ok(())
    }

    #[test]
    fn missing_device_is_fatal() {
        assert!(matches!(
            GpuContext::open(None, GpuConfig::default()),
            Err(SetupError::NoGpuDevice)
        ));
    }

    #[test]
    fn unsupported_feature_set_is_fatal() {
        let device = DeviceDescriptor {
            name: "legacy".to_string(),
            features: vec![GpuFeature::ComputeQueue],
        };
        match GpuContext::open(Some(device), GpuConfig::default()) {
            Err(SetupError::UnsupportedGpu { missing, .. }) => {
                assert_eq!(missing, vec![GpuFeature::Float32Images]);
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn submit_counts_command_buffers() -> anyhow::Result<()> {
        let ctx = GpuContext::host(GpuConfig::default())?;
        let value = ctx.submit(|| 41 + 1);
        assert_eq!(value, 42);
        assert_eq!(ctx.stats().submissions, 1);
        Ok(())
    }
}
