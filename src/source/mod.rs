//! Frame sources.
//!
//! A `FrameSource` owns one capture device and runs it on a dedicated capture
//! thread, handing every frame synchronously to a callback (normally
//! `FrameScheduler::on_frame`). Devices:
//! - Synthetic camera for `stub://` paths (testing, demos)
//! - V4L2 devices (feature: capture-v4l2)
//!
//! The source is responsible for:
//! - Resolving camera authorization once, before the first start
//! - Configuring the device (size, pixel format, orientation, locked frame rate)
//! - Pacing emission to at most the configured rate
//!
//! The source MUST NOT:
//! - Queue frames (the callback decides what to keep)
//! - Run on the presentation thread

mod auth;
mod synthetic;
#[cfg(feature = "capture-v4l2")]
mod v4l2;

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::SetupError;
use crate::frame::{Orientation, PixelFormat, RawFrame};
use crate::scheduler::panic_message;

#[cfg(target_os = "linux")]
pub use auth::DeviceNodeAuthorizer;
pub use auth::{AuthorizationStatus, Authorizer, StaticAuthorizer};
pub use synthetic::SyntheticCamera;
#[cfg(feature = "capture-v4l2")]
pub use v4l2::V4l2Camera;

/// Receives each captured frame on the capture thread.
pub type FrameCallback = Arc<dyn Fn(RawFrame) + Send + Sync>;

/// Capture configuration.
#[derive(Clone, Debug)]
pub struct CaptureSettings {
    /// Device path (e.g., "/dev/video0") or "stub://name".
    pub device: String,
    /// Locked frame rate; minimum and maximum frame duration are both 1/fps.
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub orientation: Orientation,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            device: "stub://camera".to_string(),
            fps: 20,
            width: 640,
            height: 480,
            format: PixelFormat::Bgra32,
            orientation: Orientation::Upright,
        }
    }
}

impl CaptureSettings {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.fps.max(1)
    }

    pub fn is_synthetic(&self) -> bool {
        self.device.starts_with("stub://")
    }
}

/// A capture device the source drives.
pub trait CaptureDevice: Send + 'static {
    /// Apply settings. Failure here is fatal for the source.
    fn configure(&mut self, settings: &CaptureSettings) -> Result<(), SetupError>;

    /// Capture the next frame.
    fn next_frame(&mut self) -> anyhow::Result<RawFrame>;

    fn describe(&self) -> String;
}

impl<D: CaptureDevice + ?Sized> CaptureDevice for Box<D> {
    fn configure(&mut self, settings: &CaptureSettings) -> Result<(), SetupError> {
        (**self).configure(settings)
    }

    fn next_frame(&mut self) -> anyhow::Result<RawFrame> {
        (**self).next_frame()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Device chosen from a path: synthetic for `stub://`, V4L2 otherwise.
pub struct Camera {
    backend: CameraBackend,
}

enum CameraBackend {
    Synthetic(SyntheticCamera),
    #[cfg(feature = "capture-v4l2")]
    V4l2(V4l2Camera),
}

impl Camera {
    pub fn open(settings: &CaptureSettings) -> Result<Self, SetupError> {
        if settings.is_synthetic() {
            return Ok(Self {
                backend: CameraBackend::Synthetic(SyntheticCamera::new(settings.device.clone())),
            });
        }
        #[cfg(feature = "capture-v4l2")]
        {
            Ok(Self {
                backend: CameraBackend::V4l2(V4l2Camera::new(settings.device.clone())),
            })
        }
        #[cfg(not(feature = "capture-v4l2"))]
        {
            Err(SetupError::NoCaptureDevice(format!(
                "{} (device capture requires the capture-v4l2 feature)",
                settings.device
            )))
        }
    }
}

impl CaptureDevice for Camera {
    fn configure(&mut self, settings: &CaptureSettings) -> Result<(), SetupError> {
        match &mut self.backend {
            CameraBackend::Synthetic(camera) => camera.configure(settings),
            #[cfg(feature = "capture-v4l2")]
            CameraBackend::V4l2(camera) => camera.configure(settings),
        }
    }

    fn next_frame(&mut self) -> anyhow::Result<RawFrame> {
        match &mut self.backend {
            CameraBackend::Synthetic(camera) => camera.next_frame(),
            #[cfg(feature = "capture-v4l2")]
            CameraBackend::V4l2(camera) => camera.next_frame(),
        }
    }

    fn describe(&self) -> String {
        match &self.backend {
            CameraBackend::Synthetic(camera) => camera.describe(),
            #[cfg(feature = "capture-v4l2")]
            CameraBackend::V4l2(camera) => camera.describe(),
        }
    }
}

/// Authorizer matching a device path.
pub fn authorizer_for(settings: &CaptureSettings) -> Box<dyn Authorizer> {
    if settings.is_synthetic() {
        return Box::new(StaticAuthorizer::authorized());
    }
    #[cfg(target_os = "linux")]
    {
        Box::new(DeviceNodeAuthorizer::new(settings.device.clone()))
    }
    #[cfg(not(target_os = "linux"))]
    {
        Box::new(StaticAuthorizer::authorized())
    }
}

/// Statistics for a frame source.
#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub read_errors: u64,
    /// Frames whose callback panicked.
    pub callback_failures: u64,
    pub running: bool,
    pub device: String,
}

#[derive(Default)]
struct SourceCounters {
    frames_captured: AtomicU64,
    read_errors: AtomicU64,
    callback_failures: AtomicU64,
}

struct CaptureThread<D> {
    stop: Arc<AtomicBool>,
    join: JoinHandle<D>,
}

/// Drives one capture device on a dedicated thread.
pub struct FrameSource<D: CaptureDevice> {
    settings: CaptureSettings,
    /// `None` while the capture thread owns the device.
    device: Option<D>,
    device_name: String,
    authorizer: Box<dyn Authorizer>,
    authorization: Option<Result<(), AuthorizationStatus>>,
    callback: FrameCallback,
    running: Option<CaptureThread<D>>,
    counters: Arc<SourceCounters>,
}

impl<D: CaptureDevice> FrameSource<D> {
    pub fn new(
        device: D,
        authorizer: Box<dyn Authorizer>,
        settings: CaptureSettings,
        callback: FrameCallback,
    ) -> Self {
        Self {
            device_name: device.describe(),
            settings,
            device: Some(device),
            authorizer,
            authorization: None,
            callback,
            running: None,
            counters: Arc::new(SourceCounters::default()),
        }
    }

    /// Begin emission. No-op when already running.
    ///
    /// Fails when access is not authorized, or when the device cannot be
    /// configured; both are setup errors and the source stays idle. A capture
    /// thread that died on its own is reaped here and capture restarts.
    pub fn start(&mut self) -> Result<(), SetupError> {
        if self.is_running() {
            return Ok(());
        }
        if self.running.is_some() {
            log::warn!("capture thread for {} exited; restarting", self.device_name);
            self.reap();
        }

        self.authorize()?;

        let mut device = self.device.take().ok_or_else(|| {
            SetupError::NoCaptureDevice(format!("{} was lost by a failed capture thread", self.device_name))
        })?;
        if let Err(err) = device.configure(&self.settings) {
            log::error!("capture setup failed: {}", err);
            self.device = Some(device);
            return Err(err);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let interval = self.settings.frame_interval();
        // The device moves onto the thread and comes back through join.
        let join = {
            let stop = stop.clone();
            let callback = self.callback.clone();
            let counters = self.counters.clone();
            std::thread::Builder::new()
                .name("capture".to_string())
                .spawn(move || capture_loop(device, interval, stop, callback, counters))?
        };

        log::info!(
            "frame source started: {} at {} fps",
            self.device_name,
            self.settings.fps
        );
        self.running = Some(CaptureThread { stop, join });
        Ok(())
    }

    /// Halt emission and join the capture thread. No-op when not running.
    pub fn stop(&mut self) {
        let Some(thread) = self.running.as_ref() else {
            return;
        };
        thread.stop.store(true, Ordering::Release);
        self.reap();
        log::info!("frame source stopped: {}", self.device_name);
    }

    /// True while the capture thread is alive.
    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|thread| !thread.join.is_finished())
    }

    /// Join the capture thread and take the device back.
    fn reap(&mut self) {
        let Some(CaptureThread { join, .. }) = self.running.take() else {
            return;
        };
        match join.join() {
            Ok(device) => self.device = Some(device),
            Err(payload) => log::error!(
                "capture thread for {} panicked: {}; device lost",
                self.device_name,
                panic_message(payload.as_ref())
            ),
        }
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    pub fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.counters.frames_captured.load(Ordering::Relaxed),
            read_errors: self.counters.read_errors.load(Ordering::Relaxed),
            callback_failures: self.counters.callback_failures.load(Ordering::Relaxed),
            running: self.is_running(),
            device: self.device_name.clone(),
        }
    }

    fn authorize(&mut self) -> Result<(), SetupError> {
        if let Some(decision) = self.authorization {
            return decision.map_err(SetupError::AccessDenied);
        }
        match auth::resolve(self.authorizer.as_mut()) {
            Ok(()) => {
                self.authorization = Some(Ok(()));
                Ok(())
            }
            Err(SetupError::AccessDenied(status)) => {
                log::error!("camera not authorized ({:?}); capture will not start", status);
                self.authorization = Some(Err(status));
                Err(SetupError::AccessDenied(status))
            }
            Err(err) => {
                log::error!("camera authorization failed: {}", err);
                Err(err)
            }
        }
    }
}

impl<D: CaptureDevice> Drop for FrameSource<D> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop<D: CaptureDevice>(
    mut device: D,
    interval: Duration,
    stop: Arc<AtomicBool>,
    callback: FrameCallback,
    counters: Arc<SourceCounters>,
) -> D {
    while !stop.load(Ordering::Acquire) {
        let frame_start = Instant::now();
        match device.next_frame() {
            Ok(frame) => {
                counters.frames_captured.fetch_add(1, Ordering::Relaxed);
                let sequence = frame.sequence;
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(frame))) {
                    counters.callback_failures.fetch_add(1, Ordering::Relaxed);
                    log::error!(
                        "frame {} from {} dropped: callback panicked: {}",
                        sequence,
                        device.describe(),
                        panic_message(payload.as_ref())
                    );
                }
            }
            Err(err) => {
                counters.read_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("capture from {} failed: {:#}", device.describe(), err);
            }
        }

        // Pace to the locked rate.
        let elapsed = frame_start.elapsed();
        if elapsed < interval {
            std::thread::sleep(interval - elapsed);
        }
    }
    device
}
