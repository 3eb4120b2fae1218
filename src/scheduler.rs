//! Frame scheduler: single-flight admission control.
//!
//! The scheduler sits between the capture thread and the inference engine:
//!
//! | state    | event               | action                                  | next     |
//! |----------|---------------------|-----------------------------------------|----------|
//! | Idle     | frame arrives       | convert, submit                         | InFlight |
//! | InFlight | frame arrives       | drop the frame untouched                | InFlight |
//! | InFlight | inference completes | release image, dispatch label           | Idle     |
//! | any      | conversion fails    | release partial resources               | Idle     |
//! | InFlight | inference fails     | release image, keep last label          | Idle     |
//!
//! Admission is a compare-and-swap on an atomic state flag. The swap back to
//! `Idle` is owned by a `FlightGuard` that travels with the request, so every
//! exit path (success, failure, dropped request, panic) restores `Idle` exactly
//! once.
//!
//! Frames are never queued: at most one request exists, and every frame that
//! arrives while it runs is discarded.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use crate::convert::ImageConverter;
use crate::engine::{EngineError, InferenceEngine};
use crate::error::SetupError;
use crate::frame::{FrameMeta, RawFrame};
use crate::gpu::{GpuContext, GpuImage};
use crate::sink::Presenter;
use crate::source::FrameCallback;

const IDLE: u8 = 0;
const IN_FLIGHT: u8 = 1;

const DEFAULT_SLOW_INFERENCE: Duration = Duration::from_millis(200);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    InFlight,
}

/// Where the admitted request waits for the engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SubmissionMode {
    /// Submit and wait on the thread that delivered the frame.
    Blocking,
    /// Hand the request to a dedicated inference thread.
    #[default]
    Detached,
}

impl FromStr for SubmissionMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "blocking" => Ok(SubmissionMode::Blocking),
            "detached" => Ok(SubmissionMode::Detached),
            other => Err(anyhow!("unknown scheduler mode '{}'", other)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub mode: SubmissionMode,
    /// Discard labels whose source frame is older than this at completion.
    /// `None` publishes every completed label.
    pub max_label_age: Option<Duration>,
    /// Log a warning when one inference takes longer than this.
    pub slow_inference: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: SubmissionMode::default(),
            max_label_age: None,
            slow_inference: DEFAULT_SLOW_INFERENCE,
        }
    }
}

/// Counter snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct SchedulerStats {
    pub frames_received: u64,
    pub frames_admitted: u64,
    pub frames_dropped_busy: u64,
    pub conversion_failures: u64,
    pub inference_failures: u64,
    pub stale_labels: u64,
    pub labels_published: u64,
}

#[derive(Default)]
struct Counters {
    frames_received: AtomicU64,
    frames_admitted: AtomicU64,
    frames_dropped_busy: AtomicU64,
    conversion_failures: AtomicU64,
    inference_failures: AtomicU64,
    stale_labels: AtomicU64,
    labels_published: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SchedulerStats {
        SchedulerStats {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_admitted: self.frames_admitted.load(Ordering::Relaxed),
            frames_dropped_busy: self.frames_dropped_busy.load(Ordering::Relaxed),
            conversion_failures: self.conversion_failures.load(Ordering::Relaxed),
            inference_failures: self.inference_failures.load(Ordering::Relaxed),
            stale_labels: self.stale_labels.load(Ordering::Relaxed),
            labels_published: self.labels_published.load(Ordering::Relaxed),
        }
    }
}

/// Exclusive right to run one inference. Dropping it returns the pipeline to idle.
struct FlightGuard {
    state: Arc<AtomicU8>,
}

impl FlightGuard {
    fn acquire(state: &Arc<AtomicU8>) -> Option<Self> {
        state
            .compare_exchange(IDLE, IN_FLIGHT, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self {
                state: state.clone(),
            })
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.state.store(IDLE, Ordering::Release);
    }
}

/// One admitted frame's image on its way through the engine.
struct InferenceRequest {
    image: GpuImage,
    meta: FrameMeta,
    guard: FlightGuard,
}

struct Shared {
    state: Arc<AtomicU8>,
    converter: ImageConverter,
    gpu: Arc<GpuContext>,
    engine: Mutex<Box<dyn InferenceEngine>>,
    presenter: Presenter,
    config: SchedulerConfig,
    counters: Counters,
}

impl Shared {
    fn complete(&self, request: InferenceRequest) {
        let InferenceRequest { image, meta, guard } = request;

        let started = Instant::now();
        let result = {
            let mut engine = self.engine.lock().unwrap_or_else(PoisonError::into_inner);
            // A panicking engine is one failed request, not a dead pipeline.
            panic::catch_unwind(AssertUnwindSafe(|| {
                self.gpu.submit(|| engine.forward(&image))
            }))
            .unwrap_or_else(|payload| {
                log::error!(
                    "engine {} panicked on frame {}: {}",
                    engine.name(),
                    meta.sequence,
                    panic_message(payload.as_ref())
                );
                Err(EngineError::Runtime("engine panicked".to_string()))
            })
        };
        drop(image);

        let elapsed = started.elapsed();
        if elapsed > self.config.slow_inference {
            log::warn!(
                "inference for frame {} took {} ms (warning threshold {} ms)",
                meta.sequence,
                elapsed.as_millis(),
                self.config.slow_inference.as_millis()
            );
        }

        match result {
            Ok(label) => {
                let age = meta.captured_at.elapsed();
                if self.config.max_label_age.is_some_and(|max| age > max) {
                    Counters::bump(&self.counters.stale_labels);
                    log::debug!(
                        "discarding stale label '{}' for frame {} ({} ms old)",
                        label,
                        meta.sequence,
                        age.as_millis()
                    );
                } else if self.presenter.dispatch(label) {
                    Counters::bump(&self.counters.labels_published);
                } else {
                    log::warn!(
                        "presentation thread stopped; label for frame {} not delivered",
                        meta.sequence
                    );
                }
            }
            Err(err) => {
                Counters::bump(&self.counters.inference_failures);
                log::warn!("inference failed for frame {}: {}", meta.sequence, err);
            }
        }

        drop(guard);
    }
}

struct Worker {
    tx: mpsc::SyncSender<InferenceRequest>,
    join: JoinHandle<()>,
}

/// Single-flight frame scheduler.
pub struct FrameScheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl FrameScheduler {
    /// Build the scheduler. Warms up the engine and, in detached mode, starts the
    /// inference thread.
    pub fn new(
        gpu: Arc<GpuContext>,
        mut engine: Box<dyn InferenceEngine>,
        presenter: Presenter,
        config: SchedulerConfig,
    ) -> Result<Self, SetupError> {
        engine.warm_up()?;
        let converter = ImageConverter::new(gpu.clone(), engine.input_shape());
        log::info!(
            "scheduler ready: engine={} input={}x{} mode={:?}",
            engine.name(),
            converter.shape().width,
            converter.shape().height,
            config.mode
        );

        let shared = Arc::new(Shared {
            state: Arc::new(AtomicU8::new(IDLE)),
            converter,
            gpu,
            engine: Mutex::new(engine),
            presenter,
            config,
            counters: Counters::default(),
        });

        let worker = match shared.config.mode {
            SubmissionMode::Blocking => None,
            SubmissionMode::Detached => Some(spawn_worker(shared.clone())?),
        };

        Ok(Self {
            shared,
            worker: Mutex::new(worker),
        })
    }

    /// Ingestion entry point, called once per captured frame.
    ///
    /// In blocking mode an admitted frame occupies the caller until the engine
    /// returns. In detached mode this never waits on the engine.
    pub fn on_frame(&self, frame: RawFrame) {
        let shared = &self.shared;
        Counters::bump(&shared.counters.frames_received);

        let Some(guard) = FlightGuard::acquire(&shared.state) else {
            Counters::bump(&shared.counters.frames_dropped_busy);
            log::debug!("frame {} dropped: inference in flight", frame.sequence);
            return;
        };

        let meta = frame.metadata();
        let image = match shared.converter.convert(&frame) {
            Ok(image) => image,
            Err(err) => {
                Counters::bump(&shared.counters.conversion_failures);
                log::warn!("frame {} dropped: {}", meta.sequence, err);
                return;
            }
        };
        drop(frame);

        Counters::bump(&shared.counters.frames_admitted);
        log::debug!("frame {} admitted as image {}", meta.sequence, image.id());
        let request = InferenceRequest { image, meta, guard };

        match shared.config.mode {
            SubmissionMode::Blocking => shared.complete(request),
            SubmissionMode::Detached => self.hand_off(request),
        }
    }

    fn hand_off(&self, request: InferenceRequest) {
        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(worker) = worker.as_ref() else {
            log::warn!("frame {} dropped: scheduler shut down", request.meta.sequence);
            return;
        };
        // The channel holds one slot and admission guarantees it is empty.
        if let Err(err) = worker.tx.try_send(request) {
            let request = match err {
                mpsc::TrySendError::Full(request) | mpsc::TrySendError::Disconnected(request) => {
                    request
                }
            };
            log::warn!(
                "frame {} dropped: inference thread unavailable",
                request.meta.sequence
            );
        }
    }

    pub fn state(&self) -> PipelineState {
        match self.shared.state.load(Ordering::Acquire) {
            IDLE => PipelineState::Idle,
            _ => PipelineState::InFlight,
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        self.shared.counters.snapshot()
    }

    pub fn mode(&self) -> SubmissionMode {
        self.shared.config.mode
    }

    /// Frame callback for a `FrameSource`.
    pub fn callback(self: &Arc<Self>) -> FrameCallback {
        let scheduler = self.clone();
        Arc::new(move |frame| scheduler.on_frame(frame))
    }

    /// Stop the inference thread after it finishes any in-flight request.
    pub fn shutdown(&self) -> Result<()> {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Worker { tx, join }) = worker else {
            return Ok(());
        };
        drop(tx);
        join.join()
            .map_err(|_| anyhow!("inference thread panicked"))?;
        log::info!("inference thread stopped");
        Ok(())
    }
}

impl Drop for FrameScheduler {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::error!("{}", err);
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

fn spawn_worker(shared: Arc<Shared>) -> Result<Worker, SetupError> {
    let (tx, rx) = mpsc::sync_channel::<InferenceRequest>(1);
    let join = std::thread::Builder::new()
        .name("inference".to_string())
        .spawn(move || {
            while let Ok(request) = rx.recv() {
                shared.complete(request);
            }
        })?;
    Ok(Worker { tx, join })
}
