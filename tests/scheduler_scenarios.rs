use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use live_recognizer::{
    CaptureSettings, EngineError, FanOut, FrameScheduler, FrameSource, GpuConfig, GpuContext,
    GpuImage, InferenceEngine, InputShape, Label, LatestLabel, PipelineState, PixelFormat,
    Orientation, PresentationThread, RawFrame, ResultSink, SchedulerConfig, StaticAuthorizer,
    StubEngine, SubmissionMode, SyntheticCamera,
};

const SHAPE: InputShape = InputShape {
    width: 4,
    height: 4,
};
const WAIT: Duration = Duration::from_secs(2);

/// Engine whose every result is supplied by the test.
struct ScriptedEngine {
    started: Sender<u64>,
    results: Receiver<Result<Label, EngineError>>,
}

impl InferenceEngine for ScriptedEngine {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn input_shape(&self) -> InputShape {
        SHAPE
    }

    fn forward(&mut self, image: &GpuImage) -> Result<Label, EngineError> {
        let _ = self.started.send(image.id());
        self.results
            .recv()
            .unwrap_or_else(|_| Err(EngineError::Runtime("script ended".to_string())))
    }
}

/// Records every publish with the thread it ran on.
struct RecordingSink {
    tx: Sender<(ThreadId, String)>,
}

impl ResultSink for RecordingSink {
    fn publish(&mut self, label: &Label) {
        let _ = self
            .tx
            .send((std::thread::current().id(), label.text().to_string()));
    }
}

// Field order matters: `results` drops first so a blocked engine unblocks
// before the scheduler joins its inference thread.
struct Harness {
    results: Sender<Result<Label, EngineError>>,
    gpu: Arc<GpuContext>,
    scheduler: FrameScheduler,
    presentation: PresentationThread,
    started: Receiver<u64>,
    published: Receiver<(ThreadId, String)>,
    latest: LatestLabel,
}

impl Harness {
    fn new(config: SchedulerConfig) -> Self {
        Self::with_gpu(config, GpuConfig::default())
    }

    fn with_gpu(config: SchedulerConfig, gpu_config: GpuConfig) -> Self {
        let gpu = GpuContext::host(gpu_config).expect("gpu context");
        let (started_tx, started) = mpsc::channel();
        let (results, results_rx) = mpsc::channel();
        let engine = ScriptedEngine {
            started: started_tx,
            results: results_rx,
        };

        let (published_tx, published) = mpsc::channel();
        let latest = LatestLabel::new();
        let sink_latest = latest.clone();
        let presentation = PresentationThread::spawn("presentation", move || {
            FanOut::new()
                .with(RecordingSink { tx: published_tx })
                .with(sink_latest)
        })
        .expect("presentation thread");

        let scheduler =
            FrameScheduler::new(gpu.clone(), Box::new(engine), presentation.presenter(), config)
                .expect("scheduler");

        Self {
            results,
            gpu,
            scheduler,
            presentation,
            started,
            published,
            latest,
        }
    }

    fn wait_idle(&self) {
        let deadline = Instant::now() + WAIT;
        while self.scheduler.state() != PipelineState::Idle {
            assert!(Instant::now() < deadline, "scheduler never returned to idle");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn presentation_thread(&self) -> ThreadId {
        self.presentation.presenter().thread_id()
    }
}

fn detached() -> SchedulerConfig {
    SchedulerConfig::default()
}

fn blocking() -> SchedulerConfig {
    SchedulerConfig {
        mode: SubmissionMode::Blocking,
        ..SchedulerConfig::default()
    }
}

fn frame(sequence: u64) -> RawFrame {
    let (width, height) = (8, 6);
    let data = (0..width * height * 4).map(|i| (i % 251) as u8).collect();
    RawFrame::new(
        data,
        width,
        height,
        PixelFormat::Bgra32,
        Orientation::Upright,
        sequence,
    )
}

fn corrupt_frame(sequence: u64) -> RawFrame {
    RawFrame::new(
        vec![0u8; 10],
        8,
        6,
        PixelFormat::Bgra32,
        Orientation::Upright,
        sequence,
    )
}

#[test]
fn frames_arriving_while_busy_are_dropped() {
    let h = Harness::new(detached());

    h.scheduler.on_frame(frame(1));
    h.started.recv_timeout(WAIT).expect("first frame admitted");
    assert_eq!(h.scheduler.state(), PipelineState::InFlight);

    h.scheduler.on_frame(frame(2));
    h.scheduler.on_frame(frame(3));
    let stats = h.scheduler.stats();
    assert_eq!(stats.frames_received, 3);
    assert_eq!(stats.frames_admitted, 1);
    assert_eq!(stats.frames_dropped_busy, 2);
    // Dropped frames never reach the converter.
    assert_eq!(h.gpu.stats().allocated, 1);

    h.results.send(Ok(Label::new("cat"))).expect("script result");
    let (thread, text) = h.published.recv_timeout(WAIT).expect("label published");
    assert_eq!(text, "cat");
    assert_eq!(thread, h.presentation_thread());
    h.wait_idle();

    assert!(h.published.recv_timeout(Duration::from_millis(100)).is_err());
    assert!(h.started.try_recv().is_err(), "only one forward pass ran");
    assert_eq!(h.scheduler.stats().labels_published, 1);
}

#[test]
fn idle_pipeline_admits_and_publishes_on_presentation_thread() {
    let h = Harness::new(blocking());
    h.results.send(Ok(Label::new("dog"))).expect("script result");

    h.scheduler.on_frame(frame(1));
    // Blocking mode returns only once the request completed.
    assert_eq!(h.scheduler.state(), PipelineState::Idle);

    let (thread, text) = h.published.recv_timeout(WAIT).expect("label published");
    assert_eq!(text, "dog");
    assert_eq!(thread, h.presentation_thread());
    assert_ne!(thread, std::thread::current().id());
}

#[test]
fn conversion_failure_returns_to_idle() {
    for config in [blocking(), detached()] {
        let h = Harness::new(config);

        h.scheduler.on_frame(corrupt_frame(1));
        assert_eq!(h.scheduler.state(), PipelineState::Idle);
        let stats = h.scheduler.stats();
        assert_eq!(stats.conversion_failures, 1);
        assert_eq!(stats.frames_admitted, 0);
        assert!(h.started.try_recv().is_err(), "engine never invoked");

        // The next frame is admitted normally.
        h.results.send(Ok(Label::new("cup"))).expect("script result");
        h.scheduler.on_frame(frame(2));
        let (_, text) = h.published.recv_timeout(WAIT).expect("label published");
        assert_eq!(text, "cup");
        h.wait_idle();
    }
}

#[test]
fn exhausted_image_budget_drops_the_frame() {
    let h = Harness::with_gpu(
        blocking(),
        GpuConfig {
            max_live_images: 1,
            ..GpuConfig::default()
        },
    );
    let held = h.gpu.allocate_image(2, 2).expect("held image");

    h.scheduler.on_frame(frame(1));
    assert_eq!(h.scheduler.state(), PipelineState::Idle);
    assert_eq!(h.scheduler.stats().conversion_failures, 1);

    drop(held);
    h.results.send(Ok(Label::new("pen"))).expect("script result");
    h.scheduler.on_frame(frame(2));
    let (_, text) = h.published.recv_timeout(WAIT).expect("label published");
    assert_eq!(text, "pen");
}

#[test]
fn engine_failure_keeps_the_last_label() {
    let h = Harness::new(detached());

    h.results.send(Ok(Label::new("banana"))).expect("script result");
    h.scheduler.on_frame(frame(1));
    h.published.recv_timeout(WAIT).expect("first label");
    h.wait_idle();

    h.results
        .send(Err(EngineError::Runtime("device lost".to_string())))
        .expect("script result");
    h.scheduler.on_frame(frame(2));
    h.started.recv_timeout(WAIT).expect("first forward");
    h.started.recv_timeout(WAIT).expect("second forward");
    h.wait_idle();

    assert!(h.published.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(
        h.latest.get().map(|label| label.text().to_string()),
        Some("banana".to_string())
    );
    let stats = h.scheduler.stats();
    assert_eq!(stats.inference_failures, 1);
    assert_eq!(stats.labels_published, 1);
}

#[test]
fn every_image_is_released() {
    let h = Harness::new(detached());

    h.scheduler.on_frame(corrupt_frame(1));
    for sequence in 2..6 {
        let outcome = if sequence % 2 == 0 {
            Ok(Label::new("ok"))
        } else {
            Err(EngineError::Runtime("flaky".to_string()))
        };
        h.results.send(outcome).expect("script result");
        h.scheduler.on_frame(frame(sequence));
        h.started.recv_timeout(WAIT).expect("forward");
        h.wait_idle();
    }

    let gpu = h.gpu.stats();
    assert_eq!(gpu.live_images, 0);
    assert_eq!(gpu.live_bytes, 0);
    assert_eq!(gpu.allocated, gpu.released);
    assert_eq!(gpu.allocated, 4);
}

#[test]
fn stale_labels_are_discarded() {
    let h = Harness::new(SchedulerConfig {
        max_label_age: Some(Duration::from_millis(10)),
        ..SchedulerConfig::default()
    });

    h.scheduler.on_frame(frame(1));
    h.started.recv_timeout(WAIT).expect("admitted");
    std::thread::sleep(Duration::from_millis(40));
    h.results.send(Ok(Label::new("late"))).expect("script result");
    h.wait_idle();

    assert!(h.published.recv_timeout(Duration::from_millis(100)).is_err());
    let stats = h.scheduler.stats();
    assert_eq!(stats.stale_labels, 1);
    assert_eq!(stats.labels_published, 0);
}

#[test]
fn shutdown_drops_later_frames() {
    let h = Harness::new(detached());
    h.scheduler.shutdown().expect("shutdown");
    h.scheduler.shutdown().expect("second shutdown is a no-op");

    h.scheduler.on_frame(frame(1));
    h.wait_idle();
    assert!(h.started.try_recv().is_err());
    assert_eq!(h.gpu.stats().live_images, 0);
}

/// Panics on its first forward pass, then recognizes everything as "recovered".
struct PanickingEngine {
    calls: usize,
}

impl InferenceEngine for PanickingEngine {
    fn name(&self) -> &'static str {
        "panicking"
    }

    fn input_shape(&self) -> InputShape {
        SHAPE
    }

    fn forward(&mut self, _image: &GpuImage) -> Result<Label, EngineError> {
        self.calls += 1;
        if self.calls == 1 {
            panic!("kernel assertion failed");
        }
        Ok(Label::new("recovered"))
    }
}

#[test]
fn engine_panic_is_an_inference_failure() {
    for config in [detached(), blocking()] {
        let gpu = GpuContext::host(GpuConfig::default()).expect("gpu context");
        let latest = LatestLabel::new();
        let sink = latest.clone();
        let presentation =
            PresentationThread::spawn("presentation", move || sink).expect("presentation thread");
        let scheduler = FrameScheduler::new(
            gpu.clone(),
            Box::new(PanickingEngine { calls: 0 }),
            presentation.presenter(),
            config,
        )
        .expect("scheduler");

        let wait_idle = || {
            let deadline = Instant::now() + WAIT;
            while scheduler.state() != PipelineState::Idle {
                assert!(Instant::now() < deadline, "scheduler never returned to idle");
                std::thread::sleep(Duration::from_millis(1));
            }
        };

        scheduler.on_frame(frame(1));
        let deadline = Instant::now() + WAIT;
        while scheduler.stats().inference_failures == 0 {
            assert!(Instant::now() < deadline, "engine panic was not recorded");
            std::thread::sleep(Duration::from_millis(1));
        }
        wait_idle();
        assert!(latest.get().is_none());

        // The worker survived the panic and serves the next frame.
        scheduler.on_frame(frame(2));
        let deadline = Instant::now() + WAIT;
        while latest.get().is_none() {
            assert!(Instant::now() < deadline, "no label after engine panic");
            std::thread::sleep(Duration::from_millis(1));
        }
        wait_idle();

        let stats = scheduler.stats();
        assert_eq!(stats.frames_admitted, 2);
        assert_eq!(stats.inference_failures, 1);
        assert_eq!(stats.labels_published, 1);
        assert_eq!(
            latest.get().map(|label| label.text().to_string()),
            Some("recovered".to_string())
        );
        assert_eq!(gpu.stats().live_images, 0);

        scheduler.shutdown().expect("scheduler shutdown");
        presentation.shutdown().expect("presentation shutdown");
    }
}

/// Counts concurrent forward passes.
struct ConcurrencyGauge {
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl InferenceEngine for ConcurrencyGauge {
    fn name(&self) -> &'static str {
        "gauge"
    }

    fn input_shape(&self) -> InputShape {
        SHAPE
    }

    fn forward(&mut self, _image: &GpuImage) -> Result<Label, EngineError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(2));
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(Label::new("gauge"))
    }
}

#[test]
fn concurrent_producers_never_exceed_one_request() {
    let gpu = GpuContext::host(GpuConfig::default()).expect("gpu context");
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let engine = ConcurrencyGauge {
        active: active.clone(),
        peak: peak.clone(),
    };
    let presentation =
        PresentationThread::spawn("presentation", LatestLabel::new).expect("presentation thread");
    let scheduler = Arc::new(
        FrameScheduler::new(gpu.clone(), Box::new(engine), presentation.presenter(), blocking())
            .expect("scheduler"),
    );

    let producers: Vec<_> = (0..4)
        .map(|worker| {
            let scheduler = scheduler.clone();
            std::thread::spawn(move || {
                for i in 0..50 {
                    scheduler.on_frame(frame(worker * 100 + i));
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().expect("producer thread");
    }

    let stats = scheduler.stats();
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(stats.frames_received, 200);
    assert_eq!(
        stats.frames_admitted + stats.frames_dropped_busy,
        stats.frames_received
    );
    assert!(stats.frames_dropped_busy > 0);
    assert_eq!(gpu.stats().live_images, 0);
    presentation.shutdown().expect("presentation shutdown");
}

#[test]
fn synthetic_camera_drives_the_pipeline() {
    let gpu = GpuContext::host(GpuConfig::default()).expect("gpu context");
    let engine = StubEngine::new(SHAPE).with_latency(Duration::from_millis(30));
    let latest = LatestLabel::new();
    let sink = latest.clone();
    let presentation =
        PresentationThread::spawn("presentation", move || sink).expect("presentation thread");
    let scheduler = Arc::new(
        FrameScheduler::new(gpu.clone(), Box::new(engine), presentation.presenter(), detached())
            .expect("scheduler"),
    );

    let settings = CaptureSettings {
        device: "stub://pipeline".to_string(),
        fps: 100,
        width: 32,
        height: 24,
        ..CaptureSettings::default()
    };
    let mut source = FrameSource::new(
        SyntheticCamera::new(settings.device.clone()),
        Box::new(StaticAuthorizer::authorized()),
        settings,
        scheduler.callback(),
    );
    source.start().expect("source start");
    std::thread::sleep(Duration::from_millis(400));
    source.stop();
    scheduler.shutdown().expect("scheduler shutdown");
    presentation.shutdown().expect("presentation shutdown");

    let stats = scheduler.stats();
    assert!(stats.labels_published >= 1);
    assert!(stats.frames_dropped_busy > 0);
    assert_eq!(stats.frames_received, source.stats().frames_captured);
    assert_eq!(latest.updates(), stats.labels_published);
    assert!(latest.get().is_some());
    assert_eq!(gpu.stats().live_images, 0);
}

#[test]
fn odd_sized_nv12_camera_drives_the_pipeline() {
    let gpu = GpuContext::host(GpuConfig::default()).expect("gpu context");
    let latest = LatestLabel::new();
    let sink = latest.clone();
    let presentation =
        PresentationThread::spawn("presentation", move || sink).expect("presentation thread");
    let scheduler = Arc::new(
        FrameScheduler::new(
            gpu.clone(),
            Box::new(StubEngine::new(SHAPE)),
            presentation.presenter(),
            detached(),
        )
        .expect("scheduler"),
    );

    let settings = CaptureSettings {
        device: "stub://odd".to_string(),
        fps: 100,
        width: 33,
        height: 25,
        format: PixelFormat::Nv12,
        ..CaptureSettings::default()
    };
    let mut source = FrameSource::new(
        SyntheticCamera::new(settings.device.clone()),
        Box::new(StaticAuthorizer::authorized()),
        settings,
        scheduler.callback(),
    );
    source.start().expect("source start");
    std::thread::sleep(Duration::from_millis(200));
    assert!(source.is_running());
    source.stop();
    scheduler.shutdown().expect("scheduler shutdown");
    presentation.shutdown().expect("presentation shutdown");

    let source_stats = source.stats();
    let stats = scheduler.stats();
    assert!(source_stats.frames_captured > 0);
    assert_eq!(source_stats.callback_failures, 0);
    assert_eq!(stats.conversion_failures, 0);
    assert!(stats.labels_published >= 1);
    assert_eq!(gpu.stats().live_images, 0);
}
