//! recognizerd - live recognition daemon
//!
//! This daemon:
//! 1. Captures frames from the configured camera (V4L2 or `stub://`)
//! 2. Admits one frame at a time into the inference engine, dropping the rest
//! 3. Publishes each label on the presentation thread
//! 4. Logs pipeline health every few seconds until Ctrl-C

use anyhow::{anyhow, Result};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use live_recognizer::{
    engine, source, Camera, FanOut, FrameScheduler, FrameSource, GpuContext, LatestLabel, LogSink,
    PresentationThread, RecognizerConfig,
};

const HEALTH_INTERVAL: Duration = Duration::from_secs(5);

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = RecognizerConfig::load()?;
    log::info!(
        "recognizerd {} starting: device={} fps={} engine={:?} mode={:?}",
        env!("CARGO_PKG_VERSION"),
        cfg.capture.device,
        cfg.capture.fps,
        cfg.engine.backend,
        cfg.scheduler.mode
    );

    let gpu = GpuContext::host(cfg.gpu.clone())?;
    log::info!("gpu context ready on {}", gpu.device_name());

    let engine = engine::from_settings(&cfg.engine)?;
    log::info!("engine loaded: {}", engine.name());

    let latest = LatestLabel::new();
    let presentation = {
        let latest = latest.clone();
        PresentationThread::spawn("presentation", move || {
            FanOut::new().with(LogSink::new()).with(latest)
        })?
    };

    let scheduler = Arc::new(FrameScheduler::new(
        gpu.clone(),
        engine,
        presentation.presenter(),
        cfg.scheduler.clone(),
    )?);

    let camera = Camera::open(&cfg.capture)?;
    let mut source = FrameSource::new(
        camera,
        source::authorizer_for(&cfg.capture),
        cfg.capture.clone(),
        scheduler.callback(),
    );
    source.start()?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("recognizerd running; waiting for shutdown signal (Ctrl-C)...");
    let mut capture_lost = false;
    loop {
        match rx.recv_timeout(HEALTH_INTERVAL) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                let source_stats = source.stats();
                let stats = scheduler.stats();
                let gpu_stats = gpu.stats();
                log::info!(
                    "health: captured={} read_errors={} admitted={} dropped={} published={} failures={}/{} live_images={}",
                    source_stats.frames_captured,
                    source_stats.read_errors,
                    stats.frames_admitted,
                    stats.frames_dropped_busy,
                    stats.labels_published,
                    stats.conversion_failures,
                    stats.inference_failures,
                    gpu_stats.live_images
                );
                if source_stats.callback_failures > 0 {
                    log::warn!(
                        "{} frames lost to callback failures",
                        source_stats.callback_failures
                    );
                }
                if !source.is_running() {
                    log::error!("capture thread for {} is no longer running", source_stats.device);
                    capture_lost = true;
                    break;
                }
                if let Some(label) = latest.get() {
                    log::debug!("current label: {}", label);
                }
            }
        }
    }

    log::info!("stopping pipeline...");
    source.stop();
    scheduler.shutdown()?;
    presentation.shutdown()?;

    let stats = scheduler.stats();
    log::info!(
        "final: received={} admitted={} dropped={} published={} stale={} conversion_failures={} inference_failures={}",
        stats.frames_received,
        stats.frames_admitted,
        stats.frames_dropped_busy,
        stats.labels_published,
        stats.stale_labels,
        stats.conversion_failures,
        stats.inference_failures
    );
    if capture_lost {
        return Err(anyhow!("capture stopped unexpectedly"));
    }
    Ok(())
}
