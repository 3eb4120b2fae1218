//! demo - end-to-end synthetic run of the live recognizer
//!
//! Drives the synthetic camera through the stub engine with a simulated
//! inference cost, so the effect of single-flight admission is visible: with a
//! 20 fps camera and a 120 ms engine, most frames are dropped and the label
//! stream stays current.

use anyhow::{anyhow, Result};
use clap::Parser;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use live_recognizer::gpu::GpuStats;
use live_recognizer::{
    CaptureSettings, FanOut, FrameScheduler, FrameSource, GpuConfig, GpuContext, InputShape,
    LatestLabel, LogSink, PresentationThread, SchedulerConfig, SchedulerStats, SourceStats,
    StaticAuthorizer, StubEngine, SubmissionMode, SyntheticCamera,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Duration of the run in seconds.
    #[arg(long, default_value_t = 5)]
    seconds: u64,
    /// Frames per second for the synthetic camera.
    #[arg(long, default_value_t = 20)]
    fps: u32,
    /// Simulated inference latency in milliseconds.
    #[arg(long, default_value_t = 120)]
    latency_ms: u64,
    /// Submission mode: detached or blocking.
    #[arg(long, default_value = "detached")]
    mode: SubmissionMode,
    /// Fail every Nth inference to exercise error handling.
    #[arg(long)]
    fail_every: Option<u64>,
    /// Print the summary as JSON instead of text.
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct Summary {
    seconds: u64,
    fps: u32,
    latency_ms: u64,
    mode: String,
    source: SourceStats,
    scheduler: SchedulerStats,
    gpu: GpuStats,
    sink_updates: u64,
    last_label: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();
    if args.fps == 0 {
        return Err(anyhow!("fps must be >= 1"));
    }
    if args.fail_every == Some(0) {
        return Err(anyhow!("fail-every must be >= 1"));
    }

    stage("open gpu context");
    let gpu = GpuContext::host(GpuConfig::default())?;

    stage("build stub engine");
    let mut engine = StubEngine::new(InputShape {
        width: 299,
        height: 299,
    })
    .with_latency(Duration::from_millis(args.latency_ms));
    if let Some(n) = args.fail_every {
        engine = engine.with_fail_every(n);
    }

    stage("start presentation thread");
    let latest = LatestLabel::new();
    let presentation = {
        let latest = latest.clone();
        PresentationThread::spawn("presentation", move || {
            FanOut::new().with(LogSink::new()).with(latest)
        })?
    };

    let scheduler = Arc::new(FrameScheduler::new(
        gpu.clone(),
        Box::new(engine),
        presentation.presenter(),
        SchedulerConfig {
            mode: args.mode,
            ..SchedulerConfig::default()
        },
    )?);

    let settings = CaptureSettings {
        device: "stub://demo".to_string(),
        fps: args.fps,
        ..CaptureSettings::default()
    };
    let mut source = FrameSource::new(
        SyntheticCamera::new(settings.device.clone()),
        Box::new(StaticAuthorizer::authorized()),
        settings,
        scheduler.callback(),
    );

    stage("capture synthetic frames");
    source.start()?;
    std::thread::sleep(Duration::from_secs(args.seconds));
    source.stop();
    scheduler.shutdown()?;
    presentation.shutdown()?;

    let summary = Summary {
        seconds: args.seconds,
        fps: args.fps,
        latency_ms: args.latency_ms,
        mode: format!("{:?}", args.mode).to_lowercase(),
        source: source.stats(),
        scheduler: scheduler.stats(),
        gpu: gpu.stats(),
        sink_updates: latest.updates(),
        last_label: latest.get().map(|label| label.to_string()),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

fn print_summary(summary: &Summary) {
    let stats = &summary.scheduler;
    println!("demo summary");
    println!(
        "  run:        {} s at {} fps, {} ms inference, {} mode",
        summary.seconds, summary.fps, summary.latency_ms, summary.mode
    );
    println!(
        "  frames:     captured={} admitted={} dropped={}",
        summary.source.frames_captured, stats.frames_admitted, stats.frames_dropped_busy
    );
    println!(
        "  labels:     published={} sink_updates={} stale={}",
        stats.labels_published, summary.sink_updates, stats.stale_labels
    );
    println!(
        "  failures:   conversion={} inference={}",
        stats.conversion_failures, stats.inference_failures
    );
    println!(
        "  gpu:        allocated={} released={} live={}",
        summary.gpu.allocated, summary.gpu.released, summary.gpu.live_images
    );
    match &summary.last_label {
        Some(label) => println!("  last label: {}", label),
        None => println!("  last label: (none)"),
    }
}

fn stage(msg: &str) {
    eprintln!("demo: {}", msg);
}
