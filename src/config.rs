use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::{EngineKind, EngineSettings, InputShape};
use crate::frame::{Orientation, PixelFormat};
use crate::gpu::GpuConfig;
use crate::scheduler::{SchedulerConfig, SubmissionMode};
use crate::source::CaptureSettings;

const MAX_FPS: u32 = 240;

#[derive(Debug, Deserialize, Default)]
struct RecognizerConfigFile {
    capture: Option<CaptureConfigFile>,
    engine: Option<EngineConfigFile>,
    scheduler: Option<SchedulerConfigFile>,
    gpu: Option<GpuConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    device: Option<String>,
    fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    pixel_format: Option<PixelFormat>,
    orientation: Option<Orientation>,
}

#[derive(Debug, Deserialize, Default)]
struct EngineConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    labels_path: Option<PathBuf>,
    input_width: Option<u32>,
    input_height: Option<u32>,
    simulated_latency_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SchedulerConfigFile {
    mode: Option<String>,
    max_label_age_ms: Option<u64>,
    slow_inference_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct GpuConfigFile {
    max_live_images: Option<usize>,
    memory_budget_bytes: Option<usize>,
}

/// Resolved configuration for the recognizer pipeline.
#[derive(Debug, Clone, Default)]
pub struct RecognizerConfig {
    pub capture: CaptureSettings,
    pub engine: EngineSettings,
    pub scheduler: SchedulerConfig,
    pub gpu: GpuConfig,
}

impl RecognizerConfig {
    /// File named by `RECOGNIZER_CONFIG` (if any), then environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("RECOGNIZER_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load a specific file without consulting the environment.
    pub fn from_path(path: &Path) -> Result<Self> {
        let mut cfg = Self::from_file(read_config_file(path)?)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RecognizerConfigFile) -> Result<Self> {
        let defaults = Self::default();

        let capture_file = file.capture.unwrap_or_default();
        let capture = CaptureSettings {
            device: capture_file.device.unwrap_or(defaults.capture.device),
            fps: capture_file.fps.unwrap_or(defaults.capture.fps),
            width: capture_file.width.unwrap_or(defaults.capture.width),
            height: capture_file.height.unwrap_or(defaults.capture.height),
            format: capture_file.pixel_format.unwrap_or(defaults.capture.format),
            orientation: capture_file
                .orientation
                .unwrap_or(defaults.capture.orientation),
        };

        let engine_file = file.engine.unwrap_or_default();
        let backend = match engine_file.backend.as_deref() {
            Some(name) => name.parse::<EngineKind>()?,
            None => defaults.engine.backend,
        };
        let engine = EngineSettings {
            backend,
            model_path: engine_file.model_path,
            labels_path: engine_file.labels_path,
            input: InputShape {
                width: engine_file
                    .input_width
                    .unwrap_or(defaults.engine.input.width),
                height: engine_file
                    .input_height
                    .unwrap_or(defaults.engine.input.height),
            },
            simulated_latency: engine_file
                .simulated_latency_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.engine.simulated_latency),
        };

        let scheduler_file = file.scheduler.unwrap_or_default();
        let mode = match scheduler_file.mode.as_deref() {
            Some(mode) => mode.parse::<SubmissionMode>()?,
            None => defaults.scheduler.mode,
        };
        let scheduler = SchedulerConfig {
            mode,
            max_label_age: scheduler_file.max_label_age_ms.map(Duration::from_millis),
            slow_inference: scheduler_file
                .slow_inference_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.scheduler.slow_inference),
        };

        let gpu_file = file.gpu.unwrap_or_default();
        let gpu = GpuConfig {
            max_live_images: gpu_file
                .max_live_images
                .unwrap_or(defaults.gpu.max_live_images),
            memory_budget_bytes: gpu_file
                .memory_budget_bytes
                .unwrap_or(defaults.gpu.memory_budget_bytes),
        };

        Ok(Self {
            capture,
            engine,
            scheduler,
            gpu,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(device) = std::env::var("RECOGNIZER_DEVICE") {
            if !device.trim().is_empty() {
                self.capture.device = device.trim().to_string();
            }
        }
        if let Ok(fps) = std::env::var("RECOGNIZER_FPS") {
            self.capture.fps = fps
                .trim()
                .parse()
                .map_err(|_| anyhow!("RECOGNIZER_FPS must be an integer frame rate"))?;
        }
        if let Ok(backend) = std::env::var("RECOGNIZER_ENGINE") {
            if !backend.trim().is_empty() {
                self.engine.backend = backend.parse()?;
            }
        }
        if let Ok(model) = std::env::var("RECOGNIZER_MODEL") {
            if !model.trim().is_empty() {
                self.engine.model_path = Some(PathBuf::from(model.trim()));
            }
        }
        if let Ok(labels) = std::env::var("RECOGNIZER_LABELS") {
            if !labels.trim().is_empty() {
                self.engine.labels_path = Some(PathBuf::from(labels.trim()));
            }
        }
        if let Ok(mode) = std::env::var("RECOGNIZER_MODE") {
            if !mode.trim().is_empty() {
                self.scheduler.mode = mode.parse()?;
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.capture.device.trim().is_empty() {
            return Err(anyhow!("capture.device must not be empty"));
        }
        if !(1..=MAX_FPS).contains(&self.capture.fps) {
            return Err(anyhow!(
                "capture.fps must be between 1 and {} (got {})",
                MAX_FPS,
                self.capture.fps
            ));
        }
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(anyhow!("capture width and height must be greater than zero"));
        }
        if self.engine.input.width == 0 || self.engine.input.height == 0 {
            return Err(anyhow!(
                "engine input width and height must be greater than zero"
            ));
        }
        if self.engine.backend == EngineKind::Tract
            && (self.engine.model_path.is_none() || self.engine.labels_path.is_none())
        {
            return Err(anyhow!(
                "tract backend requires engine.model_path and engine.labels_path"
            ));
        }
        if self.gpu.max_live_images == 0 {
            return Err(anyhow!("gpu.max_live_images must be greater than zero"));
        }
        if self.scheduler.max_label_age == Some(Duration::ZERO) {
            return Err(anyhow!("scheduler.max_label_age_ms must be greater than zero"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<RecognizerConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
