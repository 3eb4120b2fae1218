//! Inference engine boundary.
//!
//! The network itself is an external collaborator; the pipeline only sees the
//! `InferenceEngine` trait. Backends:
//! - `stub`: deterministic labels from image content (tests, demos)
//! - `tract`: ONNX classifier (feature: engine-tract)

mod backend;
mod backends;
mod label;

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Result};

pub use backend::{EngineError, InferenceEngine, InputShape};
pub use backends::StubEngine;
#[cfg(feature = "engine-tract")]
pub use backends::TractEngine;
pub use label::Label;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EngineKind {
    #[default]
    Stub,
    Tract,
}

impl FromStr for EngineKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stub" => Ok(EngineKind::Stub),
            "tract" => Ok(EngineKind::Tract),
            other => Err(anyhow!("unknown engine backend '{}'", other)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct EngineSettings {
    pub backend: EngineKind,
    pub model_path: Option<PathBuf>,
    pub labels_path: Option<PathBuf>,
    pub input: InputShape,
    /// Stub only: simulated cost of one forward pass.
    pub simulated_latency: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            backend: EngineKind::Stub,
            model_path: None,
            labels_path: None,
            input: InputShape {
                width: 299,
                height: 299,
            },
            simulated_latency: Duration::ZERO,
        }
    }
}

/// Build the configured engine.
pub fn from_settings(settings: &EngineSettings) -> Result<Box<dyn InferenceEngine>> {
    match settings.backend {
        EngineKind::Stub => Ok(Box::new(
            StubEngine::new(settings.input).with_latency(settings.simulated_latency),
        )),
        EngineKind::Tract => build_tract(settings),
    }
}

#[cfg(feature = "engine-tract")]
fn build_tract(settings: &EngineSettings) -> Result<Box<dyn InferenceEngine>> {
    let model = settings
        .model_path
        .as_ref()
        .ok_or_else(|| anyhow!("tract engine requires engine.model_path"))?;
    let labels = settings
        .labels_path
        .as_ref()
        .ok_or_else(|| anyhow!("tract engine requires engine.labels_path"))?;
    Ok(Box::new(TractEngine::new(model, labels, settings.input)?))
}

#[cfg(not(feature = "engine-tract"))]
fn build_tract(_settings: &EngineSettings) -> Result<Box<dyn InferenceEngine>> {
    Err(anyhow!("tract engine requires the engine-tract feature"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_stub_from_defaults() -> Result<()> {
        let engine = from_settings(&EngineSettings::default())?;
        assert_eq!(engine.name(), "stub");
        assert_eq!(
            engine.input_shape(),
            InputShape {
                width: 299,
                height: 299
            }
        );
        Ok(())
    }

    #[test]
    fn parses_backend_names() -> Result<()> {
        assert_eq!("Tract".parse::<EngineKind>()?, EngineKind::Tract);
        assert!("coreml".parse::<EngineKind>().is_err());
        Ok(())
    }
}
