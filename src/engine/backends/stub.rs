use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::engine::backend::{check_shape, EngineError, InferenceEngine, InputShape};
use crate::engine::label::Label;
use crate::gpu::GpuImage;

const DEFAULT_LABELS: &[&str] = &[
    "tabby cat",
    "golden retriever",
    "coffee mug",
    "desk lamp",
    "laptop",
    "potted plant",
    "water bottle",
    "keyboard",
];

/// Stub engine for tests and demos. Labels are a deterministic function of the
/// image content.
pub struct StubEngine {
    shape: InputShape,
    labels: Vec<String>,
    latency: Duration,
    fail_every: Option<u64>,
    calls: u64,
}

impl StubEngine {
    pub fn new(shape: InputShape) -> Self {
        Self {
            shape,
            labels: DEFAULT_LABELS.iter().map(|label| label.to_string()).collect(),
            latency: Duration::ZERO,
            fail_every: None,
            calls: 0,
        }
    }

    /// Simulated execution cost per call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail every n-th call (n >= 1).
    pub fn with_fail_every(mut self, n: u64) -> Self {
        self.fail_every = Some(n.max(1));
        self
    }

    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        if !labels.is_empty() {
            self.labels = labels;
        }
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl InferenceEngine for StubEngine {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn input_shape(&self) -> InputShape {
        self.shape
    }

    fn forward(&mut self, image: &GpuImage) -> Result<Label, EngineError> {
        check_shape(self.shape, image)?;
        self.calls += 1;
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        if self.fail_every.is_some_and(|n| self.calls % n == 0) {
            return Err(EngineError::Runtime(format!(
                "simulated failure on call {}",
                self.calls
            )));
        }

        // Quantize before hashing so labels are stable across float noise.
        let mut hasher = Sha256::new();
        for value in image.planes() {
            hasher.update([(value * 255.0).round() as u8]);
        }
        let digest: [u8; 32] = hasher.finalize().into();

        let index = digest[0] as usize % self.labels.len();
        let confidence = 0.5 + digest[1] as f32 / 510.0;
        Ok(Label::new(self.labels[index].as_str())
            .with_confidence(confidence)
            .with_class_index(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{GpuConfig, GpuContext};
    use anyhow::Result;

    const SHAPE: InputShape = InputShape {
        width: 4,
        height: 4,
    };

    #[test]
    fn stub_engine_is_deterministic() -> Result<()> {
        let gpu = GpuContext::host(GpuConfig::default())?;
        let mut engine = StubEngine::new(SHAPE);

        let image = gpu.allocate_image(4, 4)?;
        let first = engine.forward(&image)?;
        let second = engine.forward(&image)?;
        assert_eq!(first, second);
        assert!(first.confidence().is_some_and(|c| (0.5..=1.0).contains(&c)));
        assert_eq!(engine.calls(), 2);
        Ok(())
    }

    #[test]
    fn stub_engine_rejects_wrong_shape() -> Result<()> {
        let gpu = GpuContext::host(GpuConfig::default())?;
        let mut engine = StubEngine::new(SHAPE);

        let image = gpu.allocate_image(2, 2)?;
        assert!(matches!(
            engine.forward(&image),
            Err(EngineError::InputShape { actual_width: 2, .. })
        ));
        Ok(())
    }

    #[test]
    fn stub_engine_injects_failures() -> Result<()> {
        let gpu = GpuContext::host(GpuConfig::default())?;
        let mut engine = StubEngine::new(SHAPE).with_fail_every(2);

        let image = gpu.allocate_image(4, 4)?;
        assert!(engine.forward(&image).is_ok());
        assert!(matches!(engine.forward(&image), Err(EngineError::Runtime(_))));
        assert!(engine.forward(&image).is_ok());
        Ok(())
    }
}
