#![cfg(feature = "engine-tract")]

use std::path::Path;

use tract_onnx::prelude::*;

use crate::engine::backend::{check_shape, EngineError, InferenceEngine, InputShape};
use crate::engine::label::Label;
use crate::gpu::GpuImage;

/// Tract-based ONNX image classifier.
///
/// Loads a local model taking a `1x3xHxW` float tensor and producing one score per
/// class, plus a labels file with one class name per line.
pub struct TractEngine {
    model: TypedRunnableModel<TypedModel>,
    shape: InputShape,
    labels: Vec<String>,
}

impl TractEngine {
    pub fn new<P: AsRef<Path>, L: AsRef<Path>>(
        model_path: P,
        labels_path: L,
        shape: InputShape,
    ) -> Result<Self, EngineError> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .and_then(|model| {
                model.with_input_fact(
                    0,
                    InferenceFact::dt_shape(
                        f32::datum_type(),
                        tvec!(1, 3, shape.height as usize, shape.width as usize),
                    ),
                )
            })
            .and_then(|model| model.into_optimized())
            .and_then(|model| model.into_runnable())
            .map_err(|err| EngineError::Model(format!("{}: {:#}", model_path.display(), err)))?;

        let labels = load_labels(labels_path.as_ref())?;
        log::info!(
            "tract engine loaded {} ({} classes, input {}x{})",
            model_path.display(),
            labels.len(),
            shape.width,
            shape.height
        );

        Ok(Self {
            model,
            shape,
            labels,
        })
    }

    fn build_input(&self, image: &GpuImage) -> Tensor {
        let (w, h) = (self.shape.width as usize, self.shape.height as usize);
        let planes = image.planes();
        tract_ndarray::Array4::from_shape_fn((1, 3, h, w), |(_, channel, y, x)| {
            planes[channel * w * h + y * w + x]
        })
        .into_tensor()
    }

    fn top1(&self, outputs: TVec<TValue>) -> Result<Label, EngineError> {
        let output = outputs
            .first()
            .ok_or_else(|| EngineError::Runtime("model produced no outputs".to_string()))?;
        let scores = output
            .to_array_view::<f32>()
            .map_err(|err| EngineError::Runtime(format!("output tensor was not f32: {}", err)))?;
        let scores: Vec<f32> = scores.iter().copied().collect();
        let probabilities = to_probabilities(&scores);

        let (index, confidence) = probabilities
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (i, p)| if p > best.1 { (i, p) } else { best });
        let text = self.labels.get(index).ok_or_else(|| {
            EngineError::Labels(format!(
                "class {} out of range for {} labels",
                index,
                self.labels.len()
            ))
        })?;
        Ok(Label::new(text.as_str())
            .with_confidence(confidence)
            .with_class_index(index))
    }
}

impl InferenceEngine for TractEngine {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn input_shape(&self) -> InputShape {
        self.shape
    }

    fn forward(&mut self, image: &GpuImage) -> Result<Label, EngineError> {
        check_shape(self.shape, image)?;
        let input = self.build_input(image);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .map_err(|err| EngineError::Runtime(format!("{:#}", err)))?;
        self.top1(outputs)
    }
}

fn load_labels(path: &Path) -> Result<Vec<String>, EngineError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| EngineError::Labels(format!("{}: {}", path.display(), e)))?;
    let labels: Vec<String> = raw
        .lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty())
        .map(|line| line.to_string())
        .collect();
    if labels.is_empty() {
        return Err(EngineError::Labels(format!("{} is empty", path.display())));
    }
    Ok(labels)
}

/// Pass probabilities through, softmax anything that looks like logits.
fn to_probabilities(scores: &[f32]) -> Vec<f32> {
    let sum: f32 = scores.iter().sum();
    let already = scores.iter().all(|s| (0.0..=1.0).contains(s)) && (sum - 1.0).abs() < 1e-3;
    if already {
        return scores.to_vec();
    }
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
    let total: f32 = exps.iter().sum();
    exps.iter().map(|e| e / total).collect()
}
