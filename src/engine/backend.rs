use thiserror::Error;

use crate::engine::label::Label;
use crate::gpu::GpuImage;

/// Input image size an engine expects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InputShape {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("image is {actual_width}x{actual_height}, engine expects {}x{}", .expected.width, .expected.height)]
    InputShape {
        expected: InputShape,
        actual_width: u32,
        actual_height: u32,
    },

    #[error("failed to load model: {0}")]
    Model(String),

    #[error("failed to load labels: {0}")]
    Labels(String),

    #[error("inference failed: {0}")]
    Runtime(String),
}

/// Inference engine contract.
///
/// `forward` is synchronous relative to the engine's own execution context and
/// may take longer than a frame interval. Once called it runs to completion;
/// there is no cancellation. The engine must accept another call immediately
/// after one returns, carrying no per-call state besides its loaded weights.
pub trait InferenceEngine: Send {
    /// Engine identifier.
    fn name(&self) -> &'static str;

    /// Shape the converter must produce.
    fn input_shape(&self) -> InputShape;

    /// Classify one image.
    fn forward(&mut self, image: &GpuImage) -> Result<Label, EngineError>;

    /// Optional warm-up hook, run once before the first frame is admitted.
    fn warm_up(&mut self) -> Result<(), EngineError> {
        Ok(())
    }
}

impl<E: InferenceEngine + ?Sized> InferenceEngine for Box<E> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn input_shape(&self) -> InputShape {
        (**self).input_shape()
    }

    fn forward(&mut self, image: &GpuImage) -> Result<Label, EngineError> {
        (**self).forward(image)
    }

    fn warm_up(&mut self) -> Result<(), EngineError> {
        (**self).warm_up()
    }
}

/// Reject images that do not match the engine's input shape.
pub(crate) fn check_shape(expected: InputShape, image: &GpuImage) -> Result<(), EngineError> {
    if image.width() != expected.width || image.height() != expected.height {
        return Err(EngineError::InputShape {
            expected,
            actual_width: image.width(),
            actual_height: image.height(),
        });
    }
    Ok(())
}
