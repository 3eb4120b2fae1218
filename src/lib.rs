//! Live Recognizer
//!
//! A real-time recognition pipeline: camera frames flow into a single-flight
//! scheduler, which converts at most one frame at a time into a model-ready
//! image, runs it through an inference engine, and hands the resulting label
//! to a sink on the presentation thread.
//!
//! # Architecture
//!
//! ```text
//! FrameSource --(capture thread)--> FrameScheduler::on_frame
//!                                      | Idle: convert + submit
//!                                      | InFlight: drop frame
//!                                      v
//!                                ImageConverter -> InferenceEngine
//!                                                        |
//!                          Presenter (presentation thread) <- Label
//! ```
//!
//! The scheduler guarantees:
//!
//! 1. **Single flight**: at most one inference request exists at any instant.
//! 2. **Freshness**: frames arriving while busy are discarded, never queued.
//! 3. **Release**: every image and admission slot is released on every path.
//! 4. **Thread confinement**: sinks only ever run on the presentation thread.
//!
//! # Module Structure
//!
//! - `source`: capture devices, authorization, and the paced capture thread
//! - `frame`: raw frames and their pixel layout
//! - `gpu`: device context, image ledger, and the submission queue
//! - `convert`: raw frame to planar float image at the engine's input shape
//! - `engine`: the inference boundary and its backends
//! - `scheduler`: admission control and request completion
//! - `sink`: presentation thread and result sinks
//! - `config`: file and environment configuration

pub mod config;
pub mod convert;
pub mod engine;
pub mod error;
pub mod frame;
pub mod gpu;
pub mod scheduler;
pub mod sink;
pub mod source;

pub use config::RecognizerConfig;
pub use convert::ImageConverter;
pub use engine::{EngineError, EngineSettings, InferenceEngine, InputShape, Label, StubEngine};
pub use error::{ConversionError, SetupError};
pub use frame::{FrameMeta, Orientation, PixelFormat, RawFrame};
pub use gpu::{AllocationError, GpuConfig, GpuContext, GpuImage};
pub use scheduler::{FrameScheduler, PipelineState, SchedulerConfig, SchedulerStats, SubmissionMode};
pub use sink::{FanOut, LatestLabel, LogSink, PresentationThread, Presenter, ResultSink};
pub use source::{
    AuthorizationStatus, Authorizer, Camera, CaptureDevice, CaptureSettings, FrameSource,
    SourceStats, StaticAuthorizer, SyntheticCamera,
};
