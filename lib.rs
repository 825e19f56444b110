//! On-device single-image classification.
//!
//! An RGBA buffer goes through [`Preprocessor`] into a `224x224x3` tensor, the
//! [`InferenceEngine`] produces one score per class, and [`ranking::rank`]
//! turns the scores into the top results. [`ClassificationPipeline`] bundles the
//! three; [`PipelineCoordinator`] runs it off the caller's thread behind a small
//! state machine.

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod labels;
pub mod models;
pub mod onnx;
pub mod pipeline;
pub mod preprocess;
pub mod ranking;

pub use crate::config::ClassifierConfig;
pub use crate::coordinator::{
    FailureReason, Phase, PipelineCoordinator, PipelineSnapshot, PipelineState,
};
pub use crate::engine::{EngineSlot, InferenceEngine, Network};
pub use crate::error::{Error, Result};
pub use crate::labels::LabelTable;
pub use crate::models::{Classification, ClassificationResult};
pub use crate::pipeline::{ClassificationPipeline, SharedPipeline};
pub use crate::preprocess::{InputTensor, Preprocessor};
