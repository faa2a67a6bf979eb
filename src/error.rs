//! Error types
//!
//! Only conditions that indicate a malformed request or a broken deployment
//! are errors. A missing plate or a plate that fails the format grammar is a
//! normal outcome and is reported through [`crate::pipeline::Outcome`].

use thiserror::Error;

/// Errors surfaced by a recognition run
#[derive(Debug, Error)]
pub enum RecognitionError {
    /// Input bytes are not a decodable raster image
    #[error("failed to decode input image: {0}")]
    Decode(#[source] image::ImageError),

    /// Glyph classifier failed to produce a prediction
    #[error(transparent)]
    Classifier(#[from] ClassifierError),

    /// Annotated image could not be encoded
    #[error("failed to encode annotated image: {0}")]
    Encode(#[source] image::ImageError),
}

/// Errors raised by a glyph classifier
#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("inference failed: {0}")]
    Inference(#[from] ort::Error),

    #[error("classifier returned {actual} scores, expected {expected}")]
    OutputSize { expected: usize, actual: usize },

    #[error("classifier produced no output tensor")]
    MissingOutput,
}

/// Errors raised while loading or validating a cascade description
#[derive(Debug, Error)]
pub enum CascadeError {
    #[error("cascade has no stages")]
    Empty,

    #[error("cascade window {width}x{height} is too small")]
    WindowTooSmall { width: u32, height: u32 },

    #[error("weak classifier in stage {stage} references missing feature {feature}")]
    MissingFeature { stage: usize, feature: usize },

    #[error("weak classifier in stage {stage} has a node pointing to missing {what} {index}")]
    BrokenTree {
        stage: usize,
        what: &'static str,
        index: i32,
    },

    #[error("feature {feature} has a rectangle outside the detection window")]
    RectOutOfWindow { feature: usize },

    #[error("tilted features are not supported (feature {feature})")]
    TiltedFeature { feature: usize },
}

/// Errors raised while dispatching a recognition run
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Recognition(#[from] RecognitionError),

    #[error("recognition timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("recognition task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("dispatch queue closed")]
    Closed,
}
