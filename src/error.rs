//! Error types for the analysis pipeline.
//!
//! Validator rejections are not errors: they are a normal outcome carried by
//! the response. The types here cover configuration problems, model failures
//! and image content that cannot be decoded or encoded.

use thiserror::Error;
use tract_onnx::prelude::TractError;

/// The request lifecycle, in the order the orchestrator walks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Validated,
    Preprocessed,
    Classified,
    Explained,
    Rendered,
    Responded,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Received => write!(f, "receive"),
            Stage::Validated => write!(f, "validation"),
            Stage::Preprocessed => write!(f, "preprocessing"),
            Stage::Classified => write!(f, "classification"),
            Stage::Explained => write!(f, "explanation"),
            Stage::Rendered => write!(f, "rendering"),
            Stage::Responded => write!(f, "response"),
        }
    }
}

/// Failures raised while loading or running the classifier.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model manifest: {message}")]
    Manifest { message: String },

    #[error("layer `{layer}`: expected shape {expected:?}, got {actual:?}")]
    Shape {
        layer: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("layer `{layer}` does not support backward passes")]
    NotDifferentiable { layer: String },

    #[error("no layer named `{name}`")]
    UnknownLayer { name: String },

    #[error("classifier emits {outputs} scores but has {labels} labels")]
    LabelMismatch { labels: usize, outputs: usize },

    #[error("class index {index} out of range for {classes} classes")]
    ClassOutOfRange { index: usize, classes: usize },

    #[error("inference: {0}")]
    Inference(String),

    #[error("io")]
    Io(#[from] std::io::Error),

    #[error("manifest json")]
    Json(#[from] serde_json::Error),
}

impl ModelError {
    pub(crate) fn manifest(message: impl Into<String>) -> Self {
        Self::Manifest {
            message: message.into(),
        }
    }

    pub(crate) fn shape(layer: &str, expected: &[usize], actual: &[usize]) -> Self {
        Self::Shape {
            layer: layer.to_string(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

impl From<TractError> for ModelError {
    fn from(e: TractError) -> Self {
        ModelError::Inference(e.to_string())
    }
}

/// A configuration value that could not be used.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value {value:?} for `{key}`: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },

    #[error("`{key}` out of range: {message}")]
    OutOfRange { key: &'static str, message: String },
}

/// Failures of the heatmap renderer.
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("original image could not be decoded")]
    Decode(#[source] image::ImageError),

    #[error("rendered image could not be encoded")]
    Encode(#[source] image::ImageError),
}

/// Failures while assembling an analyzer at startup.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("configuration")]
    Config(#[from] ConfigError),

    #[error("model")]
    Model(#[from] ModelError),
}

/// Request-level failures with no safe fallback value.
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("{stage} failed: image could not be decoded")]
    Decode {
        stage: Stage,
        #[source]
        source: image::ImageError,
    },

    #[error("{stage} failed")]
    Model {
        stage: Stage,
        #[source]
        source: ModelError,
    },

    #[error("{stage} failed")]
    Render {
        stage: Stage,
        #[source]
        source: RenderError,
    },
}

impl AnalysisError {
    pub fn stage(&self) -> Stage {
        match self {
            AnalysisError::Decode { stage, .. }
            | AnalysisError::Model { stage, .. }
            | AnalysisError::Render { stage, .. } => *stage,
        }
    }

    /// True when the failure is caused by the submitted bytes rather than the service.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            AnalysisError::Decode { .. }
                | AnalysisError::Render {
                    source: RenderError::Decode(_),
                    ..
                }
        )
    }
}
