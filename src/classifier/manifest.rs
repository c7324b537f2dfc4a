//! JSON model bundles.
//!
//! A bundle is a manifest listing the label set, the input resolution, an
//! optional frozen trunk and the differentiable head layers with their
//! weights. Weight arrays are flattened in row-major order.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tract_onnx::prelude::tract_ndarray::{Array1, Array2, Array4};

use super::backbone::{GraphFormat, TractBackbone};
use super::layers::{Conv2d, GlobalAvgPool, Layer, Linear, MaxPool2d, Relu};
use super::{Classifier, TUMOR_LABELS};
use crate::error::ModelError;

fn default_labels() -> Vec<String> {
    TUMOR_LABELS.iter().map(|label| label.to_string()).collect()
}

fn default_input_size() -> u32 {
    224
}

fn default_stride() -> usize {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelManifest {
    #[serde(default = "default_labels")]
    pub labels: Vec<String>,
    #[serde(default = "default_input_size")]
    pub input_size: u32,
    #[serde(default)]
    pub backbone: Option<BackboneSpec>,
    pub layers: Vec<LayerSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackboneSpec {
    pub name: String,
    /// Relative paths resolve against the manifest's directory.
    pub path: PathBuf,
    pub format: GraphFormat,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LayerSpec {
    Conv2d {
        name: String,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        #[serde(default = "default_stride")]
        stride: usize,
        #[serde(default)]
        padding: usize,
        weights: Vec<f32>,
        bias: Vec<f32>,
    },
    Relu {
        name: String,
    },
    MaxPool2d {
        name: String,
        kernel_size: usize,
        #[serde(default)]
        stride: Option<usize>,
    },
    GlobalAvgPool {
        name: String,
    },
    Linear {
        name: String,
        in_features: usize,
        out_features: usize,
        weights: Vec<f32>,
        bias: Vec<f32>,
    },
}

impl LayerSpec {
    fn build(self) -> Result<Box<dyn Layer>, ModelError> {
        let layer: Box<dyn Layer> = match self {
            LayerSpec::Conv2d {
                name,
                in_channels,
                out_channels,
                kernel_size,
                stride,
                padding,
                weights,
                bias,
            } => {
                let weight = Array4::from_shape_vec(
                    (out_channels, in_channels, kernel_size, kernel_size),
                    weights,
                )
                .map_err(|e| ModelError::manifest(format!("conv `{name}` weights: {e}")))?;
                Box::new(Conv2d::new(name, weight, Array1::from(bias), stride, padding)?)
            }
            LayerSpec::Relu { name } => Box::new(Relu::new(name)),
            LayerSpec::MaxPool2d {
                name,
                kernel_size,
                stride,
            } => Box::new(MaxPool2d::new(
                name,
                kernel_size,
                stride.unwrap_or(kernel_size),
            )?),
            LayerSpec::GlobalAvgPool { name } => Box::new(GlobalAvgPool::new(name)),
            LayerSpec::Linear {
                name,
                in_features,
                out_features,
                weights,
                bias,
            } => {
                let weight = Array2::from_shape_vec((out_features, in_features), weights)
                    .map_err(|e| ModelError::manifest(format!("linear `{name}` weights: {e}")))?;
                Box::new(Linear::new(name, weight, Array1::from(bias))?)
            }
        };
        Ok(layer)
    }
}

impl ModelManifest {
    pub fn from_path(path: &Path) -> Result<Self, ModelError> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Builds the classifier, resolving the trunk path against `base_dir`.
    pub fn build(self, base_dir: &Path) -> Result<Classifier, ModelError> {
        let mut layers: Vec<Box<dyn Layer>> = Vec::with_capacity(self.layers.len() + 1);
        if let Some(backbone) = self.backbone {
            let path = if backbone.path.is_absolute() {
                backbone.path
            } else {
                base_dir.join(backbone.path)
            };
            layers.push(Box::new(TractBackbone::load(
                backbone.name,
                &path,
                backbone.format,
                self.input_size as usize,
            )?));
        }
        for spec in self.layers {
            layers.push(spec.build()?);
        }
        Classifier::new(layers, self.labels, self.input_size)
    }
}

/// Loads the classifier described by the manifest at `path`.
pub fn load_classifier(path: &Path) -> Result<Classifier, ModelError> {
    let manifest = ModelManifest::from_path(path)?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    let classifier = manifest.build(base_dir)?;
    tracing::info!(
        manifest = %path.display(),
        layers = classifier.layer_names().len(),
        labels = ?classifier.labels(),
        "loaded classifier"
    );
    Ok(classifier)
}
