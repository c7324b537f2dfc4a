//! The tumor classifier and the passes that can be run through it.
//!
//! A [`Classifier`] is loaded once and shared by every request. Passes only
//! run inside a [`Session`], which holds the classifier's exclusive lock: a
//! hook attached within a session can never observe another request's
//! tensors, and everything a backward pass produces lives on the per-call
//! [`Trace`].

mod backbone;
mod hooks;
mod layers;
mod manifest;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tract_onnx::prelude::tract_ndarray::Array1;

use crate::error::ModelError;

pub use backbone::{GraphFormat, TractBackbone};
pub use hooks::{HookHandle, LayerObserver};
pub use layers::{Conv2d, FeatureMap, GlobalAvgPool, Layer, Linear, MaxPool2d, Relu};
pub use manifest::{load_classifier, BackboneSpec, LayerSpec, ModelManifest};

use hooks::HookRegistry;

/// The fixed label set, in the order the classifier scores them.
pub const TUMOR_LABELS: [&str; 4] = ["Glioma", "Meningioma", "No Tumor", "Pituitary"];

/// The only label that means no tumor was found.
pub const NO_TUMOR_LABEL: &str = "No Tumor";

/// Identifies one layer of a specific classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerRef(usize);

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub class_index: usize,
    pub label: String,
    pub probability: f32,
}

impl Prediction {
    pub fn is_tumor(&self) -> bool {
        self.label != NO_TUMOR_LABEL
    }
}

pub struct Classifier {
    layers: Vec<Box<dyn Layer>>,
    labels: Vec<String>,
    input_size: u32,
    hooks: HookRegistry,
    exclusive: Mutex<()>,
}

impl Classifier {
    pub fn new(
        layers: Vec<Box<dyn Layer>>,
        labels: Vec<String>,
        input_size: u32,
    ) -> Result<Self, ModelError> {
        if layers.is_empty() {
            return Err(ModelError::manifest("classifier has no layers"));
        }
        if labels.is_empty() {
            return Err(ModelError::manifest("classifier has no labels"));
        }
        if input_size == 0 {
            return Err(ModelError::manifest("input size must be positive"));
        }
        let mut seen = HashSet::new();
        for layer in &layers {
            if !seen.insert(layer.name()) {
                return Err(ModelError::manifest(format!(
                    "duplicate layer name `{}`",
                    layer.name()
                )));
            }
        }
        Ok(Self {
            layers,
            labels,
            input_size,
            hooks: HookRegistry::default(),
            exclusive: Mutex::new(()),
        })
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Side length of the square input the classifier expects.
    pub fn input_size(&self) -> u32 {
        self.input_size
    }

    pub fn layer_names(&self) -> Vec<&str> {
        self.layers.iter().map(|layer| layer.name()).collect()
    }

    pub fn layer(&self, name: &str) -> Result<LayerRef, ModelError> {
        self.layers
            .iter()
            .position(|layer| layer.name() == name)
            .map(LayerRef)
            .ok_or_else(|| ModelError::UnknownLayer {
                name: name.to_string(),
            })
    }

    pub fn layer_name(&self, layer: LayerRef) -> &str {
        self.layers[layer.0].name()
    }

    /// Number of observers currently attached.
    pub fn attached_hooks(&self) -> usize {
        self.hooks.len()
    }

    /// Waits for exclusive use of the classifier.
    pub fn session(&self) -> Session<'_> {
        Session {
            classifier: self,
            _guard: self
                .exclusive
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        }
    }
}

impl std::fmt::Debug for Classifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Classifier")
            .field("labels", &self.labels)
            .field("input_size", &self.input_size)
            .field("layers", &self.layer_names())
            .finish_non_exhaustive()
    }
}

/// Exclusive access to a [`Classifier`] for the duration of one request step.
pub struct Session<'c> {
    classifier: &'c Classifier,
    _guard: MutexGuard<'c, ()>,
}

impl<'c> Session<'c> {
    /// Attaches `observer` to `layer` until the returned handle is dropped.
    /// The handle cannot outlive the session.
    pub fn attach<'s>(
        &'s self,
        layer: LayerRef,
        observer: Arc<dyn LayerObserver>,
    ) -> HookHandle<'s> {
        self.classifier.hooks.attach(layer.0, observer)
    }

    /// Inference pass: raw class scores, nothing kept for a backward pass.
    pub fn forward(&self, input: &FeatureMap) -> Result<Array1<f32>, ModelError> {
        let (scores, _) = self.run(input, None)?;
        Ok(scores)
    }

    /// Pass that records every layer input so the scores can be differentiated.
    pub fn trace(&self, input: &FeatureMap) -> Result<Trace<'_>, ModelError> {
        let mut tape = Vec::with_capacity(self.classifier.layers.len());
        let (scores, output_dim) = self.run(input, Some(&mut tape))?;
        Ok(Trace {
            classifier: self.classifier,
            tape,
            scores,
            output_dim,
        })
    }

    pub fn predict(&self, input: &FeatureMap) -> Result<Prediction, ModelError> {
        let scores = self.forward(input)?.to_vec();
        let probabilities = softmax(&scores);
        let class_index = argmax(probabilities.iter().copied()).unwrap_or(0);
        Ok(Prediction {
            class_index,
            label: self.classifier.labels[class_index].clone(),
            probability: probabilities[class_index],
        })
    }

    fn run(
        &self,
        input: &FeatureMap,
        mut tape: Option<&mut Vec<FeatureMap>>,
    ) -> Result<(Array1<f32>, (usize, usize, usize)), ModelError> {
        let mut current = input.clone();
        for (index, layer) in self.classifier.layers.iter().enumerate() {
            let output = layer.forward(&current)?;
            for observer in self.classifier.hooks.observers(index) {
                observer.on_forward(&output);
            }
            if let Some(tape) = tape.as_deref_mut() {
                tape.push(current);
            }
            current = output;
        }
        let labels = self.classifier.labels.len();
        if current.len() != labels {
            return Err(ModelError::LabelMismatch {
                labels,
                outputs: current.len(),
            });
        }
        let output_dim = current.dim();
        Ok((current.iter().copied().collect(), output_dim))
    }
}

/// A recorded forward pass, consumed by its single backward pass.
pub struct Trace<'s> {
    classifier: &'s Classifier,
    tape: Vec<FeatureMap>,
    scores: Array1<f32>,
    output_dim: (usize, usize, usize),
}

impl Trace<'_> {
    pub fn scores(&self) -> &Array1<f32> {
        &self.scores
    }

    /// Backpropagates the score of `class_index` alone, delivering the
    /// gradient at each hooked layer's output. Propagation stops at the
    /// lowest hooked layer, so layers below it never need a backward pass.
    pub fn backward(self, class_index: usize) -> Result<(), ModelError> {
        let classes = self.scores.len();
        if class_index >= classes {
            return Err(ModelError::ClassOutOfRange {
                index: class_index,
                classes,
            });
        }
        let hooks = &self.classifier.hooks;
        let Some(stop) = hooks.lowest_hooked_layer() else {
            return Ok(());
        };

        let mut seed = vec![0.0f32; classes];
        seed[class_index] = 1.0;
        let mut grad = FeatureMap::from_shape_vec(self.output_dim, seed)
            .map_err(|e| ModelError::Inference(e.to_string()))?;

        for index in (stop..self.classifier.layers.len()).rev() {
            for observer in hooks.observers(index) {
                observer.on_backward(&grad);
            }
            if index == stop {
                break;
            }
            grad = self.classifier.layers[index].backward(&self.tape[index], &grad)?;
        }
        Ok(())
    }
}

/// Numerically stable softmax.
pub fn softmax(scores: &[f32]) -> Vec<f32> {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = scores.iter().map(|&s| (s - max).exp()).collect();
    let total: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}

/// Index of the first largest value.
pub fn argmax(values: impl IntoIterator<Item = f32>) -> Option<usize> {
    values
        .into_iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (index, value)| match best {
            Some((_, top)) if value <= top => best,
            _ => Some((index, value)),
        })
        .map(|(index, _)| index)
}

#[cfg(test)]
pub(crate) mod testing {
    //! A small deterministic classifier shaped like the production one: a
    //! spatial trunk ending in `layer4`, then average pooling and a linear head.

    use super::*;
    use tract_onnx::prelude::tract_ndarray::{Array2, Array4};

    pub(crate) const TARGET_LAYER: &str = "layer4";

    pub(crate) fn toy_classifier() -> Classifier {
        let conv_weight = Array4::from_shape_fn((2, 3, 3, 3), |(o, _, _, _)| {
            if o == 0 {
                1.0 / 27.0
            } else {
                -1.0 / 27.0
            }
        });
        let fc_weight = Array2::from_shape_fn((4, 2), |(c, i)| {
            let c = c as f32;
            if i == 0 {
                1.0 + 0.1 * c
            } else {
                0.2 - 0.1 * c
            }
        });
        let layers: Vec<Box<dyn Layer>> = vec![
            Box::new(MaxPool2d::new("stem", 4, 4).unwrap()),
            Box::new(
                Conv2d::new("conv1", conv_weight, Array1::from(vec![2.5, 0.5]), 1, 1).unwrap(),
            ),
            Box::new(Relu::new("relu1")),
            Box::new(MaxPool2d::new(TARGET_LAYER, 2, 2).unwrap()),
            Box::new(GlobalAvgPool::new("avgpool")),
            Box::new(
                Linear::new("fc", fc_weight, Array1::from(vec![0.0, 0.1, -0.1, 0.05])).unwrap(),
            ),
        ];
        let labels = TUMOR_LABELS.iter().map(|l| l.to_string()).collect();
        Classifier::new(layers, labels, 224).unwrap()
    }
}
