//! Grad-CAM saliency maps.
//!
//! One call attaches a capture to the target layer, runs a traced forward
//! pass, backpropagates the chosen class score and weighs the captured
//! activations by their spatially averaged gradients. A capture that never
//! fired does not fail the request: it degrades to an all-zero map.

use std::sync::{Arc, Mutex, PoisonError};

use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma};
use tract_onnx::prelude::tract_ndarray::{Array2, Axis};

use crate::classifier::{argmax, Classifier, FeatureMap, LayerObserver, LayerRef};
use crate::error::ModelError;

/// A 2-D importance map with values in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SaliencyMap {
    values: Array2<f32>,
}

impl SaliencyMap {
    pub fn zeros(size: u32) -> Self {
        Self {
            values: Array2::zeros((size as usize, size as usize)),
        }
    }

    /// Wraps precomputed values, clamping them into `[0, 1]`.
    pub fn from_values(mut values: Array2<f32>) -> Self {
        values.mapv_inplace(|v| if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) });
        Self { values }
    }

    pub fn values(&self) -> &Array2<f32> {
        &self.values
    }

    /// `(height, width)`
    pub fn dims(&self) -> (usize, usize) {
        self.values.dim()
    }

    pub fn max(&self) -> f32 {
        self.values.fold(0.0f32, |acc, &v| acc.max(v))
    }

    pub fn is_all_zero(&self) -> bool {
        self.values.iter().all(|&v| v == 0.0)
    }
}

#[derive(Debug, Clone)]
pub struct Explanation {
    pub map: SaliencyMap,
    pub class_index: usize,
    /// Set when the capture was incomplete and `map` is the all-zero fallback.
    pub fallback: bool,
}

/// Target layer output and its gradient, filled in by the hooks of one call.
#[derive(Default)]
struct Capture {
    activations: Mutex<Option<FeatureMap>>,
    gradients: Mutex<Option<FeatureMap>>,
}

impl Capture {
    fn take(&self) -> (Option<FeatureMap>, Option<FeatureMap>) {
        let activations = self
            .activations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let gradients = self
            .gradients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        (activations, gradients)
    }
}

impl LayerObserver for Capture {
    fn on_forward(&self, output: &FeatureMap) {
        *self
            .activations
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(output.clone());
    }

    fn on_backward(&self, grad_output: &FeatureMap) {
        *self
            .gradients
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(grad_output.clone());
    }
}

/// Grad-CAM bound to one layer of one classifier.
#[derive(Debug, Clone)]
pub struct GradCam {
    target: LayerRef,
    output_size: u32,
}

impl GradCam {
    /// Maps are produced at the classifier's input resolution.
    pub fn new(classifier: &Classifier, target_layer: &str) -> Result<Self, ModelError> {
        Ok(Self {
            target: classifier.layer(target_layer)?,
            output_size: classifier.input_size(),
        })
    }

    /// Explains `class_index`, or the top scoring class when `None`.
    pub fn generate(
        &self,
        classifier: &Classifier,
        input: &FeatureMap,
        class_index: Option<usize>,
    ) -> Explanation {
        let capture = Arc::new(Capture::default());
        let (chosen, outcome) = {
            let session = classifier.session();
            let _hook = session.attach(self.target, capture.clone());
            match session.trace(input) {
                Ok(trace) => {
                    let chosen = class_index
                        .unwrap_or_else(|| argmax(trace.scores().iter().copied()).unwrap_or(0));
                    (chosen, trace.backward(chosen))
                }
                Err(err) => (class_index.unwrap_or(0), Err(err)),
            }
        };
        if let Err(err) = outcome {
            tracing::warn!(error = %err, "Grad-CAM pass failed");
        }

        let (Some(activations), Some(gradients)) = capture.take() else {
            tracing::warn!(
                layer = classifier.layer_name(self.target),
                "Grad-CAM hooks did not fire, returning an empty map"
            );
            return self.fallback(chosen);
        };

        match class_activation_map(&activations, &gradients) {
            Ok(map) => Explanation {
                map: resize_map(&map, self.output_size),
                class_index: chosen,
                fallback: false,
            },
            Err(err) => {
                tracing::warn!(error = %err, "Grad-CAM capture is inconsistent");
                self.fallback(chosen)
            }
        }
    }

    fn fallback(&self, class_index: usize) -> Explanation {
        Explanation {
            map: SaliencyMap::zeros(self.output_size),
            class_index,
            fallback: true,
        }
    }
}

/// `relu(sum_i mean(grad_i) * act_i)`, scaled so its maximum is 1.
///
/// All-zero evidence stays all zero.
pub(crate) fn class_activation_map(
    activations: &FeatureMap,
    gradients: &FeatureMap,
) -> Result<Array2<f32>, ModelError> {
    if activations.shape() != gradients.shape() {
        return Err(ModelError::shape(
            "grad_cam_inputs",
            activations.shape(),
            gradients.shape(),
        ));
    }
    let (_, height, width) = activations.dim();
    let weights = gradients
        .mean_axis(Axis(2))
        .and_then(|rows| rows.mean_axis(Axis(1)))
        .ok_or_else(|| ModelError::shape("grad_cam_inputs", &[1, 1, 1], activations.shape()))?;

    let mut map = Array2::<f32>::zeros((height, width));
    for (channel, &weight) in weights.iter().enumerate() {
        map.scaled_add(weight, &activations.index_axis(Axis(0), channel));
    }
    map.mapv_inplace(|v| v.max(0.0));
    let max = map.fold(0.0f32, |acc, &v| acc.max(v));
    if max > 0.0 {
        map.mapv_inplace(|v| v / max);
    }
    Ok(map)
}

/// Bilinear resize of a map to `size x size`.
fn resize_map(map: &Array2<f32>, size: u32) -> SaliencyMap {
    let (height, width) = map.dim();
    if (height, width) == (size as usize, size as usize) {
        return SaliencyMap {
            values: map.clone(),
        };
    }
    let buffer: ImageBuffer<Luma<f32>, Vec<f32>> =
        ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
            Luma([map[[y as usize, x as usize]]])
        });
    let resized = imageops::resize(&buffer, size, size, FilterType::Triangle);
    let values = Array2::from_shape_fn((size as usize, size as usize), |(y, x)| {
        resized.get_pixel(x as u32, y as u32).0[0].clamp(0.0, 1.0)
    });
    SaliencyMap { values }
}
