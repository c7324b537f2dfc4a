use std::path::Path;

use serde::Deserialize;
use tract_onnx::prelude::tract_ndarray::{Array4, ArrayView4, Axis, Ix4};
use tract_onnx::prelude::*;

use super::layers::{FeatureMap, Layer};
use crate::error::ModelError;

/// Serialization of a frozen convolutional trunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphFormat {
    /// ONNX graph, NCHW input and output.
    Onnx,
    /// Frozen TensorFlow graph, NHWC input and output.
    Tensorflow,
}

type Plan = SimplePlan<TypedFact, Box<dyn TypedOp>, TypedModel>;

/// The pretrained trunk of the network, run by tract.
///
/// Its output is the last spatial block of the classifier, so the trunk is
/// never traversed backwards and stays forward-only.
pub struct TractBackbone {
    name: String,
    plan: Plan,
    format: GraphFormat,
    input_size: usize,
}

impl TractBackbone {
    pub fn load(
        name: impl Into<String>,
        path: &Path,
        format: GraphFormat,
        input_size: usize,
    ) -> Result<Self, ModelError> {
        let name = name.into();
        if !path.is_file() {
            return Err(ModelError::manifest(format!(
                "backbone graph {} not found",
                path.display()
            )));
        }
        let plan = match format {
            GraphFormat::Onnx => tract_onnx::onnx()
                .model_for_path(path)?
                .with_input_fact(0, f32::fact([1, 3, input_size, input_size]).into())?
                .into_optimized()?
                .into_runnable()?,
            GraphFormat::Tensorflow => tract_tensorflow::tensorflow()
                .model_for_path(path)?
                .with_input_fact(0, f32::fact([1, input_size, input_size, 3]).into())?
                .into_optimized()?
                .into_runnable()?,
        };
        tracing::info!(layer = %name, path = %path.display(), ?format, "loaded backbone graph");
        Ok(Self {
            name,
            plan,
            format,
            input_size,
        })
    }
}

impl Layer for TractBackbone {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &FeatureMap) -> Result<FeatureMap, ModelError> {
        let expected = [3, self.input_size, self.input_size];
        if input.shape() != expected {
            return Err(ModelError::shape(&self.name, &expected, input.shape()));
        }
        let batch: Tensor = to_batch(input, self.format).into();
        let result = self.plan.run(tvec!(batch.into()))?;
        let view = result[0].to_array_view::<f32>()?;
        if view.ndim() != 4 || view.shape()[0] != 1 {
            return Err(ModelError::Inference(format!(
                "backbone `{}` produced shape {:?}, expected a single [1, C, H, W] map",
                self.name,
                view.shape()
            )));
        }
        let view = view
            .into_dimensionality::<Ix4>()
            .map_err(|e| ModelError::Inference(e.to_string()))?;
        Ok(from_batch(view, self.format))
    }
}

/// `[C, H, W]` to a batch of one in the graph's layout.
fn to_batch(input: &FeatureMap, format: GraphFormat) -> Array4<f32> {
    let view = match format {
        GraphFormat::Onnx => input.view(),
        GraphFormat::Tensorflow => input.view().permuted_axes([1, 2, 0]),
    };
    view.insert_axis(Axis(0)).as_standard_layout().into_owned()
}

/// First map of a graph output, back in `[C, H, W]`.
fn from_batch(batch: ArrayView4<'_, f32>, format: GraphFormat) -> FeatureMap {
    let map = batch.index_axis_move(Axis(0), 0);
    let map = match format {
        GraphFormat::Onnx => map,
        GraphFormat::Tensorflow => map.permuted_axes([2, 0, 1]),
    };
    map.as_standard_layout().into_owned()
}
