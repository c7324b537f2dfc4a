//! Layers of the classifier head.
//!
//! Every layer maps a `[C, H, W]` feature map to another one. Backward passes
//! only compute the gradient with respect to the layer input: weights are
//! frozen while serving, so no parameter gradients are ever accumulated.

use tract_onnx::prelude::tract_ndarray::{Array1, Array2, Array3, Array4, Axis};

use crate::error::ModelError;

/// A `[channels, height, width]` tensor flowing between layers.
pub type FeatureMap = Array3<f32>;

pub trait Layer: Send + Sync {
    fn name(&self) -> &str;

    fn forward(&self, input: &FeatureMap) -> Result<FeatureMap, ModelError>;

    /// Gradient with respect to `input`, given the gradient with respect to
    /// this layer's output. Forward-only layers keep the default.
    fn backward(
        &self,
        input: &FeatureMap,
        grad_output: &FeatureMap,
    ) -> Result<FeatureMap, ModelError> {
        let _ = (input, grad_output);
        Err(ModelError::NotDifferentiable {
            layer: self.name().to_string(),
        })
    }
}

fn ensure_shape(layer: &str, expected: &[usize], actual: &[usize]) -> Result<(), ModelError> {
    if expected != actual {
        return Err(ModelError::shape(layer, expected, actual));
    }
    Ok(())
}

/// Output length of a sliding window along one axis, `None` if the window does not fit.
fn window_len(extent: usize, kernel: usize, stride: usize, padding: usize) -> Option<usize> {
    let padded = extent + 2 * padding;
    if padded < kernel {
        return None;
    }
    Some((padded - kernel) / stride + 1)
}

pub struct Conv2d {
    name: String,
    /// `[out_channels, in_channels, kernel, kernel]`
    weight: Array4<f32>,
    bias: Array1<f32>,
    stride: usize,
    padding: usize,
}

impl Conv2d {
    pub fn new(
        name: impl Into<String>,
        weight: Array4<f32>,
        bias: Array1<f32>,
        stride: usize,
        padding: usize,
    ) -> Result<Self, ModelError> {
        let name = name.into();
        let (out_channels, _, kh, kw) = weight.dim();
        if kh != kw || kh == 0 {
            return Err(ModelError::manifest(format!(
                "conv `{name}` needs a square, non-empty kernel, got {kh}x{kw}"
            )));
        }
        if stride == 0 {
            return Err(ModelError::manifest(format!(
                "conv `{name}` stride must be positive"
            )));
        }
        ensure_shape(&name, &[out_channels], bias.shape())?;
        Ok(Self {
            name,
            weight,
            bias,
            stride,
            padding,
        })
    }

    fn in_channels(&self) -> usize {
        self.weight.dim().1
    }

    fn kernel(&self) -> usize {
        self.weight.dim().2
    }

    fn output_dims(&self, height: usize, width: usize) -> Result<(usize, usize), ModelError> {
        let kernel = self.kernel();
        match (
            window_len(height, kernel, self.stride, self.padding),
            window_len(width, kernel, self.stride, self.padding),
        ) {
            (Some(oh), Some(ow)) => Ok((oh, ow)),
            _ => Err(ModelError::shape(
                &self.name,
                &[self.in_channels(), kernel, kernel],
                &[self.in_channels(), height, width],
            )),
        }
    }

    /// Input coordinate hit by kernel offset `k` at output position `o`, if inside the image.
    fn source(&self, o: usize, k: usize, extent: usize) -> Option<usize> {
        (o * self.stride + k)
            .checked_sub(self.padding)
            .filter(|&i| i < extent)
    }
}

impl Layer for Conv2d {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &FeatureMap) -> Result<FeatureMap, ModelError> {
        let (channels, height, width) = input.dim();
        if channels != self.in_channels() {
            return Err(ModelError::shape(
                &self.name,
                &[self.in_channels(), height, width],
                input.shape(),
            ));
        }
        let (oh, ow) = self.output_dims(height, width)?;
        let kernel = self.kernel();
        let out_channels = self.weight.dim().0;
        let mut output = FeatureMap::zeros((out_channels, oh, ow));
        for co in 0..out_channels {
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut acc = self.bias[co];
                    for ky in 0..kernel {
                        let Some(iy) = self.source(oy, ky, height) else {
                            continue;
                        };
                        for kx in 0..kernel {
                            let Some(ix) = self.source(ox, kx, width) else {
                                continue;
                            };
                            for ci in 0..channels {
                                acc += self.weight[[co, ci, ky, kx]] * input[[ci, iy, ix]];
                            }
                        }
                    }
                    output[[co, oy, ox]] = acc;
                }
            }
        }
        Ok(output)
    }

    fn backward(
        &self,
        input: &FeatureMap,
        grad_output: &FeatureMap,
    ) -> Result<FeatureMap, ModelError> {
        let (channels, height, width) = input.dim();
        let (oh, ow) = self.output_dims(height, width)?;
        let out_channels = self.weight.dim().0;
        ensure_shape(&self.name, &[out_channels, oh, ow], grad_output.shape())?;
        let kernel = self.kernel();
        let mut grad_input = FeatureMap::zeros((channels, height, width));
        for ((co, oy, ox), &grad) in grad_output.indexed_iter() {
            if grad == 0.0 {
                continue;
            }
            for ky in 0..kernel {
                let Some(iy) = self.source(oy, ky, height) else {
                    continue;
                };
                for kx in 0..kernel {
                    let Some(ix) = self.source(ox, kx, width) else {
                        continue;
                    };
                    for ci in 0..channels {
                        grad_input[[ci, iy, ix]] += self.weight[[co, ci, ky, kx]] * grad;
                    }
                }
            }
        }
        Ok(grad_input)
    }
}

pub struct Relu {
    name: String,
}

impl Relu {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Layer for Relu {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &FeatureMap) -> Result<FeatureMap, ModelError> {
        Ok(input.mapv(|v| v.max(0.0)))
    }

    fn backward(
        &self,
        input: &FeatureMap,
        grad_output: &FeatureMap,
    ) -> Result<FeatureMap, ModelError> {
        ensure_shape(&self.name, input.shape(), grad_output.shape())?;
        let mut grad = grad_output.clone();
        grad.zip_mut_with(input, |g, &x| {
            if x <= 0.0 {
                *g = 0.0;
            }
        });
        Ok(grad)
    }
}

pub struct MaxPool2d {
    name: String,
    kernel: usize,
    stride: usize,
}

impl MaxPool2d {
    pub fn new(name: impl Into<String>, kernel: usize, stride: usize) -> Result<Self, ModelError> {
        let name = name.into();
        if kernel == 0 || stride == 0 {
            return Err(ModelError::manifest(format!(
                "max pool `{name}` needs a positive kernel and stride"
            )));
        }
        Ok(Self {
            name,
            kernel,
            stride,
        })
    }

    fn output_dims(&self, input: &FeatureMap) -> Result<(usize, usize), ModelError> {
        let (channels, height, width) = input.dim();
        match (
            window_len(height, self.kernel, self.stride, 0),
            window_len(width, self.kernel, self.stride, 0),
        ) {
            (Some(oh), Some(ow)) => Ok((oh, ow)),
            _ => Err(ModelError::shape(
                &self.name,
                &[channels, self.kernel, self.kernel],
                input.shape(),
            )),
        }
    }

    /// Position of the first maximum inside the window anchored at `(oy, ox)`.
    fn argmax(
        &self,
        input: &FeatureMap,
        channel: usize,
        oy: usize,
        ox: usize,
    ) -> (usize, usize, f32) {
        let (y0, x0) = (oy * self.stride, ox * self.stride);
        let mut best = (y0, x0, input[[channel, y0, x0]]);
        for y in y0..y0 + self.kernel {
            for x in x0..x0 + self.kernel {
                let value = input[[channel, y, x]];
                if value > best.2 {
                    best = (y, x, value);
                }
            }
        }
        best
    }
}

impl Layer for MaxPool2d {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &FeatureMap) -> Result<FeatureMap, ModelError> {
        let (oh, ow) = self.output_dims(input)?;
        let channels = input.dim().0;
        Ok(FeatureMap::from_shape_fn((channels, oh, ow), |(c, oy, ox)| {
            self.argmax(input, c, oy, ox).2
        }))
    }

    fn backward(
        &self,
        input: &FeatureMap,
        grad_output: &FeatureMap,
    ) -> Result<FeatureMap, ModelError> {
        let (oh, ow) = self.output_dims(input)?;
        ensure_shape(&self.name, &[input.dim().0, oh, ow], grad_output.shape())?;
        let mut grad_input = FeatureMap::zeros(input.raw_dim());
        for ((c, oy, ox), &grad) in grad_output.indexed_iter() {
            let (y, x, _) = self.argmax(input, c, oy, ox);
            grad_input[[c, y, x]] += grad;
        }
        Ok(grad_input)
    }
}

/// Averages every channel down to a single value, `[C, H, W] -> [C, 1, 1]`.
pub struct GlobalAvgPool {
    name: String,
}

impl GlobalAvgPool {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Layer for GlobalAvgPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &FeatureMap) -> Result<FeatureMap, ModelError> {
        let (channels, height, width) = input.dim();
        let area = height * width;
        if area == 0 {
            return Err(ModelError::shape(&self.name, &[channels, 1, 1], input.shape()));
        }
        Ok(FeatureMap::from_shape_fn((channels, 1, 1), |(c, _, _)| {
            input.index_axis(Axis(0), c).sum() / area as f32
        }))
    }

    fn backward(
        &self,
        input: &FeatureMap,
        grad_output: &FeatureMap,
    ) -> Result<FeatureMap, ModelError> {
        let (channels, height, width) = input.dim();
        ensure_shape(&self.name, &[channels, 1, 1], grad_output.shape())?;
        let area = (height * width) as f32;
        Ok(FeatureMap::from_shape_fn(input.raw_dim(), |(c, _, _)| {
            grad_output[[c, 0, 0]] / area
        }))
    }
}

/// Fully connected layer over the flattened input, producing `[out, 1, 1]`.
pub struct Linear {
    name: String,
    /// `[out_features, in_features]`
    weight: Array2<f32>,
    bias: Array1<f32>,
}

impl Linear {
    pub fn new(
        name: impl Into<String>,
        weight: Array2<f32>,
        bias: Array1<f32>,
    ) -> Result<Self, ModelError> {
        let name = name.into();
        ensure_shape(&name, &[weight.dim().0], bias.shape())?;
        Ok(Self { name, weight, bias })
    }
}

impl Layer for Linear {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &FeatureMap) -> Result<FeatureMap, ModelError> {
        let (out_features, in_features) = self.weight.dim();
        if input.len() != in_features {
            return Err(ModelError::shape(&self.name, &[in_features], &[input.len()]));
        }
        let flat: Array1<f32> = input.iter().copied().collect();
        let scores = self.weight.dot(&flat) + &self.bias;
        FeatureMap::from_shape_vec((out_features, 1, 1), scores.to_vec())
            .map_err(|e| ModelError::Inference(e.to_string()))
    }

    fn backward(
        &self,
        input: &FeatureMap,
        grad_output: &FeatureMap,
    ) -> Result<FeatureMap, ModelError> {
        let (out_features, in_features) = self.weight.dim();
        ensure_shape(&self.name, &[in_features], &[input.len()])?;
        ensure_shape(&self.name, &[out_features], &[grad_output.len()])?;
        let grad: Array1<f32> = grad_output.iter().copied().collect();
        let grad_input = self.weight.t().dot(&grad);
        FeatureMap::from_shape_vec(input.raw_dim(), grad_input.to_vec())
            .map_err(|e| ModelError::Inference(e.to_string()))
    }
}
