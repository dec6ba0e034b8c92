use ndarray::{s, stack, Array1, Array2, Array3, Array4, ArrayView2, ArrayView3, ArrayView4, ArrayViewMutD, Axis};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rayon::prelude::*;

use super::config::{Activation, Device};
use super::error::{CapsError, Result};

/// Receives `(name, tensor)` for every trainable parameter.
pub type ParamVisitor<'v> = dyn FnMut(&str, ArrayViewMutD<'_, f32>) + 'v;

/// Backbone stage operating on `(batch, channels, height, width)` maps.
pub trait Layer: Send + Sync {
    fn name(&self) -> &'static str;
    fn forward(&self, input: &ArrayView4<f32>) -> Result<Array4<f32>>;
    /// `(channels, height, width)` produced for the given input extent.
    fn output_shape(&self, input: (usize, usize, usize)) -> Result<(usize, usize, usize)>;
    fn visit_parameters(&mut self, prefix: &str, visitor: &mut ParamVisitor<'_>);
    fn num_parameters(&self) -> usize;
    fn set_device(&mut self, device: Device);
}

/// Runs `f` once per batch element, on the rayon pool for `CpuParallel`.
/// Results keep batch order either way.
pub fn map_batch<T, F>(device: Device, batch_size: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize) -> T + Sync + Send,
{
    match device {
        Device::Cpu => (0..batch_size).map(f).collect(),
        Device::CpuParallel => (0..batch_size).into_par_iter().map(f).collect(),
    }
}

/// Stacks per-sample results back into a batch.
pub fn stack_batch<D>(parts: &[ndarray::Array<f32, D>]) -> Result<ndarray::Array<f32, D::Larger>>
where
    D: ndarray::Dimension,
    D::Larger: ndarray::RemoveAxis,
{
    let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
    stack(Axis(0), &views).map_err(|e| CapsError::shape("batch", "equal sample shapes", e))
}

fn check_channels(layer: &str, expected: usize, found: usize) -> Result<()> {
    if expected != found {
        return Err(CapsError::shape(layer, format!("{expected} channels"), format!("{found} channels")));
    }
    Ok(())
}

/// 2D convolution followed by an element-wise activation.
pub struct ConvLayer {
    pub weights: Array4<f32>,
    pub biases: Array1<f32>,
    pub stride: usize,
    pub padding: usize,
    pub activation: Activation,
    device: Device,
}

impl ConvLayer {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        activation: Activation,
        rng: &mut StdRng,
    ) -> Self {
        // He uniform
        let scale = (2.0 / (in_channels * kernel_size * kernel_size) as f32).sqrt();
        let weights = Array4::random_using(
            (out_channels, in_channels, kernel_size, kernel_size),
            Uniform::new(-scale, scale),
            rng,
        );

        Self {
            weights,
            biases: Array1::zeros(out_channels),
            stride,
            padding,
            activation,
            device: Device::Cpu,
        }
    }

    fn convolve(&self, input: &ArrayView3<f32>) -> Array3<f32> {
        let (out_channels, in_channels, kernel_size, _) = self.weights.dim();
        let padded = pad_sample(input, self.padding, 0.0);
        let (_, in_height, in_width) = padded.dim();
        let out_height = (in_height - kernel_size) / self.stride + 1;
        let out_width = (in_width - kernel_size) / self.stride + 1;

        let mut output = Array3::zeros((out_channels, out_height, out_width));
        for oc in 0..out_channels {
            for oh in 0..out_height {
                for ow in 0..out_width {
                    let ih_start = oh * self.stride;
                    let iw_start = ow * self.stride;
                    let mut sum = 0.0;
                    for ic in 0..in_channels {
                        for kh in 0..kernel_size {
                            for kw in 0..kernel_size {
                                sum += padded[[ic, ih_start + kh, iw_start + kw]]
                                    * self.weights[[oc, ic, kh, kw]];
                            }
                        }
                    }
                    output[[oc, oh, ow]] = self.activation.apply(sum + self.biases[oc]);
                }
            }
        }
        output
    }
}

fn pad_sample(input: &ArrayView3<f32>, p: usize, fill: f32) -> Array3<f32> {
    if p == 0 {
        return input.to_owned();
    }
    let (channels, height, width) = input.dim();
    let mut padded = Array3::from_elem((channels, height + 2 * p, width + 2 * p), fill);
    padded.slice_mut(s![.., p..height + p, p..width + p]).assign(input);
    padded
}

fn window_output(extent: usize, kernel: usize, stride: usize, padding: usize) -> Result<usize> {
    let padded = extent + 2 * padding;
    if padded < kernel {
        return Err(CapsError::shape(
            "window",
            format!("extent >= {kernel}"),
            format!("{padded}"),
        ));
    }
    Ok((padded - kernel) / stride + 1)
}

impl Layer for ConvLayer {
    fn name(&self) -> &'static str {
        "conv2d"
    }

    fn forward(&self, input: &ArrayView4<f32>) -> Result<Array4<f32>> {
        check_channels(self.name(), self.weights.dim().1, input.dim().1)?;
        self.output_shape((input.dim().1, input.dim().2, input.dim().3))?;
        let samples = map_batch(self.device, input.dim().0, |b| {
            self.convolve(&input.index_axis(Axis(0), b))
        });
        stack_batch(&samples)
    }

    fn output_shape(&self, input: (usize, usize, usize)) -> Result<(usize, usize, usize)> {
        let (out_channels, in_channels, kernel_size, _) = self.weights.dim();
        check_channels(self.name(), in_channels, input.0)?;
        Ok((
            out_channels,
            window_output(input.1, kernel_size, self.stride, self.padding)?,
            window_output(input.2, kernel_size, self.stride, self.padding)?,
        ))
    }

    fn visit_parameters(&mut self, prefix: &str, visitor: &mut ParamVisitor<'_>) {
        visitor(&format!("{prefix}.weight"), self.weights.view_mut().into_dyn());
        visitor(&format!("{prefix}.bias"), self.biases.view_mut().into_dyn());
    }

    fn num_parameters(&self) -> usize {
        self.weights.len() + self.biases.len()
    }

    fn set_device(&mut self, device: Device) {
        self.device = device;
    }
}

/// Batch normalization using the statistics of the current batch.
pub struct BatchNorm2d {
    pub gamma: Array1<f32>,
    pub beta: Array1<f32>,
    pub eps: f32,
    pub activation: Activation,
}

impl BatchNorm2d {
    pub fn new(num_features: usize, eps: f32, activation: Activation) -> Self {
        Self {
            gamma: Array1::ones(num_features),
            beta: Array1::zeros(num_features),
            eps,
            activation,
        }
    }
}

impl Layer for BatchNorm2d {
    fn name(&self) -> &'static str {
        "batchnorm2d"
    }

    fn forward(&self, input: &ArrayView4<f32>) -> Result<Array4<f32>> {
        check_channels(self.name(), self.gamma.len(), input.dim().1)?;
        let mut output = input.to_owned();
        for (c, mut channel) in output.axis_iter_mut(Axis(1)).enumerate() {
            let n = channel.len().max(1) as f32;
            let mean = channel.sum() / n;
            let var = channel.mapv(|v| (v - mean) * (v - mean)).sum() / n;
            let inv_std = 1.0 / (var + self.eps).sqrt();
            let (gamma, beta) = (self.gamma[c], self.beta[c]);
            channel.mapv_inplace(|v| self.activation.apply((v - mean) * inv_std * gamma + beta));
        }
        Ok(output)
    }

    fn output_shape(&self, input: (usize, usize, usize)) -> Result<(usize, usize, usize)> {
        check_channels(self.name(), self.gamma.len(), input.0)?;
        Ok(input)
    }

    fn visit_parameters(&mut self, prefix: &str, visitor: &mut ParamVisitor<'_>) {
        visitor(&format!("{prefix}.weight"), self.gamma.view_mut().into_dyn());
        visitor(&format!("{prefix}.bias"), self.beta.view_mut().into_dyn());
    }

    fn num_parameters(&self) -> usize {
        self.gamma.len() + self.beta.len()
    }

    fn set_device(&mut self, _device: Device) {}
}

pub struct MaxPool2d {
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: usize,
    device: Device,
}

impl MaxPool2d {
    pub fn new(kernel_size: usize, stride: usize, padding: usize) -> Self {
        Self {
            kernel_size,
            stride,
            padding,
            device: Device::Cpu,
        }
    }

    fn pool(&self, input: &ArrayView3<f32>) -> Array3<f32> {
        let padded = pad_sample(input, self.padding, f32::NEG_INFINITY);
        let (channels, height, width) = padded.dim();
        let out_height = (height - self.kernel_size) / self.stride + 1;
        let out_width = (width - self.kernel_size) / self.stride + 1;
        Array3::from_shape_fn((channels, out_height, out_width), |(c, oh, ow)| {
            let (h0, w0) = (oh * self.stride, ow * self.stride);
            padded
                .slice(s![c, h0..h0 + self.kernel_size, w0..w0 + self.kernel_size])
                .fold(f32::NEG_INFINITY, |acc, &v| acc.max(v))
        })
    }
}

impl Layer for MaxPool2d {
    fn name(&self) -> &'static str {
        "maxpool2d"
    }

    fn forward(&self, input: &ArrayView4<f32>) -> Result<Array4<f32>> {
        self.output_shape((input.dim().1, input.dim().2, input.dim().3))?;
        let samples = map_batch(self.device, input.dim().0, |b| {
            self.pool(&input.index_axis(Axis(0), b))
        });
        stack_batch(&samples)
    }

    fn output_shape(&self, input: (usize, usize, usize)) -> Result<(usize, usize, usize)> {
        Ok((
            input.0,
            window_output(input.1, self.kernel_size, self.stride, self.padding)?,
            window_output(input.2, self.kernel_size, self.stride, self.padding)?,
        ))
    }

    fn visit_parameters(&mut self, _prefix: &str, _visitor: &mut ParamVisitor<'_>) {}

    fn num_parameters(&self) -> usize {
        0
    }

    fn set_device(&mut self, device: Device) {
        self.device = device;
    }
}

/// Fully connected layer on `(batch, features)`.
pub struct DenseLayer {
    pub weights: Array2<f32>,
    pub biases: Array1<f32>,
    pub activation: Activation,
}

impl DenseLayer {
    pub fn new(in_features: usize, out_features: usize, activation: Activation, rng: &mut StdRng) -> Self {
        let scale = (1.0 / in_features as f32).sqrt();
        Self {
            weights: Array2::random_using((out_features, in_features), Uniform::new(-scale, scale), rng),
            biases: Array1::zeros(out_features),
            activation,
        }
    }

    pub fn forward(&self, input: &ArrayView2<f32>) -> Result<Array2<f32>> {
        if input.dim().1 != self.weights.dim().1 {
            return Err(CapsError::shape(
                "dense",
                format!("{} features", self.weights.dim().1),
                format!("{} features", input.dim().1),
            ));
        }
        let mut output = input.dot(&self.weights.t()) + &self.biases;
        output.mapv_inplace(|v| self.activation.apply(v));
        Ok(output)
    }

    pub fn visit_parameters(&mut self, prefix: &str, visitor: &mut ParamVisitor<'_>) {
        visitor(&format!("{prefix}.weight"), self.weights.view_mut().into_dyn());
        visitor(&format!("{prefix}.bias"), self.biases.view_mut().into_dyn());
    }

    pub fn num_parameters(&self) -> usize {
        self.weights.len() + self.biases.len()
    }
}
