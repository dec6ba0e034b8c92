use ndarray::{Array2, ArrayView2, ArrayView3};
use rand::rngs::StdRng;

use super::config::{Activation, DecoderConfig};
use super::error::{CapsError, Result};
use super::layers::{DenseLayer, ParamVisitor};

/// Reconstruction network fed with the class-capsule poses, all but one
/// class masked to zero.
pub struct Decoder {
    pub layers: Vec<DenseLayer>,
    pub num_classes: usize,
    pub pose_dim: usize,
}

impl Decoder {
    pub fn new(config: &DecoderConfig, num_classes: usize, pose_dim: usize, rng: &mut StdRng) -> Self {
        let mut layers = Vec::with_capacity(config.hidden.len() + 1);
        let mut width = num_classes * pose_dim;
        for &hidden in &config.hidden {
            layers.push(DenseLayer::new(width, hidden, Activation::ReLU, rng));
            width = hidden;
        }
        layers.push(DenseLayer::new(width, config.output_size, Activation::Sigmoid, rng));
        Self {
            layers,
            num_classes,
            pose_dim,
        }
    }

    /// Class kept by the mask: the label when given, otherwise the most
    /// active class.
    pub fn select_classes(activations: &ArrayView2<f32>, labels: Option<&[usize]>) -> Result<Vec<usize>> {
        let (batch_size, num_classes) = activations.dim();
        match labels {
            Some(labels) => {
                if labels.len() != batch_size {
                    return Err(CapsError::shape("decoder", format!("{batch_size} labels"), labels.len()));
                }
                if let Some(&bad) = labels.iter().find(|&&l| l >= num_classes) {
                    return Err(CapsError::InvalidConfig(format!(
                        "label {bad} out of range for {num_classes} classes"
                    )));
                }
                Ok(labels.to_vec())
            }
            None => Ok(activations.rows().into_iter().map(|row| argmax(row.iter().copied())).collect()),
        }
    }

    /// `class_poses` is `(batch, classes, h*h)`; returns `(batch, output_size)`.
    pub fn forward(&self, class_poses: &ArrayView3<f32>, classes: &[usize]) -> Result<Array2<f32>> {
        let (batch_size, num_classes, pose_dim) = class_poses.dim();
        if (num_classes, pose_dim) != (self.num_classes, self.pose_dim) || classes.len() != batch_size {
            return Err(CapsError::shape(
                "decoder",
                format!("(batch, {}, {}) with one class per sample", self.num_classes, self.pose_dim),
                format!("{:?} with {} classes", class_poses.dim(), classes.len()),
            ));
        }

        let mut x = Array2::from_shape_fn((batch_size, num_classes * pose_dim), |(b, i)| {
            let (c, d) = (i / pose_dim, i % pose_dim);
            if c == classes[b] {
                class_poses[[b, c, d]]
            } else {
                0.0
            }
        });
        for layer in &self.layers {
            x = layer.forward(&x.view())?;
        }
        Ok(x)
    }

    pub fn visit_parameters(&mut self, prefix: &str, visitor: &mut ParamVisitor<'_>) {
        for (i, layer) in self.layers.iter_mut().enumerate() {
            layer.visit_parameters(&format!("{prefix}.fc{i}"), visitor);
        }
    }

    pub fn num_parameters(&self) -> usize {
        self.layers.iter().map(DenseLayer::num_parameters).sum()
    }
}

/// Index of the largest value; the first one on ties.
pub fn argmax(values: impl Iterator<Item = f32>) -> usize {
    values
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, v)| if v > best.1 { (i, v) } else { best })
        .0
}
