use ndarray::{s, Array2, Array3, Array4, Array5, ArrayView4};
use tracing::{debug, info, warn};

use super::capsule::{CapsuleGrid, ConvCapsLayer, PrimaryCapsLayer, RoutingStats};
use super::config::{Device, NetworkConfig};
use super::decoder::Decoder;
use super::denoise::reconstruct_inputs;
use super::error::{CapsError, Result};
use super::layers::{Layer, ParamVisitor};

/// Matrix capsule network: backbone, primary capsules, ConvCaps stack and
/// optional reconstruction decoder.
pub struct CapsNet {
    pub config: NetworkConfig,
    pub backbone: Vec<Box<dyn Layer>>,
    pub primary: PrimaryCapsLayer,
    pub capsules: Vec<ConvCapsLayer>,
    pub decoder: Option<Decoder>,
    device: Device,
}

/// Per-call inputs besides the images.
#[derive(Debug, Clone, Copy)]
pub struct ForwardOptions<'a> {
    /// Routing inverse temperature.
    pub lambda: f32,
    /// Decoder mask; the most active class is used when absent.
    pub labels: Option<&'a [usize]>,
    /// Seed of the denoising vote sampler.
    pub seed: u64,
}

impl Default for ForwardOptions<'_> {
    fn default() -> Self {
        Self {
            lambda: 1e-3,
            labels: None,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DenoiseTrace {
    pub reconstruction: Array5<f32>,
    /// Input poses of the layer.
    pub target: Array5<f32>,
}

/// Auxiliary outputs of one ConvCaps layer.
#[derive(Debug, Clone)]
pub struct LayerTrace {
    pub name: String,
    pub output: CapsuleGrid,
    pub stats: RoutingStats,
    pub denoise: Option<DenoiseTrace>,
}

#[derive(Debug, Clone)]
pub struct CapsNetOutput {
    /// `(batch, classes, h*h)`
    pub class_poses: Array3<f32>,
    /// `(batch, classes)`
    pub class_activations: Array2<f32>,
    /// `(batch, C*H*W)` when the model has a decoder.
    pub reconstruction: Option<Array2<f32>>,
    pub primary: CapsuleGrid,
    pub traces: Vec<LayerTrace>,
}

impl CapsNet {
    pub fn new(
        config: NetworkConfig,
        backbone: Vec<Box<dyn Layer>>,
        primary: PrimaryCapsLayer,
        capsules: Vec<ConvCapsLayer>,
        decoder: Option<Decoder>,
        device: Device,
    ) -> Self {
        Self {
            config,
            backbone,
            primary,
            capsules,
            decoder,
            device,
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn num_classes(&self) -> usize {
        self.config.num_classes()
    }

    /// Forward pass
    pub fn forward(&self, images: &ArrayView4<f32>, options: &ForwardOptions<'_>) -> Result<CapsNetOutput> {
        let (_, c, h, w) = images.dim();
        if (c, h, w) != self.config.input_shape {
            return Err(CapsError::shape(
                "input",
                format!("{:?}", self.config.input_shape),
                format!("{:?}", (c, h, w)),
            ));
        }

        let mut features = images.to_owned();
        for layer in &self.backbone {
            features = layer.forward(&features.view())?;
            debug!(layer = layer.name(), shape = ?features.dim(), "backbone");
        }

        let primary = self.primary.forward(&features.view())?;
        let mut grid = primary.clone();
        let mut traces = Vec::with_capacity(self.capsules.len());
        for (i, layer) in self.capsules.iter().enumerate() {
            let output = layer.forward(&grid, options.lambda)?;
            let denoise = if layer.denoise {
                let seed = options.seed.wrapping_add((i as u64) << 32);
                Some(DenoiseTrace {
                    reconstruction: reconstruct_inputs(layer, &output.stats, seed)?,
                    target: grid.poses.clone(),
                })
            } else {
                None
            };
            grid = output.grid.clone();
            traces.push(LayerTrace {
                name: layer.name.clone(),
                output: output.grid,
                stats: output.stats,
                denoise,
            });
        }

        let (batch_size, classes, out_h, out_w, pose_dim) = grid.poses.dim();
        if (out_h, out_w) != (1, 1) {
            return Err(CapsError::shape("class capsules", "1x1 extent", format!("{out_h}x{out_w}")));
        }
        let class_poses = grid.poses.slice(s![.., .., 0, 0, ..]).to_owned();
        let class_activations = grid.activations.slice(s![.., .., 0, 0]).to_owned();
        debug_assert_eq!(class_poses.dim(), (batch_size, classes, pose_dim));

        let reconstruction = match &self.decoder {
            Some(decoder) => {
                let selected = Decoder::select_classes(&class_activations.view(), options.labels)?;
                Some(decoder.forward(&class_poses.view(), &selected)?)
            }
            None => None,
        };

        Ok(CapsNetOutput {
            class_poses,
            class_activations,
            reconstruction,
            primary,
            traces,
        })
    }

    /// Most active class per sample.
    pub fn predict(&self, images: &ArrayView4<f32>, lambda: f32) -> Result<Vec<usize>> {
        let options = ForwardOptions {
            lambda,
            ..ForwardOptions::default()
        };
        let output = self.forward(images, &options)?;
        Decoder::select_classes(&output.class_activations.view(), None)
    }

    /// Visits every trainable tensor with a dotted, stable name.
    pub fn visit_parameters(&mut self, visitor: &mut ParamVisitor<'_>) {
        for (i, layer) in self.backbone.iter_mut().enumerate() {
            let prefix = format!("backbone.{i}.{}", layer.name());
            layer.visit_parameters(&prefix, visitor);
        }
        self.primary.visit_parameters("primary_caps", visitor);
        for layer in &mut self.capsules {
            let prefix = layer.name.clone();
            layer.visit_parameters(&prefix, visitor);
        }
        if let Some(decoder) = &mut self.decoder {
            decoder.visit_parameters("decoder", visitor);
        }
    }

    pub fn num_parameters(&self) -> usize {
        self.backbone.iter().map(|l| l.num_parameters()).sum::<usize>()
            + self.primary.num_parameters()
            + self.capsules.iter().map(ConvCapsLayer::num_parameters).sum::<usize>()
            + self.decoder.as_ref().map_or(0, Decoder::num_parameters)
    }

    /// Moves every layer to `device` together.
    pub fn to_device(&mut self, device: Device) {
        for layer in &mut self.backbone {
            layer.set_device(device);
        }
        for layer in &mut self.capsules {
            layer.to_device(device);
        }
        self.device = device;
        info!(?device, "model moved");
    }

    /// Quick check: a zero batch of one sample through the whole network.
    pub fn diagnostic(&self) -> Result<()> {
        info!(
            backbone = self.backbone.len(),
            capsule_layers = self.capsules.len(),
            parameters = self.num_parameters(),
            input_shape = ?self.config.input_shape,
            "diagnostic"
        );
        let (c, h, w) = self.config.input_shape;
        let blank = Array4::zeros((1, c, h, w));
        let output = self.forward(&blank.view(), &ForwardOptions::default())?;
        for trace in &output.traces {
            let (_, types, oh, ow, _) = trace.output.poses.dim();
            info!(layer = %trace.name, types, height = oh, width = ow, "capsule layer");
        }
        if output.class_activations.iter().any(|a| !a.is_finite()) {
            warn!("class activations are not finite on a zero input");
        }
        info!(classes = ?output.class_activations.dim(), "model operational");
        Ok(())
    }
}
