use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use super::error::{CapsError, Result};

/// Epsilon guarding every division and logarithm inside routing.
pub const ROUTING_EPS: f32 = 1e-10;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Activation {
    ReLU,
    LeakyReLU(f32),
    Sigmoid,
    Tanh,
    None,
}

impl Activation {
    pub fn apply(&self, v: f32) -> f32 {
        match *self {
            Activation::ReLU => v.max(0.0),
            Activation::LeakyReLU(alpha) => {
                if v > 0.0 {
                    v
                } else {
                    alpha * v
                }
            }
            Activation::Sigmoid => sigmoid(v),
            Activation::Tanh => v.tanh(),
            Activation::None => v,
        }
    }
}

pub fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}

/// Routing strategy used by every ConvCaps layer of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RoutingKind {
    #[default]
    Em,
    /// Cosine-agreement routing. Experimental: no convergence guarantee.
    Angle,
}

/// Where the batched tensor work runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Device {
    #[default]
    Cpu,
    /// Batch elements are routed on the rayon thread pool.
    CpuParallel,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub kind: RoutingKind,
    pub eps: f32,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            kind: RoutingKind::Em,
            eps: ROUTING_EPS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BackboneConfig {
    Conv2d {
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        activation: Activation,
    },
    BatchNorm2d {
        num_features: usize,
        eps: f32,
        activation: Activation,
    },
    MaxPool2d {
        kernel_size: usize,
        stride: usize,
        padding: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimaryCapsConfig {
    pub in_channels: usize,
    pub num_types: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvCapsConfig {
    pub name: String,
    pub in_types: usize,
    pub out_types: usize,
    /// 0 means the receptive field covers the whole input (class capsules).
    pub kernel_size: usize,
    pub stride: usize,
    pub iterations: usize,
    pub coordinate_add: bool,
    pub transform_share: bool,
    /// Reconstruct this layer's input poses from its routing statistics.
    #[serde(default)]
    pub denoise: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecoderConfig {
    pub hidden: Vec<usize>,
    pub output_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub input_shape: (usize, usize, usize),
    /// Side of the square pose matrix.
    pub pose_size: usize,
    pub backbone: Vec<BackboneConfig>,
    pub primary: PrimaryCapsConfig,
    pub capsules: Vec<ConvCapsConfig>,
    #[serde(default)]
    pub routing: RoutingConfig,
    pub decoder: Option<DecoderConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ClassLoss {
    Spread {
        margin: f32,
    },
    Margin {
        positive_margin: f32,
        negative_margin: f32,
        down_weighting: f32,
    },
    CrossEntropy,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossConfig {
    pub classification: ClassLoss,
    pub recon_weight: f32,
    pub denoise_weight: f32,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            classification: ClassLoss::Spread { margin: 0.2 },
            recon_weight: 0.0005,
            denoise_weight: 0.0,
        }
    }
}

fn caps(
    name: &str,
    in_types: usize,
    out_types: usize,
    kernel_size: usize,
    stride: usize,
    iterations: usize,
) -> ConvCapsConfig {
    ConvCapsConfig {
        name: name.to_string(),
        in_types,
        out_types,
        kernel_size,
        stride,
        iterations,
        coordinate_add: false,
        transform_share: false,
        denoise: false,
    }
}

fn class_caps(in_types: usize, out_types: usize) -> ConvCapsConfig {
    ConvCapsConfig {
        coordinate_add: true,
        transform_share: true,
        ..caps("class_caps", in_types, out_types, 0, 1, 3)
    }
}

impl NetworkConfig {
    /// 28x28 digits: conv 5x5/2 -> 12, caps 3x3/2 -> 5, caps 3x3/1 -> 3, class.
    pub fn mnist() -> Self {
        Self {
            input_shape: (1, 28, 28),
            pose_size: 4,
            backbone: vec![BackboneConfig::Conv2d {
                in_channels: 1,
                out_channels: 32,
                kernel_size: 5,
                stride: 2,
                padding: 0,
                activation: Activation::ReLU,
            }],
            primary: PrimaryCapsConfig {
                in_channels: 32,
                num_types: 32,
            },
            capsules: vec![
                caps("conv_caps1", 32, 32, 3, 2, 1),
                caps("conv_caps2", 32, 32, 3, 1, 3),
                class_caps(32, 10),
            ],
            routing: RoutingConfig::default(),
            decoder: Some(DecoderConfig {
                hidden: vec![512, 1024],
                output_size: 28 * 28,
            }),
        }
    }

    /// 32x32 greyscale toys, five classes.
    pub fn smallnorb() -> Self {
        Self {
            input_shape: (1, 32, 32),
            pose_size: 4,
            backbone: vec![BackboneConfig::Conv2d {
                in_channels: 1,
                out_channels: 32,
                kernel_size: 5,
                stride: 2,
                padding: 0,
                activation: Activation::ReLU,
            }],
            primary: PrimaryCapsConfig {
                in_channels: 32,
                num_types: 16,
            },
            capsules: vec![
                caps("conv_caps1", 16, 16, 3, 2, 1),
                caps("conv_caps2", 16, 16, 3, 1, 3),
                class_caps(16, 5),
            ],
            routing: RoutingConfig::default(),
            decoder: Some(DecoderConfig {
                hidden: vec![512, 1024],
                output_size: 32 * 32,
            }),
        }
    }

    /// Stereo pairs plus depth at 64x64 with a batch-normalized backbone.
    pub fn smallnorb_deep() -> Self {
        Self {
            input_shape: (4, 64, 64),
            pose_size: 4,
            backbone: vec![
                BackboneConfig::Conv2d {
                    in_channels: 4,
                    out_channels: 32,
                    kernel_size: 5,
                    stride: 2,
                    padding: 0,
                    activation: Activation::None,
                },
                BackboneConfig::BatchNorm2d {
                    num_features: 32,
                    eps: 0.001,
                    activation: Activation::ReLU,
                },
                BackboneConfig::MaxPool2d {
                    kernel_size: 2,
                    stride: 2,
                    padding: 1,
                },
                BackboneConfig::Conv2d {
                    in_channels: 32,
                    out_channels: 32,
                    kernel_size: 5,
                    stride: 2,
                    padding: 1,
                    activation: Activation::None,
                },
                BackboneConfig::BatchNorm2d {
                    num_features: 32,
                    eps: 0.001,
                    activation: Activation::ReLU,
                },
            ],
            primary: PrimaryCapsConfig {
                in_channels: 32,
                num_types: 32,
            },
            capsules: vec![
                ConvCapsConfig {
                    denoise: true,
                    ..caps("conv_caps1", 32, 32, 3, 2, 1)
                },
                caps("conv_caps2", 32, 32, 3, 1, 3),
                class_caps(32, 5),
            ],
            routing: RoutingConfig::default(),
            decoder: None,
        }
    }

    /// Looks up a named preset, ignoring case.
    pub fn preset(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "mnist" => Ok(Self::mnist()),
            "smallnorb" => Ok(Self::smallnorb()),
            "smallnorb-deep" => Ok(Self::smallnorb_deep()),
            _ => Err(CapsError::UnknownPreset(name.to_string())),
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn pose_dim(&self) -> usize {
        self.pose_size * self.pose_size
    }

    pub fn num_classes(&self) -> usize {
        self.capsules.last().map_or(0, |c| c.out_types)
    }

    /// Checks everything that does not depend on spatial sizes; the builder
    /// checks the rest while threading shapes through the network.
    pub fn validate(&self) -> Result<()> {
        let (c, h, w) = self.input_shape;
        if c == 0 || h == 0 || w == 0 {
            return Err(invalid("input shape must be non-empty"));
        }
        if self.pose_size == 0 {
            return Err(invalid("pose_size must be at least 1"));
        }
        if !(self.routing.eps > 0.0 && self.routing.eps.is_finite()) {
            return Err(invalid("routing eps must be positive"));
        }
        if self.primary.num_types == 0 {
            return Err(invalid("primary capsules need at least one type"));
        }
        if self.capsules.is_empty() {
            return Err(invalid("at least one ConvCaps layer is required"));
        }

        let mut types = self.primary.num_types;
        for layer in &self.capsules {
            if layer.in_types != types {
                return Err(invalid(format!(
                    "{}: expects {} input types but receives {}",
                    layer.name, layer.in_types, types
                )));
            }
            if layer.out_types == 0 {
                return Err(invalid(format!("{}: out_types must be positive", layer.name)));
            }
            if layer.stride == 0 {
                return Err(invalid(format!("{}: stride must be positive", layer.name)));
            }
            if layer.iterations == 0 {
                return Err(invalid(format!("{}: at least one routing iteration", layer.name)));
            }
            if layer.coordinate_add && layer.kernel_size != 0 {
                return Err(invalid(format!(
                    "{}: coordinate addition needs the full receptive field (kernel_size 0)",
                    layer.name
                )));
            }
            if layer.coordinate_add && self.pose_size < 2 {
                return Err(invalid(format!(
                    "{}: coordinate addition needs a pose of at least 2x2",
                    layer.name
                )));
            }
            types = layer.out_types;
        }

        for stage in &self.backbone {
            match *stage {
                BackboneConfig::Conv2d {
                    in_channels,
                    out_channels,
                    kernel_size,
                    stride,
                    ..
                } => {
                    if in_channels == 0 || out_channels == 0 || kernel_size == 0 || stride == 0 {
                        return Err(invalid("conv2d dimensions must be positive"));
                    }
                }
                BackboneConfig::BatchNorm2d { num_features, eps, .. } => {
                    if num_features == 0 || eps <= 0.0 {
                        return Err(invalid("batchnorm needs features and a positive eps"));
                    }
                }
                BackboneConfig::MaxPool2d {
                    kernel_size,
                    stride,
                    padding,
                } => {
                    if kernel_size == 0 || stride == 0 || padding * 2 > kernel_size {
                        return Err(invalid("maxpool padding must not exceed half the kernel"));
                    }
                }
            }
        }

        if let Some(decoder) = &self.decoder {
            if decoder.output_size == 0 || decoder.hidden.iter().any(|&h| h == 0) {
                return Err(invalid("decoder layer widths must be positive"));
            }
        }

        Ok(())
    }
}

impl LossConfig {
    pub fn validate(&self) -> Result<()> {
        if self.recon_weight < 0.0 || self.denoise_weight < 0.0 {
            return Err(invalid("loss weights must be non-negative"));
        }
        match self.classification {
            ClassLoss::Spread { margin } if margin < 0.0 => {
                Err(invalid("spread loss margin must be non-negative"))
            }
            ClassLoss::Margin {
                positive_margin,
                negative_margin,
                ..
            } if negative_margin > positive_margin => {
                Err(invalid("margin loss needs m- <= m+"))
            }
            _ => Ok(()),
        }
    }
}

fn invalid(msg: impl Into<String>) -> CapsError {
    CapsError::InvalidConfig(msg.into())
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self::mnist()
    }
}
