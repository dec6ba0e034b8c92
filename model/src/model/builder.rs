use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use super::{
    capsule::{ConvCapsLayer, PrimaryCapsLayer},
    config::{BackboneConfig, Device, NetworkConfig},
    core::CapsNet,
    decoder::Decoder,
    error::{CapsError, Result},
    layers::{BatchNorm2d, ConvLayer, Layer, MaxPool2d},
};

/// Model constructor
pub struct ModelBuilder {
    network_config: Option<NetworkConfig>,
    seed: u64,
    device: Device,
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self {
            network_config: None,
            seed: 0,
            device: Device::Cpu,
        }
    }

    pub fn with_network_config(mut self, config: NetworkConfig) -> Self {
        self.network_config = Some(config);
        self
    }

    /// Seed of every parameter initializer.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn build(self) -> Result<CapsNet> {
        let config = self
            .network_config
            .ok_or_else(|| CapsError::InvalidConfig("network configuration required".to_string()))?;
        config.validate()?;

        let mut rng = StdRng::seed_from_u64(self.seed);
        let (backbone, features) = Self::build_backbone(&config, self.device, &mut rng)?;

        let (channels, height, width) = features;
        if channels != config.primary.in_channels {
            return Err(CapsError::shape(
                "primary_caps",
                format!("{} channels", config.primary.in_channels),
                format!("{channels} channels"),
            ));
        }
        let primary = PrimaryCapsLayer::new(channels, config.primary.num_types, config.pose_size, &mut rng);

        let mut extent = (height, width);
        let mut capsules = Vec::with_capacity(config.capsules.len());
        for layer_config in &config.capsules {
            let layer = ConvCapsLayer::new(layer_config, config.pose_size, extent, &config.routing, self.device, &mut rng)?;
            debug!(
                layer = %layer.name,
                input = ?extent,
                output = ?layer.output_extent(),
                kernel = ?(layer.geometry.kernel_h, layer.geometry.kernel_w),
                "conv caps"
            );
            extent = layer.output_extent();
            capsules.push(layer);
        }
        if extent != (1, 1) {
            return Err(CapsError::InvalidConfig(format!(
                "last capsule layer must reduce to 1x1, got {}x{}",
                extent.0, extent.1
            )));
        }

        let decoder = match &config.decoder {
            Some(decoder_config) => {
                let (c, h, w) = config.input_shape;
                if decoder_config.output_size != c * h * w {
                    return Err(CapsError::InvalidConfig(format!(
                        "decoder output {} does not match the {} input pixels",
                        decoder_config.output_size,
                        c * h * w
                    )));
                }
                Some(Decoder::new(decoder_config, config.num_classes(), config.pose_dim(), &mut rng))
            }
            None => None,
        };

        let model = CapsNet::new(config, backbone, primary, capsules, decoder, self.device);
        info!(
            parameters = model.num_parameters(),
            classes = model.num_classes(),
            routing = ?model.config.routing.kind,
            device = ?self.device,
            seed = self.seed,
            "model built"
        );
        Ok(model)
    }

    /// Returns the backbone and the `(channels, height, width)` it produces.
    fn build_backbone(
        config: &NetworkConfig,
        device: Device,
        rng: &mut StdRng,
    ) -> Result<(Vec<Box<dyn Layer>>, (usize, usize, usize))> {
        let mut layers: Vec<Box<dyn Layer>> = Vec::with_capacity(config.backbone.len());
        let mut shape = config.input_shape;

        for layer_config in &config.backbone {
            let mut layer: Box<dyn Layer> = match *layer_config {
                BackboneConfig::Conv2d {
                    in_channels,
                    out_channels,
                    kernel_size,
                    stride,
                    padding,
                    activation,
                } => Box::new(ConvLayer::new(
                    in_channels,
                    out_channels,
                    kernel_size,
                    stride,
                    padding,
                    activation,
                    rng,
                )),
                BackboneConfig::BatchNorm2d {
                    num_features,
                    eps,
                    activation,
                } => Box::new(BatchNorm2d::new(num_features, eps, activation)),
                BackboneConfig::MaxPool2d {
                    kernel_size,
                    stride,
                    padding,
                } => Box::new(MaxPool2d::new(kernel_size, stride, padding)),
            };
            layer.set_device(device);
            shape = layer.output_shape(shape)?;
            debug!(layer = layer.name(), output = ?shape, "backbone");
            layers.push(layer);
        }

        Ok((layers, shape))
    }
}

impl Default for ModelBuilder {
    fn default() -> Self {
        Self::new()
    }
}
