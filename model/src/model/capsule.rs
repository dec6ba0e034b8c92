use ndarray::{Array1, Array2, Array3, Array4, Array5, Array6, ArrayView4, Axis};
use ndarray_rand::rand_distr::{StandardNormal, Uniform};
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use tracing::{debug, error};

use super::config::{sigmoid, ConvCapsConfig, Device, RoutingConfig};
use super::error::{CapsError, Result};
use super::layers::{map_batch, stack_batch, ParamVisitor};
use super::routing::{Routing, RoutingResult};
use super::votes::VoteGeometry;

/// Grid of capsules: poses `(batch, types, H, W, h*h)` and activations
/// `(batch, types, H, W)`.
#[derive(Debug, Clone, PartialEq)]
pub struct CapsuleGrid {
    pub poses: Array5<f32>,
    pub activations: Array4<f32>,
}

impl CapsuleGrid {
    pub fn new(poses: Array5<f32>, activations: Array4<f32>) -> Result<Self> {
        let (b, t, h, w, _) = poses.dim();
        if activations.dim() != (b, t, h, w) {
            return Err(CapsError::shape(
                "capsule grid",
                format!("activations {:?}", (b, t, h, w)),
                format!("activations {:?}", activations.dim()),
            ));
        }
        Ok(Self { poses, activations })
    }

    pub fn batch_size(&self) -> usize {
        self.poses.dim().0
    }

    pub fn num_types(&self) -> usize {
        self.poses.dim().1
    }

    pub fn extent(&self) -> (usize, usize) {
        let (_, _, h, w, _) = self.poses.dim();
        (h, w)
    }

    pub fn pose_dim(&self) -> usize {
        self.poses.dim().4
    }

    /// Counts NaN and infinite entries across poses and activations.
    pub fn non_finite_count(&self) -> usize {
        self.poses.iter().chain(self.activations.iter()).filter(|v| !v.is_finite()).count()
    }
}

/// Primary capsules: two 1x1 projections of a feature map, linear for the
/// poses and sigmoid for the activations.
pub struct PrimaryCapsLayer {
    pub pose_weights: Array2<f32>,
    pub pose_bias: Array1<f32>,
    pub activation_weights: Array2<f32>,
    pub activation_bias: Array1<f32>,
    pub num_types: usize,
    pub pose_dim: usize,
}

impl PrimaryCapsLayer {
    pub fn new(in_channels: usize, num_types: usize, pose_size: usize, rng: &mut StdRng) -> Self {
        let pose_dim = pose_size * pose_size;
        let scale = (1.0 / in_channels as f32).sqrt();
        Self {
            pose_weights: Array2::random_using((num_types * pose_dim, in_channels), Uniform::new(-scale, scale), rng),
            pose_bias: Array1::zeros(num_types * pose_dim),
            activation_weights: Array2::random_using((num_types, in_channels), Uniform::new(-scale, scale), rng),
            activation_bias: Array1::zeros(num_types),
            num_types,
            pose_dim,
        }
    }

    pub fn in_channels(&self) -> usize {
        self.pose_weights.dim().1
    }

    pub fn forward(&self, input: &ArrayView4<f32>) -> Result<CapsuleGrid> {
        let (batch_size, channels, height, width) = input.dim();
        if channels != self.in_channels() {
            return Err(CapsError::shape(
                "primary_caps",
                format!("{} channels", self.in_channels()),
                format!("{channels} channels"),
            ));
        }

        let poses = Array5::from_shape_fn(
            (batch_size, self.num_types, height, width, self.pose_dim),
            |(b, t, y, x, k)| {
                let row = t * self.pose_dim + k;
                let features = input.slice(ndarray::s![b, .., y, x]);
                self.pose_bias[row] + self.pose_weights.row(row).dot(&features)
            },
        );
        let activations = Array4::from_shape_fn((batch_size, self.num_types, height, width), |(b, t, y, x)| {
            let features = input.slice(ndarray::s![b, .., y, x]);
            sigmoid(self.activation_bias[t] + self.activation_weights.row(t).dot(&features))
        });

        debug!(
            types = self.num_types,
            height,
            width,
            "primary capsules"
        );
        CapsuleGrid::new(poses, activations)
    }

    pub fn visit_parameters(&mut self, prefix: &str, visitor: &mut ParamVisitor<'_>) {
        visitor(&format!("{prefix}.pose.weight"), self.pose_weights.view_mut().into_dyn());
        visitor(&format!("{prefix}.pose.bias"), self.pose_bias.view_mut().into_dyn());
        visitor(&format!("{prefix}.activation.weight"), self.activation_weights.view_mut().into_dyn());
        visitor(&format!("{prefix}.activation.bias"), self.activation_bias.view_mut().into_dyn());
    }

    pub fn num_parameters(&self) -> usize {
        self.pose_weights.len() + self.pose_bias.len() + self.activation_weights.len() + self.activation_bias.len()
    }
}

/// Per-sample routing statistics of one ConvCaps call, indexed `(batch, Cww, ..)`.
#[derive(Debug, Clone)]
pub struct RoutingStats {
    pub mu: Array3<f32>,
    pub sigma_sq: Array3<f32>,
    /// `(batch, Bkk, Cww)`
    pub responsibilities: Array3<f32>,
}

#[derive(Debug, Clone)]
pub struct ConvCapsOutput {
    pub grid: CapsuleGrid,
    pub stats: RoutingStats,
}

/// Convolutional capsule layer routed by EM (or angle) routing.
pub struct ConvCapsLayer {
    pub name: String,
    pub geometry: VoteGeometry,
    /// `(B, K, K, C, h, h)`, or `(B, 1, 1, C, h, h)` when shared.
    pub transforms: Array6<f32>,
    pub beta_v: Array1<f32>,
    pub beta_a: Array1<f32>,
    pub routing: Routing,
    pub denoise: bool,
}

impl ConvCapsLayer {
    pub fn new(
        config: &ConvCapsConfig,
        pose_size: usize,
        in_extent: (usize, usize),
        routing: &RoutingConfig,
        device: Device,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let geometry = VoteGeometry::new(
            config.in_types,
            config.out_types,
            pose_size,
            config.kernel_size,
            config.stride,
            in_extent,
            config.coordinate_add,
        )
        .map_err(|err| match err {
            CapsError::ShapeMismatch { expected, found, .. } => CapsError::ShapeMismatch {
                layer: config.name.clone(),
                expected,
                found,
            },
            other => other,
        })?;

        let (bank_h, bank_w) = if config.transform_share {
            (1, 1)
        } else {
            (geometry.kernel_h, geometry.kernel_w)
        };
        let transforms = Array6::random_using(
            (config.in_types, bank_h, bank_w, config.out_types, pose_size, pose_size),
            StandardNormal,
            rng,
        );

        Ok(Self {
            name: config.name.clone(),
            geometry,
            transforms,
            beta_v: Array1::random_using(config.out_types, StandardNormal, rng),
            beta_a: Array1::random_using(config.out_types, StandardNormal, rng),
            routing: Routing::new(routing.kind, config.iterations, routing.eps, device)?,
            denoise: config.denoise,
        })
    }

    pub fn output_extent(&self) -> (usize, usize) {
        (self.geometry.out_h, self.geometry.out_w)
    }

    pub fn device(&self) -> Device {
        self.routing.device()
    }

    /// Moves the routing constants; parameters and offsets live with them.
    pub fn to_device(&mut self, device: Device) {
        self.routing.to_device(device);
    }

    fn check_input(&self, input: &CapsuleGrid) -> Result<()> {
        let g = &self.geometry;
        let expected = (g.in_types, g.in_h, g.in_w, g.pose_dim());
        let (_, t, h, w, d) = input.poses.dim();
        if (t, h, w, d) != expected {
            return Err(CapsError::shape(
                &self.name,
                format!("(types, H, W, pose) = {expected:?}"),
                format!("{:?}", (t, h, w, d)),
            ));
        }
        Ok(())
    }

    /// Biases broadcast to every output position.
    fn position_biases(&self) -> (Array1<f32>, Array1<f32>) {
        let g = &self.geometry;
        let beta_v = Array1::from_shape_fn(g.outputs(), |j| self.beta_v[g.output_type(j)]);
        let beta_a = Array1::from_shape_fn(g.outputs(), |j| self.beta_a[g.output_type(j)]);
        (beta_v, beta_a)
    }

    pub fn forward(&self, input: &CapsuleGrid, lambda: f32) -> Result<ConvCapsOutput> {
        self.check_input(input)?;
        let g = &self.geometry;
        let (beta_v, beta_a) = self.position_biases();

        let routed: Vec<RoutingResult> = map_batch(self.device(), input.batch_size(), |b| {
            let votes = g.votes(&input.poses.index_axis(Axis(0), b), &self.transforms);
            let priors = g.priors(&input.activations.index_axis(Axis(0), b));
            self.routing.route(
                lambda,
                &priors.view(),
                &votes.view(),
                &beta_v.view(),
                &beta_a.view(),
                g.out_types,
            )
        });

        let grid = self.to_grid(&routed)?;
        let bad = grid.non_finite_count();
        if bad > 0 {
            error!(layer = %self.name, bad, "routing produced non-finite values");
            return Err(CapsError::NumericalInstability {
                layer: self.name.clone(),
                detail: format!("{bad} NaN/Inf entries in poses or activations"),
            });
        }

        debug!(
            layer = %self.name,
            inputs = g.inputs_per_window(),
            outputs = g.outputs(),
            iterations = self.routing.iterations,
            "routed"
        );

        let mu: Vec<_> = routed.iter().map(|r| r.poses.clone()).collect();
        let sigma_sq: Vec<_> = routed.iter().map(|r| r.sigma_sq.clone()).collect();
        let responsibilities: Vec<_> = routed.into_iter().map(|r| r.responsibilities).collect();
        Ok(ConvCapsOutput {
            grid,
            stats: RoutingStats {
                mu: stack_batch(&mu)?,
                sigma_sq: stack_batch(&sigma_sq)?,
                responsibilities: stack_batch(&responsibilities)?,
            },
        })
    }

    /// Reshapes `(Cww, ..)` routing outputs into the canonical grid.
    fn to_grid(&self, routed: &[RoutingResult]) -> Result<CapsuleGrid> {
        let g = &self.geometry;
        let poses = Array5::from_shape_fn(
            (routed.len(), g.out_types, g.out_h, g.out_w, g.pose_dim()),
            |(b, c, oy, ox, d)| routed[b].poses[[g.output_index(c, oy, ox), d]],
        );
        let activations = Array4::from_shape_fn((routed.len(), g.out_types, g.out_h, g.out_w), |(b, c, oy, ox)| {
            routed[b].activations[g.output_index(c, oy, ox)]
        });
        CapsuleGrid::new(poses, activations)
    }

    pub fn visit_parameters(&mut self, prefix: &str, visitor: &mut ParamVisitor<'_>) {
        visitor(&format!("{prefix}.W"), self.transforms.view_mut().into_dyn());
        visitor(&format!("{prefix}.beta_v"), self.beta_v.view_mut().into_dyn());
        visitor(&format!("{prefix}.beta_a"), self.beta_a.view_mut().into_dyn());
    }

    pub fn num_parameters(&self) -> usize {
        self.transforms.len() + self.beta_v.len() + self.beta_a.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config::{RoutingKind, ROUTING_EPS};
    use approx::assert_abs_diff_eq;
    use ndarray::Array;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(1991)
    }

    fn config(in_types: usize, out_types: usize, kernel_size: usize, stride: usize) -> ConvCapsConfig {
        ConvCapsConfig {
            name: "caps".to_string(),
            in_types,
            out_types,
            kernel_size,
            stride,
            iterations: 3,
            coordinate_add: false,
            transform_share: false,
            denoise: false,
        }
    }

    fn random_grid(batch: usize, types: usize, extent: usize, pose_dim: usize) -> CapsuleGrid {
        let mut rng = rng();
        let poses = Array::random_using((batch, types, extent, extent, pose_dim), Uniform::new(-1.0, 1.0), &mut rng);
        let activations = Array::random_using((batch, types, extent, extent), Uniform::new(0.05, 0.95), &mut rng);
        CapsuleGrid::new(poses, activations).unwrap()
    }

    #[test]
    fn grid_rejects_mismatched_activations() {
        let poses = Array5::zeros((1, 2, 3, 3, 16));
        let activations = Array4::zeros((1, 2, 3, 4));
        assert!(CapsuleGrid::new(poses, activations).is_err());
    }

    #[test]
    fn primary_caps_shapes_and_range() {
        let layer = PrimaryCapsLayer::new(8, 4, 4, &mut rng());
        let input = Array::random_using((2, 8, 6, 6), Uniform::new(-3.0, 3.0), &mut rng());
        let grid = layer.forward(&input.view()).unwrap();
        assert_eq!(grid.poses.dim(), (2, 4, 6, 6, 16));
        assert_eq!(grid.activations.dim(), (2, 4, 6, 6));
        assert!(grid.activations.iter().all(|&a| a > 0.0 && a < 1.0));
    }

    #[test]
    fn primary_caps_rejects_wrong_channels() {
        let layer = PrimaryCapsLayer::new(8, 4, 4, &mut rng());
        let input = Array4::zeros((1, 3, 6, 6));
        assert!(matches!(layer.forward(&input.view()), Err(CapsError::ShapeMismatch { .. })));
    }

    #[test]
    fn conv_caps_output_shapes() {
        let layer = ConvCapsLayer::new(&config(4, 3, 3, 2), 4, (7, 7), &RoutingConfig::default(), Device::Cpu, &mut rng()).unwrap();
        let output = layer.forward(&random_grid(2, 4, 7, 16), 0.01).unwrap();
        assert_eq!(output.grid.poses.dim(), (2, 3, 3, 3, 16));
        assert_eq!(output.grid.activations.dim(), (2, 3, 3, 3));
        assert_eq!(output.stats.responsibilities.dim(), (2, 4 * 9, 3 * 9));
        assert!(output.grid.activations.iter().all(|&a| a > 0.0 && a < 1.0));
    }

    #[test]
    fn class_layer_collapses_to_one_position() {
        let mut cfg = config(4, 5, 0, 1);
        cfg.coordinate_add = true;
        cfg.transform_share = true;
        for extent in [3, 5] {
            let layer = ConvCapsLayer::new(&cfg, 4, (extent, extent), &RoutingConfig::default(), Device::Cpu, &mut rng()).unwrap();
            assert_eq!(layer.transforms.dim(), (4, 1, 1, 5, 4, 4));
            let output = layer.forward(&random_grid(1, 4, extent, 16), 0.01).unwrap();
            assert_eq!(output.grid.poses.dim(), (1, 5, 1, 1, 16));
        }
    }

    #[test]
    fn unvalidated_configs_are_rejected_at_construction() {
        let zero_stride = config(2, 2, 3, 0);
        let mut zero_iterations = config(2, 2, 3, 1);
        zero_iterations.iterations = 0;
        for cfg in [zero_stride, zero_iterations] {
            let built = ConvCapsLayer::new(&cfg, 4, (5, 5), &RoutingConfig::default(), Device::Cpu, &mut rng());
            assert!(matches!(built, Err(CapsError::InvalidConfig(_))));
        }
    }

    #[test]
    fn rejects_input_of_wrong_extent() {
        let layer = ConvCapsLayer::new(&config(4, 3, 3, 1), 4, (5, 5), &RoutingConfig::default(), Device::Cpu, &mut rng()).unwrap();
        let err = layer.forward(&random_grid(1, 4, 6, 16), 0.01).unwrap_err();
        assert!(matches!(err, CapsError::ShapeMismatch { layer, .. } if layer == "caps"));
    }

    #[test]
    fn forward_is_deterministic_across_devices() {
        let mut layer = ConvCapsLayer::new(&config(3, 2, 3, 1), 4, (5, 5), &RoutingConfig::default(), Device::Cpu, &mut rng()).unwrap();
        let input = random_grid(3, 3, 5, 16);
        let first = layer.forward(&input, 0.02).unwrap();
        let second = layer.forward(&input, 0.02).unwrap();
        assert_eq!(first.grid, second.grid);

        layer.to_device(Device::CpuParallel);
        assert_eq!(layer.routing.constants().device, Device::CpuParallel);
        let parallel = layer.forward(&input, 0.02).unwrap();
        assert_eq!(first.grid, parallel.grid);
    }

    #[test]
    fn non_finite_input_is_reported() {
        let layer = ConvCapsLayer::new(&config(2, 2, 0, 1), 4, (3, 3), &RoutingConfig::default(), Device::Cpu, &mut rng()).unwrap();
        let mut input = random_grid(1, 2, 3, 16);
        input.poses[[0, 0, 1, 1, 0]] = f32::NAN;
        let err = layer.forward(&input, 0.01).unwrap_err();
        assert!(matches!(err, CapsError::NumericalInstability { .. }));
    }

    #[test]
    fn identity_transforms_reproduce_mean_pose() {
        let mut primary = PrimaryCapsLayer::new(3, 2, 4, &mut rng());
        primary.activation_weights.fill(0.0);
        let features = Array::random_using((1, 3, 4, 4), Uniform::new(-1.0, 1.0), &mut rng());
        let grid = primary.forward(&features.view()).unwrap();
        assert!(grid.activations.iter().all(|&a| a == 0.5));

        let mut cfg = config(2, 1, 4, 1);
        cfg.transform_share = true;
        cfg.iterations = 1;
        let routing = RoutingConfig {
            kind: RoutingKind::Em,
            eps: ROUTING_EPS,
        };
        let mut layer = ConvCapsLayer::new(&cfg, 4, (4, 4), &routing, Device::Cpu, &mut rng()).unwrap();
        layer.transforms = Array6::from_shape_fn((2, 1, 1, 1, 4, 4), |(_, _, _, _, r, c)| if r == c { 1.0 } else { 0.0 });

        let output = layer.forward(&grid, 0.01).unwrap();
        let count = (2 * 4 * 4) as f32;
        for d in 0..16 {
            let mean = grid.poses.index_axis(Axis(4), d).sum() / count;
            assert_abs_diff_eq!(output.grid.poses[[0, 0, 0, 0, d]], mean, epsilon = 1e-5);
        }
    }

    #[test]
    fn visitor_covers_parameters() {
        let mut layer = ConvCapsLayer::new(&config(2, 3, 3, 1), 4, (5, 5), &RoutingConfig::default(), Device::Cpu, &mut rng()).unwrap();
        let mut names = Vec::new();
        let mut total = 0;
        layer.visit_parameters("caps", &mut |name, tensor| {
            names.push(name.to_string());
            total += tensor.len();
        });
        assert_eq!(names, ["caps.W", "caps.beta_v", "caps.beta_a"]);
        assert_eq!(total, 2 * 9 * 3 * 16 + 3 + 3);
        assert_eq!(total, layer.num_parameters());
    }
}
