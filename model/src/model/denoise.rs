//! Inversion of the vote step for the denoising auxiliary term: votes are
//! resampled from the Gaussians found by routing and projected back onto the
//! input capsule grid through the transposed transformation matrices.

use ndarray::{Array1, Array4, Array5, ArrayView2, Axis};
use ndarray_rand::rand_distr::{Distribution, StandardNormal};
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::capsule::{ConvCapsLayer, RoutingStats};
use super::error::{CapsError, Result};
use super::layers::{map_batch, stack_batch};

/// Reconstructs the input poses `(batch, B, H, W, h*h)` of `layer` from the
/// routing statistics of its forward pass. Sample `n` draws from a generator
/// seeded with `seed + n`.
pub fn reconstruct_inputs(layer: &ConvCapsLayer, stats: &RoutingStats, seed: u64) -> Result<Array5<f32>> {
    let g = &layer.geometry;
    let (batch_size, outputs, pose_dim) = stats.mu.dim();
    if outputs != g.outputs() || pose_dim != g.pose_dim() || stats.sigma_sq.dim() != stats.mu.dim() {
        return Err(CapsError::shape(
            &layer.name,
            format!("routing stats (batch, {}, {})", g.outputs(), g.pose_dim()),
            format!("mu {:?}, sigma {:?}", stats.mu.dim(), stats.sigma_sq.dim()),
        ));
    }

    let samples = map_batch(layer.device(), batch_size, |n| {
        let mut rng = StdRng::seed_from_u64(seed.wrapping_add(n as u64));
        reconstruct_sample(
            layer,
            &stats.mu.index_axis(Axis(0), n),
            &stats.sigma_sq.index_axis(Axis(0), n),
            &mut rng,
        )
    });
    stack_batch(&samples)
}

fn reconstruct_sample(
    layer: &ConvCapsLayer,
    mu: &ArrayView2<f32>,
    sigma_sq: &ArrayView2<f32>,
    rng: &mut StdRng,
) -> Array4<f32> {
    let g = &layer.geometry;
    let h = g.pose_size;
    let mut recon = Array4::<f32>::zeros((g.in_types, g.in_h, g.in_w, g.pose_dim()));
    let mut vote = Array1::<f32>::zeros(g.pose_dim());

    for b in 0..g.in_types {
        for ki in 0..g.kernel_h {
            for kj in 0..g.kernel_w {
                for c in 0..g.out_types {
                    let w = g.transform(&layer.transforms, b, ki, kj, c);
                    for oy in 0..g.out_h {
                        for ox in 0..g.out_w {
                            let j = g.output_index(c, oy, ox);
                            for d in 0..g.pose_dim() {
                                let z: f32 = StandardNormal.sample(rng);
                                vote[d] = mu[[j, d]] + sigma_sq[[j, d]].max(0.0).sqrt() * z;
                            }
                            if let Some(slice) = vote.as_slice_mut() {
                                g.remove_coordinates(slice, ki, kj);
                            }

                            let (y, x) = (oy * g.stride + ki, ox * g.stride + kj);
                            // W^T V, accumulated where the input capsule sits.
                            for r in 0..h {
                                for col in 0..h {
                                    let mut sum = 0.0;
                                    for k in 0..h {
                                        sum += w[[k, r]] * vote[k * h + col];
                                    }
                                    recon[[b, y, x, r * h + col]] += sum;
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    recon / g.out_types as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::capsule::CapsuleGrid;
    use crate::model::config::{ConvCapsConfig, Device, RoutingConfig};
    use approx::assert_abs_diff_eq;
    use ndarray::{Array3, Array6};

    fn layer(kernel_size: usize, stride: usize, out_types: usize, coordinate_add: bool, extent: usize) -> ConvCapsLayer {
        let cfg = ConvCapsConfig {
            name: "caps".to_string(),
            in_types: 2,
            out_types,
            kernel_size,
            stride,
            iterations: 2,
            coordinate_add,
            transform_share: true,
            denoise: true,
        };
        let mut rng = StdRng::seed_from_u64(4);
        let mut layer = ConvCapsLayer::new(&cfg, 4, (extent, extent), &RoutingConfig::default(), Device::Cpu, &mut rng).unwrap();
        layer.transforms = Array6::from_shape_fn((2, 1, 1, out_types, 4, 4), |(_, _, _, _, r, c)| if r == c { 1.0 } else { 0.0 });
        layer
    }

    fn stats(mu: Array3<f32>, sigma_sq: Array3<f32>) -> RoutingStats {
        let (n, cww, _) = mu.dim();
        RoutingStats {
            mu,
            sigma_sq,
            responsibilities: Array3::zeros((n, 1, cww)),
        }
    }

    #[test]
    fn zero_variance_identity_returns_the_means() {
        let layer = layer(0, 1, 3, false, 3);
        let mu = Array3::from_shape_fn((1, 3, 16), |(_, c, d)| (c * 16 + d) as f32 * 0.1);
        let recon = reconstruct_inputs(&layer, &stats(mu.clone(), Array3::zeros((1, 3, 16))), 0).unwrap();
        assert_eq!(recon.dim(), (1, 2, 3, 3, 16));
        for d in 0..16 {
            let expected = (0..3).map(|c| mu[[0, c, d]]).sum::<f32>() / 3.0;
            for value in recon.index_axis(Axis(4), d).iter() {
                assert_abs_diff_eq!(*value, expected, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn coordinates_are_removed_before_projection() {
        let layer = layer(0, 1, 1, true, 3);
        let poses = Array5::from_elem((1, 2, 3, 3, 16), 0.3);
        let activations = Array4::from_elem((1, 2, 3, 3), 0.5);
        let output = layer.forward(&CapsuleGrid::new(poses.clone(), activations).unwrap(), 0.01).unwrap();

        // Identical inputs: one Gaussian, mean shifted only by the average offset.
        let offsets = layer.geometry.offsets.clone().unwrap();
        let mean_y = offsets.index_axis(Axis(2), 0).mean().unwrap();
        let mean_x = offsets.index_axis(Axis(2), 1).mean().unwrap();
        assert_abs_diff_eq!(output.stats.mu[[0, 0, 3]], 0.3 + mean_y, epsilon = 1e-5);
        assert_abs_diff_eq!(output.stats.mu[[0, 0, 7]], 0.3 + mean_x, epsilon = 1e-5);

        let zeroed = stats(output.stats.mu.clone(), Array3::zeros(output.stats.mu.dim()));
        let recon = reconstruct_inputs(&layer, &zeroed, 0).unwrap();
        assert_abs_diff_eq!(recon[[0, 0, 0, 0, 3]], 0.3 + mean_y, epsilon = 1e-5);
        assert_abs_diff_eq!(recon[[0, 1, 2, 2, 3]], 0.3 + mean_y - offsets[[2, 2, 0]], epsilon = 1e-5);
        assert_abs_diff_eq!(recon[[0, 1, 2, 1, 7]], 0.3 + mean_x - offsets[[2, 1, 1]], epsilon = 1e-5);
    }

    #[test]
    fn overlapping_windows_accumulate() {
        // Kernel 2, stride 1 on a 3x3 grid: the centre is covered four times.
        let layer = layer(2, 1, 1, false, 3);
        let mu = Array3::from_elem((1, 4, 16), 1.0);
        let recon = reconstruct_inputs(&layer, &stats(mu, Array3::zeros((1, 4, 16))), 0).unwrap();
        assert_abs_diff_eq!(recon[[0, 0, 0, 0, 0]], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(recon[[0, 0, 0, 1, 0]], 2.0, epsilon = 1e-6);
        assert_abs_diff_eq!(recon[[0, 1, 1, 1, 5]], 4.0, epsilon = 1e-6);
    }

    #[test]
    fn sampling_depends_only_on_the_seed() {
        let layer = layer(0, 1, 2, false, 2);
        let mu = Array3::zeros((2, 2, 16));
        let sigma = Array3::from_elem((2, 2, 16), 0.25);
        let a = reconstruct_inputs(&layer, &stats(mu.clone(), sigma.clone()), 17).unwrap();
        let b = reconstruct_inputs(&layer, &stats(mu.clone(), sigma.clone()), 17).unwrap();
        let c = reconstruct_inputs(&layer, &stats(mu, sigma), 18).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.iter().any(|&v| v != 0.0));
    }

    #[test]
    fn rejects_stats_of_another_layer() {
        let layer = layer(0, 1, 2, false, 2);
        let bad = stats(Array3::zeros((1, 5, 16)), Array3::zeros((1, 5, 16)));
        assert!(reconstruct_inputs(&layer, &bad, 0).is_err());
    }
}
