use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayView3, Axis};
use std::f32::consts::PI;

use super::config::{sigmoid, Device, RoutingKind};
use super::error::{CapsError, Result};

/// Constants the routing loop needs, fixed when the layer is built and moved
/// together with the layer's parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoutingConstants {
    pub eps: f32,
    pub ln_2pi: f32,
    pub device: Device,
}

impl RoutingConstants {
    pub fn new(eps: f32, device: Device) -> Self {
        Self {
            eps,
            ln_2pi: (2.0 * PI).ln(),
            device,
        }
    }
}

/// Result of routing one sample.
#[derive(Debug, Clone)]
pub struct RoutingResult {
    /// `(Cww,)`, each in (0, 1).
    pub activations: Array1<f32>,
    /// Gaussian means, the new poses: `(Cww, h*h)`.
    pub poses: Array2<f32>,
    pub sigma_sq: Array2<f32>,
    /// Normalized assignment used by the final M-step: `(Bkk, Cww)`.
    pub responsibilities: Array2<f32>,
}

/// Routing procedure of a ConvCaps layer.
#[derive(Debug, Clone)]
pub struct Routing {
    pub kind: RoutingKind,
    pub iterations: usize,
    constants: RoutingConstants,
}

struct MStep {
    activations: Array1<f32>,
    mu: Array2<f32>,
    sigma_sq: Array2<f32>,
}

impl Routing {
    pub fn new(kind: RoutingKind, iterations: usize, eps: f32, device: Device) -> Result<Self> {
        if iterations == 0 {
            return Err(CapsError::InvalidConfig("routing needs at least one iteration".to_string()));
        }
        Ok(Self {
            kind,
            iterations,
            constants: RoutingConstants::new(eps, device),
        })
    }

    pub fn constants(&self) -> &RoutingConstants {
        &self.constants
    }

    pub fn device(&self) -> Device {
        self.constants.device
    }

    pub fn to_device(&mut self, device: Device) {
        self.constants = RoutingConstants::new(self.constants.eps, device);
    }

    /// Routes the votes `(Bkk, Cww, h*h)` of one sample given the priors
    /// `(Bkk, Cww)` and per-output biases `(Cww,)`. `num_types` is the number
    /// of output capsule types C.
    pub fn route(
        &self,
        lambda: f32,
        priors: &ArrayView2<f32>,
        votes: &ArrayView3<f32>,
        beta_v: &ArrayView1<f32>,
        beta_a: &ArrayView1<f32>,
        num_types: usize,
    ) -> RoutingResult {
        match self.kind {
            RoutingKind::Em => self.em_routing(lambda, priors, votes, beta_v, beta_a, num_types),
            RoutingKind::Angle => self.angle_routing(lambda, priors, votes, beta_v, beta_a),
        }
    }

    fn em_routing(
        &self,
        lambda: f32,
        priors: &ArrayView2<f32>,
        votes: &ArrayView3<f32>,
        beta_v: &ArrayView1<f32>,
        beta_a: &ArrayView1<f32>,
        num_types: usize,
    ) -> RoutingResult {
        let (n_in, n_out, _) = votes.dim();
        let mut r = Array2::from_elem((n_in, n_out), 1.0 / num_types.max(1) as f32);
        let mut m = self.m_step(lambda, &r, priors, votes, beta_v, beta_a);

        for _ in 1..self.iterations {
            r = self.e_step(&m, votes);
            m = self.m_step(lambda, &r, priors, votes, beta_v, beta_a);
        }

        RoutingResult {
            activations: m.activations,
            poses: m.mu,
            sigma_sq: m.sigma_sq,
            responsibilities: r,
        }
    }

    fn m_step(
        &self,
        lambda: f32,
        r: &Array2<f32>,
        priors: &ArrayView2<f32>,
        votes: &ArrayView3<f32>,
        beta_v: &ArrayView1<f32>,
        beta_a: &ArrayView1<f32>,
    ) -> MStep {
        let eps = self.constants.eps;
        let weighted = r * priors;
        let sum_r = weighted.sum_axis(Axis(0));
        let (mu, sigma_sq) = self.gaussian(&weighted, &sum_r, votes);

        let dim = votes.dim().2;
        let activations = Array1::from_shape_fn(sum_r.len(), |j| {
            let log_sigma: f32 = (0..dim).map(|d| (sigma_sq[[j, d]].sqrt() + eps).ln()).sum();
            let cost = (beta_v[j] * dim as f32 + log_sigma) * sum_r[j];
            activation(lambda, beta_a[j], cost)
        });

        MStep {
            activations,
            mu,
            sigma_sq,
        }
    }

    /// Weighted mean and variance of the votes per output capsule.
    fn gaussian(
        &self,
        weighted: &Array2<f32>,
        sum_r: &Array1<f32>,
        votes: &ArrayView3<f32>,
    ) -> (Array2<f32>, Array2<f32>) {
        let eps = self.constants.eps;
        let w3 = weighted.view().insert_axis(Axis(2));
        let denom = sum_r.mapv(|s| s + eps).insert_axis(Axis(1));

        let mu = (&w3 * votes).sum_axis(Axis(0)) / &denom;
        let deviation = votes - &mu.view().insert_axis(Axis(0));
        let sigma_sq = (&w3 * &deviation.mapv(|x| x * x)).sum_axis(Axis(0)) / &denom;
        (mu, sigma_sq)
    }

    /// Reassigns every vote from its Gaussian likelihood under each output
    /// capsule, scaled by that capsule's activation. The normalization runs
    /// in log space so a row never collapses to all zeros.
    fn e_step(&self, m: &MStep, votes: &ArrayView3<f32>) -> Array2<f32> {
        let RoutingConstants { eps, ln_2pi, .. } = self.constants;
        let (n_in, n_out, dim) = votes.dim();
        let mut r = Array2::zeros((n_in, n_out));
        let mut ln_ap = vec![0.0f32; n_out];
        let mut ln_p = vec![0.0f32; dim];

        for i in 0..n_in {
            for (j, slot) in ln_ap.iter_mut().enumerate() {
                for (d, value) in ln_p.iter_mut().enumerate() {
                    let sigma_sq = m.sigma_sq[[j, d]];
                    let diff = votes[[i, j, d]] - m.mu[[j, d]];
                    *value = -diff * diff / (2.0 * sigma_sq + eps) - (sigma_sq.sqrt() + eps).ln() - 0.5 * ln_2pi;
                }
                *slot = (m.activations[j] + eps).ln() + log_sum_exp(&ln_p);
            }

            let max = ln_ap.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let total: f32 = ln_ap.iter().map(|&v| (v - max).exp()).sum();
            for (j, &v) in ln_ap.iter().enumerate() {
                r[[i, j]] = (v - max).exp() / (total + eps) + eps;
            }
        }
        r
    }

    /// Cosine-agreement routing. Logits accumulate the agreement on top of the
    /// weighted assignment of the previous iteration.
    fn angle_routing(
        &self,
        lambda: f32,
        priors: &ArrayView2<f32>,
        votes: &ArrayView3<f32>,
        beta_v: &ArrayView1<f32>,
        beta_a: &ArrayView1<f32>,
    ) -> RoutingResult {
        let eps = self.constants.eps;
        let (n_in, n_out, dim) = votes.dim();
        let mut logits = Array2::<f32>::zeros((n_in, n_out));
        let vote_norms = votes.map_axis(Axis(2), |v| v.dot(&v).sqrt());

        for _ in 1..self.iterations {
            let weighted = &softmax_rows(&logits) * priors;
            let sum_r = weighted.sum_axis(Axis(0));
            let (mu, _) = self.gaussian(&weighted, &sum_r, votes);
            let mu_norms = mu.map_axis(Axis(1), |m| m.dot(&m).sqrt());
            logits = Array2::from_shape_fn((n_in, n_out), |(i, j)| {
                let dot = votes.slice(ndarray::s![i, j, ..]).dot(&mu.row(j));
                weighted[[i, j]] + dot / ((vote_norms[[i, j]] + eps) * (mu_norms[j] + eps))
            });
        }

        let r = softmax_rows(&logits);
        let weighted = &r * priors;
        let sum_r = weighted.sum_axis(Axis(0));
        let (mu, sigma_sq) = self.gaussian(&weighted, &sum_r, votes);
        let activations = Array1::from_shape_fn(n_out, |j| {
            let log_sigma: f32 = (0..dim).map(|d| (sigma_sq[[j, d]] + eps).ln()).sum();
            let cost = (beta_v[j] * dim as f32 + log_sigma) * sum_r[j];
            activation(lambda, beta_a[j], cost)
        });

        RoutingResult {
            activations,
            poses: mu,
            sigma_sq,
            responsibilities: r,
        }
    }
}

/// `sigmoid(lambda * (beta_a - cost))` held inside the open interval (0, 1);
/// f32 rounds the plain sigmoid to exactly 0 or 1 for large arguments.
fn activation(lambda: f32, beta_a: f32, cost: f32) -> f32 {
    sigmoid(lambda * (beta_a - cost)).clamp(f32::EPSILON, 1.0 - f32::EPSILON)
}

fn log_sum_exp(values: &[f32]) -> f32 {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|&v| (v - max).exp()).sum::<f32>().ln()
}

/// Softmax over the output capsules of every input capsule.
fn softmax_rows(logits: &Array2<f32>) -> Array2<f32> {
    let mut out = logits.clone();
    for mut row in out.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config::ROUTING_EPS;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array3, ArrayView1};

    fn em(iterations: usize) -> Routing {
        Routing::new(RoutingKind::Em, iterations, ROUTING_EPS, Device::Cpu).unwrap()
    }

    fn zeros(n: usize) -> Array1<f32> {
        Array1::zeros(n)
    }

    /// Output 0 receives tightly clustered votes, output 1 scattered ones.
    fn clustered_votes(n_in: usize, dim: usize) -> Array3<f32> {
        Array3::from_shape_fn((n_in, 2, dim), |(i, j, d)| {
            let jitter = ((i * 7 + d * 3) % 5) as f32 - 2.0;
            if j == 0 {
                1.0 + 1e-3 * jitter
            } else {
                3.0 * jitter + (i as f32 - n_in as f32 / 2.0)
            }
        })
    }

    fn pseudo_random_votes(n_in: usize, n_out: usize, dim: usize) -> Array3<f32> {
        Array3::from_shape_fn((n_in, n_out, dim), |(i, j, d)| {
            let x = (i * 31 + j * 17 + d * 7) as f32;
            (x * 0.37).sin() * 2.0
        })
    }

    fn route(routing: &Routing, lambda: f32, priors: &Array2<f32>, votes: &Array3<f32>, beta: &Array1<f32>, c: usize) -> RoutingResult {
        let beta_view: ArrayView1<f32> = beta.view();
        routing.route(lambda, &priors.view(), &votes.view(), &beta_view, &beta_view, c)
    }

    #[test]
    fn ln_2pi_is_precomputed() {
        let routing = em(3);
        assert_abs_diff_eq!(routing.constants().ln_2pi, 1.837_877, epsilon = 1e-5);
    }

    #[test]
    fn to_device_moves_constants_together() {
        let mut routing = em(3);
        routing.to_device(Device::CpuParallel);
        assert_eq!(routing.device(), Device::CpuParallel);
        assert_eq!(routing.constants().device, Device::CpuParallel);
        assert_abs_diff_eq!(routing.constants().ln_2pi, (2.0 * PI).ln());
    }

    #[test]
    fn activations_in_open_unit_interval_and_rows_normalized() {
        for kind in [RoutingKind::Em, RoutingKind::Angle] {
            let routing = Routing::new(kind, 3, ROUTING_EPS, Device::Cpu).unwrap();
            let votes = pseudo_random_votes(12, 6, 16);
            let priors = Array2::from_shape_fn((12, 6), |(i, _)| 0.1 + 0.05 * i as f32);
            let result = route(&routing, 0.01, &priors, &votes, &zeros(6), 3);

            assert!(result.activations.iter().all(|&a| a > 0.0 && a < 1.0), "{kind:?}");
            for row in result.responsibilities.rows() {
                assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-4);
            }
            assert_eq!(result.poses.dim(), (6, 16));
        }
    }

    #[test]
    fn routing_is_deterministic() {
        let routing = em(3);
        let votes = pseudo_random_votes(9, 4, 16);
        let priors = Array2::from_elem((9, 4), 0.5);
        let beta = Array1::from_vec(vec![0.1, -0.2, 0.3, 0.0]);
        let first = route(&routing, 0.05, &priors, &votes, &beta, 2);
        let second = route(&routing, 0.05, &priors, &votes, &beta, 2);
        assert_eq!(first.activations, second.activations);
        assert_eq!(first.poses, second.poses);
        assert_eq!(first.responsibilities, second.responsibilities);
    }

    #[test]
    fn converges_to_tight_cluster() {
        let votes = clustered_votes(8, 16);
        let priors = Array2::from_elem((8, 2), 1.0);
        let beta = zeros(2);

        let three = route(&em(3), 1.0, &priors, &votes, &beta, 2);
        for i in 0..8 {
            assert!(three.responsibilities[[i, 0]] > 0.99, "row {i}: {:?}", three.responsibilities.row(i));
        }
        assert!(three.activations[0] > three.activations[1]);

        let four = route(&em(4), 1.0, &priors, &votes, &beta, 2);
        for d in 0..16 {
            assert_abs_diff_eq!(three.poses[[0, d]], four.poses[[0, d]], epsilon = 1e-5);
            assert_abs_diff_eq!(three.poses[[0, d]], 1.0, epsilon = 3e-3);
        }
        assert_abs_diff_eq!(three.activations[0], four.activations[0], epsilon = 1e-4);
    }

    #[test]
    fn identical_votes_single_output() {
        let (n_in, dim) = (4, 4);
        let votes = Array3::from_shape_fn((n_in, 1, dim), |(_, _, d)| [0.5, 1.0, 0.25, 2.0][d]);
        let priors = Array2::from_elem((n_in, 1), 0.25);
        let lambda = 0.01;
        let result = route(&em(1), lambda, &priors, &votes, &zeros(1), 1);

        assert!(result.sigma_sq.iter().all(|&s| s.abs() < 1e-12));
        for d in 0..dim {
            assert_eq!(result.poses[[0, d]], votes[[0, 0, d]]);
        }

        // beta_v = beta_a = 0, summed responsibility 4 * 0.25 = 1
        let cost = dim as f32 * ROUTING_EPS.ln();
        let expected = 1.0 / (1.0 + (lambda * cost).exp());
        assert_abs_diff_eq!(result.activations[0], expected, epsilon = 1e-5);
        assert!(result.activations[0] > 0.5);
    }

    #[test]
    fn saturated_activations_stay_inside_unit_interval() {
        let votes = Array3::from_elem((4, 2, 4), 1.0);
        let priors = Array2::from_elem((4, 2), 0.25);
        let beta_a = Array1::from_vec(vec![1e6, -1e6]);
        for kind in [RoutingKind::Em, RoutingKind::Angle] {
            let routing = Routing::new(kind, 2, ROUTING_EPS, Device::Cpu).unwrap();
            for lambda in [1e-2, 1.0, 100.0] {
                let zero = zeros(2);
                let result = routing.route(lambda, &priors.view(), &votes.view(), &zero.view(), &beta_a.view(), 2);
                assert!(result.activations[0] < 1.0 && result.activations[0] > 0.99, "{kind:?} {lambda}");
                assert!(result.activations[1] > 0.0 && result.activations[1] < 0.01, "{kind:?} {lambda}");
            }
        }
    }

    #[test]
    fn zero_iterations_are_rejected() {
        assert!(matches!(
            Routing::new(RoutingKind::Em, 0, ROUTING_EPS, Device::Cpu),
            Err(CapsError::InvalidConfig(_))
        ));
    }

    #[test]
    fn beta_a_controls_activation_sign() {
        let votes = Array3::from_elem((4, 1, 4), 1.0);
        let priors = Array2::from_elem((4, 1), 0.25);
        let high = Array1::from_elem(1, 200.0);
        let low = Array1::from_elem(1, -200.0);
        let routing = em(1);
        let zero = zeros(1);

        let up = routing.route(1.0, &priors.view(), &votes.view(), &zero.view(), &high.view(), 1);
        let down = routing.route(1.0, &priors.view(), &votes.view(), &zero.view(), &low.view(), 1);
        assert!(up.activations[0] > 0.99);
        assert!(down.activations[0] < 0.01);
    }

    #[test]
    fn e_step_survives_vanishing_variance() {
        let mut votes = Array3::from_elem((3, 2, 4), 0.0);
        votes[[2, 0, 0]] = 50.0;
        let priors = Array2::from_elem((3, 2), 1.0);
        let result = route(&em(3), 0.1, &priors, &votes, &zeros(2), 2);
        assert!(result.poses.iter().all(|v| v.is_finite()));
        assert!(result.activations.iter().all(|v| v.is_finite()));
        for row in result.responsibilities.rows() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-4);
        }
    }

    #[test]
    fn angle_routing_prefers_aligned_votes() {
        let routing = Routing::new(RoutingKind::Angle, 3, ROUTING_EPS, Device::Cpu).unwrap();
        let votes = Array3::from_shape_fn((6, 2, 4), |(i, j, d)| {
            if j == 0 {
                1.0 + d as f32
            } else if i % 2 == 0 {
                1.0
            } else {
                -1.0
            }
        });
        let priors = Array2::from_elem((6, 2), 1.0);
        let result = route(&routing, 0.01, &priors, &votes, &zeros(2), 2);
        for i in 0..6 {
            assert!(result.responsibilities[[i, 0]] > result.responsibilities[[i, 1]]);
        }
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let logits = Array2::from_shape_fn((3, 5), |(i, j)| (i * j) as f32 - 2.0);
        let soft = softmax_rows(&logits);
        for row in soft.rows() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-6);
        }
    }
}
