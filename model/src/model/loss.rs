use ndarray::{Array2, ArrayView2, ArrayView4, ArrayView5};
use tracing::{debug, info};

use super::config::{ClassLoss, LossConfig};
use super::core::CapsNetOutput;
use super::decoder::argmax;
use super::error::{CapsError, Result};

/// Classification loss over class activations `(batch, classes)`.
pub trait LossFunction: Send + Sync {
    fn compute(&self, activations: &ArrayView2<f32>, labels: &[usize]) -> f32;
    /// Derivative of `compute` with respect to the activations.
    fn gradient(&self, activations: &ArrayView2<f32>, labels: &[usize]) -> Array2<f32>;
}

/// Squared hinge between the target activation and every other class,
/// averaged over classes and batch.
pub struct SpreadLoss {
    pub margin: f32,
}

impl SpreadLoss {
    pub fn new(margin: f32) -> Self {
        Self { margin }
    }

    fn hinge(&self, activations: &ArrayView2<f32>, b: usize, target: usize, c: usize) -> f32 {
        (self.margin - (activations[[b, target]] - activations[[b, c]])).max(0.0)
    }
}

impl LossFunction for SpreadLoss {
    fn compute(&self, activations: &ArrayView2<f32>, labels: &[usize]) -> f32 {
        let (batch_size, num_classes) = activations.dim();
        let mut total = 0.0;
        for (b, &target) in labels.iter().enumerate() {
            for c in (0..num_classes).filter(|&c| c != target) {
                total += self.hinge(activations, b, target, c).powi(2);
            }
        }
        total / (batch_size * num_classes) as f32
    }

    fn gradient(&self, activations: &ArrayView2<f32>, labels: &[usize]) -> Array2<f32> {
        let (batch_size, num_classes) = activations.dim();
        let scale = 2.0 / (batch_size * num_classes) as f32;
        let mut grad = Array2::zeros(activations.dim());
        for (b, &target) in labels.iter().enumerate() {
            for c in (0..num_classes).filter(|&c| c != target) {
                let g = scale * self.hinge(activations, b, target, c);
                grad[[b, c]] += g;
                grad[[b, target]] -= g;
            }
        }
        grad
    }
}

/// Margin Loss (Sabour et al., 2017) applied to capsule activations.
pub struct MarginLoss {
    pub positive_margin: f32, // m+ = 0.9
    pub negative_margin: f32, // m- = 0.1
    pub down_weighting: f32,  // λ = 0.5
}

impl MarginLoss {
    pub fn new(positive_margin: f32, negative_margin: f32, down_weighting: f32) -> Self {
        Self {
            positive_margin,
            negative_margin,
            down_weighting,
        }
    }
}

impl LossFunction for MarginLoss {
    fn compute(&self, activations: &ArrayView2<f32>, labels: &[usize]) -> f32 {
        let (batch_size, num_classes) = activations.dim();
        let mut total_loss = 0.0;

        for (b, &target) in labels.iter().enumerate() {
            for c in 0..num_classes {
                let a = activations[[b, c]];
                total_loss += if c == target {
                    (self.positive_margin - a).max(0.0).powi(2)
                } else {
                    self.down_weighting * (a - self.negative_margin).max(0.0).powi(2)
                };
            }
        }

        // Summed over classes, averaged over the batch.
        total_loss / batch_size as f32
    }

    fn gradient(&self, activations: &ArrayView2<f32>, labels: &[usize]) -> Array2<f32> {
        let (batch_size, num_classes) = activations.dim();
        let mut grad = Array2::zeros(activations.dim());

        for (b, &target) in labels.iter().enumerate() {
            for c in 0..num_classes {
                let a = activations[[b, c]];
                grad[[b, c]] = if c == target {
                    -2.0 * (self.positive_margin - a).max(0.0)
                } else {
                    2.0 * self.down_weighting * (a - self.negative_margin).max(0.0)
                };
            }
        }

        grad / batch_size as f32
    }
}

/// Softmax cross-entropy with the activations used as logits.
pub struct CrossEntropyLoss;

impl CrossEntropyLoss {
    fn softmax_row(activations: &ArrayView2<f32>, b: usize) -> Vec<f32> {
        let row = activations.row(b);
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        let exp: Vec<f32> = row.iter().map(|&v| (v - max).exp()).collect();
        let total: f32 = exp.iter().sum();
        exp.into_iter().map(|e| e / total).collect()
    }
}

impl LossFunction for CrossEntropyLoss {
    fn compute(&self, activations: &ArrayView2<f32>, labels: &[usize]) -> f32 {
        let batch_size = activations.dim().0;
        let total: f32 = labels
            .iter()
            .enumerate()
            .map(|(b, &target)| -Self::softmax_row(activations, b)[target].max(f32::MIN_POSITIVE).ln())
            .sum();
        total / batch_size as f32
    }

    fn gradient(&self, activations: &ArrayView2<f32>, labels: &[usize]) -> Array2<f32> {
        let batch_size = activations.dim().0;
        let mut grad = Array2::zeros(activations.dim());
        for (b, &target) in labels.iter().enumerate() {
            for (c, p) in Self::softmax_row(activations, b).into_iter().enumerate() {
                let indicator = if c == target { 1.0 } else { 0.0 };
                grad[[b, c]] = (p - indicator) / batch_size as f32;
            }
        }
        grad
    }
}

/// Sum of squared pixel errors per sample, averaged over the batch.
pub struct ReconstructionLoss {
    pub weight: f32,
}

impl ReconstructionLoss {
    pub fn new(weight: f32) -> Self {
        Self { weight }
    }

    /// `reconstruction` is `(batch, C*H*W)`, `images` `(batch, C, H, W)`.
    pub fn compute(&self, reconstruction: &ArrayView2<f32>, images: &ArrayView4<f32>) -> Result<f32> {
        let (batch_size, c, h, w) = images.dim();
        if reconstruction.dim() != (batch_size, c * h * w) {
            return Err(CapsError::shape(
                "reconstruction loss",
                format!("{:?}", (batch_size, c * h * w)),
                format!("{:?}", reconstruction.dim()),
            ));
        }
        let squared: f32 = reconstruction
            .iter()
            .zip(images.iter())
            .map(|(r, x)| (r - x).powi(2))
            .sum();
        Ok(self.weight * squared / batch_size.max(1) as f32)
    }
}

/// Mean squared error between a reconstructed and an observed pose grid.
pub fn pose_mse(reconstructed: &ArrayView5<f32>, target: &ArrayView5<f32>) -> Result<f32> {
    if reconstructed.dim() != target.dim() {
        return Err(CapsError::shape(
            "denoising loss",
            format!("{:?}", target.dim()),
            format!("{:?}", reconstructed.dim()),
        ));
    }
    let squared: f32 = reconstructed.iter().zip(target.iter()).map(|(r, t)| (r - t).powi(2)).sum();
    Ok(squared / target.len().max(1) as f32)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossBreakdown {
    pub classification: f32,
    pub reconstruction: f32,
    pub denoising: f32,
    pub total: f32,
}

/// Classification + weighted reconstruction + weighted denoising terms.
pub struct CapsuleLoss {
    kind: ClassLoss,
    classification: Box<dyn LossFunction>,
    reconstruction: ReconstructionLoss,
    denoise_weight: f32,
}

impl CapsuleLoss {
    pub fn new(config: &LossConfig) -> Result<Self> {
        config.validate()?;
        let classification: Box<dyn LossFunction> = match config.classification {
            ClassLoss::Spread { margin } => Box::new(SpreadLoss::new(margin)),
            ClassLoss::Margin {
                positive_margin,
                negative_margin,
                down_weighting,
            } => Box::new(MarginLoss::new(positive_margin, negative_margin, down_weighting)),
            ClassLoss::CrossEntropy => Box::new(CrossEntropyLoss),
        };
        Ok(Self {
            kind: config.classification,
            classification,
            reconstruction: ReconstructionLoss::new(config.recon_weight),
            denoise_weight: config.denoise_weight,
        })
    }

    /// Replaces the spread-loss margin, e.g. with a scheduled one. Only valid
    /// when the configured classification loss is the spread loss.
    pub fn with_spread_margin(mut self, margin: f32) -> Result<Self> {
        match self.kind {
            ClassLoss::Spread { .. } => {
                if margin < 0.0 {
                    return Err(CapsError::InvalidConfig("spread loss margin must be non-negative".to_string()));
                }
                self.kind = ClassLoss::Spread { margin };
                self.classification = Box::new(SpreadLoss::new(margin));
                Ok(self)
            }
            other => Err(CapsError::InvalidConfig(format!(
                "a spread margin does not apply to {other:?}"
            ))),
        }
    }

    pub fn classification(&self) -> ClassLoss {
        self.kind
    }

    pub fn compute(&self, output: &CapsNetOutput, images: &ArrayView4<f32>, labels: &[usize]) -> Result<LossBreakdown> {
        let activations = output.class_activations.view();
        check_labels(&activations, labels)?;

        let classification = self.classification.compute(&activations, labels);
        let reconstruction = match &output.reconstruction {
            Some(recon) => self.reconstruction.compute(&recon.view(), images)?,
            None => 0.0,
        };
        let mut denoising = 0.0;
        if self.denoise_weight > 0.0 {
            for trace in &output.traces {
                if let Some(denoise) = &trace.denoise {
                    denoising += pose_mse(&denoise.reconstruction.view(), &denoise.target.view())?;
                }
            }
            denoising *= self.denoise_weight;
        }

        let breakdown = LossBreakdown {
            classification,
            reconstruction,
            denoising,
            total: classification + reconstruction + denoising,
        };
        debug!(?breakdown, "loss");
        Ok(breakdown)
    }

    pub fn gradient_activations(&self, activations: &ArrayView2<f32>, labels: &[usize]) -> Result<Array2<f32>> {
        check_labels(activations, labels)?;
        Ok(self.classification.gradient(activations, labels))
    }
}

fn check_labels(activations: &ArrayView2<f32>, labels: &[usize]) -> Result<()> {
    let (batch_size, num_classes) = activations.dim();
    if labels.len() != batch_size {
        return Err(CapsError::shape("loss", format!("{batch_size} labels"), labels.len()));
    }
    if let Some(&bad) = labels.iter().find(|&&l| l >= num_classes) {
        return Err(CapsError::InvalidConfig(format!("label {bad} out of range for {num_classes} classes")));
    }
    Ok(())
}

/// Evaluation metrics
#[derive(Debug, Clone, PartialEq)]
pub struct Metrics {
    pub accuracy: f32,
    pub precision: Vec<f32>,
    pub recall: Vec<f32>,
    pub f1_score: Vec<f32>,
    pub confusion_matrix: Vec<Vec<usize>>,
}

impl Metrics {
    /// Predicted class is the most active capsule.
    pub fn compute(activations: &ArrayView2<f32>, labels: &[usize]) -> Result<Self> {
        check_labels(activations, labels)?;
        let (batch_size, num_classes) = activations.dim();

        let mut confusion = vec![vec![0; num_classes]; num_classes];
        let mut correct = 0;
        for (row, &true_class) in activations.rows().into_iter().zip(labels) {
            let pred_class = argmax(row.iter().copied());
            confusion[true_class][pred_class] += 1;
            if pred_class == true_class {
                correct += 1;
            }
        }

        let accuracy = correct as f32 / batch_size.max(1) as f32;

        let mut precision = Vec::with_capacity(num_classes);
        let mut recall = Vec::with_capacity(num_classes);
        let mut f1_score = Vec::with_capacity(num_classes);
        for c in 0..num_classes {
            let tp = confusion[c][c] as f32;
            let fp: f32 = (0..num_classes).filter(|&i| i != c).map(|i| confusion[i][c] as f32).sum();
            let fn_: f32 = (0..num_classes).filter(|&i| i != c).map(|i| confusion[c][i] as f32).sum();

            let prec = if tp + fp > 0.0 { tp / (tp + fp) } else { 0.0 };
            let rec = if tp + fn_ > 0.0 { tp / (tp + fn_) } else { 0.0 };
            let f1 = if prec + rec > 0.0 { 2.0 * prec * rec / (prec + rec) } else { 0.0 };

            precision.push(prec);
            recall.push(rec);
            f1_score.push(f1);
        }

        Ok(Self {
            accuracy,
            precision,
            recall,
            f1_score,
            confusion_matrix: confusion,
        })
    }

    pub fn log(&self) {
        info!(accuracy = self.accuracy, "metrics");
        for (i, ((p, r), f1)) in self.precision.iter().zip(&self.recall).zip(&self.f1_score).enumerate() {
            info!(class = i, precision = p, recall = r, f1 = f1, "per-class metrics");
        }
        for row in &self.confusion_matrix {
            debug!(?row, "confusion");
        }
    }
}
