use std::process::ExitCode;

use ndarray::Array4;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use matrix_capsules::model::{
    CapsuleLoss, Device, ForwardOptions, LossConfig, Metrics, ModelBuilder, NetworkConfig, Result, Scheduler,
};

const STEPS: usize = 3;

/// `matrix-capsules [preset | config.json] [seed] [batch_size]`
fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "run failed");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let source = args.first().map(String::as_str).unwrap_or("smallnorb");
    let seed = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(42u64);
    let batch_size = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(4usize).max(1);

    let config = if source.ends_with(".json") {
        NetworkConfig::from_json_file(source)?
    } else {
        NetworkConfig::preset(source)?
    };
    let device = if batch_size > 1 { Device::CpuParallel } else { Device::Cpu };

    info!(source, seed, batch_size, ?device, "building model");
    let model = ModelBuilder::new()
        .with_network_config(config)
        .with_seed(seed)
        .with_device(device)
        .build()?;
    model.diagnostic()?;

    // Synthetic batch: uniform pixels, labels cycling over the classes.
    let (c, h, w) = model.config.input_shape;
    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(1));
    let images = Array4::random_using((batch_size, c, h, w), Uniform::new(0.0f32, 1.0), &mut rng);
    let labels: Vec<usize> = (0..batch_size).map(|i| i % model.num_classes()).collect();

    let loss_config = LossConfig {
        denoise_weight: if model.capsules.iter().any(|l| l.denoise) { 1e-3 } else { 0.0 },
        ..LossConfig::default()
    };
    let mut lambda = Scheduler::inverse_temperature(STEPS);
    let mut margin = Scheduler::spread_margin(STEPS);

    for step in 0..STEPS {
        let options = ForwardOptions {
            lambda: lambda.step(),
            labels: Some(labels.as_slice()),
            seed: seed.wrapping_add(step as u64),
        };
        let output = model.forward(&images.view(), &options)?;
        let loss = CapsuleLoss::new(&loss_config)?.with_spread_margin(margin.step())?;
        let breakdown = loss.compute(&output, &images.view(), &labels)?;
        let grad = loss.gradient_activations(&output.class_activations.view(), &labels)?;
        info!(
            step,
            lambda = options.lambda,
            total = breakdown.total,
            classification = breakdown.classification,
            reconstruction = breakdown.reconstruction,
            denoising = breakdown.denoising,
            grad_norm = grad.iter().map(|g| g * g).sum::<f32>().sqrt(),
            "forward pass"
        );
        Metrics::compute(&output.class_activations.view(), &labels)?.log();
    }

    Ok(())
}
