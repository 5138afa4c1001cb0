//! burn-guided CLI
//!
//! Command-line interface for classifier-guided diffusion sampling.
//!
//! Supports:
//! - Sampling with optional MCMC correction (`sample`)
//! - Calibrating MCMC step sizes against an acceptance band (`find-step-size`)
//!
//! Both commands run the analytic Gaussian-mixture model family, which needs
//! no weights.

use anyhow::{bail, Context, Result};
use burn::prelude::*;
use burn_guided::backends::{backend_name, default_device, DefaultBackend};
use burn_guided::calibration::{configured_corrector, configured_step_sizes, correction_sampler, find_step_sizes};
use burn_guided::config::{setup_results_dir, CalibrationConfig, SimulationConfig};
use burn_guided::diffusion::{
    Classifier, Denoiser, DiffusionProcess, GaussianMixtureConfig, GaussianMixtureModel,
    NoiseSource, Schedule, VarianceMode,
};
use burn_guided::mcmc::{AcceptanceBounds, Corrector, StepSizeCalibrator};
use burn_guided::metrics::{accuracy, entropy, logits_to_label};
use burn_guided::{
    ClassifierFullGuidance, Guidance, GuidedSampler, NoGuidance, SampleRequest, StepSizeKey,
    StepSizeStore,
};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::path::PathBuf;

type B = DefaultBackend;

/// Model family name of the analytic mixture
const MIXTURE: &str = "gaussian_mixture";

#[derive(Parser)]
#[command(name = "burn-guided")]
#[command(about = "Classifier-guided diffusion sampling with MCMC correction")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate class-conditional samples
    Sample {
        /// Simulation config (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Job id used in the results directory name instead of a timestamp
        #[arg(long)]
        job_id: Option<u64>,

        /// Override the configured seed
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Calibrate MCMC step sizes and write them to the step-size store
    FindStepSize {
        /// Calibration config (JSON): a simulation config plus `settings`
        #[arg(short, long)]
        config: PathBuf,

        /// Lower acceptance bound (overrides the config)
        #[arg(long)]
        lower: Option<f64>,

        /// Upper acceptance bound (overrides the config)
        #[arg(long)]
        upper: Option<f64>,

        /// Search iterations per timestep (overrides the config)
        #[arg(long)]
        max_iter: Option<usize>,

        /// Override the configured seed
        #[arg(long)]
        seed: Option<u64>,
    },
}

#[derive(Serialize)]
struct SampleReport {
    shape: [usize; 4],
    labels: Vec<i64>,
    predicted: Vec<i64>,
    accuracy: f64,
    entropy: f64,
    samples: Vec<f32>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Sample {
            config,
            job_id,
            seed,
        } => run_sample(config, job_id, seed),
        Commands::FindStepSize {
            config,
            lower,
            upper,
            max_iter,
            seed,
        } => run_find_step_size(config, lower, upper, max_iter, seed),
    }
}

/// Denoiser, classifier and process of the configured model family
fn build_model(
    config: &SimulationConfig,
    device: &<B as Backend>::Device,
) -> Result<(GaussianMixtureModel<B>, DiffusionProcess)> {
    if config.diff_model != MIXTURE {
        bail!(
            "unsupported diff_model '{}', only '{MIXTURE}' is built in",
            config.diff_model
        );
    }
    if config.is_guided() && config.classifier != MIXTURE {
        bail!(
            "unsupported classifier '{}', only '{MIXTURE}' is built in",
            config.classifier
        );
    }
    let schedule = Schedule::new(
        config.beta_schedule,
        config.num_diff_steps,
        config.num_respaced_diff_steps,
    )
    .context("Failed to build schedule")?;
    let model = GaussianMixtureConfig::default()
        .with_class_conditional(config.class_cond)
        .with_learned_variance(config.variance_mode == VarianceMode::Learned)
        .init::<B>(schedule.original_betas(), device)
        .context("Failed to build Gaussian-mixture model")?;
    let process = DiffusionProcess::new(schedule, config.variance_mode, model.capabilities())
        .context("Failed to build diffusion process")?;
    Ok((model, process))
}

fn build_sampler(
    config: &SimulationConfig,
    model: GaussianMixtureModel<B>,
    process: DiffusionProcess,
) -> Result<GuidedSampler<B, GaussianMixtureModel<B>, Box<dyn Guidance<B>>>> {
    let guidance: Box<dyn Guidance<B>> = if config.is_guided() {
        Box::new(ClassifierFullGuidance::new(model.clone(), config.guid_scale))
    } else {
        Box::new(NoGuidance)
    };
    Ok(GuidedSampler::new(process, model, guidance)
        .context("Failed to build sampler")?
        .with_mcmc_lower_t(config.mcmc_lower_t))
}

fn noise_source(seed: Option<u64>) -> NoiseSource {
    match seed {
        Some(seed) => NoiseSource::seeded(seed),
        None => NoiseSource::from_entropy(),
    }
}

fn progress_bar(total: u64) -> Result<ProgressBar> {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}% {msg}")?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

fn run_sample(config_path: PathBuf, job_id: Option<u64>, seed: Option<u64>) -> Result<()> {
    let mut config = SimulationConfig::from_json(&config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;
    if seed.is_some() {
        config.seed = seed;
    }

    let device = default_device();
    tracing::info!(backend = backend_name(), name = %config.name, "starting sampling run");
    let (model, process) = build_model(&config, &device)?;
    let sampler = build_sampler(&config, model.clone(), process)?;

    let store = StepSizeStore::new(&config.step_size_dir);
    let mut corrector = configured_corrector(&config, &sampler, &store)
        .context("Failed to set up MCMC correction")?;

    let mut noise = noise_source(config.seed);
    let labels = noise.labels(config.num_samples, model.num_classes());
    let request = SampleRequest::new(config.num_samples, &labels, config.sample_shape())
        .with_batching(config.batching())
        .with_trajectory(config.save_traj);

    let sim_dir = setup_results_dir(&config, job_id).context("Failed to set up results directory")?;

    let pb = progress_bar(100)?;
    let output = sampler
        .sample(
            &request,
            &device,
            &mut noise,
            corrector.as_mut().map(|c| c as &mut dyn Corrector<B>),
            |info| {
                let done = info.batch_index * info.total_steps + info.step + 1;
                let total = info.num_batches * info.total_steps;
                pb.set_position((done * 100 / total) as u64);
                pb.set_message(format!(
                    "Batch {}/{} step {}/{}",
                    info.batch_index + 1,
                    info.num_batches,
                    info.step + 1,
                    info.total_steps
                ));
            },
        )
        .context("Sampling failed")?;
    pb.finish_and_clear();

    let samples = output.samples;
    let shape = samples.dims();
    let timesteps = Tensor::<B, 1, Int>::zeros([shape[0]], &device);
    let logits = model.logits(samples.clone(), timesteps);
    let probs = burn::tensor::activation::softmax(logits.clone(), 1);
    let predicted = logits_to_label(logits);
    let targets = Tensor::<B, 1, Int>::from_data(TensorData::new(labels.clone(), [labels.len()]), &device);

    let report = SampleReport {
        shape,
        labels: labels.clone(),
        predicted: predicted
            .clone()
            .into_data()
            .convert::<i64>()
            .to_vec()
            .map_err(|e| anyhow::anyhow!("{e:?}"))?,
        accuracy: accuracy(targets, predicted),
        entropy: entropy(probs),
        samples: samples
            .into_data()
            .convert::<f32>()
            .to_vec()
            .map_err(|e| anyhow::anyhow!("{e:?}"))?,
    };
    let samples_path = sim_dir.join("samples.json");
    std::fs::write(&samples_path, serde_json::to_string(&report)?)
        .context("Failed to write samples")?;

    if let Some(trajectory) = output.trajectory {
        let steps = trajectory
            .into_iter()
            .map(|x| x.into_data().convert::<f32>().to_vec::<f32>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| anyhow::anyhow!("{e:?}"))?;
        std::fs::write(sim_dir.join("trajectory.json"), serde_json::to_string(&steps)?)
            .context("Failed to write trajectory")?;
    }

    println!(
        "Wrote {} samples to {} (accuracy {:.3}, entropy {:.3})",
        shape[0],
        samples_path.display(),
        report.accuracy,
        report.entropy
    );
    Ok(())
}

fn run_find_step_size(
    config_path: PathBuf,
    lower: Option<f64>,
    upper: Option<f64>,
    max_iter: Option<usize>,
    seed: Option<u64>,
) -> Result<()> {
    let mut config = CalibrationConfig::from_json(&config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;
    let bounds = AcceptanceBounds::new(
        lower.unwrap_or(config.settings.bounds.lower),
        upper.unwrap_or(config.settings.bounds.upper),
    )
    .context("Invalid acceptance bounds")?;
    config.settings.bounds = bounds;
    if let Some(max_iter) = max_iter {
        config.settings.max_iter = max_iter;
    }
    if seed.is_some() {
        config.simulation.seed = seed;
    }
    config.validate().context("Invalid calibration config")?;
    let simulation = &config.simulation;
    let Some(method) = simulation.mcmc_method else {
        bail!("calibration needs an mcmc_method");
    };

    let device = default_device();
    tracing::info!(
        backend = backend_name(),
        name = %simulation.name,
        method = %method,
        bounds = %bounds.label(),
        "starting step-size search"
    );
    let (model, process) = build_model(simulation, &device)?;
    let sampler = build_sampler(simulation, model.clone(), process)?;

    let store = StepSizeStore::new(&simulation.step_size_dir);
    let initial = configured_step_sizes(simulation, &sampler, &store)
        .context("Failed to build initial step sizes")?;
    let correction = correction_sampler::<B>(method, sampler.process(), simulation.n_trapets)?;
    let calibrator = StepSizeCalibrator::new(
        correction,
        simulation.mcmc_steps.unwrap_or(1),
        config.settings,
        initial,
    )
    .context("Failed to set up calibrator")?;

    let mut noise = noise_source(simulation.seed);
    let labels = noise.labels(simulation.num_samples, model.num_classes());
    let request = SampleRequest::new(simulation.num_samples, &labels, simulation.sample_shape())
        .with_batching(simulation.batching());

    let outcome = find_step_sizes(&sampler, calibrator, &request, &device, &mut noise)
        .context("Step-size search failed")?;

    let key = StepSizeKey::new(simulation.name.clone(), method, bounds);
    let path = store.save(&key, &outcome).context("Failed to save step sizes")?;
    let unresolved: Vec<usize> = outcome
        .records
        .iter()
        .filter(|r| !r.resolved)
        .map(|r| r.t)
        .collect();
    if !unresolved.is_empty() {
        tracing::warn!(count = unresolved.len(), timesteps = ?unresolved, "unresolved timesteps in final sub-batch");
    }
    println!(
        "Saved {} step sizes to {} ({} unresolved)",
        outcome.table.len(),
        path.display(),
        unresolved.len()
    );
    Ok(())
}
