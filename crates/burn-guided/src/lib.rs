//! burn-guided: classifier-guided diffusion sampling with MCMC correction
//!
//! Generates samples from a diffusion model while steering them toward target
//! classes with the gradient of a classifier, optionally refining every
//! reverse step with an annealed MCMC chain whose step sizes are either loaded
//! from a calibrated table or searched on the fly.
//!
//! # Crates
//!
//! - [`diffusion`] - schedules, the DDPM process, collaborator traits
//! - [`mcmc`] - correction samplers and the step-size calibrator
//!
//! # Example
//!
//! ```ignore
//! use burn_guided::{backends::DefaultBackend, GuidedSampler, SampleRequest};
//! use burn_guided::guidance::ClassifierFullGuidance;
//!
//! let sampler = GuidedSampler::new(process, denoiser, ClassifierFullGuidance::new(classifier, 1.0))?;
//! let request = SampleRequest::new(8, &labels, [1, 28, 28]);
//! let output = sampler.sample(&request, &device, &mut noise, None, |_| {})?;
//! ```

pub use burn_guided_diffusion as diffusion;
pub use burn_guided_mcmc as mcmc;

pub mod backends;
pub mod calibration;
pub mod config;
pub mod debug;
pub mod guidance;
pub mod metrics;
pub mod sampler;
pub mod store;
pub mod target;

pub use calibration::find_step_sizes;
pub use config::{McmcStepSizes, SimulationConfig, StepSizeParams, StepSizeSource};
pub use guidance::{ClassifierFullGuidance, ClassifierGuidance, Guidance, Guided, NoGuidance};
pub use metrics::RunningMean;
pub use sampler::{GuidedSampler, SampleOutput, SampleRequest, StepInfo};
pub use store::{StepSizeKey, StepSizeStore};
pub use target::GuidedTarget;

use std::path::PathBuf;

/// Guided sampling error variants.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Diffusion(#[from] burn_guided_diffusion::Error),

    #[error(transparent)]
    Mcmc(#[from] burn_guided_mcmc::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("got {actual} class labels for {expected} samples")]
    LabelCount { expected: usize, actual: usize },

    #[error("class label {label} out of range for {num_classes} classes")]
    LabelOutOfRange { label: i64, num_classes: usize },

    #[error("classifier returned logits of shape {actual:?}, expected {expected:?}")]
    ClassifierOutput {
        expected: [usize; 2],
        actual: [usize; 2],
    },

    #[error("guidance input received no gradient")]
    MissingGradient,

    #[error("non-finite values at step {step} (t = {t}): {stats}")]
    NonFinite { step: usize, t: usize, stats: String },

    #[error("step size table '{key}' not found at {path}")]
    StepSizesNotFound { key: String, path: PathBuf },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
