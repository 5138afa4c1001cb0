//! Annealed MCMC correction for reverse diffusion
//!
//! After each reverse diffusion step the sample can be refined with a short
//! MCMC chain targeting the noised marginal at that step. This crate provides:
//!
//! - [`target`] - the annealed target contract and energy-difference estimates
//! - [`hmc`] - damped-momentum Hamiltonian correction with a Metropolis test
//! - [`langevin`] - unadjusted Langevin ascent with a MALA acceptance proxy
//! - [`step_size`] - scalar/elementwise step sizes and per-timestep tables
//! - [`calibrate`] - fixed-table correction and acceptance-band step-size search
//!
//! Samplers are generic over `burn::tensor::backend::Backend`. Gradients are
//! the target's business: a target backed by an autodiff model computes its
//! score internally and hands back a detached tensor.

pub mod calibrate;
pub mod hmc;
pub mod langevin;
pub mod sampler;
pub mod step_size;
pub mod target;

pub use calibrate::{
    AcceptanceBounds, BatchingStrategy, CalibrationBatch, CalibrationOutcome, CalibrationSettings,
    Corrector, FixedStepCorrector, StepSizeCalibrator, TimestepRecord,
};
pub use hmc::AnnealedHmcSampler;
pub use langevin::AnnealedLangevinSampler;
pub use sampler::{CorrectionSampler, CorrectionStats, McmcMethod};
pub use step_size::{StepSize, StepSizeShape, StepSizeTable};
pub use target::AnnealedTarget;

/// MCMC error variants.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Diffusion(#[from] burn_guided_diffusion::Error),

    #[error("no step size for timestep {t}")]
    MissingStepSize { t: usize },

    #[error("step size for timestep {t} was already resolved in this run")]
    StepSizeRevised { t: usize },

    #[error("invalid acceptance bounds [{lower}, {upper}]: need 0 <= lower <= upper <= 1")]
    InvalidBounds { lower: f64, upper: f64 },

    #[error("elementwise step size has {actual} entries, sample has {expected} elements")]
    StepSizeShape { expected: usize, actual: usize },

    #[error("invalid sampler parameter: {0}")]
    InvalidParameter(String),

    #[error("batch must contain at least one sample")]
    EmptyBatch,

    #[error("target evaluation failed: {0}")]
    Target(Box<dyn std::error::Error + Send + Sync>),
}

pub type Result<T> = std::result::Result<T, Error>;
