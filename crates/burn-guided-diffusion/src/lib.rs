//! Diffusion building blocks for guided sampling
//!
//! This crate holds everything the guided sampler needs from the diffusion
//! side, independent of guidance and MCMC:
//!
//! - [`schedule`] - beta schedules, respacing and the derived sparse schedule
//! - [`process`] - forward noising and the DDPM reverse transition
//! - [`model`] - capability traits the denoiser and classifier collaborators implement
//! - [`noise`] - seeded Gaussian/uniform noise for reproducible runs
//! - [`mixture`] - closed-form Gaussian-mixture denoiser/classifier
//!
//! All timestep arguments are indices into the (possibly respaced) schedule,
//! counted from `0` (cleanest) to `len - 1` (noisiest). The timestep handed to a
//! collaborator is the retained original timestep, see
//! [`DiffusionProcess::model_timesteps`].

pub mod mixture;
pub mod model;
pub mod noise;
pub mod process;
pub mod schedule;

pub use mixture::{GaussianMixtureConfig, GaussianMixtureModel};
pub use model::{Classifier, Denoiser, DenoiserCapabilities, DenoiserOutput};
pub use noise::NoiseSource;
pub use process::{DiffusionProcess, Posterior, VarianceMode};
pub use schedule::{
    improved_beta_schedule, linear_beta_schedule, new_sparse, respaced_beta_schedule,
    respaced_timesteps, BetaSchedule, Schedule,
};

/// Diffusion error variants.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("schedule must contain at least one step")]
    EmptySchedule,

    #[error("respaced step count {respaced} exceeds full step count {full}")]
    RespacedTooLong { respaced: usize, full: usize },

    #[error("timestep index {index} out of range for schedule of length {len}")]
    TimestepOutOfRange { index: usize, len: usize },

    #[error("variance mode 'learned' requires a denoiser that predicts variance")]
    LearnedVarianceUnsupported,

    #[error("denoiser did not return a variance prediction in 'learned' mode")]
    MissingVariance,

    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("tensor data error: {0}")]
    Data(String),
}

pub type Result<T> = std::result::Result<T, Error>;
