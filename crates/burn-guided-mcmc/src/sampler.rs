//! Correction sampler contract

use std::fmt;

use burn::prelude::*;
use burn_guided_diffusion::NoiseSource;
use serde::{Deserialize, Serialize};

use crate::step_size::StepSize;
use crate::target::AnnealedTarget;
use crate::Result;

/// Correction method identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McmcMethod {
    /// Annealed Hamiltonian Monte Carlo
    Hmc,
    /// Annealed Langevin ascent
    La,
}

impl fmt::Display for McmcMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            McmcMethod::Hmc => write!(f, "hmc"),
            McmcMethod::La => write!(f, "la"),
        }
    }
}

impl std::str::FromStr for McmcMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hmc" => Ok(McmcMethod::Hmc),
            "la" => Ok(McmcMethod::La),
            other => Err(format!("unknown MCMC method '{other}', expected 'hmc' or 'la'")),
        }
    }
}

/// Acceptance statistics of one correction call
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectionStats {
    /// Per-sample acceptance averaged over the chain's steps
    pub per_sample: Vec<f64>,
}

impl CorrectionStats {
    /// Batch mean acceptance
    pub fn mean(&self) -> f64 {
        if self.per_sample.is_empty() {
            return 0.0;
        }
        self.per_sample.iter().sum::<f64>() / self.per_sample.len() as f64
    }
}

/// One correction strategy
///
/// `correct` advances every sample of the batch through exactly `n_steps`
/// iterations targeting `target` at respaced timestep `t`.
pub trait CorrectionSampler<B: Backend> {
    fn method(&self) -> McmcMethod;

    fn correct(
        &self,
        target: &dyn AnnealedTarget<B>,
        x: Tensor<B, 4>,
        t: usize,
        step_size: &StepSize,
        n_steps: usize,
        noise: &mut NoiseSource,
    ) -> Result<(Tensor<B, 4>, CorrectionStats)>;
}

/// Turn per-sample log acceptance ratios into acceptance probabilities
///
/// Non-finite ratios map to probability `0`.
pub(crate) fn acceptance_probabilities(log_ratio: &[f32]) -> Vec<f64> {
    log_ratio
        .iter()
        .map(|r| {
            if r.is_finite() {
                (*r as f64).min(0.0).exp()
            } else {
                0.0
            }
        })
        .collect()
}

/// Host copy of a 1-d float tensor
pub(crate) fn host_vec<B: Backend>(x: Tensor<B, 1>) -> Result<Vec<f32>> {
    x.into_data()
        .convert::<f32>()
        .to_vec()
        .map_err(|e| burn_guided_diffusion::Error::Data(format!("{e:?}")).into())
}
