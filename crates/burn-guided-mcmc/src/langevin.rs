//! Annealed Langevin ascent
//!
//! `x' = x + h s(x) + sqrt(2h) xi`, never rejected.
//!
//! The chain has no accept/reject step, so the reported acceptance is a proxy:
//! the probability a Metropolis-adjusted Langevin chain would have accepted the
//! same move,
//!
//! `min(1, exp(log p(x') - log p(x) + log q(x | x') - log q(x' | x)))`
//!
//! with `q(x' | x) = N(x + h s(x), 2h)`. It approaches `1` as `h -> 0` and
//! falls as the discretization error grows, which gives the calibrator the
//! same monotone signal it gets from HMC.
//!
//! Unlike HMC there is no per-timestep mass. The schedule reaches the chain
//! through the target score at `t` and through the step size of `t`, which
//! parametric tables derive from `beta_t`. Scaling `h` again here would
//! change what a calibrated step size means.

use burn::prelude::*;
use burn_guided_diffusion::NoiseSource;

use crate::sampler::{acceptance_probabilities, host_vec, CorrectionSampler, CorrectionStats, McmcMethod};
use crate::step_size::StepSize;
use crate::target::{batch_sum, trapezoid_line, AnnealedTarget};
use crate::{Error, Result};

/// Langevin-ascent correction
#[derive(Debug, Clone)]
pub struct AnnealedLangevinSampler {
    /// Trapezoid sub-intervals for the `log p` difference of score-only targets
    n_trapets: usize,
}

impl Default for AnnealedLangevinSampler {
    fn default() -> Self {
        Self { n_trapets: 5 }
    }
}

impl AnnealedLangevinSampler {
    pub fn new(n_trapets: usize) -> Result<Self> {
        if n_trapets == 0 {
            return Err(Error::InvalidParameter(
                "n_trapets must be at least 1".into(),
            ));
        }
        Ok(Self { n_trapets })
    }

    pub fn n_trapets(&self) -> usize {
        self.n_trapets
    }
}

impl<B: Backend> CorrectionSampler<B> for AnnealedLangevinSampler {
    fn method(&self) -> McmcMethod {
        McmcMethod::La
    }

    fn correct(
        &self,
        target: &dyn AnnealedTarget<B>,
        x: Tensor<B, 4>,
        t: usize,
        step_size: &StepSize,
        n_steps: usize,
        noise: &mut NoiseSource,
    ) -> Result<(Tensor<B, 4>, CorrectionStats)> {
        let dims = x.dims();
        let batch = dims[0];
        if batch == 0 {
            return Err(Error::EmptyBatch);
        }
        let device = x.device();
        let h = step_size.to_tensor::<B>(dims, &device)?;
        let noise_scale = (h.clone() * 2.0).sqrt();
        let four_h = h.clone() * 4.0;

        let mut x = x.detach();
        let mut score = target.score(x.clone(), t)?;
        let mut log_p = target.log_density(x.clone(), t)?;
        let mut proxy = vec![0.0f64; batch];

        for _ in 0..n_steps {
            let drift = h.clone() * score.clone();
            let x_new = x.clone()
                + drift.clone()
                + noise_scale.clone() * noise.normal::<B, 4>(dims, &device);
            let s_new = target.score(x_new.clone(), t)?;

            let (delta_log_p, log_p_new) = match &log_p {
                Some(current) => {
                    let proposed = target.log_density(x_new.clone(), t)?.ok_or_else(|| {
                        Error::InvalidParameter("target stopped providing a log density".into())
                    })?;
                    (proposed.clone() - current.clone(), Some(proposed))
                }
                None => (
                    trapezoid_line(
                        target,
                        x.clone(),
                        x_new.clone(),
                        score.clone(),
                        s_new.clone(),
                        t,
                        self.n_trapets,
                    )?,
                    None,
                ),
            };

            let forward = batch_sum(
                (x_new.clone() - x.clone() - drift).powf_scalar(2.0) / four_h.clone(),
            );
            let backward = batch_sum(
                (x.clone() - x_new.clone() - h.clone() * s_new.clone()).powf_scalar(2.0)
                    / four_h.clone(),
            );
            let log_ratio = host_vec(delta_log_p + forward - backward)?;
            for (total, p) in proxy.iter_mut().zip(acceptance_probabilities(&log_ratio)) {
                *total += p;
            }

            x = x_new;
            score = s_new;
            log_p = log_p_new;
        }

        let per_sample = proxy
            .into_iter()
            .map(|p| if n_steps == 0 { 0.0 } else { p / n_steps as f64 })
            .collect();
        let stats = CorrectionStats { per_sample };
        tracing::debug!(t, h = step_size.magnitude(), proxy = stats.mean(), "langevin correction");
        Ok((x.detach(), stats))
    }
}
