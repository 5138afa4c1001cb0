//! Annealed Hamiltonian Monte Carlo
//!
//! Each of the `n_steps` iterations:
//!
//! 1. partially refreshes the momentum, `v' = d v + sqrt(1 - d^2) M^{1/2} xi`
//! 2. integrates `L` leapfrog steps of size `h` from `(x, v')`
//! 3. accepts the end point with probability
//!    `min(1, exp(log p(x*) - log p(x) - K(v*) + K(v')))`, `K(v) = |v|^2 / 2M`
//!
//! When the target only provides a score, `log p(x*) - log p(x)` is the
//! trapezoid integral of the score along the leapfrog path.
//! Accept/reject is decided per sample and applied with a mask, so a
//! rejected or degenerate proposal never touches the other samples.

use burn::prelude::*;
use burn_guided_diffusion::NoiseSource;

use crate::sampler::{acceptance_probabilities, host_vec, CorrectionSampler, CorrectionStats, McmcMethod};
use crate::step_size::StepSize;
use crate::target::{batch_sum, trapezoid_path, AnnealedTarget};
use crate::{Error, Result};

/// Default momentum damping
pub const DEFAULT_DAMPING: f64 = 0.9;

/// Default number of leapfrog steps per proposal
pub const DEFAULT_LEAPFROG_STEPS: usize = 3;

/// Damped-momentum HMC over an annealed target
#[derive(Debug, Clone)]
pub struct AnnealedHmcSampler {
    damping: f64,
    leapfrog_steps: usize,
    /// Square root of the diagonal mass per respaced timestep
    mass_sqrt: Vec<f64>,
}

impl AnnealedHmcSampler {
    pub fn new(damping: f64, leapfrog_steps: usize, mass_sqrt: Vec<f64>) -> Result<Self> {
        if !(0.0..1.0).contains(&damping) {
            return Err(Error::InvalidParameter(format!(
                "damping must lie in [0, 1), got {damping}"
            )));
        }
        if leapfrog_steps == 0 {
            return Err(Error::InvalidParameter(
                "at least one leapfrog step is required".into(),
            ));
        }
        if let Some(m) = mass_sqrt.iter().find(|m| !(m.is_finite() && **m > 0.0)) {
            return Err(Error::InvalidParameter(format!(
                "mass must be positive and finite, got {m}"
            )));
        }
        Ok(Self {
            damping,
            leapfrog_steps,
            mass_sqrt,
        })
    }

    /// Default damping and path length with the mass scaled by the schedule
    ///
    /// The square root of the mass at step `t` is `beta_t`.
    pub fn for_schedule(betas: &[f64]) -> Result<Self> {
        Self::new(DEFAULT_DAMPING, DEFAULT_LEAPFROG_STEPS, betas.to_vec())
    }

    pub fn damping(&self) -> f64 {
        self.damping
    }

    pub fn leapfrog_steps(&self) -> usize {
        self.leapfrog_steps
    }

    fn mass_sqrt(&self, t: usize) -> Result<f64> {
        self.mass_sqrt.get(t).copied().ok_or_else(|| {
            burn_guided_diffusion::Error::TimestepOutOfRange {
                index: t,
                len: self.mass_sqrt.len(),
            }
            .into()
        })
    }
}

impl<B: Backend> CorrectionSampler<B> for AnnealedHmcSampler {
    fn method(&self) -> McmcMethod {
        McmcMethod::Hmc
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
        let mass_sqrt = self.mass_sqrt(t)?;
        let mass = mass_sqrt * mass_sqrt;
        let h = step_size.to_tensor::<B>(dims, &device)?;
        let refresh = (1.0 - self.damping * self.damping).sqrt() * mass_sqrt;

        let mut x = x.detach();
        let mut score = target.score(x.clone(), t)?;
        let mut log_p = target.log_density(x.clone(), t)?;
        let mut v = noise.normal::<B, 4>(dims, &device) * mass_sqrt;
        let mut accepted = vec![0.0f64; batch];
        let mut degenerate = 0usize;

        for _ in 0..n_steps {
            let v_start = v * self.damping + noise.normal::<B, 4>(dims, &device) * refresh;

            let mut points = Vec::with_capacity(self.leapfrog_steps + 1);
            let mut scores = Vec::with_capacity(self.leapfrog_steps + 1);
            points.push(x.clone());
            scores.push(score.clone());
            let mut x_new = x.clone();
            let mut v_new = v_start.clone();
            let mut s_new = score.clone();
            for _ in 0..self.leapfrog_steps {
                v_new = v_new + h.clone() * s_new * 0.5;
                x_new = x_new + h.clone() * v_new.clone() / mass;
                s_new = target.score(x_new.clone(), t)?;
                v_new = v_new + h.clone() * s_new.clone() * 0.5;
                points.push(x_new.clone());
                scores.push(s_new.clone());
            }

            let (delta_log_p, log_p_new) = match &log_p {
                Some(current) => {
                    let proposed = target.log_density(x_new.clone(), t)?.ok_or_else(|| {
                        Error::InvalidParameter("target stopped providing a log density".into())
                    })?;
                    (proposed.clone() - current.clone(), Some(proposed))
                }
                None => (trapezoid_path(&points, &scores), None),
            };
            let kinetic_start = batch_sum(v_start.clone().powf_scalar(2.0)) * (0.5 / mass);
            let kinetic_new = batch_sum(v_new.clone().powf_scalar(2.0)) * (0.5 / mass);
            let log_ratio = host_vec(delta_log_p - kinetic_new + kinetic_start)?;
            degenerate += log_ratio.iter().filter(|r| !r.is_finite()).count();

            let probs = acceptance_probabilities(&log_ratio);
            let uniforms = noise.uniforms(batch);
            let decisions: Vec<f32> = probs
                .iter()
                .zip(&uniforms)
                .map(|(p, u)| if u < p { 1.0 } else { 0.0 })
                .collect();
            for (total, d) in accepted.iter_mut().zip(&decisions) {
                *total += *d as f64;
            }

            let keep: Tensor<B, 1> =
                Tensor::from_data(TensorData::new(decisions, [batch]), &device);
            let keep = keep.greater_elem(0.5);
            let keep_4d = keep.clone().reshape([batch, 1, 1, 1]).expand(dims);
            x = x.mask_where(keep_4d.clone(), x_new);
            score = score.mask_where(keep_4d.clone(), s_new);
            v = v_start.mask_where(keep_4d, v_new);
            log_p = match (log_p, log_p_new) {
                (Some(current), Some(proposed)) => Some(current.mask_where(keep, proposed)),
                (current, _) => current,
            };
        }

        if degenerate > 0 {
            tracing::warn!(t, degenerate, "rejected HMC proposals with non-finite energy");
        }
        let per_sample = accepted
            .into_iter()
            .map(|a| if n_steps == 0 { 0.0 } else { a / n_steps as f64 })
            .collect();
        let stats = CorrectionStats { per_sample };
        tracing::debug!(t, h = step_size.magnitude(), acceptance = stats.mean(), "hmc correction");
        Ok((x.detach(), stats))
    }
}
