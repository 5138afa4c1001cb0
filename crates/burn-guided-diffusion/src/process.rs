//! DDPM forward and reverse process
//!
//! Forward noising: `x_t = sqrt(a_t) * x_0 + sqrt(1 - a_t) * noise`.
//!
//! Reverse transition: `x_{t-1} ~ N(mu(x_t, x_0_hat), sigma_t^2)` where `x_0_hat`
//! is reconstructed from the denoiser's noise estimate and `sigma_t^2` is either
//! fixed by the schedule or interpolated from the denoiser's variance output.
//! At `t = 0` the transition returns the mean.

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::model::{DenoiserCapabilities, DenoiserOutput};
use crate::schedule::{cumprod_alphas, Schedule};
use crate::{Error, Result};

/// Variance of the reverse transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarianceMode {
    /// Fixed large variance: beta_t
    #[default]
    Beta,
    /// Fixed small variance: the true posterior variance beta~_t
    BetaTilde,
    /// Model interpolates between beta~_t and beta_t in log space
    Learned,
}

/// Parameters of one reverse transition
#[derive(Debug, Clone)]
pub struct Posterior<B: Backend> {
    pub mean: Tensor<B, 4>,
    pub variance: Tensor<B, 4>,
    pub log_variance: Tensor<B, 4>,
    /// One-step reconstruction of the clean sample
    pub pred_x0: Tensor<B, 4>,
}

/// Forward and reverse operators over a [`Schedule`]
#[derive(Debug, Clone)]
pub struct DiffusionProcess {
    schedule: Schedule,
    variance_mode: VarianceMode,
    clip_denoised: bool,
    alphas_cumprod: Vec<f64>,
    posterior_variance: Vec<f64>,
    posterior_log_variance_clipped: Vec<f64>,
    fixed_large_variance: Vec<f64>,
    posterior_mean_coef1: Vec<f64>,
    posterior_mean_coef2: Vec<f64>,
}

impl DiffusionProcess {
    /// Create the process for a fixed-variance or learned-variance denoiser
    ///
    /// Fails when `variance_mode` is [`VarianceMode::Learned`] but the
    /// denoiser does not predict a variance.
    pub fn new(
        schedule: Schedule,
        variance_mode: VarianceMode,
        denoiser: DenoiserCapabilities,
    ) -> Result<Self> {
        if schedule.is_empty() {
            return Err(Error::EmptySchedule);
        }
        if variance_mode == VarianceMode::Learned && !denoiser.learned_variance {
            return Err(Error::LearnedVarianceUnsupported);
        }

        let betas = schedule.betas();
        let n = betas.len();
        let alphas_cumprod = cumprod_alphas(betas);
        let alphas_cumprod_prev: Vec<f64> = std::iter::once(1.0)
            .chain(alphas_cumprod[..n - 1].iter().copied())
            .collect();

        let mut posterior_variance = Vec::with_capacity(n);
        let mut posterior_mean_coef1 = Vec::with_capacity(n);
        let mut posterior_mean_coef2 = Vec::with_capacity(n);
        for t in 0..n {
            let beta = betas[t];
            let a = alphas_cumprod[t];
            let a_prev = alphas_cumprod_prev[t];
            posterior_variance.push(beta * (1.0 - a_prev) / (1.0 - a));
            posterior_mean_coef1.push(beta * a_prev.sqrt() / (1.0 - a));
            posterior_mean_coef2.push((1.0 - a_prev) * (1.0 - beta).sqrt() / (1.0 - a));
        }

        // posterior_variance[0] is 0, borrow the next step's value for the log
        let floor = if n > 1 {
            posterior_variance[1]
        } else {
            betas[0]
        };
        let posterior_log_variance_clipped = (0..n)
            .map(|t| if t == 0 { floor.ln() } else { posterior_variance[t].ln() })
            .collect();
        let fixed_large_variance = (0..n)
            .map(|t| if t == 0 { floor } else { betas[t] })
            .collect();

        tracing::debug!(
            steps = n,
            train_steps = schedule.num_train_steps(),
            ?variance_mode,
            "diffusion process ready"
        );

        Ok(Self {
            schedule,
            variance_mode,
            clip_denoised: false,
            alphas_cumprod,
            posterior_variance,
            posterior_log_variance_clipped,
            fixed_large_variance,
            posterior_mean_coef1,
            posterior_mean_coef2,
        })
    }

    /// Clamp the reconstructed `x_0` to `[-1, 1]` before forming the mean
    pub fn with_clip_denoised(mut self, clip: bool) -> Self {
        self.clip_denoised = clip;
        self
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn variance_mode(&self) -> VarianceMode {
        self.variance_mode
    }

    /// Number of reverse steps
    pub fn num_steps(&self) -> usize {
        self.schedule.len()
    }

    pub fn betas(&self) -> &[f64] {
        self.schedule.betas()
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    fn check_t(&self, t: usize) -> Result<()> {
        if t >= self.num_steps() {
            return Err(Error::TimestepOutOfRange {
                index: t,
                len: self.num_steps(),
            });
        }
        Ok(())
    }

    /// Original-schedule timesteps for a batch at respaced index `t`
    pub fn model_timesteps<B: Backend>(
        &self,
        t: usize,
        batch: usize,
        device: &B::Device,
    ) -> Result<Tensor<B, 1, Int>> {
        let timestep = self.schedule.model_timestep(t)? as i64;
        Ok(Tensor::from_data(
            TensorData::new(vec![timestep; batch], [batch]),
            device,
        ))
    }

    /// Noise `x_0` to step `t` with externally supplied `noise`
    pub fn forward_noise<B: Backend>(
        &self,
        x_0: Tensor<B, 4>,
        t: usize,
        noise: Tensor<B, 4>,
    ) -> Result<Tensor<B, 4>> {
        self.check_t(t)?;
        check_same_shape(&x_0, &noise)?;
        let a = self.alphas_cumprod[t];
        Ok(x_0 * a.sqrt() + noise * (1.0 - a).sqrt())
    }

    /// Reconstruct `x_0` from `x_t` and a noise estimate
    pub fn predict_x0<B: Backend>(
        &self,
        x_t: Tensor<B, 4>,
        t: usize,
        epsilon: Tensor<B, 4>,
    ) -> Result<Tensor<B, 4>> {
        self.check_t(t)?;
        check_same_shape(&x_t, &epsilon)?;
        let a = self.alphas_cumprod[t];
        let x_0 = (x_t - epsilon * (1.0 - a).sqrt()) / a.sqrt();
        Ok(if self.clip_denoised {
            x_0.clamp(-1.0, 1.0)
        } else {
            x_0
        })
    }

    /// Score of the noised marginal implied by a noise estimate
    ///
    /// `grad log p_t(x_t) = -epsilon / sqrt(1 - a_t)`
    pub fn score_from_epsilon<B: Backend>(
        &self,
        epsilon: Tensor<B, 4>,
        t: usize,
    ) -> Result<Tensor<B, 4>> {
        self.check_t(t)?;
        let a = self.alphas_cumprod[t];
        Ok(epsilon.div_scalar(-(1.0 - a).sqrt()))
    }

    /// Mean and variance of `p(x_{t-1} | x_t)`
    pub fn posterior<B: Backend>(
        &self,
        x_t: Tensor<B, 4>,
        t: usize,
        output: &DenoiserOutput<B>,
    ) -> Result<Posterior<B>> {
        let pred_x0 = self.predict_x0(x_t.clone(), t, output.epsilon.clone())?;
        let mean =
            pred_x0.clone() * self.posterior_mean_coef1[t] + x_t.clone() * self.posterior_mean_coef2[t];

        let (variance, log_variance) = match self.variance_mode {
            VarianceMode::Beta => {
                let v = self.fixed_large_variance[t];
                (x_t.ones_like() * v, x_t.ones_like() * v.ln())
            }
            VarianceMode::BetaTilde => {
                let v = self.posterior_variance[t];
                let log_v = self.posterior_log_variance_clipped[t];
                (x_t.ones_like() * v, x_t.ones_like() * log_v)
            }
            VarianceMode::Learned => {
                let raw = output.variance.clone().ok_or(Error::MissingVariance)?;
                check_same_shape(&x_t, &raw)?;
                let min_log = self.posterior_log_variance_clipped[t];
                let max_log = self.betas()[t].ln();
                let frac = (raw + 1.0) / 2.0;
                let log_variance = frac.clone() * max_log + (frac.neg() + 1.0) * min_log;
                (log_variance.clone().exp(), log_variance)
            }
        };

        Ok(Posterior {
            mean,
            variance,
            log_variance,
            pred_x0,
        })
    }

    /// Draw `x_{t-1}` given a (possibly shifted) mean and the log variance
    ///
    /// Deterministic at `t = 0`: the mean is returned and `noise` is unused.
    pub fn sample_from<B: Backend>(
        &self,
        mean: Tensor<B, 4>,
        log_variance: Tensor<B, 4>,
        t: usize,
        noise: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        if t == 0 {
            mean
        } else {
            mean + (log_variance * 0.5).exp() * noise
        }
    }

    /// One unguided reverse step `x_t -> x_{t-1}`
    pub fn reverse_step<B: Backend>(
        &self,
        x_t: Tensor<B, 4>,
        t: usize,
        output: &DenoiserOutput<B>,
        noise: Tensor<B, 4>,
    ) -> Result<Tensor<B, 4>> {
        let posterior = self.posterior(x_t, t, output)?;
        Ok(self.sample_from(posterior.mean, posterior.log_variance, t, noise))
    }
}

fn check_same_shape<B: Backend>(a: &Tensor<B, 4>, b: &Tensor<B, 4>) -> Result<()> {
    let (expected, actual) = (a.dims(), b.dims());
    if expected != actual {
        return Err(Error::ShapeMismatch {
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::BetaSchedule;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn process(mode: VarianceMode, learned: bool) -> Result<DiffusionProcess> {
        let schedule = Schedule::new(BetaSchedule::Linear, 1000, 250)?;
        DiffusionProcess::new(
            schedule,
            mode,
            DenoiserCapabilities {
                learned_variance: learned,
                class_conditional: false,
            },
        )
    }

    fn max_abs_diff(a: Tensor<TestBackend, 4>, b: Tensor<TestBackend, 4>) -> f32 {
        (a - b).abs().max().into_scalar()
    }

    #[test]
    fn test_learned_mode_requires_variance_output() {
        let err = process(VarianceMode::Learned, false).unwrap_err();
        assert!(matches!(err, Error::LearnedVarianceUnsupported));
        assert!(process(VarianceMode::Learned, true).is_ok());
    }

    #[test]
    fn test_first_step_posterior_mean_is_reconstruction() {
        let proc = process(VarianceMode::BetaTilde, false).unwrap();
        assert!((proc.posterior_mean_coef1[0] - 1.0).abs() < 1e-9);
        assert!(proc.posterior_mean_coef2[0].abs() < 1e-12);
    }

    #[test]
    fn test_forward_then_final_reverse_step_is_identity() {
        let device = Default::default();
        let proc = process(VarianceMode::Beta, false).unwrap();
        let x_0 = Tensor::<TestBackend, 4>::from_data(
            TensorData::new(vec![0.3f32, -0.7, 0.1, 0.9], [1, 1, 2, 2]),
            &device,
        );
        let zeros = x_0.zeros_like();
        let x_t = proc.forward_noise(x_0.clone(), 0, zeros.clone()).unwrap();
        let output = DenoiserOutput::epsilon(zeros.clone());
        let x_prev = proc.reverse_step(x_t, 0, &output, zeros).unwrap();
        assert!(max_abs_diff(x_prev, x_0) < 1e-5);
    }

    #[test]
    fn test_final_step_ignores_noise() {
        let device = Default::default();
        let proc = process(VarianceMode::BetaTilde, false).unwrap();
        let x_t = Tensor::<TestBackend, 4>::ones([2, 1, 2, 2], &device);
        let output = DenoiserOutput::epsilon(x_t.zeros_like());
        let a = proc
            .reverse_step(x_t.clone(), 0, &output, x_t.zeros_like())
            .unwrap();
        let b = proc
            .reverse_step(x_t.clone(), 0, &output, x_t.ones_like() * 5.0)
            .unwrap();
        assert!(max_abs_diff(a, b) < 1e-7);
    }

    #[test]
    fn test_learned_variance_interpolates_between_bounds() {
        let device = Default::default();
        let proc = process(VarianceMode::Learned, true).unwrap();
        let t = 100;
        let x_t = Tensor::<TestBackend, 4>::zeros([1, 1, 2, 2], &device);
        let upper = DenoiserOutput {
            epsilon: x_t.zeros_like(),
            variance: Some(x_t.ones_like()),
        };
        let lower = DenoiserOutput {
            epsilon: x_t.zeros_like(),
            variance: Some(x_t.ones_like().neg()),
        };
        let hi: f32 = proc
            .posterior(x_t.clone(), t, &upper)
            .unwrap()
            .variance
            .max()
            .into_scalar();
        let lo: f32 = proc
            .posterior(x_t, t, &lower)
            .unwrap()
            .variance
            .max()
            .into_scalar();
        assert!((hi as f64 - proc.betas()[t]).abs() < 1e-6);
        assert!((lo as f64 - proc.posterior_variance[t]).abs() < 1e-6);
    }

    #[test]
    fn test_shape_mismatch_is_reported() {
        let device = Default::default();
        let proc = process(VarianceMode::Beta, false).unwrap();
        let x = Tensor::<TestBackend, 4>::zeros([1, 1, 2, 2], &device);
        let eps = Tensor::<TestBackend, 4>::zeros([1, 1, 3, 3], &device);
        let err = proc.predict_x0(x, 5, eps).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }
}
