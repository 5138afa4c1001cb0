//! Annealed target of the correction chains
//!
//! At respaced timestep `t` the chains target the guided noised marginal
//! `p_t(x) p(y | x)^lambda`, whose score is the denoiser score
//! `-eps(x, t) / sqrt(1 - a_t)` plus the guidance gradient. Both come from a
//! single denoiser evaluation.

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn_guided_diffusion::{Denoiser, DiffusionProcess};
use burn_guided_mcmc::AnnealedTarget;

use crate::guidance::Guidance;
use crate::Error;

/// Guided score over a fixed label batch
pub struct GuidedTarget<'a, B: AutodiffBackend> {
    process: &'a DiffusionProcess,
    denoiser: &'a dyn Denoiser<B>,
    guidance: &'a dyn Guidance<B>,
    labels: Tensor<B, 1, Int>,
}

impl<'a, B: AutodiffBackend> GuidedTarget<'a, B> {
    pub fn new(
        process: &'a DiffusionProcess,
        denoiser: &'a dyn Denoiser<B>,
        guidance: &'a dyn Guidance<B>,
        labels: Tensor<B, 1, Int>,
    ) -> Self {
        Self {
            process,
            denoiser,
            guidance,
            labels,
        }
    }
}

fn into_mcmc(err: Error) -> burn_guided_mcmc::Error {
    match err {
        Error::Diffusion(e) => e.into(),
        Error::Mcmc(e) => e,
        other => burn_guided_mcmc::Error::Target(Box::new(other)),
    }
}

impl<B: AutodiffBackend> AnnealedTarget<B> for GuidedTarget<'_, B> {
    fn score(&self, x: Tensor<B, 4>, t: usize) -> burn_guided_mcmc::Result<Tensor<B, 4>> {
        let guided = self
            .guidance
            .guide(self.process, self.denoiser, x.detach(), t, self.labels.clone())
            .map_err(into_mcmc)?;
        let score = self.process.score_from_epsilon(guided.output.epsilon, t)?;
        Ok(score + guided.gradient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guidance::{ClassifierFullGuidance, NoGuidance};
    use burn::backend::Autodiff;
    use burn_guided_diffusion::{
        BetaSchedule, DenoiserCapabilities, DenoiserOutput, GaussianMixtureConfig, Schedule,
        VarianceMode,
    };
    use burn_ndarray::NdArray;
    use std::cell::Cell;

    type TestBackend = Autodiff<NdArray<f32>>;

    /// Counts forward passes of the wrapped denoiser
    struct CountingDenoiser<D> {
        inner: D,
        calls: Cell<usize>,
    }

    impl<D: Denoiser<TestBackend>> Denoiser<TestBackend> for CountingDenoiser<D> {
        fn capabilities(&self) -> DenoiserCapabilities {
            self.inner.capabilities()
        }

        fn predict(
            &self,
            x_t: Tensor<TestBackend, 4>,
            timesteps: Tensor<TestBackend, 1, Int>,
            labels: Option<Tensor<TestBackend, 1, Int>>,
        ) -> DenoiserOutput<TestBackend> {
            self.calls.set(self.calls.get() + 1);
            self.inner.predict(x_t, timesteps, labels)
        }
    }

    #[test]
    fn test_unguided_score_matches_single_class_gaussian() {
        let device = Default::default();
        let schedule = Schedule::new(BetaSchedule::Linear, 100, 10).unwrap();
        let model = GaussianMixtureConfig {
            means: vec![0.0],
            data_std: 1.0,
            ..Default::default()
        }
        .init::<TestBackend>(schedule.original_betas(), &device)
        .unwrap();
        let process = DiffusionProcess::new(schedule, VarianceMode::Beta, model.capabilities()).unwrap();
        let labels = Tensor::from_data(TensorData::new(vec![0i64; 3], [3]), &device);
        let target = GuidedTarget::new(&process, &model, &NoGuidance, labels);

        // unit-variance data stays unit variance under noising: score = -x
        let x = Tensor::<TestBackend, 4>::ones([3, 1, 2, 2], &device) * 0.7;
        let score = target.score(x.clone(), 4).unwrap();
        let err: f32 = (score + x).abs().max().into_scalar();
        assert!(err < 1e-4);
    }

    #[test]
    fn test_full_guidance_score_runs_denoiser_once() {
        let device = Default::default();
        let schedule = Schedule::new(BetaSchedule::Linear, 100, 10).unwrap();
        let model = GaussianMixtureConfig::default()
            .init::<TestBackend>(schedule.original_betas(), &device)
            .unwrap();
        let process = DiffusionProcess::new(schedule, VarianceMode::Beta, model.capabilities()).unwrap();
        let guidance = ClassifierFullGuidance::new(model.clone(), 1.0);
        let denoiser = CountingDenoiser {
            inner: model.clone(),
            calls: Cell::new(0),
        };
        let labels = Tensor::from_data(TensorData::new(vec![0i64, 1], [2]), &device);
        let target = GuidedTarget::new(&process, &denoiser, &guidance, labels.clone());

        let x = Tensor::<TestBackend, 4>::ones([2, 1, 2, 2], &device) * 0.2;
        let score = target.score(x.clone(), 6).unwrap();
        assert_eq!(denoiser.calls.get(), 1);

        // same value as an unguided score plus a separately computed gradient
        let plain = GuidedTarget::new(&process, &model, &NoGuidance, labels.clone())
            .score(x.clone(), 6)
            .unwrap();
        let gradient = guidance.guide(&process, &model, x, 6, labels).unwrap().gradient;
        let err: f32 = (score - plain - gradient).abs().max().into_scalar();
        assert!(err < 1e-5);
    }
}
