//! Guided reverse diffusion
//!
//! [`GuidedSampler`] walks the respaced schedule from `T' - 1` down to `0`.
//! At each step `t` it
//!
//! 1. predicts the noise in `x_t`,
//! 2. shifts the reverse-step mean by the posterior variance times the
//!    guidance gradient,
//! 3. draws `x_{t-1}` (the mean itself at `t = 0`),
//! 4. hands `x_{t-1}` to the corrector, if one is attached and `t - 1` lies
//!    above the lower cutoff.
//!
//! Requests larger than one device batch run the whole loop once per
//! sub-batch, in order, and concatenate the results.

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn_guided_diffusion::{Denoiser, DiffusionProcess, NoiseSource};
use burn_guided_mcmc::{BatchingStrategy, Corrector};

use crate::debug::{check_finite, tensor_stats};
use crate::guidance::Guidance;
use crate::target::GuidedTarget;
use crate::{Error, Result};

/// Information passed to the step callback
pub struct StepInfo<B: Backend> {
    /// Current step (0-indexed)
    pub step: usize,
    /// Total number of steps per sub-batch
    pub total_steps: usize,
    /// Respaced timestep the step started from
    pub timestep: usize,
    /// Original-schedule timestep handed to the models
    pub model_timestep: usize,
    /// Sub-batch index (0 unless stacking)
    pub batch_index: usize,
    /// Number of sub-batches
    pub num_batches: usize,
    /// `x_{t-1}` when trajectories are kept
    pub output: Option<Tensor<B, 4>>,
}

/// What to sample
#[derive(Debug, Clone)]
pub struct SampleRequest<'a> {
    pub num_samples: usize,
    /// One target class per sample
    pub labels: &'a [i64],
    /// `[channels, height, width]`
    pub shape: [usize; 3],
    pub batching: BatchingStrategy,
    /// Keep every intermediate batch
    pub save_trajectory: bool,
    /// Fail on NaN/Inf after every step
    pub check_finite: bool,
}

impl<'a> SampleRequest<'a> {
    pub fn new(num_samples: usize, labels: &'a [i64], shape: [usize; 3]) -> Self {
        Self {
            num_samples,
            labels,
            shape,
            batching: BatchingStrategy::Single,
            save_trajectory: false,
            check_finite: false,
        }
    }

    pub fn with_batching(mut self, batching: BatchingStrategy) -> Self {
        self.batching = batching;
        self
    }

    pub fn with_trajectory(mut self, save: bool) -> Self {
        self.save_trajectory = save;
        self
    }

    pub fn with_finite_check(mut self, check: bool) -> Self {
        self.check_finite = check;
        self
    }
}

/// Result of a sampling call
#[derive(Debug, Clone)]
pub struct SampleOutput<B: Backend> {
    /// `[num_samples, channels, height, width]`
    pub samples: Tensor<B, 4>,
    /// Initial noise followed by the state after every step, when requested
    pub trajectory: Option<Vec<Tensor<B, 4>>>,
}

/// Reverse-diffusion driver with guidance and optional correction
pub struct GuidedSampler<B, D, G>
where
    B: AutodiffBackend,
    D: Denoiser<B>,
    G: Guidance<B>,
{
    process: DiffusionProcess,
    denoiser: D,
    guidance: G,
    /// Correct only timesteps strictly above this one
    mcmc_lower_t: Option<usize>,
    _backend: std::marker::PhantomData<B>,
}

impl<B, D, G> GuidedSampler<B, D, G>
where
    B: AutodiffBackend,
    D: Denoiser<B>,
    G: Guidance<B>,
{
    /// Fails when the process needs a variance output the denoiser does not produce
    pub fn new(process: DiffusionProcess, denoiser: D, guidance: G) -> Result<Self> {
        if process.variance_mode() == burn_guided_diffusion::VarianceMode::Learned
            && !denoiser.capabilities().learned_variance
        {
            return Err(burn_guided_diffusion::Error::LearnedVarianceUnsupported.into());
        }
        Ok(Self {
            process,
            denoiser,
            guidance,
            mcmc_lower_t: None,
            _backend: std::marker::PhantomData,
        })
    }

    pub fn with_mcmc_lower_t(mut self, lower_t: Option<usize>) -> Self {
        self.mcmc_lower_t = lower_t;
        self
    }

    pub fn process(&self) -> &DiffusionProcess {
        &self.process
    }

    pub fn denoiser(&self) -> &D {
        &self.denoiser
    }

    /// Respaced timesteps that get corrected, in visiting order
    pub fn corrected_timesteps(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.process.num_steps().saturating_sub(1))
            .rev()
            .filter(|s| self.mcmc_lower_t.map_or(true, |lower| *s > lower))
    }

    fn validate(&self, request: &SampleRequest<'_>) -> Result<Vec<usize>> {
        if request.labels.len() != request.num_samples {
            return Err(Error::LabelCount {
                expected: request.num_samples,
                actual: request.labels.len(),
            });
        }
        if request.shape.iter().any(|d| *d == 0) {
            return Err(Error::InvalidConfig(format!(
                "sample shape {:?} has an empty dimension",
                request.shape
            )));
        }
        if let Some(num_classes) = self.guidance.num_classes() {
            if let Some(&label) = request
                .labels
                .iter()
                .find(|l| **l < 0 || **l as usize >= num_classes)
            {
                return Err(Error::LabelOutOfRange { label, num_classes });
            }
        }
        Ok(request.batching.sub_batches(request.num_samples)?)
    }

    /// Run the reverse loop for `request`
    ///
    /// Labels, shapes and the corrector's step sizes are validated before any
    /// tensor is created. The corrector, when given, is notified at every
    /// sub-batch boundary.
    pub fn sample<F>(
        &self,
        request: &SampleRequest<'_>,
        device: &B::Device,
        noise: &mut NoiseSource,
        mut corrector: Option<&mut dyn Corrector<B>>,
        mut callback: F,
    ) -> Result<SampleOutput<B>>
    where
        F: FnMut(StepInfo<B>),
    {
        let sub_batches = self.validate(request)?;
        if let Some(c) = corrector.as_deref() {
            let timesteps: Vec<usize> = self.corrected_timesteps().collect();
            c.prepare(&timesteps)?;
        }
        let num_batches = sub_batches.len();
        tracing::info!(
            samples = request.num_samples,
            batches = num_batches,
            steps = self.process.num_steps(),
            corrected = corrector.is_some(),
            "sampling"
        );

        let mut samples = Vec::with_capacity(num_batches);
        let mut trajectories: Vec<Vec<Tensor<B, 4>>> = Vec::with_capacity(num_batches);
        let mut offset = 0;
        for (batch_index, size) in sub_batches.into_iter().enumerate() {
            let labels = &request.labels[offset..offset + size];
            offset += size;
            let (x, trajectory) = self.sample_batch(
                request,
                labels,
                batch_index,
                num_batches,
                device,
                noise,
                corrector.as_mut().map(|c| &mut **c as &mut dyn Corrector<B>),
                &mut callback,
            )?;
            samples.push(x);
            trajectories.push(trajectory);
        }

        let trajectory = request.save_trajectory.then(|| {
            let steps = trajectories.first().map_or(0, Vec::len);
            (0..steps)
                .map(|i| Tensor::cat(trajectories.iter().map(|tr| tr[i].clone()).collect(), 0))
                .collect()
        });
        Ok(SampleOutput {
            samples: Tensor::cat(samples, 0),
            trajectory,
        })
    }

    /// Stacked sampling: `batch_size` samples per device batch
    pub fn sample_stacking<F>(
        &self,
        request: &SampleRequest<'_>,
        batch_size: usize,
        device: &B::Device,
        noise: &mut NoiseSource,
        corrector: Option<&mut dyn Corrector<B>>,
        callback: F,
    ) -> Result<SampleOutput<B>>
    where
        F: FnMut(StepInfo<B>),
    {
        let request = request
            .clone()
            .with_batching(BatchingStrategy::Stacked {
                sub_batch: batch_size,
            });
        self.sample(&request, device, noise, corrector, callback)
    }

    #[allow(clippy::too_many_arguments)]
    fn sample_batch<F>(
        &self,
        request: &SampleRequest<'_>,
        labels: &[i64],
        batch_index: usize,
        num_batches: usize,
        device: &B::Device,
        noise: &mut NoiseSource,
        mut corrector: Option<&mut (dyn Corrector<B> + '_)>,
        callback: &mut F,
    ) -> Result<(Tensor<B, 4>, Vec<Tensor<B, 4>>)>
    where
        F: FnMut(StepInfo<B>),
    {
        let size = labels.len();
        let [channels, height, width] = request.shape;
        let dims = [size, channels, height, width];
        let labels: Tensor<B, 1, Int> =
            Tensor::from_data(TensorData::new(labels.to_vec(), [size]), device);
        let target = GuidedTarget::new(&self.process, &self.denoiser, &self.guidance, labels.clone());

        if let Some(c) = corrector.as_deref_mut() {
            c.begin_batch(batch_index, size);
        }

        let mut x = noise.normal::<B, 4>(dims, device);
        let mut trajectory = Vec::new();
        if request.save_trajectory {
            trajectory.push(x.clone());
        }

        let total_steps = self.process.num_steps();
        for (step, t) in self.process.schedule().reverse_indices().enumerate() {
            let guided =
                self.guidance
                    .guide(&self.process, &self.denoiser, x.clone(), t, labels.clone())?;
            let posterior = self.process.posterior(x, t, &guided.output)?;
            let mean = posterior.mean + posterior.variance * guided.gradient;
            let z = if t > 0 {
                noise.normal::<B, 4>(dims, device)
            } else {
                mean.zeros_like()
            };
            x = self
                .process
                .sample_from(mean, posterior.log_variance, t, z)
                .detach();

            if t > 0 {
                let level = t - 1;
                let above_cutoff = self.mcmc_lower_t.map_or(true, |lower| level > lower);
                if let (Some(c), true) = (corrector.as_deref_mut(), above_cutoff) {
                    x = c.correct(&target, x, level, noise)?;
                }
            }

            if request.check_finite {
                check_finite(&x, step, t)?;
            }
            if step % 50 == 0 || t == 0 {
                tracing::debug!(step, t, stats = %tensor_stats(&x), "reverse step");
            }
            if request.save_trajectory {
                trajectory.push(x.clone());
            }

            callback(StepInfo {
                step,
                total_steps,
                timestep: t,
                model_timestep: self.process.schedule().model_timestep(t)?,
                batch_index,
                num_batches,
                output: request.save_trajectory.then(|| x.clone()),
            });
        }

        if let Some(c) = corrector {
            c.end_batch();
        }
        tracing::info!(batch = batch_index, size, "sub-batch done");
        Ok((x, trajectory))
    }
}
