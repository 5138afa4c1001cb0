//! Wiring between configs, the guided sampler and the MCMC crate
//!
//! [`find_step_sizes`] runs the guided sampler with a [`StepSizeCalibrator`]
//! in the correction slot and returns the calibrated table. The remaining
//! helpers build correction samplers and step-size tables from a
//! [`SimulationConfig`].

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn_guided_diffusion::{Denoiser, DiffusionProcess, NoiseSource};
use burn_guided_mcmc::{
    AnnealedHmcSampler, AnnealedLangevinSampler, CalibrationOutcome, CorrectionSampler, Corrector,
    FixedStepCorrector, McmcMethod, StepSizeCalibrator, StepSizeShape, StepSizeTable,
};

use crate::config::{SimulationConfig, StepSizeParams, StepSizeSource};
use crate::guidance::Guidance;
use crate::sampler::{GuidedSampler, SampleRequest};
use crate::store::{StepSizeKey, StepSizeStore};
use crate::{Error, Result};

/// Correction sampler for `method` over the respaced schedule of `process`
pub fn correction_sampler<B: Backend>(
    method: McmcMethod,
    process: &DiffusionProcess,
    n_trapets: Option<usize>,
) -> Result<Box<dyn CorrectionSampler<B>>> {
    Ok(match method {
        McmcMethod::Hmc => Box::new(AnnealedHmcSampler::for_schedule(process.betas())?),
        McmcMethod::La => match n_trapets {
            Some(n) => Box::new(AnnealedLangevinSampler::new(n)?),
            None => Box::new(AnnealedLangevinSampler::default()),
        },
    })
}

/// `factor * beta_t^exponent` for every timestep in `timesteps`
pub fn parametric_step_sizes(
    process: &DiffusionProcess,
    params: StepSizeParams,
    timesteps: impl IntoIterator<Item = usize>,
) -> Result<StepSizeTable> {
    Ok(StepSizeTable::from_betas(
        process.betas(),
        params.factor,
        params.exponent,
        timesteps,
    )?)
}

/// Step sizes of the configured run, loaded or parametric
///
/// Fails with [`MissingStepSize`](burn_guided_mcmc::Error::MissingStepSize)
/// when a timestep the sampler corrects has no entry.
pub fn configured_step_sizes<B, D, G>(
    config: &SimulationConfig,
    sampler: &GuidedSampler<B, D, G>,
    store: &StepSizeStore,
) -> Result<StepSizeTable>
where
    B: AutodiffBackend,
    D: Denoiser<B>,
    G: Guidance<B>,
{
    let method = config
        .mcmc_method
        .ok_or_else(|| Error::InvalidConfig("no mcmc_method configured".into()))?;
    let shape = config
        .mcmc_stepsizes
        .as_ref()
        .map_or(StepSizeShape::Scalar, |s| s.shape);
    let numel = config.sample_shape().iter().product();
    let table = match config.step_size_source()? {
        StepSizeSource::Load { bounds } => {
            store.load(&StepSizeKey::new(config.name.clone(), method, bounds))?
        }
        StepSizeSource::Params(params) => {
            parametric_step_sizes(sampler.process(), params, sampler.corrected_timesteps())?
        }
    };
    table.require_all(sampler.corrected_timesteps())?;
    Ok(table.with_shape(shape, numel))
}

/// Fixed-step corrector of the configured run, `None` without MCMC
pub fn configured_corrector<B, D, G>(
    config: &SimulationConfig,
    sampler: &GuidedSampler<B, D, G>,
    store: &StepSizeStore,
) -> Result<Option<FixedStepCorrector<B>>>
where
    B: AutodiffBackend,
    D: Denoiser<B>,
    G: Guidance<B>,
{
    let Some(method) = config.mcmc_method else {
        return Ok(None);
    };
    let table = configured_step_sizes(config, sampler, store)?;
    let correction = correction_sampler::<B>(method, sampler.process(), config.n_trapets)?;
    Ok(Some(FixedStepCorrector::new(
        correction,
        table,
        config.mcmc_steps.unwrap_or(1),
    )))
}

/// Run the guided sampler with `calibrator` as corrector
///
/// Every sub-batch of `request` is sampled in full; the generated samples are
/// discarded. The outcome holds the table of the last sub-batch and the search
/// records of all of them.
pub fn find_step_sizes<B, D, G>(
    sampler: &GuidedSampler<B, D, G>,
    mut calibrator: StepSizeCalibrator<B>,
    request: &SampleRequest<'_>,
    device: &B::Device,
    noise: &mut NoiseSource,
) -> Result<CalibrationOutcome>
where
    B: AutodiffBackend,
    D: Denoiser<B>,
    G: Guidance<B>,
{
    let corrector: &mut dyn Corrector<B> = &mut calibrator;
    sampler.sample(request, device, noise, Some(corrector), |_| {})?;
    let outcome = calibrator.into_outcome();
    let unresolved: usize = outcome.batches.iter().map(|b| b.unresolved().count()).sum();
    tracing::info!(
        entries = outcome.table.len(),
        batches = outcome.batches.len(),
        unresolved,
        "calibration finished"
    );
    Ok(outcome)
}
