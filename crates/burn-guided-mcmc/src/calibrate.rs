//! Per-timestep correction drivers
//!
//! The guided sampler hands every corrected timestep to a [`Corrector`]:
//!
//! - [`FixedStepCorrector`] runs the chain with step sizes from a table
//!   (production sampling).
//! - [`StepSizeCalibrator`] searches, at every timestep, for a step size whose
//!   acceptance falls inside [`AcceptanceBounds`] and records the outcome
//!   (calibration runs).
//!
//! Calibration over more samples than fit in one batch uses the same
//! calibrator with [`BatchingStrategy::Stacked`]: the sampler runs the reverse
//! loop once per sub-batch and the calibrator starts each timestep's search
//! from the step size the previous sub-batch resolved. A single batch is the
//! one-sub-batch case of the same algorithm.
//!
//! # Search
//!
//! Acceptance falls as the step size grows. Starting from the initial (or
//! warm-start) step size the calibrator multiplies the step by
//! `adjust_factor` while acceptance is above the band and divides while it is
//! below, until the band is bracketed; after that it bisects geometrically.
//! The search stops at the first trial inside the band or after `max_iter`
//! trials. An unresolved timestep keeps the trial closest to the band and is
//! flagged in its [`TimestepRecord`].

use burn::prelude::*;
use burn_guided_diffusion::NoiseSource;
use serde::{Deserialize, Serialize};

use crate::sampler::CorrectionSampler;
use crate::step_size::{StepSize, StepSizeTable};
use crate::target::AnnealedTarget;
use crate::{Error, Result};

/// Target acceptance band `[lower, upper]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AcceptanceBounds {
    pub lower: f64,
    pub upper: f64,
}

impl AcceptanceBounds {
    pub fn new(lower: f64, upper: f64) -> Result<Self> {
        let bounds = Self { lower, upper };
        bounds.validate()?;
        Ok(bounds)
    }

    pub fn validate(&self) -> Result<()> {
        let ok = self.lower.is_finite()
            && self.upper.is_finite()
            && 0.0 <= self.lower
            && self.lower <= self.upper
            && self.upper <= 1.0;
        if !ok {
            return Err(Error::InvalidBounds {
                lower: self.lower,
                upper: self.upper,
            });
        }
        Ok(())
    }

    pub fn contains(&self, acceptance: f64) -> bool {
        self.lower <= acceptance && acceptance <= self.upper
    }

    /// Distance from `acceptance` to the band, `0` inside it
    pub fn distance(&self, acceptance: f64) -> f64 {
        if acceptance < self.lower {
            self.lower - acceptance
        } else if acceptance > self.upper {
            acceptance - self.upper
        } else {
            0.0
        }
    }

    /// Compact form used in file names, e.g. `0.6_0.8`
    pub fn label(&self) -> String {
        format!("{}_{}", self.lower, self.upper)
    }
}

impl Default for AcceptanceBounds {
    fn default() -> Self {
        Self {
            lower: 0.6,
            upper: 0.8,
        }
    }
}

/// Search parameters of the calibrator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSettings {
    pub bounds: AcceptanceBounds,
    /// Trials per timestep
    pub max_iter: usize,
    /// Multiplier applied while the band is not yet bracketed
    pub adjust_factor: f64,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            bounds: AcceptanceBounds::default(),
            max_iter: 10,
            adjust_factor: 2.0,
        }
    }
}

impl CalibrationSettings {
    pub fn validate(&self) -> Result<()> {
        self.bounds.validate()?;
        if self.max_iter == 0 {
            return Err(Error::InvalidParameter("max_iter must be at least 1".into()));
        }
        if !(self.adjust_factor.is_finite() && self.adjust_factor > 1.0) {
            return Err(Error::InvalidParameter(format!(
                "adjust_factor must be greater than 1, got {}",
                self.adjust_factor
            )));
        }
        Ok(())
    }
}

/// How a request of `total` samples is split into device batches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BatchingStrategy {
    /// Everything in one batch
    #[default]
    Single,
    /// Sequential sub-batches of at most `sub_batch` samples
    Stacked { sub_batch: usize },
}

impl BatchingStrategy {
    /// Single batch when `total` fits in `batch_size`, stacked otherwise
    pub fn for_batch_size(total: usize, batch_size: usize) -> Self {
        if total <= batch_size {
            BatchingStrategy::Single
        } else {
            BatchingStrategy::Stacked {
                sub_batch: batch_size,
            }
        }
    }

    /// Sizes of the sub-batches covering `total` samples, in order
    pub fn sub_batches(&self, total: usize) -> Result<Vec<usize>> {
        if total == 0 {
            return Err(Error::EmptyBatch);
        }
        match *self {
            BatchingStrategy::Single => Ok(vec![total]),
            BatchingStrategy::Stacked { sub_batch: 0 } => Err(Error::EmptyBatch),
            BatchingStrategy::Stacked { sub_batch } => {
                let mut sizes = vec![sub_batch; total / sub_batch];
                if total % sub_batch != 0 {
                    sizes.push(total % sub_batch);
                }
                Ok(sizes)
            }
        }
    }
}

/// Search history of one timestep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestepRecord {
    pub t: usize,
    /// Magnitude of every trial step size, in trial order
    pub step_sizes: Vec<f64>,
    /// Acceptance of every trial, in trial order
    pub acceptances: Vec<f64>,
    pub iterations: usize,
    /// Acceptance of the kept trial
    pub acceptance: f64,
    /// Kept trial lies inside the band
    pub resolved: bool,
}

/// Table and records of one sub-batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationBatch {
    pub index: usize,
    pub size: usize,
    pub table: StepSizeTable,
    /// In visiting order, descending timesteps
    pub records: Vec<TimestepRecord>,
}

impl CalibrationBatch {
    fn new(index: usize, size: usize) -> Self {
        Self {
            index,
            size,
            table: StepSizeTable::new(),
            records: Vec::new(),
        }
    }

    pub fn unresolved(&self) -> impl Iterator<Item = &TimestepRecord> {
        self.records.iter().filter(|r| !r.resolved)
    }
}

/// Result of a calibration run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationOutcome {
    /// Final step sizes, taken from the last sub-batch
    pub table: StepSizeTable,
    /// Records of the last sub-batch
    pub records: Vec<TimestepRecord>,
    /// Every sub-batch, kept for diagnostics
    pub batches: Vec<CalibrationBatch>,
}

/// Per-timestep correction hook of the guided sampler
pub trait Corrector<B: Backend> {
    /// Refine `x` at respaced timestep `t`
    fn correct(
        &mut self,
        target: &dyn AnnealedTarget<B>,
        x: Tensor<B, 4>,
        t: usize,
        noise: &mut NoiseSource,
    ) -> Result<Tensor<B, 4>>;

    /// Fail if any of `timesteps` could not be corrected
    ///
    /// Called once before a run touches the device.
    fn prepare(&self, _timesteps: &[usize]) -> Result<()> {
        Ok(())
    }

    /// A new sub-batch of `size` samples starts
    fn begin_batch(&mut self, _index: usize, _size: usize) {}

    /// The current sub-batch reached `t = 0`
    fn end_batch(&mut self) {}
}

/// Correction with known step sizes
pub struct FixedStepCorrector<B: Backend> {
    sampler: Box<dyn CorrectionSampler<B>>,
    table: StepSizeTable,
    n_steps: usize,
}

impl<B: Backend> FixedStepCorrector<B> {
    pub fn new(sampler: Box<dyn CorrectionSampler<B>>, table: StepSizeTable, n_steps: usize) -> Self {
        Self {
            sampler,
            table,
            n_steps,
        }
    }

    pub fn table(&self) -> &StepSizeTable {
        &self.table
    }
}

impl<B: Backend> Corrector<B> for FixedStepCorrector<B> {
    fn correct(
        &mut self,
        target: &dyn AnnealedTarget<B>,
        x: Tensor<B, 4>,
        t: usize,
        noise: &mut NoiseSource,
    ) -> Result<Tensor<B, 4>> {
        let step_size = self.table.require(t)?;
        let (x, stats) = self
            .sampler
            .correct(target, x, t, step_size, self.n_steps, noise)?;
        tracing::debug!(t, acceptance = stats.mean(), "corrected");
        Ok(x)
    }

    fn prepare(&self, timesteps: &[usize]) -> Result<()> {
        self.table.require_all(timesteps.iter().copied())
    }
}

struct Trial<B: Backend> {
    x: Tensor<B, 4>,
    step_size: StepSize,
    acceptance: f64,
    distance: f64,
}

/// Acceptance-band step-size search wrapped around a correction sampler
pub struct StepSizeCalibrator<B: Backend> {
    sampler: Box<dyn CorrectionSampler<B>>,
    n_steps: usize,
    settings: CalibrationSettings,
    initial: StepSizeTable,
    /// Latest resolved step size per timestep, carried across sub-batches
    warm: StepSizeTable,
    current: Option<CalibrationBatch>,
    batches: Vec<CalibrationBatch>,
}

impl<B: Backend> StepSizeCalibrator<B> {
    /// `initial` holds the first guess for every timestep that will be corrected
    pub fn new(
        sampler: Box<dyn CorrectionSampler<B>>,
        n_steps: usize,
        settings: CalibrationSettings,
        initial: StepSizeTable,
    ) -> Result<Self> {
        settings.validate()?;
        if let Some((t, _)) = initial.iter().find(|(_, s)| !s.is_valid()) {
            return Err(Error::InvalidParameter(format!(
                "initial step size for timestep {t} must be positive and finite"
            )));
        }
        Ok(Self {
            sampler,
            n_steps,
            settings,
            initial,
            warm: StepSizeTable::new(),
            current: None,
            batches: Vec::new(),
        })
    }

    pub fn settings(&self) -> &CalibrationSettings {
        &self.settings
    }

    /// Sub-batches finished so far
    pub fn batches(&self) -> &[CalibrationBatch] {
        &self.batches
    }

    /// Search the step size of timestep `t` on the held batch `x`
    ///
    /// Every trial restarts from `x`. Returns the output of the kept trial and
    /// its step size.
    pub fn calibrate(
        &mut self,
        target: &dyn AnnealedTarget<B>,
        x: Tensor<B, 4>,
        t: usize,
        noise: &mut NoiseSource,
    ) -> Result<(Tensor<B, 4>, StepSize)> {
        if self.current.is_none() {
            self.begin_batch(self.batches.len(), x.dims()[0]);
        }
        if self.current.as_ref().is_some_and(|b| b.table.contains(t)) {
            return Err(Error::StepSizeRevised { t });
        }

        let base = match self.warm.get(t) {
            Some(step_size) => step_size.clone(),
            None => self.initial.require(t)?.clone(),
        };
        let bounds = self.settings.bounds;
        let factor = self.settings.adjust_factor;

        let mut record = TimestepRecord {
            t,
            step_sizes: Vec::with_capacity(self.settings.max_iter),
            acceptances: Vec::with_capacity(self.settings.max_iter),
            iterations: 0,
            acceptance: 0.0,
            resolved: false,
        };
        // Largest scale seen with acceptance above the band, smallest seen below it
        let mut too_small: Option<f64> = None;
        let mut too_large: Option<f64> = None;
        let mut scale = 1.0;
        let mut best: Option<Trial<B>> = None;

        for iteration in 1..=self.settings.max_iter {
            let step_size = base.scaled(scale);
            let (x_out, stats) =
                self.sampler
                    .correct(target, x.clone(), t, &step_size, self.n_steps, noise)?;
            let acceptance = stats.mean();
            let distance = bounds.distance(acceptance);
            tracing::debug!(t, iteration, h = step_size.magnitude(), acceptance, "calibration trial");

            record.step_sizes.push(step_size.magnitude());
            record.acceptances.push(acceptance);
            record.iterations = iteration;

            if best.as_ref().map_or(true, |b| distance < b.distance) {
                best = Some(Trial {
                    x: x_out,
                    step_size,
                    acceptance,
                    distance,
                });
            }
            if distance == 0.0 {
                break;
            }

            if acceptance > bounds.upper {
                too_small = Some(too_small.map_or(scale, |s| s.max(scale)));
            } else {
                too_large = Some(too_large.map_or(scale, |s| s.min(scale)));
            }
            scale = match (too_small, too_large) {
                (Some(lo), Some(hi)) => (lo * hi).sqrt(),
                (Some(lo), None) => lo * factor,
                (None, Some(hi)) => hi / factor,
                (None, None) => scale,
            };
        }

        let Some(best) = best else {
            return Err(Error::InvalidParameter("max_iter must be at least 1".into()));
        };
        record.acceptance = best.acceptance;
        record.resolved = best.distance == 0.0;
        if record.resolved {
            tracing::info!(
                t,
                h = best.step_size.magnitude(),
                acceptance = best.acceptance,
                iterations = record.iterations,
                "step size resolved"
            );
        } else {
            tracing::warn!(
                t,
                h = best.step_size.magnitude(),
                acceptance = best.acceptance,
                lower = bounds.lower,
                upper = bounds.upper,
                "step size search did not converge, keeping closest trial"
            );
        }

        self.warm.set(t, best.step_size.clone());
        if let Some(batch) = self.current.as_mut() {
            batch.table.insert(t, best.step_size.clone())?;
            batch.records.push(record);
        }
        Ok((best.x, best.step_size))
    }

    /// Close the run and return the final table with all diagnostics
    pub fn into_outcome(mut self) -> CalibrationOutcome {
        Corrector::end_batch(&mut self);
        let (table, records) = self
            .batches
            .last()
            .map(|b| (b.table.clone(), b.records.clone()))
            .unwrap_or_default();
        CalibrationOutcome {
            table,
            records,
            batches: self.batches,
        }
    }
}

impl<B: Backend> Corrector<B> for StepSizeCalibrator<B> {
    fn correct(
        &mut self,
        target: &dyn AnnealedTarget<B>,
        x: Tensor<B, 4>,
        t: usize,
        noise: &mut NoiseSource,
    ) -> Result<Tensor<B, 4>> {
        self.calibrate(target, x, t, noise).map(|(x, _)| x)
    }

    fn prepare(&self, timesteps: &[usize]) -> Result<()> {
        match timesteps
            .iter()
            .find(|t| !self.warm.contains(**t) && !self.initial.contains(**t))
        {
            Some(&t) => Err(Error::MissingStepSize { t }),
            None => Ok(()),
        }
    }

    fn begin_batch(&mut self, index: usize, size: usize) {
        Corrector::end_batch(self);
        tracing::info!(index, size, "calibrating sub-batch");
        self.current = Some(CalibrationBatch::new(index, size));
    }

    fn end_batch(&mut self) {
        if let Some(batch) = self.current.take() {
            let unresolved = batch.unresolved().count();
            if unresolved > 0 {
                tracing::warn!(
                    index = batch.index,
                    unresolved,
                    total = batch.records.len(),
                    "sub-batch finished with unresolved timesteps"
                );
            }
            self.batches.push(batch);
        }
    }
}
