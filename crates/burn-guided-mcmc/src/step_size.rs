//! Step sizes and per-timestep step-size tables

use std::collections::BTreeMap;

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Whether a timestep uses one step size or one per sample element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepSizeShape {
    #[default]
    Scalar,
    /// One value per `channel * height * width` element, shared across the batch
    Elementwise,
}

/// Step size of one correction chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepSize {
    Scalar(f64),
    Elementwise(Vec<f32>),
}

impl StepSize {
    pub fn shape(&self) -> StepSizeShape {
        match self {
            StepSize::Scalar(_) => StepSizeShape::Scalar,
            StepSize::Elementwise(_) => StepSizeShape::Elementwise,
        }
    }

    /// Multiply every entry by `factor`
    pub fn scaled(&self, factor: f64) -> StepSize {
        match self {
            StepSize::Scalar(h) => StepSize::Scalar(h * factor),
            StepSize::Elementwise(h) => {
                StepSize::Elementwise(h.iter().map(|v| (*v as f64 * factor) as f32).collect())
            }
        }
    }

    /// Representative magnitude: the value itself or the elementwise mean
    pub fn magnitude(&self) -> f64 {
        match self {
            StepSize::Scalar(h) => *h,
            StepSize::Elementwise(h) if h.is_empty() => 0.0,
            StepSize::Elementwise(h) => h.iter().map(|v| *v as f64).sum::<f64>() / h.len() as f64,
        }
    }

    /// Convert to `shape`, broadcasting a scalar to `numel` entries
    ///
    /// Converting an elementwise step size to a scalar keeps its mean.
    pub fn with_shape(self, shape: StepSizeShape, numel: usize) -> StepSize {
        match (self, shape) {
            (StepSize::Scalar(h), StepSizeShape::Elementwise) => {
                StepSize::Elementwise(vec![h as f32; numel])
            }
            (s @ StepSize::Elementwise(_), StepSizeShape::Scalar) => StepSize::Scalar(s.magnitude()),
            (s, _) => s,
        }
    }

    /// Broadcast to a tensor of `dims` (`[batch, channels, height, width]`)
    pub fn to_tensor<B: Backend>(&self, dims: [usize; 4], device: &B::Device) -> Result<Tensor<B, 4>> {
        match self {
            StepSize::Scalar(h) => Ok(Tensor::full(dims, *h, device)),
            StepSize::Elementwise(h) => {
                let [_, c, height, width] = dims;
                let expected = c * height * width;
                if h.len() != expected {
                    return Err(Error::StepSizeShape {
                        expected,
                        actual: h.len(),
                    });
                }
                let base: Tensor<B, 4> =
                    Tensor::from_data(TensorData::new(h.clone(), [1, c, height, width]), device);
                Ok(base.expand(dims))
            }
        }
    }

    pub fn is_valid(&self) -> bool {
        match self {
            StepSize::Scalar(h) => h.is_finite() && *h > 0.0,
            StepSize::Elementwise(h) => !h.is_empty() && h.iter().all(|v| v.is_finite() && *v > 0.0),
        }
    }
}

/// Step sizes keyed by respaced timestep
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepSizeTable {
    entries: BTreeMap<usize, StepSize>,
}

impl StepSizeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// `factor * beta_t^exponent` for every `t` in `timesteps`
    pub fn from_betas(
        betas: &[f64],
        factor: f64,
        exponent: f64,
        timesteps: impl IntoIterator<Item = usize>,
    ) -> Result<Self> {
        let mut table = Self::new();
        for t in timesteps {
            let beta = betas.get(t).ok_or(burn_guided_diffusion::Error::TimestepOutOfRange {
                index: t,
                len: betas.len(),
            })?;
            table.insert(t, StepSize::Scalar(factor * beta.powf(exponent)))?;
        }
        Ok(table)
    }

    /// Add the step size of `t`; a timestep is written at most once
    pub fn insert(&mut self, t: usize, step_size: StepSize) -> Result<()> {
        if self.entries.contains_key(&t) {
            return Err(Error::StepSizeRevised { t });
        }
        self.entries.insert(t, step_size);
        Ok(())
    }

    /// Add or overwrite the step size of `t`
    pub fn set(&mut self, t: usize, step_size: StepSize) {
        self.entries.insert(t, step_size);
    }

    pub fn get(&self, t: usize) -> Option<&StepSize> {
        self.entries.get(&t)
    }

    /// Step size of `t` or [`Error::MissingStepSize`]
    pub fn require(&self, t: usize) -> Result<&StepSize> {
        self.get(t).ok_or(Error::MissingStepSize { t })
    }

    pub fn contains(&self, t: usize) -> bool {
        self.entries.contains_key(&t)
    }

    /// First of `timesteps` without an entry, as [`Error::MissingStepSize`]
    pub fn require_all(&self, timesteps: impl IntoIterator<Item = usize>) -> Result<()> {
        match timesteps.into_iter().find(|t| !self.contains(*t)) {
            Some(t) => Err(Error::MissingStepSize { t }),
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in ascending timestep order
    pub fn iter(&self) -> impl Iterator<Item = (usize, &StepSize)> {
        self.entries.iter().map(|(t, s)| (*t, s))
    }

    pub fn timesteps(&self) -> impl Iterator<Item = usize> + '_ {
        self.entries.keys().copied()
    }

    /// Convert every entry to `shape`
    pub fn with_shape(self, shape: StepSizeShape, numel: usize) -> Self {
        Self {
            entries: self
                .entries
                .into_iter()
                .map(|(t, s)| (t, s.with_shape(shape, numel)))
                .collect(),
        }
    }
}

impl FromIterator<(usize, StepSize)> for StepSizeTable {
    fn from_iter<I: IntoIterator<Item = (usize, StepSize)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
