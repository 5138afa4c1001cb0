//! Beta schedules and respacing
//!
//! A [`Schedule`] keeps the full `T`-step beta sequence it was derived from
//! together with the retained timesteps of a respaced `T' <= T` process and the
//! sparsified betas that reproduce the original cumulative noise growth at
//! those timesteps.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Largest beta the cosine schedule is allowed to produce
const MAX_BETA: f64 = 0.999;

/// Offset `s` of the improved (cosine) schedule
const COSINE_OFFSET: f64 = 0.008;

/// Shape of the forward-process beta sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    /// Linear from 1e-4 to 0.02, rescaled to the number of steps
    #[default]
    Linear,
    /// Improved cosine schedule of Nichol & Dhariwal
    Cosine,
}

impl BetaSchedule {
    /// Betas for a `num_timesteps`-step forward process
    pub fn betas(self, num_timesteps: usize) -> Vec<f64> {
        match self {
            BetaSchedule::Linear => linear_beta_schedule(num_timesteps),
            BetaSchedule::Cosine => improved_beta_schedule(num_timesteps),
        }
    }
}

/// Linear beta schedule, scaled so that any `T` matches the 1000-step original
pub fn linear_beta_schedule(num_timesteps: usize) -> Vec<f64> {
    if num_timesteps == 0 {
        return Vec::new();
    }
    let scale = 1000.0 / num_timesteps as f64;
    let beta_start = scale * 1e-4;
    let beta_end = scale * 0.02;
    if num_timesteps == 1 {
        return vec![beta_start];
    }
    (0..num_timesteps)
        .map(|i| {
            let frac = i as f64 / (num_timesteps - 1) as f64;
            beta_start + frac * (beta_end - beta_start)
        })
        .collect()
}

/// Improved (cosine) beta schedule
///
/// Discretizes `alpha_bar(t) = cos(((t + s) / (1 + s)) * pi / 2)^2` and clips
/// every beta to [`MAX_BETA`].
pub fn improved_beta_schedule(num_timesteps: usize) -> Vec<f64> {
    let alpha_bar = |t: f64| {
        (((t + COSINE_OFFSET) / (1.0 + COSINE_OFFSET)) * std::f64::consts::FRAC_PI_2)
            .cos()
            .powi(2)
    };
    (0..num_timesteps)
        .map(|i| {
            let t1 = i as f64 / num_timesteps as f64;
            let t2 = (i + 1) as f64 / num_timesteps as f64;
            (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(MAX_BETA)
        })
        .collect()
}

/// Evenly spread `respaced` timesteps over `[0, full - 1]`
///
/// The result starts at `0`, ends at `full - 1` (when `respaced > 1`) and is
/// strictly increasing.
pub fn respaced_timesteps(full: usize, respaced: usize) -> Result<Vec<usize>> {
    if full == 0 || respaced == 0 {
        return Err(Error::EmptySchedule);
    }
    if respaced > full {
        return Err(Error::RespacedTooLong { respaced, full });
    }
    if respaced == full {
        return Ok((0..full).collect());
    }
    if respaced == 1 {
        return Ok(vec![0]);
    }
    let stride = (full - 1) as f64 / (respaced - 1) as f64;
    Ok((0..respaced)
        .map(|i| ((i as f64 * stride).round() as usize).min(full - 1))
        .collect())
}

/// Betas of the sparse process visiting only `time_steps`
///
/// Each new beta is `1 - alpha_bar[t_i] / alpha_bar[t_{i-1}]`, so the
/// cumulative product at every retained step equals the original one.
pub fn new_sparse(time_steps: &[usize], betas: &[f64]) -> Vec<f64> {
    let alphas_cumprod = cumprod_alphas(betas);
    let mut prev = 1.0;
    time_steps
        .iter()
        .map(|&t| {
            let alpha_bar = alphas_cumprod[t];
            let beta = 1.0 - alpha_bar / prev;
            prev = alpha_bar;
            beta
        })
        .collect()
}

/// Respace `original_betas` from `full` to `respaced` steps
///
/// Returns the sparse betas and the retained timesteps.
pub fn respaced_beta_schedule(
    original_betas: &[f64],
    full: usize,
    respaced: usize,
) -> Result<(Vec<f64>, Vec<usize>)> {
    if original_betas.len() != full {
        return Err(Error::ShapeMismatch {
            expected: vec![full],
            actual: vec![original_betas.len()],
        });
    }
    let time_steps = respaced_timesteps(full, respaced)?;
    let betas = if respaced == full {
        original_betas.to_vec()
    } else {
        new_sparse(&time_steps, original_betas)
    };
    Ok((betas, time_steps))
}

pub(crate) fn cumprod_alphas(betas: &[f64]) -> Vec<f64> {
    let mut cumprod = 1.0;
    betas
        .iter()
        .map(|b| {
            cumprod *= 1.0 - b;
            cumprod
        })
        .collect()
}

/// A (possibly respaced) diffusion schedule
#[derive(Debug, Clone)]
pub struct Schedule {
    original_betas: Vec<f64>,
    betas: Vec<f64>,
    time_steps: Vec<usize>,
}

impl Schedule {
    /// Build a `respaced`-step schedule from a `full`-step beta schedule
    pub fn new(kind: BetaSchedule, full: usize, respaced: usize) -> Result<Self> {
        Self::from_betas(kind.betas(full), respaced)
    }

    /// Build a `respaced`-step schedule from explicit original betas
    pub fn from_betas(original_betas: Vec<f64>, respaced: usize) -> Result<Self> {
        let full = original_betas.len();
        let (betas, time_steps) = respaced_beta_schedule(&original_betas, full, respaced)?;
        Ok(Self {
            original_betas,
            betas,
            time_steps,
        })
    }

    /// Number of steps of the respaced process (`T'`)
    pub fn len(&self) -> usize {
        self.betas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.betas.is_empty()
    }

    /// Number of steps of the original process (`T`)
    pub fn num_train_steps(&self) -> usize {
        self.original_betas.len()
    }

    /// Sparse betas, one per respaced step
    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    /// Betas of the original `T`-step process
    pub fn original_betas(&self) -> &[f64] {
        &self.original_betas
    }

    /// Retained original timesteps, strictly increasing
    pub fn time_steps(&self) -> &[usize] {
        &self.time_steps
    }

    /// Cumulative products of `1 - beta` over the respaced process
    pub fn alphas_cumprod(&self) -> Vec<f64> {
        cumprod_alphas(&self.betas)
    }

    /// Original timestep handed to collaborators for respaced index `t`
    pub fn model_timestep(&self, t: usize) -> Result<usize> {
        self.time_steps
            .get(t)
            .copied()
            .ok_or(Error::TimestepOutOfRange {
                index: t,
                len: self.len(),
            })
    }

    /// Respaced indices in sampling order, `T' - 1` down to `0`
    pub fn reverse_indices(&self) -> impl Iterator<Item = usize> {
        (0..self.len()).rev()
    }
}
