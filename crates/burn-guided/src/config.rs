//! Simulation configuration
//!
//! One JSON file describes a sampling run: model family, schedule, guidance,
//! the optional MCMC correction and where results go. Configs are validated
//! on load, before any tensor is created.

use std::fs;
use std::path::{Path, PathBuf};

use burn_guided_diffusion::{BetaSchedule, VarianceMode};
use burn_guided_mcmc::{
    AcceptanceBounds, BatchingStrategy, CalibrationSettings, McmcMethod, StepSizeShape,
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}

fn default_step_size_dir() -> PathBuf {
    PathBuf::from("step_sizes")
}

/// `factor * beta_t^exponent`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepSizeParams {
    pub factor: f64,
    pub exponent: f64,
}

/// Where the MCMC step sizes come from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McmcStepSizes {
    /// Read a calibrated table from the step-size store
    pub load: bool,
    /// Acceptance band the loaded table was calibrated for
    #[serde(default)]
    pub bounds: Option<AcceptanceBounds>,
    /// Closed-form step sizes when not loading
    #[serde(default)]
    pub params: Option<StepSizeParams>,
    #[serde(default)]
    pub shape: StepSizeShape,
}

/// Validated form of [`McmcStepSizes`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepSizeSource {
    Load { bounds: AcceptanceBounds },
    Params(StepSizeParams),
}

impl McmcStepSizes {
    pub fn load(bounds: AcceptanceBounds) -> Self {
        Self {
            load: true,
            bounds: Some(bounds),
            params: None,
            shape: StepSizeShape::Scalar,
        }
    }

    pub fn params(factor: f64, exponent: f64) -> Self {
        Self {
            load: false,
            bounds: None,
            params: Some(StepSizeParams { factor, exponent }),
            shape: StepSizeShape::Scalar,
        }
    }

    pub fn source(&self) -> Result<StepSizeSource> {
        if self.load {
            let bounds = self.bounds.ok_or_else(|| {
                Error::InvalidConfig("mcmc_stepsizes.load requires bounds".into())
            })?;
            bounds.validate()?;
            return Ok(StepSizeSource::Load { bounds });
        }
        let params = self.params.ok_or_else(|| {
            Error::InvalidConfig("mcmc_stepsizes requires params when load is false".into())
        })?;
        if !(params.factor.is_finite() && params.factor > 0.0 && params.exponent.is_finite()) {
            return Err(Error::InvalidConfig(format!(
                "invalid step size params: factor {} exponent {}",
                params.factor, params.exponent
            )));
        }
        Ok(StepSizeSource::Params(params))
    }
}

/// A sampling run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub name: String,
    pub image_size: usize,
    pub num_channels: usize,
    /// Denoiser family
    pub diff_model: String,
    pub class_cond: bool,
    pub num_diff_steps: usize,
    pub num_respaced_diff_steps: usize,
    pub num_samples: usize,
    pub batch_size: usize,
    /// Classifier family, empty for unguided sampling
    pub classifier: String,
    pub guid_scale: f64,
    #[serde(default)]
    pub mcmc_method: Option<McmcMethod>,
    #[serde(default)]
    pub mcmc_steps: Option<usize>,
    /// Correct only timesteps strictly above this one
    #[serde(default)]
    pub mcmc_lower_t: Option<usize>,
    #[serde(default)]
    pub mcmc_stepsizes: Option<McmcStepSizes>,
    #[serde(default)]
    pub n_trapets: Option<usize>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub save_traj: bool,
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
    #[serde(default = "default_step_size_dir")]
    pub step_size_dir: PathBuf,
    #[serde(default)]
    pub beta_schedule: BetaSchedule,
    #[serde(default)]
    pub variance_mode: VarianceMode,
}

impl SimulationConfig {
    pub fn from_json(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidConfig("name must not be empty".into()));
        }
        if self.image_size == 0 || self.num_channels == 0 {
            return Err(Error::InvalidConfig(format!(
                "sample shape {}x{}x{} has an empty dimension",
                self.num_channels, self.image_size, self.image_size
            )));
        }
        if self.num_diff_steps == 0 || self.num_respaced_diff_steps == 0 {
            return Err(Error::InvalidConfig("diffusion step counts must be positive".into()));
        }
        if self.num_respaced_diff_steps > self.num_diff_steps {
            return Err(Error::InvalidConfig(format!(
                "num_respaced_diff_steps ({}) exceeds num_diff_steps ({})",
                self.num_respaced_diff_steps, self.num_diff_steps
            )));
        }
        if self.num_samples == 0 || self.batch_size == 0 {
            return Err(Error::InvalidConfig(
                "num_samples and batch_size must be positive".into(),
            ));
        }
        if !self.guid_scale.is_finite() || self.guid_scale < 0.0 {
            return Err(Error::InvalidConfig(format!(
                "guid_scale must be finite and non-negative, got {}",
                self.guid_scale
            )));
        }
        if let Some(method) = self.mcmc_method {
            self.step_size_source()?;
            if self.mcmc_steps.unwrap_or(0) == 0 {
                return Err(Error::InvalidConfig(
                    "mcmc_steps must be at least 1 when mcmc_method is set".into(),
                ));
            }
            if method == McmcMethod::La && self.n_trapets.unwrap_or(0) == 0 {
                return Err(Error::InvalidConfig(
                    "n_trapets must be at least 1 for the la method".into(),
                ));
            }
        }
        Ok(())
    }

    /// `[channels, height, width]`
    pub fn sample_shape(&self) -> [usize; 3] {
        [self.num_channels, self.image_size, self.image_size]
    }

    pub fn batching(&self) -> BatchingStrategy {
        BatchingStrategy::for_batch_size(self.num_samples, self.batch_size)
    }

    pub fn is_guided(&self) -> bool {
        !self.classifier.is_empty() && self.guid_scale > 0.0
    }

    /// Step-size source of the configured MCMC method
    pub fn step_size_source(&self) -> Result<StepSizeSource> {
        self.mcmc_stepsizes
            .as_ref()
            .ok_or_else(|| Error::InvalidConfig("mcmc_method is set but mcmc_stepsizes is missing".into()))?
            .source()
    }

    /// Write `config.json` into `dir`
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let path = dir.as_ref().join("config.json");
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }
}

/// Create `<results_dir>/<name>_<job id or timestamp>` and save the config there
pub fn setup_results_dir(config: &SimulationConfig, job_id: Option<u64>) -> Result<PathBuf> {
    fs::create_dir_all(&config.results_dir)?;
    let sim_id = match job_id {
        Some(id) => format!("{}_{}", config.name, id),
        None => format!("{}_{}", config.name, timestamp()),
    };
    let dir = config.results_dir.join(sim_id);
    fs::create_dir_all(&dir)?;
    config.save(&dir)?;
    tracing::info!(dir = %dir.display(), "results directory ready");
    Ok(dir)
}

fn timestamp() -> String {
    chrono::Local::now().format("%y%m%d_%H%M").to_string()
}

/// A step-size search run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    #[serde(flatten)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub settings: CalibrationSettings,
}

impl CalibrationConfig {
    pub fn from_json(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.simulation.validate()?;
        self.settings.validate()?;
        if self.simulation.mcmc_method.is_none() {
            return Err(Error::InvalidConfig(
                "calibration needs an mcmc_method".into(),
            ));
        }
        Ok(())
    }
}
