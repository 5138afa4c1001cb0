//! Closed-form Gaussian-mixture model family
//!
//! Data are images whose pixels all equal a class mean `m_k` plus isotropic
//! noise of standard deviation `sigma_0`, with uniform class prior. Under the
//! forward process the noised marginal of class `k` at original timestep `s`
//! is `N(sqrt(a_s) m_k, (a_s sigma_0^2 + 1 - a_s) I)`, so both the optimal
//! noise estimate and the Bayes classifier are available in closed form.
//!
//! The model stands in for trained networks in tests and in the CLI.

use burn::prelude::*;
use burn::tensor::activation::softmax;
use serde::{Deserialize, Serialize};

use crate::model::{Classifier, Denoiser, DenoiserCapabilities, DenoiserOutput};
use crate::schedule::cumprod_alphas;
use crate::{Error, Result};

/// Parameters of the mixture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaussianMixtureConfig {
    /// Per-class pixel value
    pub means: Vec<f64>,
    /// Pixel standard deviation within a class
    pub data_std: f64,
    #[serde(default)]
    pub class_conditional: bool,
    /// Emit a (neutral) variance channel so the model can run in learned-variance mode
    #[serde(default)]
    pub learned_variance: bool,
}

impl Default for GaussianMixtureConfig {
    fn default() -> Self {
        Self {
            means: vec![-0.5, 0.5],
            data_std: 0.1,
            class_conditional: false,
            learned_variance: false,
        }
    }
}

impl GaussianMixtureConfig {
    pub fn with_class_conditional(mut self, class_conditional: bool) -> Self {
        self.class_conditional = class_conditional;
        self
    }

    pub fn with_learned_variance(mut self, learned_variance: bool) -> Self {
        self.learned_variance = learned_variance;
        self
    }

    /// Build the model for a process with the given original betas
    pub fn init<B: Backend>(
        &self,
        original_betas: &[f64],
        device: &B::Device,
    ) -> Result<GaussianMixtureModel<B>> {
        if self.means.is_empty() {
            return Err(Error::Data("mixture needs at least one class".into()));
        }
        if self.data_std.is_nan() || self.data_std <= 0.0 {
            return Err(Error::Data(format!(
                "mixture data_std must be positive, got {}",
                self.data_std
            )));
        }
        if original_betas.is_empty() {
            return Err(Error::EmptySchedule);
        }

        let alphas_cumprod: Vec<f32> = cumprod_alphas(original_betas)
            .into_iter()
            .map(|a| a as f32)
            .collect();
        let num_steps = alphas_cumprod.len();
        let means: Vec<f32> = self.means.iter().map(|m| *m as f32).collect();
        let num_classes = means.len();

        Ok(GaussianMixtureModel {
            alphas_cumprod: Tensor::from_data(TensorData::new(alphas_cumprod, [num_steps]), device),
            means: Tensor::from_data(TensorData::new(means, [num_classes]), device),
            num_classes,
            data_var: self.data_std * self.data_std,
            capabilities: DenoiserCapabilities {
                learned_variance: self.learned_variance,
                class_conditional: self.class_conditional,
            },
        })
    }
}

/// Gaussian-mixture denoiser and time-conditioned classifier
#[derive(Debug, Clone)]
pub struct GaussianMixtureModel<B: Backend> {
    /// Original-schedule cumulative alphas indexed by model timestep
    alphas_cumprod: Tensor<B, 1>,
    means: Tensor<B, 1>,
    num_classes: usize,
    data_var: f64,
    capabilities: DenoiserCapabilities,
}

/// Per-sample quantities shared by the denoiser and the classifier
struct Marginal<B: Backend> {
    /// `sqrt(a_s)`, `[batch, 1]`
    scale: Tensor<B, 2>,
    /// Marginal variance per pixel, `[batch, 1]`
    var: Tensor<B, 2>,
    /// Class log-likelihoods up to a shared constant, `[batch, classes]`
    log_likelihood: Tensor<B, 2>,
}

impl<B: Backend> GaussianMixtureModel<B> {
    fn marginal(&self, x: Tensor<B, 4>, timesteps: Tensor<B, 1, Int>) -> Marginal<B> {
        let [batch, channels, height, width] = x.dims();
        let dim = channels * height * width;
        let k = self.num_classes;

        let abar = self.alphas_cumprod.clone().select(0, timesteps).reshape([batch, 1]);
        let scale = abar.clone().sqrt();
        let var = abar.clone() * self.data_var + abar.neg() + 1.0;

        let flat = x.reshape([batch, dim]);
        let sum_x = flat.clone().sum_dim(1);
        let sum_sq = flat.powf_scalar(2.0).sum_dim(1);

        let means = self.means.clone().reshape([1, k]).expand([batch, k]);
        let cross = (scale.clone() * sum_x).expand([batch, k]) * means.clone() * 2.0;
        let quad = (scale.clone().powf_scalar(2.0) * dim as f64).expand([batch, k])
            * means.powf_scalar(2.0);
        let distance = sum_sq.expand([batch, k]) - cross + quad;
        let log_likelihood = distance / var.clone().expand([batch, k]) * -0.5;

        Marginal {
            scale,
            var,
            log_likelihood,
        }
    }
}

impl<B: Backend> Denoiser<B> for GaussianMixtureModel<B> {
    fn capabilities(&self) -> DenoiserCapabilities {
        self.capabilities
    }

    fn predict(
        &self,
        x_t: Tensor<B, 4>,
        timesteps: Tensor<B, 1, Int>,
        labels: Option<Tensor<B, 1, Int>>,
    ) -> DenoiserOutput<B> {
        let dims = x_t.dims();
        let batch = dims[0];
        let k = self.num_classes;
        let marginal = self.marginal(x_t.clone(), timesteps);

        let mean = match labels.filter(|_| self.capabilities.class_conditional) {
            Some(labels) => self.means.clone().select(0, labels).reshape([batch, 1]),
            None => {
                let resp = softmax(marginal.log_likelihood, 1);
                (resp * self.means.clone().reshape([1, k]).expand([batch, k])).sum_dim(1)
            }
        };

        let abar = marginal.scale.clone().powf_scalar(2.0);
        let noise_scale = (abar.neg() + 1.0).sqrt() / marginal.var;
        let center = (marginal.scale * mean).reshape([batch, 1, 1, 1]).expand(dims);
        let epsilon = (x_t - center) * noise_scale.reshape([batch, 1, 1, 1]).expand(dims);

        let variance = self
            .capabilities
            .learned_variance
            .then(|| epsilon.zeros_like());
        DenoiserOutput { epsilon, variance }
    }
}

impl<B: Backend> Classifier<B> for GaussianMixtureModel<B> {
    fn is_time_conditioned(&self) -> bool {
        true
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn logits(&self, x: Tensor<B, 4>, timesteps: Tensor<B, 1, Int>) -> Tensor<B, 2> {
        self.marginal(x, timesteps).log_likelihood
    }
}
