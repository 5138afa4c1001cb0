//! Classifier guidance
//!
//! A [`Guidance`] turns a classifier into a gradient that nudges the reverse
//! step mean toward higher `log p(y | x)` for the requested labels:
//!
//! `mu' = mu + Sigma * lambda * grad_{x_t} log p(y | .)`
//!
//! Each evaluation runs the denoiser once and hands its output back next to
//! the gradient, so callers never predict the same `x_t` twice. Gradients are
//! taken on a detached, grad-tracking copy of `x_t` and both results come back
//! untracked, so no graph outlives the call.

use burn::prelude::*;
use burn::tensor::activation::log_softmax;
use burn::tensor::backend::AutodiffBackend;
use burn_guided_diffusion::{Classifier, Denoiser, DenoiserOutput, DiffusionProcess};

use crate::{Error, Result};

/// One guided evaluation at `x_t`
#[derive(Debug, Clone)]
pub struct Guided<B: Backend> {
    /// Denoiser output at `x_t`
    pub output: DenoiserOutput<B>,
    /// Scaled `grad_{x_t} log p(labels | .)`
    pub gradient: Tensor<B, 4>,
}

/// Source of the guidance gradient
pub trait Guidance<B: AutodiffBackend> {
    /// Number of classes labels may address, `None` for unguided sampling
    fn num_classes(&self) -> Option<usize>;

    /// Denoiser output and guidance gradient at respaced timestep `t`
    fn guide(
        &self,
        process: &DiffusionProcess,
        denoiser: &dyn Denoiser<B>,
        x_t: Tensor<B, 4>,
        t: usize,
        labels: Tensor<B, 1, Int>,
    ) -> Result<Guided<B>>;
}

impl<B: AutodiffBackend, G: Guidance<B> + ?Sized> Guidance<B> for Box<G> {
    fn num_classes(&self) -> Option<usize> {
        (**self).num_classes()
    }

    fn guide(
        &self,
        process: &DiffusionProcess,
        denoiser: &dyn Denoiser<B>,
        x_t: Tensor<B, 4>,
        t: usize,
        labels: Tensor<B, 1, Int>,
    ) -> Result<Guided<B>> {
        (**self).guide(process, denoiser, x_t, t, labels)
    }
}

/// Denoiser evaluation at respaced timestep `t`, labels passed only to conditional models
fn denoise<B: AutodiffBackend>(
    process: &DiffusionProcess,
    denoiser: &dyn Denoiser<B>,
    x_t: Tensor<B, 4>,
    t: usize,
    labels: &Tensor<B, 1, Int>,
) -> Result<DenoiserOutput<B>> {
    let timesteps = process.model_timesteps::<B>(t, x_t.dims()[0], &x_t.device())?;
    let labels = denoiser
        .capabilities()
        .class_conditional
        .then(|| labels.clone());
    Ok(denoiser.predict(x_t, timesteps, labels))
}

/// No steering; the gradient is zero
#[derive(Debug, Clone, Copy, Default)]
pub struct NoGuidance;

impl<B: AutodiffBackend> Guidance<B> for NoGuidance {
    fn num_classes(&self) -> Option<usize> {
        None
    }

    fn guide(
        &self,
        process: &DiffusionProcess,
        denoiser: &dyn Denoiser<B>,
        x_t: Tensor<B, 4>,
        t: usize,
        labels: Tensor<B, 1, Int>,
    ) -> Result<Guided<B>> {
        let x = x_t.detach();
        let gradient = x.zeros_like();
        let output = denoise(process, denoiser, x, t, &labels)?.detach();
        Ok(Guided { output, gradient })
    }
}

/// Classifier evaluated on the one-step reconstruction of `x_0`
///
/// The gradient flows through the denoiser's reconstruction
/// `x_0_hat(x_t) = (x_t - sqrt(1 - a_t) eps(x_t, t)) / sqrt(a_t)`.
/// Time-conditioned classifiers see the reconstruction at timestep `0`.
#[derive(Debug, Clone)]
pub struct ClassifierFullGuidance<C> {
    classifier: C,
    scale: f64,
}

impl<C> ClassifierFullGuidance<C> {
    pub fn new(classifier: C, scale: f64) -> Self {
        Self { classifier, scale }
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }
}

impl<B: AutodiffBackend, C: Classifier<B>> Guidance<B> for ClassifierFullGuidance<C> {
    fn num_classes(&self) -> Option<usize> {
        Some(self.classifier.num_classes())
    }

    fn guide(
        &self,
        process: &DiffusionProcess,
        denoiser: &dyn Denoiser<B>,
        x_t: Tensor<B, 4>,
        t: usize,
        labels: Tensor<B, 1, Int>,
    ) -> Result<Guided<B>> {
        let batch = x_t.dims()[0];
        let x = x_t.detach().require_grad();

        // the tracked pass doubles as the prediction of the reverse step
        let output = denoise(process, denoiser, x.clone(), t, &labels)?;
        let x_0 = process.predict_x0(x.clone(), t, output.epsilon.clone())?;

        let classifier_timesteps = process.model_timesteps::<B>(0, batch, &x.device())?;
        let logits = self.classifier.logits(x_0, classifier_timesteps);
        let gradient = log_prob_gradient(logits, x, labels, self.classifier.num_classes(), self.scale)?;
        Ok(Guided {
            output: output.detach(),
            gradient,
        })
    }
}

/// Classifier evaluated directly on the noisy sample
#[derive(Debug, Clone)]
pub struct ClassifierGuidance<C> {
    classifier: C,
    scale: f64,
}

impl<C> ClassifierGuidance<C> {
    pub fn new(classifier: C, scale: f64) -> Self {
        Self { classifier, scale }
    }
}

impl<B: AutodiffBackend, C: Classifier<B>> Guidance<B> for ClassifierGuidance<C> {
    fn num_classes(&self) -> Option<usize> {
        Some(self.classifier.num_classes())
    }

    fn guide(
        &self,
        process: &DiffusionProcess,
        denoiser: &dyn Denoiser<B>,
        x_t: Tensor<B, 4>,
        t: usize,
        labels: Tensor<B, 1, Int>,
    ) -> Result<Guided<B>> {
        let batch = x_t.dims()[0];
        let x = x_t.detach();
        let output = denoise(process, denoiser, x.clone(), t, &labels)?.detach();

        let x = x.require_grad();
        let timesteps = process.model_timesteps::<B>(t, batch, &x.device())?;
        let logits = self.classifier.logits(x.clone(), timesteps);
        let gradient = log_prob_gradient(logits, x, labels, self.classifier.num_classes(), self.scale)?;
        Ok(Guided { output, gradient })
    }
}

/// `scale * grad_x sum_i log softmax(logits_i)[labels_i]`
fn log_prob_gradient<B: AutodiffBackend>(
    logits: Tensor<B, 2>,
    x: Tensor<B, 4>,
    labels: Tensor<B, 1, Int>,
    num_classes: usize,
    scale: f64,
) -> Result<Tensor<B, 4>> {
    let batch = x.dims()[0];
    let expected = [batch, num_classes];
    if logits.dims() != expected {
        return Err(Error::ClassifierOutput {
            expected,
            actual: logits.dims(),
        });
    }

    let log_probs = log_softmax(logits, 1);
    let selected = log_probs.gather(1, labels.reshape([batch, 1]));
    let grads = selected.sum().backward();
    let grad = x.grad(&grads).ok_or(Error::MissingGradient)?;
    Ok(Tensor::from_inner(grad) * scale)
}
