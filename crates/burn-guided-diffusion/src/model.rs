//! Collaborator contracts
//!
//! Network architectures and weight loading live outside this workspace. A
//! model family plugs in by implementing [`Denoiser`] and/or [`Classifier`]
//! and declaring what it can do once, through [`DenoiserCapabilities`] and
//! [`Classifier::is_time_conditioned`].

use burn::prelude::*;

/// What a denoiser family supports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DenoiserCapabilities {
    /// Emits a variance prediction next to the noise estimate
    pub learned_variance: bool,
    /// Accepts class labels as conditioning
    pub class_conditional: bool,
}

/// Output of one denoiser evaluation
#[derive(Debug, Clone)]
pub struct DenoiserOutput<B: Backend> {
    /// Noise estimate, same shape as the input batch
    pub epsilon: Tensor<B, 4>,
    /// Raw variance interpolation values in `[-1, 1]`, present for learned-variance models
    pub variance: Option<Tensor<B, 4>>,
}

impl<B: Backend> DenoiserOutput<B> {
    pub fn epsilon(epsilon: Tensor<B, 4>) -> Self {
        Self {
            epsilon,
            variance: None,
        }
    }

    pub fn detach(self) -> Self {
        Self {
            epsilon: self.epsilon.detach(),
            variance: self.variance.map(|v| v.detach()),
        }
    }
}

/// Noise-predicting network of the reverse process
pub trait Denoiser<B: Backend> {
    fn capabilities(&self) -> DenoiserCapabilities;

    /// Predict the noise in `x_t`
    ///
    /// - `x_t`: `[batch, channels, height, width]`
    /// - `timesteps`: `[batch]` original-schedule timesteps of the respaced steps
    /// - `labels`: `[batch]` class labels, only passed to class-conditional models
    fn predict(
        &self,
        x_t: Tensor<B, 4>,
        timesteps: Tensor<B, 1, Int>,
        labels: Option<Tensor<B, 1, Int>>,
    ) -> DenoiserOutput<B>;
}

/// Classifier over (possibly noisy) samples
pub trait Classifier<B: Backend> {
    /// Trained on noisy inputs and expects the timestep
    fn is_time_conditioned(&self) -> bool;

    fn num_classes(&self) -> usize;

    /// Class logits `[batch, num_classes]`
    ///
    /// `timesteps` is ignored by classifiers that are not time conditioned.
    fn logits(&self, x: Tensor<B, 4>, timesteps: Tensor<B, 1, Int>) -> Tensor<B, 2>;
}

impl<B: Backend, T: Denoiser<B> + ?Sized> Denoiser<B> for &T {
    fn capabilities(&self) -> DenoiserCapabilities {
        (**self).capabilities()
    }

    fn predict(
        &self,
        x_t: Tensor<B, 4>,
        timesteps: Tensor<B, 1, Int>,
        labels: Option<Tensor<B, 1, Int>>,
    ) -> DenoiserOutput<B> {
        (**self).predict(x_t, timesteps, labels)
    }
}

impl<B: Backend, T: Classifier<B> + ?Sized> Classifier<B> for &T {
    fn is_time_conditioned(&self) -> bool {
        (**self).is_time_conditioned()
    }

    fn num_classes(&self) -> usize {
        (**self).num_classes()
    }

    fn logits(&self, x: Tensor<B, 4>, timesteps: Tensor<B, 1, Int>) -> Tensor<B, 2> {
        (**self).logits(x, timesteps)
    }
}
