//! Classification metrics for generated samples

use burn::prelude::*;
use burn::tensor::activation::log_softmax;
use burn::tensor::ElementConversion;

/// Fraction of predictions equal to the targets
pub fn accuracy<B: Backend>(y_true: Tensor<B, 1, Int>, y_pred: Tensor<B, 1, Int>) -> f64 {
    let hits = y_true.equal(y_pred).int().float();
    hits.mean().into_scalar().elem()
}

/// Mean entropy of a `[batch, classes]` probability matrix, in nats
///
/// Zero-probability entries contribute nothing.
pub fn entropy<B: Backend>(probs: Tensor<B, 2>) -> f64 {
    let log_probs = probs.clone().clamp_min(f32::MIN_POSITIVE).log();
    let per_sample = (probs * log_probs).sum_dim(1).neg();
    per_sample.mean().into_scalar().elem()
}

/// Row-wise log-softmax of `[batch, classes]` logits
pub fn logits_to_log_prob<B: Backend>(logits: Tensor<B, 2>) -> Tensor<B, 2> {
    log_softmax(logits, 1)
}

/// Hard labels `[batch]`
pub fn logits_to_label<B: Backend>(logits: Tensor<B, 2>) -> Tensor<B, 1, Int> {
    let [batch, _] = logits.dims();
    logits.argmax(1).reshape([batch])
}

/// Sample-weighted running mean over batches
///
/// Owned by the caller and fed explicitly, one batch at a time.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningMean {
    total: f64,
    count: usize,
}

impl RunningMean {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a batch of `count` samples whose mean is `value`
    pub fn update(&mut self, value: f64, count: usize) {
        self.total += value * count as f64;
        self.count += count;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// `None` before the first batch
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.total / self.count as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn ints(values: Vec<i64>) -> Tensor<TestBackend, 1, Int> {
        let n = values.len();
        Tensor::from_data(TensorData::new(values, [n]), &Default::default())
    }

    #[test]
    fn test_accuracy() {
        assert!((accuracy(ints(vec![0, 1, 1, 0]), ints(vec![0, 1, 0, 0])) - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_entropy_bounds() {
        let device = Default::default();
        let certain = Tensor::<TestBackend, 2>::from_floats([[1.0, 0.0], [0.0, 1.0]], &device);
        assert!(entropy(certain).abs() < 1e-6);
        let uniform = Tensor::<TestBackend, 2>::from_floats([[0.5, 0.5]], &device);
        assert!((entropy(uniform) - std::f64::consts::LN_2).abs() < 1e-5);
    }

    #[test]
    fn test_labels_and_log_probs() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::from_floats([[0.1, 2.0, -1.0], [3.0, 0.0, 0.0]], &device);
        let labels: Vec<i64> = logits_to_label(logits.clone())
            .into_data()
            .convert::<i64>()
            .to_vec()
            .unwrap();
        assert_eq!(labels, vec![1, 0]);

        let row_sums: Vec<f32> = logits_to_log_prob(logits)
            .exp()
            .sum_dim(1)
            .into_data()
            .to_vec()
            .unwrap();
        assert!(row_sums.iter().all(|s| (s - 1.0).abs() < 1e-5));
    }

    #[test]
    fn test_running_mean_weights_by_batch_size() {
        let mut mean = RunningMean::new();
        assert_eq!(mean.mean(), None);
        mean.update(1.0, 3);
        mean.update(0.0, 1);
        assert_eq!(mean.count(), 4);
        assert!((mean.mean().unwrap() - 0.75).abs() < 1e-12);
    }
}
