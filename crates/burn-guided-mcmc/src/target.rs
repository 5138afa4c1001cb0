//! Annealed target distributions

use burn::prelude::*;

use crate::Result;

/// Distribution a correction chain targets at respaced timestep `t`
///
/// Implementations return detached tensors so chains never accumulate a
/// computation graph.
pub trait AnnealedTarget<B: Backend> {
    /// `grad_x log p_t(x)`, same shape as `x`
    fn score(&self, x: Tensor<B, 4>, t: usize) -> Result<Tensor<B, 4>>;

    /// Unnormalized `log p_t(x)` per sample, when available in closed form
    ///
    /// Score-only targets return `None`; energy differences are then estimated
    /// from the score by the trapezoid rule.
    fn log_density(&self, _x: Tensor<B, 4>, _t: usize) -> Result<Option<Tensor<B, 1>>> {
        Ok(None)
    }
}

impl<B: Backend, T: AnnealedTarget<B> + ?Sized> AnnealedTarget<B> for &T {
    fn score(&self, x: Tensor<B, 4>, t: usize) -> Result<Tensor<B, 4>> {
        (**self).score(x, t)
    }

    fn log_density(&self, x: Tensor<B, 4>, t: usize) -> Result<Option<Tensor<B, 1>>> {
        (**self).log_density(x, t)
    }
}

/// Per-sample inner product over all non-batch dimensions
pub fn batch_dot<B: Backend>(a: Tensor<B, 4>, b: Tensor<B, 4>) -> Tensor<B, 1> {
    batch_sum(a * b)
}

/// Per-sample sum over all non-batch dimensions
pub fn batch_sum<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 1> {
    let batch = x.dims()[0];
    x.flatten::<2>(1, 3).sum_dim(1).reshape([batch])
}

/// Trapezoid estimate of `log p(x_K) - log p(x_0)` along a polyline
///
/// `points` and `scores` are the path vertices and the score at each vertex.
/// Exact when the score is affine in `x`.
pub fn trapezoid_path<B: Backend>(points: &[Tensor<B, 4>], scores: &[Tensor<B, 4>]) -> Tensor<B, 1> {
    debug_assert_eq!(points.len(), scores.len());
    debug_assert!(points.len() >= 2);
    let mut total = batch_dot(
        (scores[0].clone() + scores[1].clone()) * 0.5,
        points[1].clone() - points[0].clone(),
    );
    for k in 1..points.len() - 1 {
        total = total
            + batch_dot(
                (scores[k].clone() + scores[k + 1].clone()) * 0.5,
                points[k + 1].clone() - points[k].clone(),
            );
    }
    total
}

/// Trapezoid estimate of `log p_t(x_1) - log p_t(x_0)` along the straight line
///
/// Uses `intervals` equal sub-intervals. `score_0` and `score_1` are the scores
/// at the end points, which callers usually already hold, so only the
/// `intervals - 1` interior points are evaluated.
pub fn trapezoid_line<B: Backend, T: AnnealedTarget<B> + ?Sized>(
    target: &T,
    x_0: Tensor<B, 4>,
    x_1: Tensor<B, 4>,
    score_0: Tensor<B, 4>,
    score_1: Tensor<B, 4>,
    t: usize,
    intervals: usize,
) -> Result<Tensor<B, 1>> {
    let intervals = intervals.max(1);
    let delta = x_1 - x_0.clone();
    let mut score_sum = (score_0 + score_1) * 0.5;
    for k in 1..intervals {
        let point = x_0.clone() + delta.clone() * (k as f64 / intervals as f64);
        score_sum = score_sum + target.score(point, t)?;
    }
    Ok(batch_dot(score_sum, delta) / intervals as f64)
}
