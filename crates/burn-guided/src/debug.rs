//! Tensor diagnostics

use burn::prelude::*;

use crate::{Error, Result};

fn host_values<B: Backend, const D: usize>(tensor: &Tensor<B, D>) -> Vec<f32> {
    tensor
        .clone()
        .into_data()
        .convert::<f32>()
        .to_vec()
        .unwrap_or_default()
}

/// Summary statistics of a tensor for logs
pub fn tensor_stats<B: Backend, const D: usize>(tensor: &Tensor<B, D>) -> String {
    let floats = host_values(tensor);
    if floats.is_empty() {
        return "empty".to_string();
    }

    let nan_count = floats.iter().filter(|x| x.is_nan()).count();
    let inf_count = floats.iter().filter(|x| x.is_infinite()).count();
    let finite: Vec<f32> = floats.iter().copied().filter(|x| x.is_finite()).collect();
    let min = finite.iter().copied().fold(f32::INFINITY, f32::min);
    let max = finite.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mean = finite.iter().sum::<f32>() / finite.len().max(1) as f32;
    let var = finite.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / finite.len().max(1) as f32;

    if nan_count > 0 || inf_count > 0 {
        format!(
            "min={:.4}, max={:.4}, mean={:.4}, std={:.4} [NaN={}, Inf={}]",
            min,
            max,
            mean,
            var.sqrt(),
            nan_count,
            inf_count
        )
    } else {
        format!(
            "min={:.4}, max={:.4}, mean={:.4}, std={:.4}",
            min,
            max,
            mean,
            var.sqrt()
        )
    }
}

/// Fail with [`Error::NonFinite`] when `tensor` holds NaN or Inf
pub fn check_finite<B: Backend, const D: usize>(
    tensor: &Tensor<B, D>,
    step: usize,
    t: usize,
) -> Result<()> {
    if host_values(tensor).iter().all(|x| x.is_finite()) {
        return Ok(());
    }
    Err(Error::NonFinite {
        step,
        t,
        stats: tensor_stats(tensor),
    })
}
