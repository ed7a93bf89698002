//! Gradient orchestration and verification.
//!
//! Provides:
//! - `compute_gradients`: forward + loss gradient + backward for one batch
//! - `finite_diff_gradient`: central finite differences for verification
//! - `check_weight_gradient`: sampled analytical-vs-numerical comparison

use crate::backward::backward;
use crate::dataset::Batch;
use crate::error::{Error, Result};
use crate::forward::{forward, step_targets, SequenceLoss};
use crate::model::{ModelConfig, ModelParams};
use crate::tensor::masked_cross_entropy_backward;

/// Names of the parameter buffers, in `ModelParams::buffers` order.
pub const PARAM_NAMES: [&str; 5] = ["w_hidden", "w_recur", "b_hidden", "w_out", "b_out"];

/// Compute the batch loss and its gradient w.r.t. every parameter.
pub fn compute_gradients(
    params: &ModelParams,
    cfg: &ModelConfig,
    batch: &Batch,
) -> Result<(SequenceLoss, ModelParams)> {
    let (loss, cache) = forward(params, cfg, batch)?;

    let o = cfg.output_size;
    let bs = batch.batch_size;
    let mut d_logits = vec![0.0f32; batch.steps * bs * o];
    for t in 0..batch.steps {
        let (targets, scored) = step_targets(batch, t);
        let range = t * bs * o..(t + 1) * bs * o;
        masked_cross_entropy_backward(&cache.logits[range.clone()], &targets, &scored, o, &mut d_logits[range]);
    }

    let grads = backward(params, cfg, &cache, &d_logits)?;
    Ok((loss, grads))
}

/// Central finite difference of the batch loss w.r.t. one parameter entry.
pub fn finite_diff_gradient(
    params: &ModelParams,
    cfg: &ModelConfig,
    batch: &Batch,
    buffer: usize,
    idx: usize,
    eps: f32,
) -> Result<f32> {
    let len = params.buffers().get(buffer).map_or(0, |b| b.len());
    if idx >= len {
        return Err(Error::config(format!("no parameter entry {idx} in buffer {buffer}")));
    }

    let mut p_plus = params.clone();
    let mut bufs = p_plus.buffers_mut();
    bufs[buffer][idx] += eps;
    let (loss_plus, _) = forward(&p_plus, cfg, batch)?;

    let mut p_minus = params.clone();
    let mut bufs = p_minus.buffers_mut();
    bufs[buffer][idx] -= eps;
    let (loss_minus, _) = forward(&p_minus, cfg, batch)?;

    Ok((loss_plus.loss - loss_minus.loss) / (2.0 * eps))
}

/// Outcome of a sampled gradient check on one buffer.
#[derive(Clone, Copy, Debug)]
pub struct GradCheck {
    pub checked: usize,
    pub passed: usize,
    pub max_rel_err: f32,
}

impl GradCheck {
    pub fn pass_rate(&self) -> f32 {
        if self.checked == 0 { 1.0 } else { self.passed as f32 / self.checked as f32 }
    }
}

/// Check up to `num_samples` evenly spaced entries of one parameter buffer.
///
/// Uses relative error with denominator = max(|a|, |b|). Entries where both
/// analytical and numerical are below `abs_threshold` are auto-passed (below
/// FD resolution in f32).
pub fn check_weight_gradient(
    params: &ModelParams,
    cfg: &ModelConfig,
    batch: &Batch,
    grads: &ModelParams,
    buffer: usize,
    num_samples: usize,
    eps: f32,
    tol: f32,
) -> Result<GradCheck> {
    let abs_threshold = 5e-4;
    let analytical_buf = grads
        .buffers()
        .get(buffer)
        .copied()
        .ok_or_else(|| Error::config(format!("no parameter buffer {buffer}")))?;
    let n = analytical_buf.len();
    let step = if n > num_samples { n / num_samples } else { 1 };

    let mut report = GradCheck { checked: 0, passed: 0, max_rel_err: 0.0 };
    for idx in (0..n).step_by(step).take(num_samples) {
        let analytical = analytical_buf[idx];
        let numerical = finite_diff_gradient(params, cfg, batch, buffer, idx, eps)?;
        report.checked += 1;

        let denom = analytical.abs().max(numerical.abs());
        if denom < abs_threshold {
            report.passed += 1;
            continue;
        }
        let rel_err = (analytical - numerical).abs() / denom;
        report.max_rel_err = report.max_rel_err.max(rel_err);
        if rel_err < tol {
            report.passed += 1;
        } else {
            tracing::debug!(
                buffer = PARAM_NAMES[buffer], idx, analytical, numerical, rel_err,
                "gradient check mismatch"
            );
        }
    }
    Ok(report)
}
