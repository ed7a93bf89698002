//! Sequence forward pass: drive the controller across every padded step of a
//! batch, collect the logits and score them against the targets.
//!
//! All intermediate buffers are kept in the returned cache for backward use.

use crate::controller::{Controller, ControllerTrace};
use crate::dataset::Batch;
use crate::error::{check_len, Result};
use crate::model::{ModelConfig, ModelParams};
use crate::task::evaluate_step;

/// Activations from a sequence forward pass, needed for backward.
pub struct ForwardCache {
    pub batch_size: usize,
    pub steps: usize,
    /// Output logits: [steps, batch, output_size]
    pub logits: Vec<f32>,
    /// Controller step caches and the stack log.
    pub trace: ControllerTrace,
}

/// Loss and accuracy counts over a batch.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SequenceLoss {
    /// Sum over steps of the per-step mean cross entropy.
    pub loss: f32,
    pub correct: usize,
    pub total: usize,
}

impl SequenceLoss {
    /// Fraction of scored positions predicted correctly (0 when nothing is scored).
    pub fn accuracy(&self) -> f32 {
        if self.total == 0 { 0.0 } else { self.correct as f32 / self.total as f32 }
    }
}

/// Run the controller over `steps` steps.
///
/// inputs: [batch_size, steps, input_size], one-hot rows as stored by the dataset.
pub fn forward_sequence(
    params: &ModelParams,
    cfg: &ModelConfig,
    inputs: &[f32],
    batch_size: usize,
    steps: usize,
) -> Result<ForwardCache> {
    let a = cfg.input_size;
    let o = cfg.output_size;
    check_len("sequence inputs", batch_size * steps * a, inputs.len())?;

    let mut controller = Controller::new(params, cfg, batch_size, steps)?;
    let mut logits = vec![0.0f32; steps * batch_size * o];
    let mut x_t = vec![0.0f32; batch_size * a];
    for t in 0..steps {
        for b in 0..batch_size {
            let src = (b * steps + t) * a;
            x_t[b * a..(b + 1) * a].copy_from_slice(&inputs[src..src + a]);
        }
        let out = controller.forward(&x_t)?;
        logits[t * batch_size * o..(t + 1) * batch_size * o].copy_from_slice(&out);
    }

    Ok(ForwardCache {
        batch_size,
        steps,
        logits,
        trace: controller.into_trace(),
    })
}

/// Targets and score mask for step `t`, gathered across the batch.
pub(crate) fn step_targets(batch: &Batch, t: usize) -> (Vec<usize>, Vec<bool>) {
    let steps = batch.steps;
    let targets = (0..batch.batch_size).map(|b| batch.targets[b * steps + t]).collect();
    let scored = (0..batch.batch_size).map(|b| batch.scored[b * steps + t]).collect();
    (targets, scored)
}

/// Run the full forward pass on a batch. Returns (loss, cache).
pub fn forward(params: &ModelParams, cfg: &ModelConfig, batch: &Batch) -> Result<(SequenceLoss, ForwardCache)> {
    check_len("batch input width", cfg.input_size, batch.input_size)?;
    let cache = forward_sequence(params, cfg, &batch.inputs, batch.batch_size, batch.steps)?;

    let o = cfg.output_size;
    let bs = batch.batch_size;
    let mut result = SequenceLoss::default();
    for t in 0..batch.steps {
        let (targets, scored) = step_targets(batch, t);
        let (loss, correct, total) = evaluate_step(&cache.logits[t * bs * o..(t + 1) * bs * o], &targets, &scored, o);
        result.loss += loss;
        result.correct += correct;
        result.total += total;
    }
    Ok((result, cache))
}
