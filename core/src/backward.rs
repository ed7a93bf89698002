//! Hand-written backward pass through controller and stack.
//!
//! The reverse loop is interleaved: the gradient w.r.t. the read returned at
//! step t only exists after controller step t+1 has been differentiated (that
//! read is part of step t+1's input). Each iteration therefore
//!   1. hands d_read_t to the stack's reverse walker, which yields d_v, d_u, d_d
//!      for step t,
//!   2. turns those into gate gradients through the sigmoid,
//!   3. differentiates controller step t, producing d_read_{t-1} and, for the
//!      recurrent kind, d_h_{t-1}.

use crate::controller::StepCache;
use crate::error::{check_len, Result};
use crate::forward::ForwardCache;
use crate::model::{ControllerKind, ModelConfig, ModelParams};
use crate::stack::StackBackward;
use crate::tensor::{matmul_acc_f32, matmul_f32, sum_rows_acc_f32, transpose_f32};

/// Backward through one controller step.
///
/// `d_y`: [B, Y] gradient w.r.t. the raw output, `d_h_next`: [B, H] gradient
/// arriving from step t+1's recurrence (empty for `Linear`). Parameter
/// gradients are accumulated into `grads`.
///
/// Returns (d_input [B, I], d_h_prev [B, H]).
pub fn controller_step_backward(
    params: &ModelParams,
    cfg: &ModelConfig,
    cache: &StepCache,
    d_y: &[f32],
    d_h_next: &[f32],
    batch_size: usize,
    grads: &mut ModelParams,
) -> (Vec<f32>, Vec<f32>) {
    let bs = batch_size;
    let i_w = cfg.controller_input_size();
    let y_w = cfg.output_width();
    let p_w = cfg.pre_output_size();

    let pre_out = match cfg.kind {
        ControllerKind::Linear => &cache.input,
        ControllerKind::Recurrent => &cache.hidden,
    };

    // y = pre_out @ W_out + b_out
    let mut pre_t = vec![0.0f32; p_w * bs];
    transpose_f32(pre_out, &mut pre_t, bs, p_w);
    matmul_acc_f32(&pre_t, d_y, &mut grads.w_out, p_w, bs, y_w);
    sum_rows_acc_f32(d_y, &mut grads.b_out, bs, y_w);

    let mut w_out_t = vec![0.0f32; y_w * p_w];
    transpose_f32(&params.w_out, &mut w_out_t, p_w, y_w);
    let mut d_pre_out = vec![0.0f32; bs * p_w];
    matmul_f32(d_y, &w_out_t, &mut d_pre_out, bs, y_w, p_w);

    match cfg.kind {
        ControllerKind::Linear => (d_pre_out, Vec::new()),
        ControllerKind::Recurrent => {
            let h = cfg.hidden_size;
            // h = tanh(pre): d_pre = (d_h_out + d_h_next) * (1 - h^2)
            let mut d_pre = d_pre_out;
            for (idx, dp) in d_pre.iter_mut().enumerate() {
                let hv = cache.hidden[idx];
                *dp = (*dp + d_h_next[idx]) * (1.0 - hv * hv);
            }

            let mut in_t = vec![0.0f32; i_w * bs];
            transpose_f32(&cache.input, &mut in_t, bs, i_w);
            matmul_acc_f32(&in_t, &d_pre, &mut grads.w_hidden, i_w, bs, h);

            let mut hp_t = vec![0.0f32; h * bs];
            transpose_f32(&cache.h_prev, &mut hp_t, bs, h);
            matmul_acc_f32(&hp_t, &d_pre, &mut grads.w_recur, h, bs, h);
            sum_rows_acc_f32(&d_pre, &mut grads.b_hidden, bs, h);

            let mut w_hidden_t = vec![0.0f32; h * i_w];
            transpose_f32(&params.w_hidden, &mut w_hidden_t, i_w, h);
            let mut d_input = vec![0.0f32; bs * i_w];
            matmul_f32(&d_pre, &w_hidden_t, &mut d_input, bs, h, i_w);

            let mut w_recur_t = vec![0.0f32; h * h];
            transpose_f32(&params.w_recur, &mut w_recur_t, h, h);
            let mut d_h_prev = vec![0.0f32; bs * h];
            matmul_f32(&d_pre, &w_recur_t, &mut d_h_prev, bs, h, h);

            (d_input, d_h_prev)
        }
    }
}

/// Full backward pass. `d_logits`: [steps, batch, output_size].
/// Returns parameter gradients shaped like `params`.
pub fn backward(
    params: &ModelParams,
    cfg: &ModelConfig,
    cache: &ForwardCache,
    d_logits: &[f32],
) -> Result<ModelParams> {
    let bs = cache.batch_size;
    let steps = cache.steps;
    let o = cfg.output_size;
    let a = cfg.input_size;
    let e = cfg.read_size;
    let rw = cfg.num_reads * e;
    let i_w = cfg.controller_input_size();
    let y_w = cfg.output_width();
    let g_w = cfg.gate_size();
    check_len("logit gradients", steps * bs * o, d_logits.len())?;

    let mut grads = ModelParams::zeros_like(cfg);
    let mut walker = StackBackward::new(&cache.trace.stack);
    let h = if cfg.kind == ControllerKind::Recurrent { cfg.hidden_size } else { 0 };
    let mut d_h = vec![0.0f32; bs * h];
    // Gradient w.r.t. the read of the step being processed; the last read is unused.
    let mut d_read = vec![0.0f32; bs * rw];

    for t in (0..steps).rev() {
        let step = &cache.trace.steps[t];
        let stack_grads = walker.step(&d_read)?;

        let mut d_y = vec![0.0f32; bs * y_w];
        for b in 0..bs {
            let row = &mut d_y[b * y_w..(b + 1) * y_w];
            row[..o].copy_from_slice(&d_logits[(t * bs + b) * o..(t * bs + b + 1) * o]);
            let gates = &step.gates[b * g_w..(b + 1) * g_w];
            let mut d_gate = |g: usize, upstream: f32| {
                let s = gates[g];
                row[o + g] = upstream * s * (1.0 - s);
            };
            d_gate(0, stack_grads.d_u[b]);
            d_gate(1, stack_grads.d_d[b]);
            for j in 0..e {
                d_gate(2 + j, stack_grads.d_v[b * e + j]);
            }
        }

        let (d_input, d_h_prev) = controller_step_backward(params, cfg, step, &d_y, &d_h, bs, &mut grads);
        for b in 0..bs {
            d_read[b * rw..(b + 1) * rw].copy_from_slice(&d_input[b * i_w + a..(b + 1) * i_w]);
        }
        d_h = d_h_prev;
    }

    Ok(grads)
}
