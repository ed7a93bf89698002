//! Controller: the network that drives a `NeuralStack` one step at a time.
//!
//! Each step sees `[x_t ; r_{t-1}]`, emits output logits plus the structure
//! gates (pop, push, push vector) and issues exactly one `push_pop_read`. The
//! read it gets back is fed into the next step. Activations are cached per
//! step for the paired backward in `backward.rs`.

use crate::error::{check_len, Result};
use crate::model::{ControllerKind, ModelConfig, ModelParams};
use crate::stack::NeuralStack;
use crate::tensor::{add_bias_f32, matmul_acc_f32, matmul_f32, sigmoid_f32};

/// Activations of one controller step.
#[derive(Clone, Debug)]
pub struct StepCache {
    /// [x_t ; r_{t-1}]: [B, I]
    pub input: Vec<f32>,
    /// Hidden state entering the step: [B, H] (empty for `Linear`)
    pub h_prev: Vec<f32>,
    /// tanh hidden state: [B, H] (empty for `Linear`)
    pub hidden: Vec<f32>,
    /// Raw output before the gate sigmoid: [B, O + 2 + E]
    pub y: Vec<f32>,
    /// Sigmoid gates: [B, 2 + E]
    pub gates: Vec<f32>,
}

/// Everything the backward pass needs once a sequence has been run.
pub struct ControllerTrace {
    pub batch_size: usize,
    pub steps: Vec<StepCache>,
    pub stack: NeuralStack,
}

/// A controller bound to one parameter set for the duration of a batch.
pub struct Controller<'a> {
    params: &'a ModelParams,
    cfg: ModelConfig,
    batch_size: usize,
    stack: NeuralStack,
    hidden: Vec<f32>,
    prev_read: Vec<f32>,
    steps: Vec<StepCache>,
}

impl<'a> Controller<'a> {
    /// Validate `params` against `cfg` and allocate a stack for `max_steps`.
    pub fn new(params: &'a ModelParams, cfg: &ModelConfig, batch_size: usize, max_steps: usize) -> Result<Self> {
        cfg.validate()?;
        params.check_shapes(cfg)?;
        let stack = NeuralStack::new(batch_size, cfg.read_size, cfg.num_reads, max_steps)?;
        let h = if cfg.kind == ControllerKind::Recurrent { cfg.hidden_size } else { 0 };
        Ok(Controller {
            params,
            cfg: cfg.clone(),
            batch_size,
            stack,
            hidden: vec![0.0; batch_size * h],
            prev_read: vec![0.0; batch_size * cfg.num_reads * cfg.read_size],
            steps: Vec::with_capacity(max_steps),
        })
    }

    /// Clear hidden state, previous read, stack and step caches for a new batch.
    pub fn reset(&mut self, batch_size: usize) -> Result<()> {
        self.stack.reset(batch_size, self.cfg.read_size)?;
        let h = if self.cfg.kind == ControllerKind::Recurrent { self.cfg.hidden_size } else { 0 };
        self.batch_size = batch_size;
        self.hidden = vec![0.0; batch_size * h];
        self.prev_read = vec![0.0; batch_size * self.cfg.num_reads * self.cfg.read_size];
        self.steps.clear();
        tracing::debug!(batch_size, "controller reset");
        Ok(())
    }

    pub fn config(&self) -> &ModelConfig {
        &self.cfg
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn stack(&self) -> &NeuralStack {
        &self.stack
    }

    pub fn steps(&self) -> &[StepCache] {
        &self.steps
    }

    /// Run one step. `x_t`: [B, A]. Returns the output logits [B, O].
    pub fn forward(&mut self, x_t: &[f32]) -> Result<Vec<f32>> {
        let cfg = &self.cfg;
        let bs = self.batch_size;
        let a = cfg.input_size;
        let rw = cfg.num_reads * cfg.read_size;
        let i_w = cfg.controller_input_size();
        let o = cfg.output_size;
        let y_w = cfg.output_width();
        let g_w = cfg.gate_size();
        let e = cfg.read_size;
        check_len("controller input", bs * a, x_t.len())?;

        let mut input = vec![0.0f32; bs * i_w];
        for b in 0..bs {
            input[b * i_w..b * i_w + a].copy_from_slice(&x_t[b * a..(b + 1) * a]);
            input[b * i_w + a..(b + 1) * i_w].copy_from_slice(&self.prev_read[b * rw..(b + 1) * rw]);
        }

        let p = self.params;
        let (h_prev, hidden) = match cfg.kind {
            ControllerKind::Linear => (Vec::new(), Vec::new()),
            ControllerKind::Recurrent => {
                let h = cfg.hidden_size;
                let mut pre = vec![0.0f32; bs * h];
                matmul_f32(&input, &p.w_hidden, &mut pre, bs, i_w, h);
                matmul_acc_f32(&self.hidden, &p.w_recur, &mut pre, bs, h, h);
                add_bias_f32(&mut pre, &p.b_hidden, bs, h);
                pre.iter_mut().for_each(|x| *x = x.tanh());
                (std::mem::replace(&mut self.hidden, pre.clone()), pre)
            }
        };

        let mut y = vec![0.0f32; bs * y_w];
        let pre_out = if cfg.kind == ControllerKind::Linear { &input } else { &hidden };
        matmul_f32(pre_out, &p.w_out, &mut y, bs, cfg.pre_output_size(), y_w);
        add_bias_f32(&mut y, &p.b_out, bs, y_w);

        let mut gates = vec![0.0f32; bs * g_w];
        let mut logits = vec![0.0f32; bs * o];
        let mut u = vec![0.0f32; bs];
        let mut d = vec![0.0f32; bs];
        let mut v = vec![0.0f32; bs * e];
        for b in 0..bs {
            let row = &y[b * y_w..(b + 1) * y_w];
            logits[b * o..(b + 1) * o].copy_from_slice(&row[..o]);
            for g in 0..g_w {
                gates[b * g_w + g] = sigmoid_f32(row[o + g]);
            }
            u[b] = gates[b * g_w];
            d[b] = gates[b * g_w + 1];
            v[b * e..(b + 1) * e].copy_from_slice(&gates[b * g_w + 2..(b + 1) * g_w]);
        }

        let read = self.stack.push_pop_read(&v, &u, &d)?;
        self.prev_read = read;
        self.steps.push(StepCache { input, h_prev, hidden, y, gates });
        Ok(logits)
    }

    /// Release the parameter borrow, keeping the caches and the stack.
    pub fn into_trace(self) -> ControllerTrace {
        ControllerTrace {
            batch_size: self.batch_size,
            steps: self.steps,
            stack: self.stack,
        }
    }
}
