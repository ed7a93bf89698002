//! AdamW optimizer for the controller parameters.
//!
//! One moment pair per parameter buffer, a shared step counter for bias
//! correction, decoupled weight decay, and optional global-norm gradient
//! clipping applied before the moment update.
//!
//! Source: Loshchilov & Hutter 2019.

use serde::{Deserialize, Serialize};

use crate::model::ModelParams;

/// AdamW hyperparameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdamWConfig {
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    pub weight_decay: f32,
    /// Rescale gradients whose global L2 norm exceeds this value.
    pub max_grad_norm: Option<f32>,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        AdamWConfig {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.01,
            max_grad_norm: None,
        }
    }
}

#[derive(Clone)]
struct MomentBuf {
    m: Vec<f32>,
    v: Vec<f32>,
}

impl MomentBuf {
    fn zeros(n: usize) -> Self {
        MomentBuf { m: vec![0.0; n], v: vec![0.0; n] }
    }
}

/// Core AdamW step on a single (params, grads, m, v) group.
///
/// `grad_scale` multiplies every gradient entry (clipping factor).
#[inline]
fn adamw_step_buf(
    params: &mut [f32],
    grads: &[f32],
    buf: &mut MomentBuf,
    lr: f32,
    c: &AdamWConfig,
    bc1_inv: f32,
    bc2_inv: f32,
    grad_scale: f32,
) {
    debug_assert_eq!(params.len(), grads.len());
    for i in 0..params.len() {
        let g = grads[i] * grad_scale;
        buf.m[i] = c.beta1 * buf.m[i] + (1.0 - c.beta1) * g;
        buf.v[i] = c.beta2 * buf.v[i] + (1.0 - c.beta2) * g * g;
        let m_hat = buf.m[i] * bc1_inv;
        let v_hat = buf.v[i] * bc2_inv;
        params[i] -= lr * (m_hat / (v_hat.sqrt() + c.eps) + c.weight_decay * params[i]);
    }
}

pub struct AdamW {
    pub config: AdamWConfig,
    bufs: Vec<MomentBuf>,
    step: u32,
}

impl AdamW {
    /// Create optimizer state shaped like `params`.
    pub fn new(params: &ModelParams, config: AdamWConfig) -> Self {
        let bufs = params.buffers().iter().map(|b| MomentBuf::zeros(b.len())).collect();
        AdamW { config, bufs, step: 0 }
    }

    /// Number of updates applied so far.
    pub fn step_count(&self) -> u32 {
        self.step
    }

    /// Apply one update. Returns the gradient norm before clipping.
    pub fn step(&mut self, params: &mut ModelParams, grads: &ModelParams, lr: f32) -> f32 {
        let grad_norm = grads.norm();
        let grad_scale = match self.config.max_grad_norm {
            Some(max) if grad_norm > max && grad_norm > 0.0 => max / grad_norm,
            _ => 1.0,
        };

        self.step += 1;
        let t = self.step as f32;
        let bc1_inv = 1.0 / (1.0 - self.config.beta1.powf(t));
        let bc2_inv = 1.0 / (1.0 - self.config.beta2.powf(t));

        let c = &self.config;
        for ((p, g), buf) in params.buffers_mut().into_iter().zip(grads.buffers()).zip(self.bufs.iter_mut()) {
            adamw_step_buf(p, g, buf, lr, c, bc1_inv, bc2_inv, grad_scale);
        }
        grad_norm
    }
}
