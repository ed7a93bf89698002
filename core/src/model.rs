//! Controller configuration and parameters.
//!
//! All weight matrices are flat Vec<f32> in row-major [in, out] layout, so a
//! batch of inputs [B, in] maps to [B, out] with a single matmul.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tensor::{vec_norm_f32, SimpleRng};

/// Which network drives the stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerKind {
    /// Feed-forward: y = [x; r] W_out + b_out.
    Linear,
    /// Elman RNN: h = tanh([x; r] W_hidden + h_prev W_recur + b_hidden), y = h W_out + b_out.
    Recurrent,
}

/// Model configuration, immutable after construction.
///
/// `input_size` is the input alphabet width A (NULL channel included),
/// `output_size` the number of output classes O, `read_size` the stack
/// embedding width E, `num_reads` the number of read levels k.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub kind: ControllerKind,
    pub input_size: usize,
    pub output_size: usize,
    pub read_size: usize,
    pub num_reads: usize,
    /// Hidden width; ignored by `Linear`.
    pub hidden_size: usize,
}

impl ModelConfig {
    /// Tiny feed-forward controller for fast tests.
    pub fn test_config() -> Self {
        ModelConfig {
            kind: ControllerKind::Linear,
            input_size: 4,
            output_size: 4,
            read_size: 2,
            num_reads: 1,
            hidden_size: 0,
        }
    }

    /// Tiny recurrent controller with two read levels.
    pub fn recurrent_test_config() -> Self {
        ModelConfig {
            kind: ControllerKind::Recurrent,
            input_size: 4,
            output_size: 4,
            read_size: 2,
            num_reads: 2,
            hidden_size: 5,
        }
    }

    /// Controller input width: A + k·E.
    pub fn controller_input_size(&self) -> usize {
        self.input_size + self.num_reads * self.read_size
    }

    /// Number of sigmoid gates: pop, push, then the push vector.
    pub fn gate_size(&self) -> usize {
        2 + self.read_size
    }

    /// Width of the raw output y: O logits followed by the gates.
    pub fn output_width(&self) -> usize {
        self.output_size + self.gate_size()
    }

    /// Width feeding W_out: the controller input for `Linear`, h for `Recurrent`.
    pub fn pre_output_size(&self) -> usize {
        match self.kind {
            ControllerKind::Linear => self.controller_input_size(),
            ControllerKind::Recurrent => self.hidden_size,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_size == 0 {
            return Err(Error::config("input_size must be > 0"));
        }
        if self.output_size == 0 {
            return Err(Error::config("output_size must be > 0"));
        }
        if self.read_size == 0 {
            return Err(Error::config("read_size must be > 0"));
        }
        if self.num_reads == 0 {
            return Err(Error::config("num_reads must be > 0"));
        }
        if self.kind == ControllerKind::Recurrent && self.hidden_size == 0 {
            return Err(Error::config("recurrent controller needs hidden_size > 0"));
        }
        Ok(())
    }
}

/// All learnable parameters.
///
/// Layout (row-major):
///   w_hidden: [I, H]   (Recurrent only, empty for Linear)
///   w_recur:  [H, H]   (Recurrent only)
///   b_hidden: [H]      (Recurrent only)
///   w_out:    [P, Y]   P = I (Linear) or H (Recurrent), Y = O + 2 + E
///   b_out:    [Y]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    pub w_hidden: Vec<f32>,
    pub w_recur: Vec<f32>,
    pub b_hidden: Vec<f32>,
    pub w_out: Vec<f32>,
    pub b_out: Vec<f32>,
}

impl ModelParams {
    fn shapes(cfg: &ModelConfig) -> [usize; 5] {
        let i = cfg.controller_input_size();
        let y = cfg.output_width();
        match cfg.kind {
            ControllerKind::Linear => [0, 0, 0, i * y, y],
            ControllerKind::Recurrent => {
                let h = cfg.hidden_size;
                [i * h, h * h, h, h * y, y]
            }
        }
    }

    /// Initialize with uniform values scaled by 1/sqrt(fan_in); biases start at zero.
    pub fn init(cfg: &ModelConfig, seed: u64) -> Self {
        let mut rng = SimpleRng::new(seed);
        let mut p = Self::zeros_like(cfg);
        let i = cfg.controller_input_size();

        if cfg.kind == ControllerKind::Recurrent {
            let h = cfg.hidden_size;
            rng.fill_uniform(&mut p.w_hidden, (1.0 / i as f32).sqrt());
            rng.fill_uniform(&mut p.w_recur, (1.0 / h as f32).sqrt());
        }
        let fan_in = cfg.pre_output_size();
        rng.fill_uniform(&mut p.w_out, (1.0 / fan_in as f32).sqrt());
        p
    }

    /// Create a zero-initialized shadow for gradient accumulation.
    pub fn zeros_like(cfg: &ModelConfig) -> Self {
        let [wh, wr, bh, wo, bo] = Self::shapes(cfg);
        ModelParams {
            w_hidden: vec![0.0; wh],
            w_recur: vec![0.0; wr],
            b_hidden: vec![0.0; bh],
            w_out: vec![0.0; wo],
            b_out: vec![0.0; bo],
        }
    }

    /// Check every buffer length against `cfg`.
    pub fn check_shapes(&self, cfg: &ModelConfig) -> Result<()> {
        let expected = Self::shapes(cfg);
        let names = ["w_hidden", "w_recur", "b_hidden", "w_out", "b_out"];
        for ((name, buf), want) in names.iter().zip(self.buffers()).zip(expected) {
            if buf.len() != want {
                return Err(Error::config(format!(
                    "parameter {name} has {} elements, config needs {want}", buf.len()
                )));
            }
        }
        Ok(())
    }

    /// Buffers in a fixed order: w_hidden, w_recur, b_hidden, w_out, b_out.
    pub fn buffers(&self) -> [&[f32]; 5] {
        [&self.w_hidden, &self.w_recur, &self.b_hidden, &self.w_out, &self.b_out]
    }

    pub fn buffers_mut(&mut self) -> [&mut Vec<f32>; 5] {
        [&mut self.w_hidden, &mut self.w_recur, &mut self.b_hidden, &mut self.w_out, &mut self.b_out]
    }

    /// Total number of parameters.
    pub fn num_params(&self) -> usize {
        self.buffers().iter().map(|b| b.len()).sum()
    }

    /// Global L2 norm across all buffers.
    pub fn norm(&self) -> f32 {
        self.buffers()
            .iter()
            .map(|b| {
                let n = vec_norm_f32(b);
                n * n
            })
            .sum::<f32>()
            .sqrt()
    }
}

// ── Parameter snapshot ───────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct ParamCheckpoint {
    config: ModelConfig,
    params: ModelParams,
}

/// Save params + config to a JSON file.
pub fn save_checkpoint(path: &Path, params: &ModelParams, config: &ModelConfig) -> Result<()> {
    let checkpoint = ParamCheckpoint {
        config: config.clone(),
        params: params.clone(),
    };
    let json = serde_json::to_string(&checkpoint)?;
    std::fs::write(path, json)?;
    tracing::debug!(path = %path.display(), num_params = params.num_params(), "saved parameter snapshot");
    Ok(())
}

/// Load params + config from a JSON file. Shapes are checked against the
/// stored config.
pub fn load_checkpoint(path: &Path) -> Result<(ModelParams, ModelConfig)> {
    let json = std::fs::read_to_string(path)?;
    let checkpoint: ParamCheckpoint = serde_json::from_str(&json)?;
    checkpoint.config.validate()?;
    checkpoint.params.check_shapes(&checkpoint.config)?;
    tracing::debug!(path = %path.display(), "loaded parameter snapshot");
    Ok((checkpoint.params, checkpoint.config))
}
