//! Experiment configuration, deserialised from JSON and validated before
//! any stack or controller exists.
//!
//! ```json
//! {
//!   "controller": { "kind": "Recurrent", "read_size": 2, "hidden_size": 10 },
//!   "training":   { "batch_size": 10, "learning_rate": 0.01, "epochs": 30 },
//!   "task": {
//!     "transform": "Reverse",
//!     "source": { "type": "RandomStrings", "num_symbols": 2, "min_length": 1,
//!                 "max_length": 12, "mean_length": 10.0, "std_length": 2.0 }
//!   }
//! }
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::adamw::AdamWConfig;
use crate::error::{Error, Result};
use crate::model::{ControllerKind, ModelConfig};
use crate::task::{Task, TaskConfig};

fn default_kind() -> ControllerKind {
    ControllerKind::Linear
}
fn default_read_size() -> usize {
    2
}
fn default_num_reads() -> usize {
    1
}
fn default_hidden_size() -> usize {
    10
}

/// Controller shape; alphabet widths come from the task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default = "default_kind")]
    pub kind: ControllerKind,
    #[serde(default = "default_read_size")]
    pub read_size: usize,
    #[serde(default = "default_num_reads")]
    pub num_reads: usize,
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            kind: default_kind(),
            read_size: default_read_size(),
            num_reads: default_num_reads(),
            hidden_size: default_hidden_size(),
        }
    }
}

impl ControllerConfig {
    /// Full model config for a task's alphabet.
    pub fn model_config(&self, task: &Task) -> ModelConfig {
        ModelConfig {
            kind: self.kind,
            input_size: task.input_size(),
            output_size: task.output_size(),
            read_size: self.read_size,
            num_reads: self.num_reads,
            hidden_size: self.hidden_size,
        }
    }
}

fn default_batch_size() -> usize {
    10
}
fn default_learning_rate() -> f32 {
    0.01
}
fn default_l2_weight() -> f32 {
    0.01
}
fn default_epochs() -> usize {
    30
}
fn default_early_stopping() -> Option<usize> {
    Some(5)
}
fn default_seed() -> u64 {
    42
}
fn default_log_every() -> usize {
    10
}

/// Optimisation hyperparameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
    /// Decoupled weight decay.
    #[serde(default = "default_l2_weight")]
    pub l2_weight: f32,
    /// Rescale gradients whose global norm exceeds this.
    #[serde(default)]
    pub clipping_norm: Option<f32>,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    /// Stop after this many epochs without a test-loss improvement.
    #[serde(default = "default_early_stopping")]
    pub early_stopping_steps: Option<usize>,
    /// Seeds data generation, shuffling and weight init.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Batch report cadence.
    #[serde(default = "default_log_every")]
    pub log_every: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            batch_size: default_batch_size(),
            learning_rate: default_learning_rate(),
            l2_weight: default_l2_weight(),
            clipping_norm: None,
            epochs: default_epochs(),
            early_stopping_steps: default_early_stopping(),
            seed: default_seed(),
            log_every: default_log_every(),
        }
    }
}

impl TrainConfig {
    pub fn optimizer_config(&self) -> AdamWConfig {
        AdamWConfig {
            weight_decay: self.l2_weight,
            max_grad_norm: self.clipping_norm,
            ..AdamWConfig::default()
        }
    }
}

/// Everything needed to run one experiment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub training: TrainConfig,
    pub task: TaskConfig,
    /// Load the training set from CSV instead of generating it.
    #[serde(default)]
    pub train_csv: Option<PathBuf>,
    /// Load the test set from CSV instead of generating it.
    #[serde(default)]
    pub test_csv: Option<PathBuf>,
    /// Write a parameter snapshot here when the experiment finishes.
    #[serde(default)]
    pub save_path: Option<PathBuf>,
    /// Warm-start from a parameter snapshot.
    #[serde(default)]
    pub load_path: Option<PathBuf>,
}

impl ExperimentConfig {
    /// Defaults around a task.
    pub fn for_task(task: TaskConfig) -> Self {
        ExperimentConfig {
            controller: ControllerConfig::default(),
            training: TrainConfig::default(),
            task,
            train_csv: None,
            test_csv: None,
            save_path: None,
            load_path: None,
        }
    }

    /// Report the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        let c = &self.controller;
        if c.read_size == 0 {
            return Err(Error::config("controller.read_size must be > 0"));
        }
        if c.num_reads == 0 {
            return Err(Error::config("controller.num_reads must be > 0"));
        }
        if c.kind == ControllerKind::Recurrent && c.hidden_size == 0 {
            return Err(Error::config("controller.hidden_size must be > 0 for a recurrent controller"));
        }

        let t = &self.training;
        if t.batch_size == 0 {
            return Err(Error::config("training.batch_size must be > 0"));
        }
        if !(t.learning_rate.is_finite() && t.learning_rate > 0.0) {
            return Err(Error::config(format!("training.learning_rate must be > 0, got {}", t.learning_rate)));
        }
        if !(t.l2_weight.is_finite() && t.l2_weight >= 0.0) {
            return Err(Error::config(format!("training.l2_weight must be >= 0, got {}", t.l2_weight)));
        }
        if let Some(norm) = t.clipping_norm {
            if !(norm.is_finite() && norm > 0.0) {
                return Err(Error::config(format!("training.clipping_norm must be > 0, got {norm}")));
            }
        }
        if t.epochs == 0 {
            return Err(Error::config("training.epochs must be > 0"));
        }
        if t.early_stopping_steps == Some(0) {
            return Err(Error::config("training.early_stopping_steps must be > 0 when set"));
        }
        if t.log_every == 0 {
            return Err(Error::config("training.log_every must be > 0"));
        }

        self.task.validate()?;
        if self.train_csv.is_none() && self.task.train_size < t.batch_size {
            return Err(Error::config(format!(
                "train_size {} is smaller than one batch of {}",
                self.task.train_size, t.batch_size
            )));
        }
        Ok(())
    }

    /// Parse and validate.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let cfg: ExperimentConfig = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
