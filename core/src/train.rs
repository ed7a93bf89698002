//! Training loop.
//!
//! `ExperimentContext::new` does all setup (validate, build task, data,
//! parameters, optimizer, RNG); `run` trains for the configured epochs,
//! evaluating on the test set after each; `finish` writes the parameter
//! snapshot. Each mini-batch gets a fresh controller and stack, one forward
//! across every padded step, one backward, one optimizer step.

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::adamw::AdamW;
use crate::config::ExperimentConfig;
use crate::dataset::{Batch, SequenceDataset};
use crate::error::{check_len, Error, Result};
use crate::forward::{forward_sequence, step_targets, SequenceLoss};
use crate::gradient::compute_gradients;
use crate::model::{load_checkpoint, save_checkpoint, ModelConfig, ModelParams};
use crate::task::{evaluate_step, Task};

/// Result of one optimizer step.
#[derive(Clone, Copy, Debug)]
pub struct BatchReport {
    pub epoch: usize,
    pub batch: usize,
    pub loss: f32,
    pub accuracy: f32,
    pub correct: usize,
    pub total: usize,
    /// Gradient norm before clipping.
    pub grad_norm: f32,
}

/// Training and test metrics for one epoch.
#[derive(Clone, Copy, Debug)]
pub struct EpochReport {
    pub epoch: usize,
    /// Mean batch loss.
    pub train_loss: f32,
    pub train_accuracy: f32,
    pub test_loss: f32,
    pub test_accuracy: f32,
}

/// What `run` did.
#[derive(Clone, Debug)]
pub struct RunSummary {
    pub epochs: Vec<EpochReport>,
    pub best_test_loss: f32,
    pub stopped_early: bool,
}

pub struct ExperimentContext {
    config: ExperimentConfig,
    task: Task,
    model_config: ModelConfig,
    params: ModelParams,
    optimizer: AdamW,
    train: SequenceDataset,
    test: SequenceDataset,
    rng: StdRng,
    history: Vec<EpochReport>,
}

impl ExperimentContext {
    pub fn new(config: ExperimentConfig) -> Result<Self> {
        config.validate()?;
        let task = Task::new(config.task.clone())?;
        let model_config = config.controller.model_config(&task);
        model_config.validate()?;

        let mut rng = StdRng::seed_from_u64(config.training.seed);
        let train = match &config.train_csv {
            Some(path) => task.load_csv(path)?,
            None => task.generate(&mut rng, config.task.train_size)?,
        };
        let test = match &config.test_csv {
            Some(path) => task.load_csv(path)?,
            None => task.generate(&mut rng, config.task.test_size)?,
        };
        if train.len() < config.training.batch_size {
            return Err(Error::data(format!(
                "{} training examples cannot fill a batch of {}",
                train.len(),
                config.training.batch_size
            )));
        }

        let params = match &config.load_path {
            Some(path) => {
                let (params, loaded) = load_checkpoint(path)?;
                if loaded != model_config {
                    return Err(Error::config(format!(
                        "snapshot {} was trained with {loaded:?}, experiment needs {model_config:?}",
                        path.display()
                    )));
                }
                params
            }
            None => ModelParams::init(&model_config, config.training.seed),
        };
        let optimizer = AdamW::new(&params, config.training.optimizer_config());

        tracing::info!(
            transform = ?config.task.transform,
            kind = ?model_config.kind,
            alphabet = task.alphabet().len(),
            steps = task.max_steps(),
            train = train.len(),
            test = test.len(),
            num_params = params.num_params(),
            lr = config.training.learning_rate,
            batch_size = config.training.batch_size,
            "experiment initialised"
        );

        Ok(ExperimentContext {
            config,
            task,
            model_config,
            params,
            optimizer,
            train,
            test,
            rng,
            history: Vec::new(),
        })
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn model_config(&self) -> &ModelConfig {
        &self.model_config
    }

    pub fn params(&self) -> &ModelParams {
        &self.params
    }

    pub fn train_set(&self) -> &SequenceDataset {
        &self.train
    }

    pub fn test_set(&self) -> &SequenceDataset {
        &self.test
    }

    pub fn history(&self) -> &[EpochReport] {
        &self.history
    }

    /// One optimizer step on one mini-batch.
    pub fn train_batch(&mut self, epoch: usize, index: usize, batch: &Batch) -> Result<BatchReport> {
        let (loss, grads) = compute_gradients(&self.params, &self.model_config, batch)?;
        let grad_norm = self.optimizer.step(&mut self.params, &grads, self.config.training.learning_rate);
        Ok(BatchReport {
            epoch,
            batch: index,
            loss: loss.loss,
            accuracy: loss.accuracy(),
            correct: loss.correct,
            total: loss.total,
            grad_norm,
        })
    }

    /// Loss and accuracy on a dataset, run `batch_size` examples at a time.
    ///
    /// Per-step losses are pooled across chunks before averaging, so the
    /// result equals a single forward over the whole dataset.
    pub fn evaluate(&self, data: &SequenceDataset) -> Result<SequenceLoss> {
        let cfg = &self.model_config;
        check_len("dataset input width", cfg.input_size, data.input_size())?;
        let o = cfg.output_size;
        let steps = data.steps();
        let mut step_loss = vec![0.0f32; steps];
        let mut step_count = vec![0usize; steps];
        let mut result = SequenceLoss::default();

        for chunk in data.chunks(self.config.training.batch_size) {
            let cache = forward_sequence(&self.params, cfg, &chunk.inputs, chunk.batch_size, steps)?;
            let bs = chunk.batch_size;
            for t in 0..steps {
                let (targets, scored) = step_targets(&chunk, t);
                let (loss, correct, total) =
                    evaluate_step(&cache.logits[t * bs * o..(t + 1) * bs * o], &targets, &scored, o);
                step_loss[t] += loss * total as f32;
                step_count[t] += total;
                result.correct += correct;
                result.total += total;
            }
        }

        result.loss = step_loss
            .iter()
            .zip(&step_count)
            .filter(|(_, n)| **n > 0)
            .map(|(&l, &n)| l / n as f32)
            .sum();
        Ok(result)
    }

    /// Shuffle, train on every full batch, then evaluate on the test set.
    pub fn run_epoch(&mut self, epoch: usize) -> Result<EpochReport> {
        self.train.shuffle(&mut self.rng);
        let batch_size = self.config.training.batch_size;
        let log_every = self.config.training.log_every;
        let batches: Vec<Batch> = self.train.batches(batch_size).collect();

        let mut loss_sum = 0.0f32;
        let mut correct = 0usize;
        let mut total = 0usize;
        for (index, batch) in batches.iter().enumerate() {
            let report = self.train_batch(epoch, index, batch)?;
            loss_sum += report.loss;
            correct += report.correct;
            total += report.total;
            if index % log_every == 0 {
                tracing::debug!(
                    epoch, batch = index, loss = report.loss, acc = report.accuracy,
                    grad_norm = report.grad_norm, "batch"
                );
            }
        }

        let test = self.evaluate(&self.test)?;
        let report = EpochReport {
            epoch,
            train_loss: if batches.is_empty() { 0.0 } else { loss_sum / batches.len() as f32 },
            train_accuracy: if total == 0 { 0.0 } else { correct as f32 / total as f32 },
            test_loss: test.loss,
            test_accuracy: test.accuracy(),
        };
        tracing::info!(
            epoch,
            train_loss = report.train_loss,
            train_acc = report.train_accuracy,
            test_loss = report.test_loss,
            test_acc = report.test_accuracy,
            "epoch"
        );
        self.history.push(report);
        Ok(report)
    }

    /// Train for the configured number of epochs, stopping early when the
    /// test loss has not improved for `early_stopping_steps` epochs.
    pub fn run(&mut self) -> Result<RunSummary> {
        let epochs = self.config.training.epochs;
        let patience = self.config.training.early_stopping_steps;
        let first = self.history.len();

        let mut best = f32::INFINITY;
        let mut since_best = 0usize;
        let mut stopped_early = false;
        for epoch in first..first + epochs {
            let report = self.run_epoch(epoch)?;
            if report.test_loss < best {
                best = report.test_loss;
                since_best = 0;
            } else {
                since_best += 1;
            }
            if let Some(p) = patience {
                if since_best >= p {
                    tracing::info!(epoch, best_test_loss = best, "early stopping");
                    stopped_early = true;
                    break;
                }
            }
        }

        Ok(RunSummary {
            epochs: self.history[first..].to_vec(),
            best_test_loss: best,
            stopped_early,
        })
    }

    /// Write the parameter snapshot (if `save_path` is set) and hand back
    /// the trained parameters.
    pub fn finish(self) -> Result<ModelParams> {
        if let Some(path) = &self.config.save_path {
            save_checkpoint(path, &self.params, &self.model_config)?;
            tracing::info!(path = %path.display(), "saved parameters");
        }
        Ok(self.params)
    }
}
