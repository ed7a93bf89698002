//! Padded sequence datasets and mini-batching.
//!
//! A dataset holds N examples of a fixed number of steps T:
//!   inputs:  [N, T, A] one-hot, NULL is channel A - 1
//!   targets: [N, T]    symbol codes
//!   scored:  [N, T]    whether the position counts towards loss/accuracy
//!
//! Batches are gathered through a permutation that `shuffle` redraws, so the
//! tensors themselves never move.

use std::path::Path;

use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{Error, Result};
use crate::task::Alphabet;

/// A contiguous mini-batch, same layout as the dataset with N = batch_size.
#[derive(Clone, Debug)]
pub struct Batch {
    pub batch_size: usize,
    pub steps: usize,
    pub input_size: usize,
    /// [batch_size, steps, input_size]
    pub inputs: Vec<f32>,
    /// [batch_size, steps]
    pub targets: Vec<usize>,
    /// [batch_size, steps]
    pub scored: Vec<bool>,
}

#[derive(Clone, Debug)]
pub struct SequenceDataset {
    steps: usize,
    input_size: usize,
    inputs: Vec<f32>,
    targets: Vec<usize>,
    scored: Vec<bool>,
    order: Vec<usize>,
}

/// Pad `codes` with `null` to `steps`. Longer sequences are cut.
fn pad(codes: &[usize], steps: usize, null: usize) -> Vec<usize> {
    let mut out: Vec<usize> = codes.iter().copied().take(steps).collect();
    out.resize(steps, null);
    out
}

impl SequenceDataset {
    /// Build from unpadded code sequences. `is_scored` decides, per target
    /// code, whether a position is scored.
    pub fn from_codes(
        xs: &[Vec<usize>],
        ys: &[Vec<usize>],
        steps: usize,
        alphabet_size: usize,
        is_scored: impl Fn(usize) -> bool,
    ) -> Result<Self> {
        if xs.len() != ys.len() {
            return Err(Error::data(format!("{} inputs but {} targets", xs.len(), ys.len())));
        }
        if xs.is_empty() {
            return Err(Error::data("dataset would be empty"));
        }
        if steps == 0 || alphabet_size == 0 {
            return Err(Error::data("dataset needs steps > 0 and a non-empty alphabet"));
        }
        let null = alphabet_size - 1;
        let n = xs.len();
        let mut inputs = vec![0.0f32; n * steps * alphabet_size];
        let mut targets = Vec::with_capacity(n * steps);
        let mut scored = Vec::with_capacity(n * steps);

        for (i, (x, y)) in xs.iter().zip(ys).enumerate() {
            if let Some(&bad) = x.iter().chain(y).find(|&&c| c >= alphabet_size) {
                return Err(Error::data(format!("example {i}: code {bad} outside alphabet of {alphabet_size}")));
            }
            for (t, c) in pad(x, steps, null).into_iter().enumerate() {
                inputs[(i * steps + t) * alphabet_size + c] = 1.0;
            }
            for c in pad(y, steps, null) {
                targets.push(c);
                scored.push(is_scored(c));
            }
        }

        Ok(SequenceDataset {
            steps,
            input_size: alphabet_size,
            inputs,
            targets,
            scored,
            order: (0..n).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    /// Target codes of example `i` (in storage order).
    pub fn targets(&self, i: usize) -> &[usize] {
        &self.targets[i * self.steps..(i + 1) * self.steps]
    }

    /// Input codes of example `i`, recovered from the one-hot rows.
    pub fn input_codes(&self, i: usize) -> Vec<usize> {
        let a = self.input_size;
        (0..self.steps)
            .map(|t| {
                let row = &self.inputs[(i * self.steps + t) * a..(i * self.steps + t + 1) * a];
                row.iter().position(|&v| v == 1.0).unwrap_or(a - 1)
            })
            .collect()
    }

    /// Number of scored positions across the dataset.
    pub fn num_scored(&self) -> usize {
        self.scored.iter().filter(|&&s| s).count()
    }

    /// Redraw the batch order.
    pub fn shuffle<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.order.shuffle(rng);
    }

    /// Number of full batches; a partial tail is dropped.
    pub fn num_batches(&self, batch_size: usize) -> usize {
        if batch_size == 0 { 0 } else { self.len() / batch_size }
    }

    /// Gather the examples at `indices` (positions in the current order).
    pub fn batch(&self, indices: &[usize]) -> Batch {
        let t = self.steps;
        let a = self.input_size;
        let mut batch = Batch {
            batch_size: indices.len(),
            steps: t,
            input_size: a,
            inputs: Vec::with_capacity(indices.len() * t * a),
            targets: Vec::with_capacity(indices.len() * t),
            scored: Vec::with_capacity(indices.len() * t),
        };
        for &pos in indices {
            let i = self.order[pos];
            batch.inputs.extend_from_slice(&self.inputs[i * t * a..(i + 1) * t * a]);
            batch.targets.extend_from_slice(&self.targets[i * t..(i + 1) * t]);
            batch.scored.extend_from_slice(&self.scored[i * t..(i + 1) * t]);
        }
        batch
    }

    /// Full mini-batches in the current order.
    pub fn batches(&self, batch_size: usize) -> impl Iterator<Item = Batch> + '_ {
        (0..self.num_batches(batch_size)).map(move |k| {
            let indices: Vec<usize> = (k * batch_size..(k + 1) * batch_size).collect();
            self.batch(&indices)
        })
    }

    /// Every example in the current order, `size` at a time. The last chunk
    /// may be short.
    pub fn chunks(&self, size: usize) -> impl Iterator<Item = Batch> + '_ {
        let size = size.max(1);
        let n = self.len();
        (0..n).step_by(size).map(move |start| {
            let indices: Vec<usize> = (start..(start + size).min(n)).collect();
            self.batch(&indices)
        })
    }

    /// The whole dataset as one batch.
    pub fn as_batch(&self) -> Batch {
        let all: Vec<usize> = (0..self.len()).collect();
        self.batch(&all)
    }

    // ── CSV import ───────────────────────────────────────────────────

    /// Parse `input,target` rows of space-separated symbols.
    ///
    /// A first row reading `input,target` is skipped. Inputs may contain the
    /// NULL symbol only as trailing padding. Sequences longer than `steps`
    /// are rejected.
    pub fn from_csv_str(
        text: &str,
        alphabet: &Alphabet,
        steps: usize,
        is_scored: impl Fn(usize) -> bool,
    ) -> Result<Self> {
        let null = alphabet.null_code();
        let mut xs = Vec::new();
        let mut ys = Vec::new();

        for (i, line) in text.lines().enumerate() {
            let line_no = i + 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if i == 0 && line.eq_ignore_ascii_case("input,target") {
                continue;
            }
            let (x_field, y_field) = line
                .split_once(',')
                .ok_or_else(|| Error::data(format!("line {line_no}: expected two columns")))?;
            if y_field.contains(',') {
                return Err(Error::data(format!("line {line_no}: expected two columns")));
            }

            let encode = |field: &str| -> Result<Vec<usize>> {
                field
                    .split_whitespace()
                    .map(|s| {
                        alphabet
                            .code(s)
                            .ok_or_else(|| Error::data(format!("line {line_no}: unknown symbol {s:?}")))
                    })
                    .collect()
            };
            let x = encode(x_field)?;
            let y = encode(y_field)?;

            if let Some(first_null) = x.iter().position(|&c| c == null) {
                if x[first_null..].iter().any(|&c| c != null) {
                    return Err(Error::data(format!("line {line_no}: NULL inside the input, not just at the end")));
                }
            }
            if x.len() > steps || y.len() > steps {
                return Err(Error::data(format!(
                    "line {line_no}: sequence longer than {steps} steps"
                )));
            }
            xs.push(x);
            ys.push(y);
        }

        let ds = Self::from_codes(&xs, &ys, steps, alphabet.len(), is_scored)?;
        tracing::info!(examples = ds.len(), steps, "loaded CSV dataset");
        Ok(ds)
    }

    /// `from_csv_str` on a file.
    pub fn from_csv_path(
        path: &Path,
        alphabet: &Alphabet,
        steps: usize,
        is_scored: impl Fn(usize) -> bool,
    ) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_csv_str(&text, alphabet, steps, is_scored)
    }
}
