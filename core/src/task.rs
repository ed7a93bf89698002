//! Task harness: what the controller reads and what it must predict.
//!
//! A task is a tagged pair of a sequence source (random strings or a
//! grammar) and a transform that turns each sampled sequence into an
//! `(input, target)` pair. Both sides are padded with the NULL symbol to the
//! task's fixed step count; padded or filtered-out targets are unscored.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::dataset::SequenceDataset;
use crate::error::{Error, Result};
use crate::grammar::Grammar;
use crate::tensor::masked_cross_entropy;

/// How each sampled sequence becomes an `(input, target)` pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequenceTransform {
    /// Copy: the target at every step is the input symbol.
    Identity,
    /// Read the string, then emit it backwards: y = NULL×len ++ reverse(x).
    Reverse,
    /// Like `Reverse`, after deleting every symbol from the upper half of the alphabet.
    ReverseDeletion,
    /// Predict the next symbol: y = x[1..].
    NextSymbol,
    /// Read the even-indexed symbols, predict the odd-indexed ones.
    Transduce,
}

impl SequenceTransform {
    /// Steps needed for sequences of up to `max_length` symbols.
    pub fn padded_length(self, max_length: usize) -> usize {
        match self {
            SequenceTransform::Identity | SequenceTransform::Reverse | SequenceTransform::ReverseDeletion => {
                2 * max_length
            }
            SequenceTransform::NextSymbol | SequenceTransform::Transduce => max_length,
        }
    }
}

/// How grammar sentences are drawn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sampling {
    /// Enumerate every sentence up to the depth once, then draw uniformly.
    Enumerate,
    /// Weighted random top-down derivation per example.
    Derive,
}

fn default_max_sentences() -> usize {
    100_000
}

/// Where sequences come from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SequenceSource {
    /// Uniform random symbols "0".."n-1"; length ~ floor(N(mean, std)) clamped to [min, max].
    RandomStrings {
        num_symbols: usize,
        min_length: usize,
        max_length: usize,
        mean_length: f64,
        std_length: f64,
    },
    /// Sentences of a context-free grammar.
    Grammar {
        grammar: String,
        sample_depth: usize,
        max_length: usize,
        sampling: Sampling,
        #[serde(default = "default_max_sentences")]
        max_sentences: usize,
    },
}

impl SequenceSource {
    pub fn max_length(&self) -> usize {
        match self {
            SequenceSource::RandomStrings { max_length, .. } | SequenceSource::Grammar { max_length, .. } => {
                *max_length
            }
        }
    }
}

fn default_null() -> String {
    "#".to_string()
}

fn default_train_size() -> usize {
    800
}

fn default_test_size() -> usize {
    100
}

/// Task configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub transform: SequenceTransform,
    pub source: SequenceSource,
    #[serde(default = "default_null")]
    pub null: String,
    /// Only targets in this set are scored. `None` scores every non-NULL target.
    #[serde(default)]
    pub to_predict: Option<Vec<String>>,
    #[serde(default = "default_train_size")]
    pub train_size: usize,
    #[serde(default = "default_test_size")]
    pub test_size: usize,
}

impl TaskConfig {
    /// Reversal of random binary strings, lengths 1..=12 around a mean of 10.
    pub fn reverse_default() -> Self {
        TaskConfig {
            transform: SequenceTransform::Reverse,
            source: SequenceSource::RandomStrings {
                num_symbols: 2,
                min_length: 1,
                max_length: 12,
                mean_length: 10.0,
                std_length: 2.0,
            },
            null: default_null(),
            to_predict: None,
            train_size: default_train_size(),
            test_size: default_test_size(),
        }
    }

    /// Next-symbol prediction on balanced parentheses and brackets.
    pub fn parentheses_default() -> Self {
        TaskConfig {
            transform: SequenceTransform::NextSymbol,
            source: SequenceSource::Grammar {
                grammar: "S -> S S [0.2]\n\
                          S -> '(' S ')' [0.2] | '(' ')' [0.2]\n\
                          S -> '[' S ']' [0.2] | '[' ']' [0.2]"
                    .to_string(),
                sample_depth: 5,
                max_length: 25,
                sampling: Sampling::Enumerate,
                max_sentences: default_max_sentences(),
            },
            null: default_null(),
            to_predict: Some(vec![")".to_string(), "]".to_string()]),
            train_size: default_train_size(),
            test_size: default_test_size(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.train_size == 0 || self.test_size == 0 {
            return Err(Error::config("train_size and test_size must be > 0"));
        }
        if self.null.is_empty() || self.null.chars().any(char::is_whitespace) || self.null.contains(',') {
            return Err(Error::config(format!("bad NULL symbol {:?}", self.null)));
        }
        match &self.source {
            SequenceSource::RandomStrings { num_symbols, min_length, max_length, mean_length, std_length } => {
                if *num_symbols == 0 {
                    return Err(Error::config("num_symbols must be > 0"));
                }
                if *min_length == 0 || min_length > max_length {
                    return Err(Error::config(format!(
                        "need 0 < min_length <= max_length (got {min_length}, {max_length})"
                    )));
                }
                if !mean_length.is_finite() || !std_length.is_finite() || *std_length < 0.0 {
                    return Err(Error::config("mean_length/std_length must be finite, std_length >= 0"));
                }
            }
            SequenceSource::Grammar { sample_depth, max_length, max_sentences, .. } => {
                if *sample_depth == 0 || *max_length == 0 || *max_sentences == 0 {
                    return Err(Error::config("sample_depth, max_length and max_sentences must be > 0"));
                }
            }
        }
        Ok(())
    }
}

// ── Alphabet ─────────────────────────────────────────────────────────

/// Symbol ↔ code map. NULL always has the highest code.
#[derive(Clone, Debug)]
pub struct Alphabet {
    symbols: Vec<String>,
    codes: HashMap<String, usize>,
}

impl Alphabet {
    /// `symbols` in code order, followed by `null`.
    pub fn new(symbols: Vec<String>, null: &str) -> Result<Self> {
        let mut all = symbols;
        all.push(null.to_string());
        let mut codes = HashMap::new();
        for (i, s) in all.iter().enumerate() {
            if codes.insert(s.clone(), i).is_some() {
                return Err(Error::config(format!("symbol {s:?} appears twice in the alphabet")));
            }
        }
        Ok(Alphabet { symbols: all, codes })
    }

    /// Number of codes, NULL included.
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn null_code(&self) -> usize {
        self.symbols.len() - 1
    }

    pub fn code(&self, symbol: &str) -> Option<usize> {
        self.codes.get(symbol).copied()
    }

    pub fn symbol(&self, code: usize) -> Option<&str> {
        self.symbols.get(code).map(String::as_str)
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    /// Map symbols to codes; an unknown symbol is a data error.
    pub fn encode<S: AsRef<str>>(&self, symbols: &[S]) -> Result<Vec<usize>> {
        symbols
            .iter()
            .map(|s| {
                let s = s.as_ref();
                self.code(s).ok_or_else(|| Error::data(format!("unknown symbol {s:?}")))
            })
            .collect()
    }

    pub fn decode(&self, codes: &[usize]) -> Vec<&str> {
        codes.iter().map(|&c| self.symbol(c).unwrap_or("?")).collect()
    }
}

// ── Task ─────────────────────────────────────────────────────────────

/// Per-step evaluation: mean cross entropy over the scored rows, number of
/// correct argmax predictions, number of scored rows.
pub fn evaluate_step(logits: &[f32], targets: &[usize], scored: &[bool], classes: usize) -> (f32, usize, usize) {
    masked_cross_entropy(logits, targets, scored, classes)
}

/// Draws sentences as symbol codes.
enum Sampler {
    Random { num_symbols: usize, min_length: usize, max_length: usize, length: Normal<f64> },
    Pool(Vec<Vec<usize>>),
    Derive { grammar: Grammar, depth: usize },
}

const DERIVE_ATTEMPTS: usize = 1000;

pub struct Task {
    config: TaskConfig,
    alphabet: Alphabet,
    max_steps: usize,
    sampler: Sampler,
    to_predict: Option<HashSet<usize>>,
}

impl Task {
    /// Build the alphabet and the sampler. For enumerated grammars the
    /// sentence pool is generated here, so an unproductive grammar fails
    /// before any training starts.
    pub fn new(config: TaskConfig) -> Result<Self> {
        config.validate()?;
        let max_steps = config.transform.padded_length(config.source.max_length());

        let (alphabet, sampler) = match &config.source {
            SequenceSource::RandomStrings { num_symbols, min_length, max_length, mean_length, std_length } => {
                let symbols = (0..*num_symbols).map(|i| i.to_string()).collect();
                let alphabet = Alphabet::new(symbols, &config.null)?;
                let length = Normal::new(*mean_length, *std_length)
                    .map_err(|e| Error::config(format!("length distribution N({mean_length}, {std_length}): {e}")))?;
                let sampler = Sampler::Random {
                    num_symbols: *num_symbols,
                    min_length: *min_length,
                    max_length: *max_length,
                    length,
                };
                (alphabet, sampler)
            }
            SequenceSource::Grammar { grammar, sample_depth, sampling, max_sentences, .. } => {
                let grammar = Grammar::parse(grammar)?;
                let alphabet = Alphabet::new(grammar.terminals().to_vec(), &config.null)?;
                let sampler = match sampling {
                    Sampling::Enumerate => {
                        let (sentences, truncated) = grammar.generate_unique(*sample_depth, *max_sentences);
                        if truncated {
                            tracing::warn!(
                                max_sentences, depth = sample_depth,
                                "sentence enumeration hit its cap; pool is a prefix of the language"
                            );
                        }
                        let pool = sentences.iter().map(|s| alphabet.encode(s)).collect::<Result<Vec<_>>>()?;
                        if pool.is_empty() {
                            return Err(Error::data(format!(
                                "grammar produces no sentences within depth {sample_depth}"
                            )));
                        }
                        let longest = pool.iter().map(Vec::len).max().unwrap_or(0);
                        tracing::info!(sentences = pool.len(), longest, "enumerated grammar sentences");
                        Sampler::Pool(pool)
                    }
                    Sampling::Derive => Sampler::Derive { grammar, depth: *sample_depth },
                };
                (alphabet, sampler)
            }
        };

        let to_predict = match &config.to_predict {
            Some(symbols) => Some(alphabet.encode(symbols)?.into_iter().collect()),
            None => None,
        };

        Ok(Task { config, alphabet, max_steps, sampler, to_predict })
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    pub fn alphabet(&self) -> &Alphabet {
        &self.alphabet
    }

    /// Fixed step count of every example.
    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    pub fn input_size(&self) -> usize {
        self.alphabet.len()
    }

    pub fn output_size(&self) -> usize {
        self.alphabet.len()
    }

    /// Whether a target code counts towards loss and accuracy.
    pub fn is_scored(&self, target: usize) -> bool {
        target != self.alphabet.null_code()
            && self.to_predict.as_ref().map_or(true, |set| set.contains(&target))
    }

    /// Draw one source sequence as codes.
    pub fn sample_sequence<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Vec<usize>> {
        match &self.sampler {
            Sampler::Random { num_symbols, min_length, max_length, length: lengths } => {
                let drawn = lengths.sample(rng).floor();
                let length = (drawn.max(0.0) as usize).clamp(*min_length, *max_length);
                Ok((0..length).map(|_| rng.gen_range(0..*num_symbols)).collect())
            }
            Sampler::Pool(pool) => {
                let i = rng.gen_range(0..pool.len());
                Ok(pool[i].clone())
            }
            Sampler::Derive { grammar, depth } => {
                let s = grammar.sample(rng, *depth, DERIVE_ATTEMPTS)?;
                self.alphabet.encode(&s)
            }
        }
    }

    /// Apply the transform to one sequence. Results are unpadded.
    pub fn transform(&self, seq: &[usize]) -> (Vec<usize>, Vec<usize>) {
        let null = self.alphabet.null_code();
        match self.config.transform {
            SequenceTransform::Identity => (seq.to_vec(), seq.to_vec()),
            SequenceTransform::Reverse => {
                let mut y = vec![null; seq.len()];
                y.extend(seq.iter().rev());
                (seq.to_vec(), y)
            }
            SequenceTransform::ReverseDeletion => {
                // Codes of "0".."n-1" equal their numeric value.
                let large = (self.alphabet.len() - 1) / 2;
                let mut y = vec![null; seq.len()];
                y.extend(seq.iter().rev().filter(|&&c| c < large));
                (seq.to_vec(), y)
            }
            SequenceTransform::NextSymbol => {
                let y = seq.get(1..).map(<[usize]>::to_vec).unwrap_or_default();
                (seq.to_vec(), y)
            }
            SequenceTransform::Transduce => {
                let x = seq.iter().step_by(2).copied().collect();
                let y = seq.iter().skip(1).step_by(2).copied().collect();
                (x, y)
            }
        }
    }

    /// Generate `n` examples.
    pub fn generate<R: Rng + ?Sized>(&self, rng: &mut R, n: usize) -> Result<SequenceDataset> {
        if n == 0 {
            return Err(Error::data("requested an empty dataset"));
        }
        let mut xs = Vec::with_capacity(n);
        let mut ys = Vec::with_capacity(n);
        let mut truncated = 0usize;
        for _ in 0..n {
            let seq = self.sample_sequence(rng)?;
            let (x, y) = self.transform(&seq);
            if x.len() > self.max_steps || y.len() > self.max_steps {
                truncated += 1;
            }
            xs.push(x);
            ys.push(y);
        }
        if truncated > 0 {
            tracing::warn!(truncated, max_steps = self.max_steps, "examples truncated to the step limit");
        }
        let ds = SequenceDataset::from_codes(&xs, &ys, self.max_steps, self.alphabet.len(), |c| self.is_scored(c))?;
        tracing::debug!(examples = n, scored = ds.num_scored(), "generated dataset");
        Ok(ds)
    }

    /// Load `input,target` CSV data in this task's alphabet and step count.
    pub fn load_csv(&self, path: &Path) -> Result<SequenceDataset> {
        SequenceDataset::from_csv_path(path, &self.alphabet, self.max_steps, |c| self.is_scored(c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn random_task(transform: SequenceTransform, num_symbols: usize) -> Task {
        let mut cfg = TaskConfig::reverse_default();
        cfg.transform = transform;
        cfg.source = SequenceSource::RandomStrings {
            num_symbols,
            min_length: 1,
            max_length: 6,
            mean_length: 4.0,
            std_length: 2.0,
        };
        Task::new(cfg).unwrap()
    }

    #[test]
    fn test_alphabet_null_is_last() {
        let a = Alphabet::new(vec!["x".into(), "y".into()], "#").unwrap();
        assert_eq!(a.len(), 3);
        assert_eq!(a.null_code(), 2);
        assert_eq!(a.code("#"), Some(2));
        assert_eq!(a.encode(&["y", "x"]).unwrap(), vec![1, 0]);
        assert!(a.encode(&["z"]).is_err());
        assert_eq!(a.decode(&[0, 2, 7]), vec!["x", "#", "?"]);
        assert!(Alphabet::new(vec!["#".into()], "#").is_err());
    }

    #[test]
    fn test_reverse_transform() {
        let task = random_task(SequenceTransform::Reverse, 3);
        let (x, y) = task.transform(&[0, 1, 2]);
        assert_eq!(x, vec![0, 1, 2]);
        assert_eq!(y, vec![3, 3, 3, 2, 1, 0]);
        assert_eq!(task.max_steps(), 12);
    }

    #[test]
    fn test_reverse_deletion_transform() {
        let task = random_task(SequenceTransform::ReverseDeletion, 4);
        let (_, y) = task.transform(&[1, 2, 2, 0, 0, 3, 1, 3, 0, 1, 1]);
        let null = 4;
        assert_eq!(&y[..11], &[null; 11]);
        assert_eq!(&y[11..], &[1, 1, 0, 1, 0, 0, 1]);
    }

    #[test]
    fn test_identity_next_symbol_transduce() {
        let task = random_task(SequenceTransform::Identity, 3);
        assert_eq!(task.transform(&[2, 0]), (vec![2, 0], vec![2, 0]));
        let task = random_task(SequenceTransform::NextSymbol, 3);
        assert_eq!(task.transform(&[2, 0, 1]), (vec![2, 0, 1], vec![0, 1]));
        assert_eq!(task.transform(&[]), (vec![], vec![]));
        assert_eq!(task.max_steps(), 6);
        let task = random_task(SequenceTransform::Transduce, 3);
        assert_eq!(task.transform(&[0, 1, 2, 0, 1]), (vec![0, 2, 1], vec![1, 0]));
    }

    #[test]
    fn test_random_lengths_clamped() {
        let task = random_task(SequenceTransform::Reverse, 2);
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..200 {
            let s = task.sample_sequence(&mut rng).unwrap();
            assert!((1..=6).contains(&s.len()));
            assert!(s.iter().all(|&c| c < 2));
        }
    }

    #[test]
    fn test_zero_std_gives_fixed_length() {
        let mut cfg = TaskConfig::reverse_default();
        cfg.source = SequenceSource::RandomStrings {
            num_symbols: 2,
            min_length: 1,
            max_length: 8,
            mean_length: 5.7,
            std_length: 0.0,
        };
        let task = Task::new(cfg).unwrap();
        let mut rng = StdRng::seed_from_u64(6);
        for _ in 0..20 {
            assert_eq!(task.sample_sequence(&mut rng).unwrap().len(), 5);
        }
    }

    #[test]
    fn test_random_lengths_follow_mean() {
        let mut cfg = TaskConfig::reverse_default();
        cfg.source = SequenceSource::RandomStrings {
            num_symbols: 2,
            min_length: 1,
            max_length: 40,
            mean_length: 20.5,
            std_length: 3.0,
        };
        let task = Task::new(cfg).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let n = 2000;
        let lengths: Vec<f64> = (0..n).map(|_| task.sample_sequence(&mut rng).unwrap().len() as f64).collect();
        let mean = lengths.iter().sum::<f64>() / n as f64;
        let var = lengths.iter().map(|l| (l - mean).powi(2)).sum::<f64>() / n as f64;
        // floor() shifts the mean down by about half a step.
        assert!((mean - 20.0).abs() < 0.3, "mean length {mean}");
        assert!((var.sqrt() - 3.0).abs() < 0.3, "length std {}", var.sqrt());
    }

    #[test]
    fn test_enumerated_pool_is_unique() {
        let cfg = TaskConfig {
            transform: SequenceTransform::Identity,
            source: SequenceSource::Grammar {
                grammar: "S -> 'a' | 'a' | 'a' 'b'".to_string(),
                sample_depth: 3,
                max_length: 2,
                sampling: Sampling::Enumerate,
                max_sentences: 100,
            },
            null: "#".to_string(),
            to_predict: None,
            train_size: 5,
            test_size: 5,
        };
        let task = Task::new(cfg).unwrap();
        match &task.sampler {
            Sampler::Pool(pool) => assert_eq!(pool, &vec![vec![0], vec![0, 1]]),
            _ => panic!("enumerated grammar should build a sentence pool"),
        }
    }

    #[test]
    fn test_grammar_alphabet_and_scoring() {
        let task = Task::new(TaskConfig::parentheses_default()).unwrap();
        let a = task.alphabet();
        assert_eq!(a.symbols(), &["(", ")", "[", "]", "#"]);
        assert_eq!(task.max_steps(), 25);
        assert!(task.is_scored(a.code(")").unwrap()));
        assert!(!task.is_scored(a.code("(").unwrap()));
        assert!(!task.is_scored(a.null_code()));
    }

    #[test]
    fn test_unproductive_grammar_is_data_error() {
        let mut cfg = TaskConfig::parentheses_default();
        if let SequenceSource::Grammar { sample_depth, .. } = &mut cfg.source {
            *sample_depth = 1;
        }
        assert!(matches!(Task::new(cfg), Err(Error::Data(_))));
    }

    #[test]
    fn test_unknown_to_predict_symbol() {
        let mut cfg = TaskConfig::parentheses_default();
        cfg.to_predict = Some(vec!["{".into()]);
        assert!(matches!(Task::new(cfg), Err(Error::Data(_))));
    }

    #[test]
    fn test_invalid_config() {
        let mut cfg = TaskConfig::reverse_default();
        cfg.train_size = 0;
        assert!(matches!(Task::new(cfg), Err(Error::Config(_))));
        let mut cfg = TaskConfig::reverse_default();
        cfg.null = "1".into();
        assert!(matches!(Task::new(cfg), Err(Error::Config(_))));
        let mut cfg = TaskConfig::reverse_default();
        if let SequenceSource::RandomStrings { std_length, .. } = &mut cfg.source {
            *std_length = -1.0;
        }
        assert!(matches!(Task::new(cfg), Err(Error::Config(_))));
    }

    #[test]
    fn test_generate_empty_is_error() {
        let task = random_task(SequenceTransform::Reverse, 2);
        let mut rng = StdRng::seed_from_u64(5);
        assert!(matches!(task.generate(&mut rng, 0), Err(Error::Data(_))));
    }
}
