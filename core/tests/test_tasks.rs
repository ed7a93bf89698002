//! Task harness: per-transform dataset invariants, grammar-driven tasks and
//! CSV import.

use std::io::Write;

use rand::rngs::StdRng;
use rand::SeedableRng;
use stacknn_core::grammar::Grammar;
use stacknn_core::task::{Sampling, SequenceSource, SequenceTransform, Task, TaskConfig};
use stacknn_core::Error;

// ── Helpers ──────────────────────────────────────────────────────────

fn random_task(transform: SequenceTransform) -> Task {
    Task::new(TaskConfig {
        transform,
        source: SequenceSource::RandomStrings {
            num_symbols: 4,
            min_length: 1,
            max_length: 5,
            mean_length: 3.0,
            std_length: 1.5,
        },
        null: "#".to_string(),
        to_predict: None,
        train_size: 30,
        test_size: 10,
    })
    .unwrap()
}

fn unpadded(codes: &[usize], null: usize) -> Vec<usize> {
    codes.iter().copied().take_while(|&c| c != null).collect()
}

fn padded(codes: &[usize], steps: usize, null: usize) -> Vec<usize> {
    let mut out = codes.to_vec();
    out.resize(steps, null);
    out
}

fn is_balanced(s: &[&str]) -> bool {
    let mut stack = Vec::new();
    for &c in s {
        match c {
            "(" | "[" => stack.push(c),
            ")" => {
                if stack.pop() != Some("(") {
                    return false;
                }
            }
            "]" => {
                if stack.pop() != Some("[") {
                    return false;
                }
            }
            _ => return false,
        }
    }
    stack.is_empty()
}

// ── Per-transform dataset invariants ─────────────────────────────────

macro_rules! transform_tests {
    ($name:ident, $transform:ident, $input_is_source:expr) => {
        paste::paste! {
            #[test]
            fn [<test_ $name _dataset_layout>]() {
                let task = random_task(SequenceTransform::$transform);
                let mut rng = StdRng::seed_from_u64(7);
                let ds = task.generate(&mut rng, 30).unwrap();
                let steps = task.max_steps();
                let null = task.alphabet().null_code();
                assert_eq!(ds.len(), 30);
                assert_eq!(ds.steps(), steps);
                assert_eq!(ds.input_size(), task.input_size());

                let batch = ds.as_batch();
                let a = batch.input_size;
                for row in batch.inputs.chunks(a) {
                    let hot: Vec<usize> = (0..a).filter(|&j| row[j] != 0.0).collect();
                    assert_eq!(hot.len(), 1, "{}: input row is not one-hot", stringify!($name));
                    assert_eq!(row[hot[0]], 1.0);
                }

                let mut scored = 0;
                for i in 0..ds.len() {
                    let x = ds.input_codes(i);
                    let y = ds.targets(i);
                    assert_eq!(x.len(), steps);
                    assert_eq!(y.len(), steps);
                    // NULL only as trailing padding on the input side.
                    let n = unpadded(&x, null).len();
                    assert!(x[n..].iter().all(|&c| c == null));
                    scored += y.iter().filter(|&&c| c != null).count();
                }
                assert_eq!(ds.num_scored(), scored, "{}: unscored non-NULL target", stringify!($name));
            }

            #[test]
            fn [<test_ $name _targets_follow_transform>]() {
                if !$input_is_source {
                    return;
                }
                let task = random_task(SequenceTransform::$transform);
                let mut rng = StdRng::seed_from_u64(8);
                let ds = task.generate(&mut rng, 20).unwrap();
                let null = task.alphabet().null_code();
                for i in 0..ds.len() {
                    let seq = unpadded(&ds.input_codes(i), null);
                    let (x, y) = task.transform(&seq);
                    assert_eq!(x, seq);
                    assert_eq!(ds.targets(i), padded(&y, task.max_steps(), null).as_slice());
                }
            }

            #[test]
            fn [<test_ $name _forward_is_finite>]() {
                use stacknn_core::config::ControllerConfig;
                use stacknn_core::forward::forward;
                use stacknn_core::model::ModelParams;

                let task = random_task(SequenceTransform::$transform);
                let cfg = ControllerConfig::default().model_config(&task);
                let params = ModelParams::init(&cfg, 3);
                let mut rng = StdRng::seed_from_u64(9);
                let ds = task.generate(&mut rng, 6).unwrap();
                let (loss, cache) = forward(&params, &cfg, &ds.as_batch()).unwrap();
                assert!(loss.loss.is_finite());
                assert_eq!(loss.total, ds.num_scored());
                assert_eq!(cache.logits.len(), task.max_steps() * 6 * task.output_size());
            }
        }
    };
}

transform_tests!(identity, Identity, true);
transform_tests!(reverse, Reverse, true);
transform_tests!(reverse_deletion, ReverseDeletion, true);
transform_tests!(next_symbol, NextSymbol, true);
transform_tests!(transduce, Transduce, false);

#[test]
fn test_reverse_second_half_mirrors_input() {
    let task = random_task(SequenceTransform::Reverse);
    let mut rng = StdRng::seed_from_u64(10);
    let ds = task.generate(&mut rng, 10).unwrap();
    let null = task.alphabet().null_code();
    for i in 0..ds.len() {
        let x = unpadded(&ds.input_codes(i), null);
        let n = x.len();
        let y = ds.targets(i);
        assert!(y[..n].iter().all(|&c| c == null));
        let mirrored: Vec<usize> = x.iter().rev().copied().collect();
        assert_eq!(&y[n..2 * n], mirrored.as_slice());
    }
}

#[test]
fn test_reverse_deletion_drops_upper_half() {
    let task = random_task(SequenceTransform::ReverseDeletion);
    let mut rng = StdRng::seed_from_u64(11);
    let ds = task.generate(&mut rng, 20).unwrap();
    for i in 0..ds.len() {
        // Four symbols: "2" and "3" are deleted.
        assert!(ds.targets(i).iter().all(|&c| c < 2 || c == 4));
    }
}

// ── Grammar tasks ────────────────────────────────────────────────────

#[test]
fn test_parentheses_task_sentences_are_balanced() {
    let mut cfg = TaskConfig::parentheses_default();
    if let SequenceSource::Grammar { sample_depth, max_length, .. } = &mut cfg.source {
        *sample_depth = 4;
        *max_length = 12;
    }
    let task = Task::new(cfg).unwrap();
    let mut rng = StdRng::seed_from_u64(12);
    let ds = task.generate(&mut rng, 40).unwrap();
    let alphabet = task.alphabet();
    let null = alphabet.null_code();
    let close = [alphabet.code(")").unwrap(), alphabet.code("]").unwrap()];

    for i in 0..ds.len() {
        let x = unpadded(&ds.input_codes(i), null);
        assert!(is_balanced(&alphabet.decode(&x)), "unbalanced {:?}", alphabet.decode(&x));
        // Next-symbol targets: x shifted left by one.
        assert_eq!(&ds.targets(i)[..x.len() - 1], &x[1..]);
    }
    let batch = ds.as_batch();
    for (t, &s) in batch.targets.iter().zip(&batch.scored) {
        assert_eq!(s, close.contains(t), "only closing brackets are scored");
    }
}

#[test]
fn test_derive_sampling_stays_in_language() {
    let cfg = TaskConfig {
        transform: SequenceTransform::Identity,
        source: SequenceSource::Grammar {
            grammar: "S -> 'a' S 'b' [0.4] | 'a' 'b' [0.6]".to_string(),
            sample_depth: 6,
            max_length: 10,
            sampling: Sampling::Derive,
            max_sentences: 100,
        },
        null: "#".to_string(),
        to_predict: Some(vec!["b".to_string()]),
        train_size: 10,
        test_size: 10,
    };
    let task = Task::new(cfg).unwrap();
    let mut rng = StdRng::seed_from_u64(13);
    let (a, b) = (task.alphabet().code("a").unwrap(), task.alphabet().code("b").unwrap());
    for _ in 0..100 {
        let s = task.sample_sequence(&mut rng).unwrap();
        let n = s.len() / 2;
        assert!(n >= 1 && s.len() <= 10);
        assert!(s[..n].iter().all(|&c| c == a) && s[n..].iter().all(|&c| c == b), "{s:?}");
    }
}

#[test]
fn test_grammar_text_round_trip() {
    let g = Grammar::parse(
        "# Dyck language\n\
         S -> S S [0.2]\n\
           | '(' S ')' [0.4]\n\
           | '(' ')' [0.4]",
    )
    .unwrap();
    assert_eq!(g.start(), "S");
    assert_eq!(g.productions().len(), 3);
    assert_eq!(g.terminals(), &["(", ")"]);
    let reparsed = Grammar::parse(
        &g.productions().iter().map(|p| p.to_string()).collect::<Vec<_>>().join("\n"),
    )
    .unwrap();
    assert_eq!(reparsed.productions(), g.productions());
}

#[test]
fn test_bad_grammar_is_data_error() {
    for text in ["S -> A", "S 'a'", "S -> 'a", "", "S -> 'a' [0]"] {
        assert!(matches!(Grammar::parse(text), Err(Error::Data(_))), "{text:?} should fail");
    }
}

// ── CSV import ───────────────────────────────────────────────────────

fn binary_reverse_task() -> Task {
    let mut cfg = TaskConfig::reverse_default();
    cfg.source = SequenceSource::RandomStrings {
        num_symbols: 2,
        min_length: 1,
        max_length: 3,
        mean_length: 2.0,
        std_length: 1.0,
    };
    Task::new(cfg).unwrap()
}

fn write_csv(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_load_csv() {
    let task = binary_reverse_task();
    let file = write_csv("input,target\n0 1 1,# # # 1 1 0\n1 #,# 1\n\n0,# 0\n");
    let ds = task.load_csv(file.path()).unwrap();
    assert_eq!(ds.len(), 3);
    assert_eq!(ds.steps(), 6);
    assert_eq!(ds.input_codes(0), vec![0, 1, 1, 2, 2, 2]);
    assert_eq!(ds.targets(0), &[2, 2, 2, 1, 1, 0]);
    assert_eq!(ds.input_codes(1), vec![1, 2, 2, 2, 2, 2]);
    assert_eq!(ds.num_scored(), 3 + 1 + 1);
}

#[test]
fn test_load_csv_rejects_bad_rows() {
    let task = binary_reverse_task();
    let cases = [
        "0 2,# 1",               // unknown symbol
        "0 # 1,# # 1",           // NULL inside the input
        "0 1 0 1 0 1 0,1",       // longer than the step count
        "0 1",                   // one column
        "0,1,1",                 // three columns
    ];
    for body in cases {
        let file = write_csv(body);
        assert!(matches!(task.load_csv(file.path()), Err(Error::Data(_))), "{body:?} should fail");
    }
}

#[test]
fn test_load_csv_missing_file_is_io_error() {
    let task = binary_reverse_task();
    let dir = tempfile::tempdir().unwrap();
    let err = task.load_csv(&dir.path().join("missing.csv")).unwrap_err();
    assert!(matches!(err, Error::Io(_)));
}
