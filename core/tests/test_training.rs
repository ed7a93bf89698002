//! End-to-end training: loss goes down, a learnable task is learned,
//! snapshots warm-start new experiments, CSV data feeds the loop.

use std::io::Write;

use stacknn_core::config::ExperimentConfig;
use stacknn_core::model::{load_checkpoint, ControllerKind};
use stacknn_core::task::{SequenceSource, SequenceTransform, TaskConfig};
use stacknn_core::train::ExperimentContext;
use stacknn_core::Error;

// ── Helpers ──────────────────────────────────────────────────────────

fn small_task(transform: SequenceTransform, max_length: usize) -> TaskConfig {
    TaskConfig {
        transform,
        source: SequenceSource::RandomStrings {
            num_symbols: 2,
            min_length: 1,
            max_length,
            mean_length: max_length as f64 - 1.0,
            std_length: 1.0,
        },
        null: "#".to_string(),
        to_predict: None,
        train_size: 50,
        test_size: 20,
    }
}

fn small_experiment(transform: SequenceTransform) -> ExperimentConfig {
    let mut cfg = ExperimentConfig::for_task(small_task(transform, 4));
    cfg.training.batch_size = 10;
    cfg.training.learning_rate = 0.05;
    cfg.training.early_stopping_steps = None;
    cfg.training.seed = 1234;
    cfg
}

// ── Convergence ──────────────────────────────────────────────────────

#[test]
fn test_training_loss_decreases() {
    let mut cfg = small_experiment(SequenceTransform::Reverse);
    cfg.controller.kind = ControllerKind::Recurrent;
    cfg.controller.hidden_size = 8;
    cfg.training.epochs = 15;
    let mut ctx = ExperimentContext::new(cfg).unwrap();
    let summary = ctx.run().unwrap();

    let first = summary.epochs[0].train_loss;
    let last = summary.epochs[summary.epochs.len() - 1].train_loss;
    eprintln!("Reverse/Recurrent: first epoch loss={first:.4}, last={last:.4}");
    assert!(!summary.stopped_early);
    assert_eq!(summary.epochs.len(), 15);
    assert!(last.is_finite());
    assert!(last < first, "loss should decrease: first={first:.4}, last={last:.4}");
}

#[test]
fn test_identity_task_is_learned() {
    let mut cfg = small_experiment(SequenceTransform::Identity);
    cfg.training.epochs = 40;
    let mut ctx = ExperimentContext::new(cfg).unwrap();
    let before = ctx.evaluate(ctx.test_set()).unwrap();
    ctx.run().unwrap();
    let after = ctx.evaluate(ctx.test_set()).unwrap();
    eprintln!(
        "Identity/Linear: test loss {:.4} -> {:.4}, acc {:.3} -> {:.3}",
        before.loss, after.loss, before.accuracy(), after.accuracy()
    );
    assert!(after.loss < before.loss);
    assert!(after.accuracy() > 0.95, "accuracy {:.3}", after.accuracy());
}

#[test]
fn test_batch_reports() {
    let mut ctx = ExperimentContext::new(small_experiment(SequenceTransform::Reverse)).unwrap();
    let batch = ctx.train_set().batches(10).next().unwrap();
    let report = ctx.train_batch(0, 0, &batch).unwrap();
    assert!(report.loss.is_finite() && report.loss > 0.0);
    assert!(report.grad_norm.is_finite() && report.grad_norm > 0.0);
    assert!(report.correct <= report.total && report.total > 0);
    assert!((report.accuracy - report.correct as f32 / report.total as f32).abs() < 1e-6);
}

#[test]
fn test_same_seed_same_run() {
    let run = || {
        let mut cfg = small_experiment(SequenceTransform::Reverse);
        cfg.training.epochs = 2;
        let mut ctx = ExperimentContext::new(cfg).unwrap();
        ctx.run().unwrap();
        ctx.finish().unwrap()
    };
    assert_eq!(run(), run());
}

#[test]
fn test_early_stopping_respects_patience() {
    let mut cfg = small_experiment(SequenceTransform::Reverse);
    cfg.training.epochs = 30;
    cfg.training.early_stopping_steps = Some(2);
    cfg.training.learning_rate = 0.5;
    let mut ctx = ExperimentContext::new(cfg).unwrap();
    let summary = ctx.run().unwrap();
    let losses: Vec<f32> = summary.epochs.iter().map(|e| e.test_loss).collect();
    eprintln!("test losses: {losses:?}, stopped_early={}", summary.stopped_early);

    let best = losses.iter().copied().fold(f32::INFINITY, f32::min);
    assert_eq!(best, summary.best_test_loss);
    if summary.stopped_early {
        assert!(losses.len() < 30);
        // The last two epochs did not improve on the best before them.
        let n = losses.len();
        let prior_best = losses[..n - 2].iter().copied().fold(f32::INFINITY, f32::min);
        assert!(losses[n - 2..].iter().all(|&l| l >= prior_best));
    } else {
        assert_eq!(losses.len(), 30);
    }
}

// ── Snapshots ────────────────────────────────────────────────────────

#[test]
fn test_save_and_warm_start() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trained.json");

    let mut cfg = small_experiment(SequenceTransform::Reverse);
    cfg.training.epochs = 3;
    cfg.save_path = Some(path.clone());
    let mut ctx = ExperimentContext::new(cfg.clone()).unwrap();
    ctx.run().unwrap();
    let trained = ctx.finish().unwrap();

    let (saved, saved_cfg) = load_checkpoint(&path).unwrap();
    assert_eq!(saved, trained);

    let mut warm = cfg.clone();
    warm.save_path = None;
    warm.load_path = Some(path.clone());
    let ctx = ExperimentContext::new(warm).unwrap();
    assert_eq!(ctx.params(), &trained);
    assert_eq!(ctx.model_config(), &saved_cfg);

    // A snapshot from a different controller does not fit.
    let mut other = cfg;
    other.save_path = None;
    other.load_path = Some(path);
    other.controller.kind = ControllerKind::Recurrent;
    assert!(matches!(ExperimentContext::new(other), Err(Error::Config(_))));
}

// ── CSV data ─────────────────────────────────────────────────────────

#[test]
fn test_training_from_csv() {
    let dir = tempfile::tempdir().unwrap();
    let train_path = dir.path().join("train.csv");
    let test_path = dir.path().join("test.csv");

    let mut train = std::fs::File::create(&train_path).unwrap();
    writeln!(train, "input,target").unwrap();
    for i in 0..12 {
        let (x, y) = if i % 2 == 0 { ("0 1", "# # 1 0") } else { ("1 1 0", "# # # 0 1 1") };
        writeln!(train, "{x},{y}").unwrap();
    }
    std::fs::write(&test_path, "1 0,# # 0 1\n0 0 1,# # # 1 0 0\n").unwrap();

    let mut cfg = small_experiment(SequenceTransform::Reverse);
    cfg.train_csv = Some(train_path);
    cfg.test_csv = Some(test_path);
    cfg.training.epochs = 2;
    let mut ctx = ExperimentContext::new(cfg).unwrap();
    assert_eq!(ctx.train_set().len(), 12);
    assert_eq!(ctx.test_set().len(), 2);
    let summary = ctx.run().unwrap();
    assert_eq!(summary.epochs.len(), 2);
}

#[test]
fn test_too_little_csv_data() {
    let dir = tempfile::tempdir().unwrap();
    let train_path = dir.path().join("train.csv");
    std::fs::write(&train_path, "0 1,# # 1 0\n").unwrap();
    let mut cfg = small_experiment(SequenceTransform::Reverse);
    cfg.train_csv = Some(train_path);
    assert!(matches!(ExperimentContext::new(cfg), Err(Error::Data(_))));
}
