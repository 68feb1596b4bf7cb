//! End-to-end driver tests over real partition files and the built-in
//! linear model.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use ndarray::{Array2, Array3, Axis};
use trainrun_core::config::{DataConfig, RunConfig};
use trainrun_core::data::MatrixFile;
use trainrun_core::driver::{Phase, TrainingLoopDriver};
use trainrun_core::error::RunError;
use trainrun_core::metrics::MetricReport;
use trainrun_core::registry::{MetricRegistry, ModelRegistry};
use trainrun_core::reporter::Reporter;
use trainrun_core::sampler::Partition;

/// Learnable toy data: targets are fixed linear functions of the inputs.
fn synthetic(n: usize, n_targets: usize) -> (Array3<f32>, Array2<f32>) {
    let inputs = Array3::from_shape_fn((n, 4, 2), |(i, j, k)| {
        ((i * 7 + j * 3 + k) % 13) as f32 / 13.0
    });
    let targets = Array2::from_shape_fn((n, n_targets), |(i, t)| {
        inputs.index_axis(Axis(0), i).sum() * (t + 1) as f32 * 0.1
    });
    (inputs, targets)
}

fn write_partitions(dir: &Path, train_n: usize, eval_n: usize) {
    for (name, n) in [("train", train_n), ("validate", eval_n), ("test", eval_n)] {
        let (inputs, targets) = synthetic(n, 3);
        MatrixFile::write(
            &dir.join(format!("{name}.st")),
            &inputs,
            &targets,
            "sequences",
            "targets",
        )
        .unwrap();
    }
}

fn base_config(dir: &Path) -> RunConfig {
    RunConfig {
        batch_size: 16,
        max_steps: 20,
        report_stats_every_n_steps: 10,
        save_checkpoint_every_n_steps: 10,
        n_validation_samples: 8,
        n_test_samples: 8,
        output_dir: dir.join("out"),
        create_subdirectory: false,
        metrics: vec!["mse".to_string()],
        data: DataConfig {
            train: dir.join("train.st"),
            validate: dir.join("validate.st"),
            test: dir.join("test.st"),
            ..DataConfig::default()
        },
        ..RunConfig::default()
    }
}

fn driver(config: RunConfig) -> TrainingLoopDriver {
    TrainingLoopDriver::new(
        config,
        &MetricRegistry::with_builtins(),
        &ModelRegistry::with_builtins(),
    )
    .unwrap()
}

/// Records every report the driver emits.
#[derive(Clone, Default)]
struct RecordingReporter {
    reports: Arc<Mutex<Vec<MetricReport>>>,
}

impl Reporter for RecordingReporter {
    fn report(&mut self, report: &MetricReport) -> trainrun_core::Result<()> {
        self.reports.lock().unwrap().push(report.clone());
        Ok(())
    }
}

impl RecordingReporter {
    fn steps_for(&self, partition: Partition) -> Vec<u64> {
        self.reports
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.partition == partition)
            .map(|r| r.step)
            .collect()
    }
}

fn checkpoint_steps(run_dir: &Path) -> Vec<u64> {
    let mut steps: Vec<u64> = std::fs::read_dir(run_dir.join("checkpoints"))
        .unwrap()
        .filter_map(|e| {
            e.unwrap()
                .file_name()
                .to_str()?
                .strip_prefix("step_")?
                .strip_suffix(".ckpt")?
                .parse()
                .ok()
        })
        .collect();
    steps.sort_unstable();
    steps
}

#[test]
fn completed_run_ends_done_with_final_checkpoint() {
    let dir = tempfile::TempDir::new().unwrap();
    write_partitions(dir.path(), 64, 16);

    let mut driver = driver(base_config(dir.path()));
    let run_dir = driver.run_dir().to_path_buf();
    let outcome = driver.run().unwrap();

    assert_eq!(driver.phase(), Phase::Done);
    assert_eq!(outcome.steps_completed, 20);
    assert!(!outcome.stopped_early);
    assert!(checkpoint_steps(&run_dir).contains(&20));
    assert!(run_dir.join("checkpoints").join("best.ckpt").exists());
    assert!(run_dir.join("metrics.log").exists());
    assert!(run_dir.join("run_config.json").exists());

    let final_report = outcome.final_report.unwrap();
    assert_eq!(final_report.partition, Partition::Test);
    assert_eq!(final_report.step, 20);
}

#[test]
fn evaluation_and_checkpoint_cadence() {
    // 8124 steps with both intervals at 2031: exactly four validation
    // evaluations, four distinct checkpoint steps, and the finalizing
    // checkpoint coincides with the last periodic one.
    let dir = tempfile::TempDir::new().unwrap();
    write_partitions(dir.path(), 64, 16);

    let config = RunConfig {
        batch_size: 128,
        max_steps: 8124,
        report_stats_every_n_steps: 2031,
        save_checkpoint_every_n_steps: 2031,
        ..base_config(dir.path())
    };
    let mut driver = driver(config);
    let recorder = RecordingReporter::default();
    driver.add_reporter(Box::new(recorder.clone()));
    let run_dir = driver.run_dir().to_path_buf();

    driver.run().unwrap();

    assert_eq!(
        recorder.steps_for(Partition::Validate),
        vec![2031, 4062, 6093, 8124]
    );
    assert_eq!(recorder.steps_for(Partition::Test), vec![8124]);
    assert_eq!(checkpoint_steps(&run_dir), vec![2031, 4062, 6093, 8124]);
}

#[test]
fn resuming_reaches_the_same_final_step_count() {
    let dir = tempfile::TempDir::new().unwrap();
    write_partitions(dir.path(), 64, 16);

    // First leg: stop at a 20-step budget, leaving a step_20 checkpoint.
    let first_leg = base_config(dir.path());
    driver(first_leg).run().unwrap();

    // Second leg: same run directory, larger budget, resume from latest.
    let second_leg = RunConfig {
        max_steps: 40,
        ..base_config(dir.path())
    };
    let mut resumed = driver(second_leg);
    resumed.resume(None).unwrap();
    let outcome = resumed.run().unwrap();
    assert_eq!(outcome.steps_completed, 40);

    // An uninterrupted 40-step run lands on the same step count.
    let other_dir = tempfile::TempDir::new().unwrap();
    write_partitions(other_dir.path(), 64, 16);
    let uninterrupted = RunConfig {
        max_steps: 40,
        ..base_config(other_dir.path())
    };
    let reference = driver(uninterrupted).run().unwrap();
    assert_eq!(reference.steps_completed, outcome.steps_completed);
}

#[test]
fn oversized_validation_draw_is_a_config_error() {
    let dir = tempfile::TempDir::new().unwrap();
    write_partitions(dir.path(), 64, 16);

    let config = RunConfig {
        n_validation_samples: 17,
        ..base_config(dir.path())
    };
    let err = TrainingLoopDriver::new(
        config,
        &MetricRegistry::with_builtins(),
        &ModelRegistry::with_builtins(),
    )
    .err()
    .expect("oversized draw must fail at initialization");
    assert!(matches!(err, RunError::Config(_)), "{err}");
}

#[test]
fn stop_request_checkpoints_and_exits_cleanly() {
    let dir = tempfile::TempDir::new().unwrap();
    write_partitions(dir.path(), 64, 16);

    let mut driver = driver(base_config(dir.path()));
    driver.stop_handle().stop();
    let outcome = driver.run().unwrap();

    assert!(outcome.stopped_early);
    assert!(outcome.final_report.is_none());
    assert_eq!(driver.phase(), Phase::Done);
    // Best-effort checkpoint on the way out.
    assert!(!checkpoint_steps(driver.run_dir()).is_empty());
}

#[test]
fn mismatched_validation_targets_abort_the_run() {
    let dir = tempfile::TempDir::new().unwrap();
    write_partitions(dir.path(), 64, 16);

    // Rewrite the validate partition with a different target width; the
    // first evaluation trips a fatal shape mismatch.
    let (inputs, _) = synthetic(16, 3);
    let (_, wrong_targets) = synthetic(16, 5);
    MatrixFile::write(
        &dir.path().join("validate.st"),
        &inputs,
        &wrong_targets,
        "sequences",
        "targets",
    )
    .unwrap();

    let mut driver = driver(base_config(dir.path()));
    let err = driver.run().unwrap_err();
    assert!(matches!(err, RunError::ShapeMismatch { .. }), "{err}");
    assert_eq!(driver.phase(), Phase::Aborted);
}

#[test]
fn monitored_metric_improves_over_training() {
    let dir = tempfile::TempDir::new().unwrap();
    write_partitions(dir.path(), 128, 32);

    let config = RunConfig {
        max_steps: 200,
        report_stats_every_n_steps: 50,
        save_checkpoint_every_n_steps: 50,
        n_validation_samples: 32,
        n_test_samples: 32,
        ..base_config(dir.path())
    };
    let mut driver = driver(config);
    let recorder = RecordingReporter::default();
    driver.add_reporter(Box::new(recorder.clone()));
    let outcome = driver.run().unwrap();

    let reports = recorder.reports.lock().unwrap();
    let first = reports
        .iter()
        .find(|r| r.partition == Partition::Validate)
        .unwrap();
    let last = reports
        .iter()
        .filter(|r| r.partition == Partition::Validate)
        .next_back()
        .unwrap();
    assert!(
        last.values["mse"] < first.values["mse"],
        "mse {} -> {}",
        first.values["mse"],
        last.values["mse"]
    );
    assert!(outcome.best_metric.is_some());
}

#[test]
fn run_directory_layout_without_subdirectory() {
    let dir = tempfile::TempDir::new().unwrap();
    write_partitions(dir.path(), 64, 16);

    let config = base_config(dir.path());
    let expected: PathBuf = dir.path().join("out");
    let driver = driver(config);
    assert_eq!(driver.run_dir(), expected.as_path());
}
