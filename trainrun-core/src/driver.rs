//! The training-loop driver.
//!
//! Owns the step counter and the whole run lifecycle: pull a train batch,
//! run one optimization step, and fire evaluation, checkpointing, and
//! reporting at their configured step intervals. Runs on a single control
//! thread; evaluation and checkpointing block the loop by design.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use ndarray::{Array2, Axis};
use tracing::{error, info, warn};

use crate::checkpoint::{CheckpointManager, TrainingState};
use crate::config::RunConfig;
use crate::error::{Result, RunError};
use crate::metrics::{MetricEvaluator, MetricReport};
use crate::model::{Device, Model};
use crate::persist::atomic_write_json;
use crate::registry::{Direction, MetricRegistry, ModelRegistry};
use crate::reporter::{JsonlReporter, LogReporter, Reporter};
use crate::sampler::{MatrixSampler, Partition};

/// Driver lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    Running,
    Evaluating,
    Checkpointing,
    Finalizing,
    Done,
    Aborted,
}

/// Summary of a completed run.
#[derive(Debug)]
pub struct RunOutcome {
    pub steps_completed: u64,
    pub failed_steps: u64,
    /// True when a cooperative stop ended the run before `max_steps`.
    pub stopped_early: bool,
    pub best_metric: Option<f64>,
    /// The finalizing test-partition report, absent on early stop.
    pub final_report: Option<MetricReport>,
    pub run_dir: PathBuf,
}

/// Flips the driver's cooperative stop flag. Honored at the next step
/// boundary; nothing is interrupted mid-step.
#[derive(Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// What a configuration resolves to on disk, reported by [`preflight`].
#[derive(Debug)]
pub struct PartitionSummary {
    pub train_len: usize,
    pub validate_len: usize,
    pub test_len: usize,
    pub seq_len: usize,
    pub channels: usize,
    pub n_targets: usize,
}

/// Validate a configuration against the actual partition files without
/// starting a run: structural checks, dataset opening, and evaluation-draw
/// caps.
pub fn preflight(config: &RunConfig) -> Result<PartitionSummary> {
    config.validate()?;
    let (train, validate, test) = open_partitions(config)?;
    let (seq_len, channels, n_targets) = train.input_shape();
    Ok(PartitionSummary {
        train_len: train.len(),
        validate_len: validate.len(),
        test_len: test.len(),
        seq_len,
        channels,
        n_targets,
    })
}

fn open_partitions(
    config: &RunConfig,
) -> Result<(MatrixSampler, MatrixSampler, MatrixSampler)> {
    let seed = config.random_seed;
    let keys = (&config.data.input_key, &config.data.target_key);
    let train =
        MatrixSampler::open(&config.data.train, Partition::Train, keys.0, keys.1, true, seed)?;
    let validate = MatrixSampler::open(
        &config.data.validate,
        Partition::Validate,
        keys.0,
        keys.1,
        false,
        seed,
    )?;
    let test =
        MatrixSampler::open(&config.data.test, Partition::Test, keys.0, keys.1, false, seed)?;

    // Evaluation draws must fit the non-shuffled partitions; anything else
    // is a configuration error, caught before any compute.
    if config.n_validation_samples > validate.len() {
        return Err(RunError::config(format!(
            "n_validation_samples ({}) exceeds the validate partition ({} examples)",
            config.n_validation_samples,
            validate.len()
        )));
    }
    if config.n_test_samples > test.len() {
        return Err(RunError::config(format!(
            "n_test_samples ({}) exceeds the test partition ({} examples)",
            config.n_test_samples,
            test.len()
        )));
    }
    Ok((train, validate, test))
}

/// The orchestrator. See the module docs for the control flow.
pub struct TrainingLoopDriver {
    config: RunConfig,
    run_dir: PathBuf,
    model: Box<dyn Model>,
    train: MatrixSampler,
    validate: MatrixSampler,
    test: MatrixSampler,
    evaluator: MetricEvaluator,
    monitored: (String, Direction),
    checkpoints: CheckpointManager,
    reporters: Vec<Box<dyn Reporter>>,
    state: TrainingState,
    phase: Phase,
    stop: Arc<AtomicBool>,
}

impl TrainingLoopDriver {
    /// Initialize a run: validate the configuration against the actual
    /// partitions, open all three dataset handles, build and place the
    /// model, and set up the run directory. Fails before any compute on a
    /// configuration error.
    pub fn new(
        config: RunConfig,
        metric_registry: &MetricRegistry,
        model_registry: &ModelRegistry,
    ) -> Result<Self> {
        config.validate()?;

        let evaluator = MetricEvaluator::from_registry(
            metric_registry,
            &config.metrics,
            config.report_gt_feature_n_positives,
        )?;
        let monitored_name = config.metrics[0].clone();
        let monitored = (
            monitored_name.clone(),
            metric_registry.direction(&monitored_name)?,
        );

        let (train, validate, test) = open_partitions(&config)?;
        let (seq_len, channels, n_targets) = train.input_shape();
        let mut model = model_registry.build(seq_len, channels, n_targets, &config.model)?;
        model.place(Device::from_flags(config.use_accelerator, config.data_parallel))?;

        let run_dir = config.run_dir(Utc::now());
        std::fs::create_dir_all(&run_dir)?;
        atomic_write_json(&run_dir.join("run_config.json"), &config)?;

        let checkpoints =
            CheckpointManager::new(&run_dir, config.compat_hash(), config.checkpoint_max_keep)?;
        let reporters: Vec<Box<dyn Reporter>> =
            vec![Box::new(LogReporter), Box::new(JsonlReporter::create(&run_dir)?)];

        info!(
            run_dir = %run_dir.display(),
            max_steps = config.max_steps,
            batch_size = config.batch_size,
            "run initialized"
        );

        Ok(Self {
            config,
            run_dir,
            model,
            train,
            validate,
            test,
            evaluator,
            monitored,
            checkpoints,
            reporters,
            state: TrainingState::fresh(),
            phase: Phase::Initializing,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.stop))
    }

    /// Attach an additional report sink.
    pub fn add_reporter(&mut self, reporter: Box<dyn Reporter>) {
        self.reporters.push(reporter);
    }

    /// Restore state from a checkpoint before running. With no explicit
    /// path, resumes from the highest-step checkpoint in this run's
    /// directory.
    pub fn resume(&mut self, checkpoint: Option<&Path>) -> Result<()> {
        let path = match checkpoint {
            Some(p) => p.to_path_buf(),
            None => self.checkpoints.latest()?.ok_or_else(|| {
                RunError::config("no checkpoint found in the run directory to resume from")
            })?,
        };
        let state = self.checkpoints.load(&path)?;
        self.model.load_parameters(&state.params)?;
        info!(step = state.step, checkpoint = %path.display(), "resumed");
        self.state = state;
        Ok(())
    }

    /// Execute the run to completion, early stop, or abort.
    pub fn run(&mut self) -> Result<RunOutcome> {
        match self.drive() {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.phase = Phase::Aborted;
                error!(
                    last_completed_step = self.state.step,
                    %err,
                    "run aborted"
                );
                Err(err)
            }
        }
    }

    fn drive(&mut self) -> Result<RunOutcome> {
        self.phase = Phase::Running;
        let mut failed_steps = 0u64;
        let mut stopped_early = false;
        let mut last_loss = f64::NAN;
        let mut latest_validation: Option<f64> = None;

        while self.state.step < self.config.max_steps {
            if self.stop.load(Ordering::Relaxed) {
                warn!(step = self.state.step, "stop requested; checkpointing and exiting");
                stopped_early = true;
                if let Err(err) = self.save_checkpoint(latest_validation) {
                    // Best effort on the way out.
                    warn!(%err, "stop-time checkpoint failed");
                }
                break;
            }

            let batch = self.train.next_batch(self.config.batch_size)?;
            match self.model.train_step(&batch.inputs, &batch.targets) {
                Ok(outcome) if outcome.loss.is_finite() => last_loss = outcome.loss,
                Ok(outcome) => {
                    failed_steps += 1;
                    let failure = RunError::StepFailed {
                        step: self.state.step + 1,
                        reason: format!("non-finite loss {}", outcome.loss),
                    };
                    warn!(%failure, "continuing after failed step");
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    failed_steps += 1;
                    warn!(%err, "continuing after failed step");
                }
            }
            self.state.step += 1;

            // Evaluation is sequenced before checkpointing so a coinciding
            // checkpoint records the freshly computed metric.
            if self.state.step % self.config.report_stats_every_n_steps == 0 {
                self.phase = Phase::Evaluating;
                for reporter in &mut self.reporters {
                    reporter.progress(self.state.step, last_loss)?;
                }
                let values = self.evaluate(Partition::Validate)?;
                latest_validation = values;
                self.phase = Phase::Running;
            }
            if self.state.step % self.config.save_checkpoint_every_n_steps == 0 {
                self.phase = Phase::Checkpointing;
                self.save_checkpoint(latest_validation)?;
                self.phase = Phase::Running;
            }
        }

        let mut final_report = None;
        if !stopped_early {
            self.phase = Phase::Finalizing;
            let report = self.emit_report(Partition::Test)?;
            final_report = Some(report);
            self.save_checkpoint(latest_validation)?;
        }

        self.phase = Phase::Done;
        info!(
            steps = self.state.step,
            failed_steps,
            stopped_early,
            "run complete"
        );
        Ok(RunOutcome {
            steps_completed: self.state.step,
            failed_steps,
            stopped_early,
            best_metric: self.state.best_metric,
            final_report,
            run_dir: self.run_dir.clone(),
        })
    }

    /// One evaluation pass: returns the monitored metric value when finite.
    fn evaluate(&mut self, partition: Partition) -> Result<Option<f64>> {
        let report = self.emit_report(partition)?;
        Ok(report
            .values
            .get(&self.monitored.0)
            .copied()
            .filter(|v| v.is_finite()))
    }

    fn emit_report(&mut self, partition: Partition) -> Result<MetricReport> {
        let (sampler, total) = match partition {
            Partition::Validate => (&mut self.validate, self.config.n_validation_samples),
            Partition::Test => (&mut self.test, self.config.n_test_samples),
            Partition::Train => {
                return Err(RunError::config("evaluation over the train partition"))
            }
        };
        sampler.rewind();
        let batches = sampler.take(total, self.config.batch_size)?;

        let mut predictions = Vec::with_capacity(batches.len());
        let mut targets = Vec::with_capacity(batches.len());
        for batch in &batches {
            predictions.push(self.model.predict(&batch.inputs)?);
            targets.push(batch.targets.clone());
        }
        let predictions = stack_rows(&predictions)?;
        let targets = stack_rows(&targets)?;

        let values = self.evaluator.evaluate(&predictions, &targets)?;
        let report = MetricReport {
            step: self.state.step,
            partition,
            values,
        };
        for reporter in &mut self.reporters {
            reporter.report(&report)?;
        }
        Ok(report)
    }

    /// Sync parameters into the state and persist a checkpoint; promote it
    /// to the best marker when the latest validation metric improved.
    fn save_checkpoint(&mut self, latest_validation: Option<f64>) -> Result<()> {
        if let Some(value) = latest_validation {
            if improved(self.monitored.1, value, self.state.best_metric) {
                self.state.best_metric = Some(value);
                self.state.params = self.model.parameters();
                self.checkpoints.save(&self.state)?;
                self.checkpoints.update_best(self.state.step)?;
                info!(
                    step = self.state.step,
                    metric = %self.monitored.0,
                    value,
                    "new best checkpoint"
                );
                return Ok(());
            }
        }
        self.state.params = self.model.parameters();
        self.checkpoints.save(&self.state)?;
        Ok(())
    }
}

fn improved(direction: Direction, value: f64, best: Option<f64>) -> bool {
    match best {
        None => true,
        Some(best) => match direction {
            Direction::Minimize => value < best,
            Direction::Maximize => value > best,
        },
    }
}

fn stack_rows(parts: &[Array2<f32>]) -> Result<Array2<f32>> {
    let views: Vec<_> = parts.iter().map(Array2::view).collect();
    ndarray::concatenate(Axis(0), &views).map_err(|e| {
        RunError::shape_mismatch("evaluation batches", "equal target widths", e.to_string())
    })
}
