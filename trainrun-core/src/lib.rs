//! # trainrun-core: bounded-step training-run orchestration
//!
//! Reads an immutable [`config::RunConfig`], opens file-backed
//! train/validate/test partitions, and drives a step-budgeted training loop
//! with interleaved periodic evaluation, checkpointing, and metric
//! reporting. Models and metrics plug in through explicit registries; the
//! on-disk matrix format stays behind the sampler.

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod driver;
pub mod error;
pub mod metrics;
pub mod model;
pub mod registry;
pub mod reporter;
pub mod sampler;

mod persist;

pub use checkpoint::{CheckpointManager, TrainingState};
pub use config::RunConfig;
pub use driver::{Phase, RunOutcome, StopHandle, TrainingLoopDriver};
pub use error::{Result, RunError};
pub use metrics::{MetricEvaluator, MetricReport};
pub use model::{Device, Model};
pub use registry::{MetricRegistry, ModelRegistry};
pub use sampler::{Batch, MatrixSampler, Partition};
