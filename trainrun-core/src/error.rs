//! Error types for the trainrun-core crate.

use thiserror::Error;

use crate::sampler::Partition;

/// The result type used throughout the crate.
pub type Result<T> = std::result::Result<T, RunError>;

/// Top-level error type for training-run operations.
#[derive(Debug, Error)]
pub enum RunError {
    /// Invalid or inconsistent configuration. Fatal before any compute.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A non-shuffled partition ran out of examples before a requested
    /// count was met. Fatal during evaluation; the train partition never
    /// surfaces this because it wraps.
    #[error(
        "Partition '{partition}' exhausted: requested {requested} examples, {remaining} remaining"
    )]
    ExhaustedPartition {
        partition: Partition,
        requested: usize,
        remaining: usize,
    },

    /// Predictions, targets, or stored arrays have incompatible shapes.
    #[error("Shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: String,
        expected: String,
        actual: String,
    },

    /// A persisted checkpoint cannot be restored into the current run.
    #[error("Corrupt checkpoint: {0}")]
    CorruptCheckpoint(String),

    /// A single optimization step failed. The only locally recovered class:
    /// the driver logs it and keeps going.
    #[error("Optimization step {step} failed: {reason}")]
    StepFailed { step: u64, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Tensor file error: {0}")]
    Tensor(#[from] safetensors::SafeTensorError),
}

impl RunError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn corrupt_checkpoint(msg: impl Into<String>) -> Self {
        Self::CorruptCheckpoint(msg.into())
    }

    pub fn shape_mismatch(
        context: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Whether the driver treats this error as fatal for the whole run.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::StepFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_failures_are_not_fatal() {
        let err = RunError::StepFailed {
            step: 7,
            reason: "non-finite loss".into(),
        };
        assert!(!err.is_fatal());
        assert!(RunError::config("bad batch size").is_fatal());
    }

    #[test]
    fn exhaustion_message_names_the_partition() {
        let err = RunError::ExhaustedPartition {
            partition: Partition::Validate,
            requested: 64,
            remaining: 12,
        };
        let msg = err.to_string();
        assert!(msg.contains("validate"));
        assert!(msg.contains("64"));
    }
}
