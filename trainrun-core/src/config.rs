//! Run configuration.
//!
//! Uses `figment` for layered configuration: defaults -> TOML file ->
//! `TRAINRUN_`-prefixed environment variables. The resulting [`RunConfig`]
//! is validated once at startup and never mutated afterwards.

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, RunError};

/// Immutable snapshot of a training run's hyperparameters and environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Examples per optimization step.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Total optimization steps before the run finalizes.
    #[serde(default = "default_max_steps")]
    pub max_steps: u64,
    /// Steps between validation evaluations (and metric reports).
    #[serde(default = "default_report_interval")]
    pub report_stats_every_n_steps: u64,
    /// Steps between periodic checkpoints.
    #[serde(default = "default_checkpoint_interval")]
    pub save_checkpoint_every_n_steps: u64,
    /// Examples drawn from the validate partition per evaluation.
    #[serde(default = "default_eval_samples")]
    pub n_validation_samples: usize,
    /// Examples drawn from the test partition during finalization.
    #[serde(default = "default_eval_samples")]
    pub n_test_samples: usize,
    /// A target column is excluded from a metric computation when it has
    /// fewer positive labels than this within the evaluation sample.
    /// Zero disables the filter.
    #[serde(default)]
    pub report_gt_feature_n_positives: usize,
    /// Place the model on the accelerator device.
    #[serde(default)]
    pub use_accelerator: bool,
    /// Shard each step's batch across accelerator devices. Only meaningful
    /// together with `use_accelerator`.
    #[serde(default)]
    pub data_parallel: bool,
    /// Default tracing filter when the CLI does not override it
    /// (e.g. "info", "debug").
    #[serde(default = "default_verbosity")]
    pub logging_verbosity: String,
    /// Root directory for run artifacts.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Create a timestamped subdirectory under `output_dir` for this run.
    /// When false, artifacts write directly into `output_dir`.
    #[serde(default = "default_true")]
    pub create_subdirectory: bool,
    /// Seed for all run randomness; partition shuffles derive from it.
    #[serde(default = "default_seed")]
    pub random_seed: u64,
    /// Named metrics to compute at each evaluation, resolved through the
    /// metric registry. The first entry is monitored for the best marker.
    #[serde(default = "default_metrics")]
    pub metrics: Vec<String>,
    /// How many periodic checkpoints to retain. The best marker and the
    /// final checkpoint are exempt from rotation.
    #[serde(default = "default_max_keep")]
    pub checkpoint_max_keep: usize,
    /// Dataset files, one per partition.
    #[serde(default)]
    pub data: DataConfig,
    /// Model construction settings, resolved through the model registry.
    #[serde(default)]
    pub model: ModelConfig,
}

/// Dataset file locations and the named arrays to read from them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub train: PathBuf,
    pub validate: PathBuf,
    pub test: PathBuf,
    /// Name of the input array inside each file.
    #[serde(default = "default_input_key")]
    pub input_key: String,
    /// Name of the target array inside each file.
    #[serde(default = "default_target_key")]
    pub target_key: String,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            train: PathBuf::from("data/train.st"),
            validate: PathBuf::from("data/validate.st"),
            test: PathBuf::from("data/test.st"),
            input_key: default_input_key(),
            target_key: default_target_key(),
        }
    }
}

/// Model settings. `kind` selects a factory from the model registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model_kind")]
    pub kind: String,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            kind: default_model_kind(),
            learning_rate: default_learning_rate(),
        }
    }
}

fn default_batch_size() -> usize {
    64
}
fn default_max_steps() -> u64 {
    10_000
}
fn default_report_interval() -> u64 {
    1_000
}
fn default_checkpoint_interval() -> u64 {
    1_000
}
fn default_eval_samples() -> usize {
    512
}
fn default_verbosity() -> String {
    "info".to_string()
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("runs")
}
fn default_true() -> bool {
    true
}
fn default_seed() -> u64 {
    436
}
fn default_metrics() -> Vec<String> {
    vec!["mse".to_string()]
}
fn default_max_keep() -> usize {
    5
}
fn default_input_key() -> String {
    "sequences".to_string()
}
fn default_target_key() -> String {
    "targets".to_string()
}
fn default_model_kind() -> String {
    "linear".to_string()
}
fn default_learning_rate() -> f32 {
    0.01
}

impl Default for RunConfig {
    fn default() -> Self {
        // Round-trips through serde so defaults live in one place.
        serde_json::from_value(serde_json::json!({})).expect("defaults are total")
    }
}

impl RunConfig {
    /// Load configuration layered as defaults -> TOML file -> environment
    /// (`TRAINRUN_DATA__TRAIN=...` style keys).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(RunConfig::default()));
        if let Some(path) = path {
            if !path.exists() {
                return Err(RunError::config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("TRAINRUN_").split("__"));
        let config: RunConfig = figment
            .extract()
            .map_err(|e| RunError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation. Partition-size checks need open dataset
    /// handles and happen in the driver's initialization instead.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(RunError::config("batch_size must be positive"));
        }
        if self.max_steps == 0 {
            return Err(RunError::config("max_steps must be positive"));
        }
        if self.report_stats_every_n_steps == 0 {
            return Err(RunError::config(
                "report_stats_every_n_steps must be positive",
            ));
        }
        if self.save_checkpoint_every_n_steps == 0 {
            return Err(RunError::config(
                "save_checkpoint_every_n_steps must be positive",
            ));
        }
        if self.n_validation_samples == 0 || self.n_test_samples == 0 {
            return Err(RunError::config(
                "n_validation_samples and n_test_samples must be positive",
            ));
        }
        if self.metrics.is_empty() {
            return Err(RunError::config("at least one metric must be configured"));
        }
        if self.checkpoint_max_keep == 0 {
            return Err(RunError::config("checkpoint_max_keep must be positive"));
        }
        if self.data_parallel && !self.use_accelerator {
            return Err(RunError::config(
                "data_parallel requires use_accelerator",
            ));
        }
        Ok(())
    }

    /// Hash of the compatibility-relevant configuration: the model settings
    /// and the dataset array keys. Recorded in every checkpoint; a restore
    /// into a run with a different hash is rejected.
    pub fn compat_hash(&self) -> String {
        let mut hasher = Sha256::new();
        let model = serde_json::to_vec(&self.model).expect("model config serializes");
        hasher.update(&model);
        hasher.update(self.data.input_key.as_bytes());
        hasher.update(self.data.target_key.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Resolved artifact directory for this run. Timestamped when
    /// `create_subdirectory` is set; otherwise `output_dir` itself.
    pub fn run_dir(&self, started_at: chrono::DateTime<chrono::Utc>) -> PathBuf {
        if self.create_subdirectory {
            self.output_dir
                .join(format!("run-{}", started_at.format("%Y%m%d-%H%M%S")))
        } else {
            self.output_dir.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_validate() {
        let config = RunConfig::default();
        config.validate().unwrap();
        assert_eq!(config.data.input_key, "sequences");
        assert_eq!(config.metrics, vec!["mse".to_string()]);
    }

    #[test]
    fn zero_batch_size_rejected() {
        let config = RunConfig {
            batch_size: 0,
            ..RunConfig::default()
        };
        assert!(matches!(config.validate(), Err(RunError::Config(_))));
    }

    #[test]
    fn data_parallel_requires_accelerator() {
        let config = RunConfig {
            data_parallel: true,
            use_accelerator: false,
            ..RunConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn compat_hash_tracks_model_settings() {
        let a = RunConfig::default();
        let mut b = RunConfig::default();
        assert_eq!(a.compat_hash(), b.compat_hash());

        b.model.learning_rate = 0.5;
        assert_ne!(a.compat_hash(), b.compat_hash());

        // Run-environment knobs do not affect compatibility.
        let c = RunConfig {
            output_dir: PathBuf::from("elsewhere"),
            max_steps: 1,
            ..RunConfig::default()
        };
        assert_eq!(a.compat_hash(), c.compat_hash());
    }

    #[test]
    fn load_from_toml_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("run.toml");
        std::fs::write(
            &path,
            r#"
batch_size = 128
max_steps = 8124
metrics = ["pearson_r", "mse"]

[data]
train = "data/train.st"
validate = "data/validate.st"
test = "data/test.st"
"#,
        )
        .unwrap();

        let config = RunConfig::load(Some(&path)).unwrap();
        assert_eq!(config.batch_size, 128);
        assert_eq!(config.max_steps, 8124);
        assert_eq!(config.metrics.len(), 2);
        // Unset fields keep their defaults.
        assert_eq!(config.random_seed, 436);
    }

    #[test]
    fn run_dir_honors_create_subdirectory() {
        let now = chrono::Utc::now();
        let mut config = RunConfig::default();
        config.output_dir = PathBuf::from("out");

        config.create_subdirectory = false;
        assert_eq!(config.run_dir(now), PathBuf::from("out"));

        config.create_subdirectory = true;
        assert!(config.run_dir(now).starts_with("out"));
        assert_ne!(config.run_dir(now), PathBuf::from("out"));
    }
}
