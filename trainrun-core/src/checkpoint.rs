//! Checkpoint persistence and restore.
//!
//! A checkpoint is one safetensors file: the parameter blob as a tensor and
//! the run metadata (step, best metric, config hash, timestamp) in the
//! header. Saves are atomic; an interrupted save never clobbers the
//! previous checkpoint at the same path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;
use tracing::debug;

use crate::error::{Result, RunError};
use crate::persist::atomic_write;

const CHECKPOINT_VERSION: &str = "1";
const BEST_NAME: &str = "best.ckpt";

/// The driver-owned mutable training state.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingState {
    /// Completed optimization steps.
    pub step: u64,
    /// Best monitored validation metric observed so far.
    pub best_metric: Option<f64>,
    /// Trainable-parameter snapshot, synced from the model before saves.
    pub params: Vec<f32>,
}

impl TrainingState {
    pub fn fresh() -> Self {
        Self {
            step: 0,
            best_metric: None,
            params: Vec::new(),
        }
    }
}

/// Writes, rotates, and restores checkpoints under one run directory.
pub struct CheckpointManager {
    dir: PathBuf,
    config_hash: String,
    max_keep: usize,
    retained: Vec<u64>,
}

impl CheckpointManager {
    /// Create a manager over `{run_dir}/checkpoints`. Periodic checkpoints
    /// already on disk (e.g. from an earlier leg of a resumed run) count
    /// against the retention limit.
    pub fn new(run_dir: &Path, config_hash: String, max_keep: usize) -> Result<Self> {
        let dir = run_dir.join("checkpoints");
        std::fs::create_dir_all(&dir)?;
        let mut retained = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if let Some(step) = path.file_name().and_then(|n| n.to_str()).and_then(step_of) {
                retained.push(step);
            }
        }
        retained.sort_unstable();
        Ok(Self {
            dir,
            config_hash,
            max_keep,
            retained,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn step_path(&self, step: u64) -> PathBuf {
        self.dir.join(format!("step_{step}.ckpt"))
    }

    pub fn best_path(&self) -> PathBuf {
        self.dir.join(BEST_NAME)
    }

    /// Persist `state` as `step_{N}.ckpt`, rotating out the oldest periodic
    /// checkpoint beyond the retention limit. Saving the same step twice
    /// overwrites in place.
    pub fn save(&mut self, state: &TrainingState) -> Result<PathBuf> {
        let path = self.step_path(state.step);
        atomic_write(&path, &encode(state, &self.config_hash)?)?;
        debug!(step = state.step, path = %path.display(), "checkpoint written");

        if !self.retained.contains(&state.step) {
            self.retained.push(state.step);
            self.retained.sort_unstable();
        }
        while self.retained.len() > self.max_keep {
            let oldest = self.retained.remove(0);
            let stale = self.step_path(oldest);
            if stale.exists() {
                std::fs::remove_file(&stale)?;
                debug!(step = oldest, "rotated out checkpoint");
            }
        }
        Ok(path)
    }

    /// Mark the checkpoint saved at `step` as the best so far by copying it
    /// over `best.ckpt`. Independent of periodic rotation.
    pub fn update_best(&self, step: u64) -> Result<()> {
        let source = self.step_path(step);
        let bytes = std::fs::read(&source)?;
        atomic_write(&self.best_path(), &bytes)
    }

    /// Restore a checkpoint, rejecting blobs from an incompatible run.
    pub fn load(&self, path: &Path) -> Result<TrainingState> {
        let state = decode(path)?;
        let recorded = &state.1;
        if recorded != &self.config_hash {
            return Err(RunError::corrupt_checkpoint(format!(
                "config hash mismatch: checkpoint {recorded}, run {}",
                self.config_hash
            )));
        }
        Ok(state.0)
    }

    /// Highest-step periodic checkpoint in the directory, for resume.
    pub fn latest(&self) -> Result<Option<PathBuf>> {
        let mut best: Option<(u64, PathBuf)> = None;
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(step) = path.file_name().and_then(|n| n.to_str()).and_then(step_of) else {
                continue;
            };
            if best.as_ref().map_or(true, |(s, _)| step > *s) {
                best = Some((step, path));
            }
        }
        Ok(best.map(|(_, p)| p))
    }
}

/// Step number of a `step_{N}.ckpt` file name.
fn step_of(name: &str) -> Option<u64> {
    name.strip_prefix("step_")?
        .strip_suffix(".ckpt")?
        .parse()
        .ok()
}

fn encode(state: &TrainingState, config_hash: &str) -> Result<Vec<u8>> {
    let mut meta = HashMap::from([
        ("version".to_string(), CHECKPOINT_VERSION.to_string()),
        ("step".to_string(), state.step.to_string()),
        ("config_hash".to_string(), config_hash.to_string()),
        ("created_at".to_string(), Utc::now().to_rfc3339()),
    ]);
    if let Some(best) = state.best_metric {
        meta.insert("best_metric".to_string(), best.to_string());
    }
    let views = HashMap::from([(
        "params".to_string(),
        TensorView::new(
            Dtype::F32,
            vec![state.params.len()],
            bytemuck::cast_slice(&state.params),
        )?,
    )]);
    Ok(safetensors::serialize(views, &Some(meta))?)
}

/// Decode a checkpoint file into (state, recorded config hash).
fn decode(path: &Path) -> Result<(TrainingState, String)> {
    let bytes = std::fs::read(path).map_err(|e| {
        RunError::corrupt_checkpoint(format!("cannot read {}: {e}", path.display()))
    })?;
    let (_, header) = SafeTensors::read_metadata(&bytes)
        .map_err(|e| RunError::corrupt_checkpoint(e.to_string()))?;
    let meta = header
        .metadata()
        .as_ref()
        .ok_or_else(|| RunError::corrupt_checkpoint("missing header metadata"))?;

    let field = |key: &str| -> Result<&String> {
        meta.get(key)
            .ok_or_else(|| RunError::corrupt_checkpoint(format!("missing '{key}' in header")))
    };
    let version = field("version")?;
    if version != CHECKPOINT_VERSION {
        return Err(RunError::corrupt_checkpoint(format!(
            "unsupported checkpoint version {version}"
        )));
    }
    let step = field("step")?
        .parse::<u64>()
        .map_err(|e| RunError::corrupt_checkpoint(format!("bad step: {e}")))?;
    let best_metric = match meta.get("best_metric") {
        Some(raw) => Some(
            raw.parse::<f64>()
                .map_err(|e| RunError::corrupt_checkpoint(format!("bad best_metric: {e}")))?,
        ),
        None => None,
    };
    let config_hash = field("config_hash")?.clone();

    let tensors =
        SafeTensors::deserialize(&bytes).map_err(|e| RunError::corrupt_checkpoint(e.to_string()))?;
    let params_view = tensors
        .tensor("params")
        .map_err(|e| RunError::corrupt_checkpoint(e.to_string()))?;
    let params: Vec<f32> = bytemuck::pod_collect_to_vec(params_view.data());

    Ok((
        TrainingState {
            step,
            best_metric,
            params,
        },
        config_hash,
    ))
}

/// Read only the header metadata of a checkpoint, for inspection tooling.
pub fn read_meta(path: &Path) -> Result<HashMap<String, String>> {
    let bytes = std::fs::read(path).map_err(|e| {
        RunError::corrupt_checkpoint(format!("cannot read {}: {e}", path.display()))
    })?;
    let (_, header) = SafeTensors::read_metadata(&bytes)
        .map_err(|e| RunError::corrupt_checkpoint(e.to_string()))?;
    Ok(header.metadata().clone().unwrap_or_default())
}
