//! Atomic file writes for run artifacts.
//!
//! Everything persisted under a run directory goes through the
//! write-to-temp-then-rename discipline: a crash mid-write can leave a stale
//! `.tmp` sibling behind, never a truncated readable artifact.

use std::path::Path;

use crate::error::Result;

/// Atomically replace `path` with `data`, creating parent directories.
pub(crate) fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Atomically write a value as pretty-printed JSON.
pub(crate) fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    atomic_write(path, &json)
}
