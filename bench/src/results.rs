//! Result persistence.
//!
//! Each task run lands in `<out>/<task_id>/<run_id>/` with `result.json`
//! (the full [`TaskResult`]), `meta.json` and the per-worker audit logs the
//! scheduler writes there.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use kernel::core::outcome::{OutcomeStatus, TaskResult};

pub const RESULT_FILE: &str = "result.json";
pub const META_FILE: &str = "meta.json";

/// Metadata for one task run, persisted to `meta.json`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RunMeta {
    pub task_id: String,
    pub run_id: String,
    /// SHA-256 of the dataset file for reproducibility tracking.
    pub dataset_hash: String,
    pub start_time: String,
    pub end_time: String,
    pub duration_secs: f64,
    pub worker_count: usize,
    pub strict: bool,
    pub winner_worker: usize,
    pub winner_status: OutcomeStatus,
}

impl RunMeta {
    pub fn new(
        run_id: &str,
        dataset_hash: &str,
        strict: bool,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        result: &TaskResult,
    ) -> Self {
        let duration = finished_at - started_at;
        Self {
            task_id: result.task_id.clone(),
            run_id: run_id.to_string(),
            dataset_hash: dataset_hash.to_string(),
            start_time: started_at.to_rfc3339(),
            end_time: finished_at.to_rfc3339(),
            duration_secs: duration.num_milliseconds() as f64 / 1000.0,
            worker_count: result.outcomes.len(),
            strict,
            winner_worker: result.winner.worker_id,
            winner_status: result.winner.status,
        }
    }
}

pub fn new_run_id(now: DateTime<Utc>) -> String {
    format!("run-{}", now.format("%Y%m%d_%H%M%S%.3f"))
}

pub fn results_dir(base_dir: &Path, task_id: &str, run_id: &str) -> PathBuf {
    base_dir.join(task_id).join(run_id)
}

/// Create a fresh run directory. An existing directory is never reused.
pub fn create_run_dir(base_dir: &Path, task_id: &str, run_id: &str) -> Result<PathBuf> {
    let dir = results_dir(base_dir, task_id, run_id);
    let parent = base_dir.join(task_id);
    fs::create_dir_all(&parent).with_context(|| format!("create {}", parent.display()))?;
    fs::create_dir(&dir).with_context(|| format!("create results dir {}", dir.display()))?;
    Ok(dir)
}

#[instrument(skip_all, fields(task_id = %meta.task_id, run_id = %meta.run_id))]
pub fn write_run(dir: &Path, result: &TaskResult, meta: &RunMeta) -> Result<()> {
    write_json(&dir.join(RESULT_FILE), result).context("write result")?;
    write_json(&dir.join(META_FILE), meta).context("write meta")?;
    debug!(dir = %dir.display(), "results written");
    Ok(())
}

/// Serialize `value` to pretty-printed JSON with trailing newline.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut payload = serde_json::to_string_pretty(value).context("serialize json")?;
    payload.push('\n');
    fs::write(path, payload).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

pub fn file_sha256(path: &Path) -> Result<String> {
    let contents = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(contents);
    Ok(hex::encode(hasher.finalize()))
}
