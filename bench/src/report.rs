use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

use kernel::core::outcome::{OutcomeStatus, TaskResult};

use crate::results::{META_FILE, RESULT_FILE, RunMeta};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityRecord {
    pub task_id: String,
    pub run_id: String,
    pub worker_id: usize,
    pub detail: Option<String>,
}

#[derive(Debug, Default)]
pub struct ReportSummary {
    pub runs: usize,
    pub winners: BTreeMap<&'static str, usize>,
    pub workers: usize,
    pub gate_rejections: usize,
    /// Runs whose winner passed.
    pub passed: usize,
    pub security_violations: Vec<SecurityRecord>,
    pub avg_duration_secs: Option<f64>,
    pub total_duration_secs: f64,
}

impl ReportSummary {
    pub fn failed(&self) -> usize {
        self.runs - self.passed
    }

    /// Share of runs whose winner passed; `None` before the first run.
    pub fn pass_rate(&self) -> Option<f64> {
        (self.runs > 0).then(|| self.passed as f64 / self.runs as f64)
    }
}

/// Run directories under `<out>/<task_id>/<run_id>`, sorted. Hidden entries
/// (the snapshot scratch area) are ignored.
pub fn load_run_dirs(out_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for task_dir in child_dirs(out_dir)? {
        dirs.extend(child_dirs(&task_dir)?);
    }
    dirs.sort();
    Ok(dirs)
}

fn child_dirs(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry.context("read entry")?;
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if !hidden && entry.path().is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

pub fn aggregate(out_dir: &Path) -> Result<(ReportSummary, Vec<String>)> {
    let mut summary = ReportSummary::default();
    let mut warnings = Vec::new();

    for run_dir in load_run_dirs(out_dir)? {
        let loaded = read_json::<RunMeta>(&run_dir.join(META_FILE)).and_then(|meta| {
            read_json::<TaskResult>(&run_dir.join(RESULT_FILE)).map(|result| (meta, result))
        });
        let (meta, result) = match loaded {
            Ok(pair) => pair,
            Err(err) => {
                warnings.push(format!("skip {}: {err:#}", run_dir.display()));
                continue;
            }
        };

        summary.runs += 1;
        *summary
            .winners
            .entry(result.winner.status.as_str())
            .or_default() += 1;
        if result.winner.status == OutcomeStatus::Pass {
            summary.passed += 1;
        }
        summary.workers += result.outcomes.len();
        summary.gate_rejections += result
            .outcomes
            .iter()
            .filter(|outcome| outcome.status == OutcomeStatus::RejectedByGate)
            .count();
        summary
            .security_violations
            .extend(result.security_violations().map(|outcome| SecurityRecord {
                task_id: result.task_id.clone(),
                run_id: meta.run_id.clone(),
                worker_id: outcome.worker_id,
                detail: outcome.detail.clone(),
            }));

        summary.total_duration_secs += meta.duration_secs;
        summary.avg_duration_secs = Some(match summary.avg_duration_secs {
            None => meta.duration_secs,
            Some(avg) => {
                let total = avg * (summary.runs as f64 - 1.0) + meta.duration_secs;
                total / summary.runs as f64
            }
        });
    }

    Ok((summary, warnings))
}
