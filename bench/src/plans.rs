//! Plan-variant discovery: `<plans>/<task_id>/*.json`, sorted by file name.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::debug;

use kernel::core::plan::Plan;
use kernel::preflight::require;

/// Variant files for one task. A missing task directory yields no files.
pub fn variant_files(plans_dir: &Path, task_id: &str) -> Result<Vec<PathBuf>> {
    let dir = plans_dir.join(task_id);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(&dir).with_context(|| format!("read plans dir {}", dir.display()))? {
        let entry = entry.context("read plan entry")?;
        let path = entry.path();
        if path.is_file() && path.extension().and_then(|ext| ext.to_str()) == Some("json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

pub fn load_plan(path: &Path) -> Result<Plan> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read plan {}", path.display()))?;
    Plan::from_json(&contents).with_context(|| format!("load plan {}", path.display()))
}

/// Load every variant for `task_id`.
///
/// In strict mode an unparseable file or an empty variant list is a
/// [`kernel::preflight::PreflightError`]; otherwise bad files are skipped and
/// an empty list tells the caller to skip the task.
pub fn load_variants(plans_dir: &Path, task_id: &str, strict: bool) -> Result<Vec<Arc<Plan>>> {
    let mut plans = Vec::new();
    for path in variant_files(plans_dir, task_id)? {
        match load_plan(&path) {
            Ok(plan) => plans.push(Arc::new(plan)),
            Err(err) => {
                require(strict, false, || format!("task {task_id}: {err:#}"))?;
            }
        }
    }
    require(strict, !plans.is_empty(), || {
        format!("task {task_id} has no plan variants")
    })?;
    debug!(task_id, variants = plans.len(), "plan variants loaded");
    Ok(plans)
}
