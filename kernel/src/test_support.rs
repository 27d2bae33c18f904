//! Test-only builders, scripted executors and counting snapshot providers.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;

use crate::core::outcome::{OutcomeStatus, StepResult, StepStatus, TaskOutcome};
use crate::core::patch::sha256_hex;
use crate::core::plan::{Budget, ParamValue, Plan, Step, StepType};
use crate::io::sandbox::{ExecContext, SecurityViolation, StepExecutor};
use crate::io::snapshot::SnapshotProvider;

/// A step with no target, params or dependencies.
pub fn step(id: &str, step_type: StepType) -> Step {
    Step {
        id: id.to_string(),
        kind: step_type.into(),
        target_path: None,
        params: BTreeMap::new(),
        depends_on: BTreeSet::new(),
    }
}

pub fn step_after(id: &str, step_type: StepType, depends_on: &[&str]) -> Step {
    Step {
        depends_on: depends_on.iter().map(|dep| (*dep).to_string()).collect(),
        ..step(id, step_type)
    }
}

pub fn with_target(mut step: Step, target_path: &str) -> Step {
    step.target_path = Some(target_path.to_string());
    step
}

pub fn with_param(mut step: Step, key: &str, value: impl Into<ParamValue>) -> Step {
    step.params.insert(key.to_string(), value.into());
    step
}

/// A mutating step targeting `target_path` and applying patch artifact `patch_id`.
pub fn patched(step: Step, target_path: &str, patch_id: &str) -> Step {
    with_param(with_target(step, target_path), "patch", patch_id)
}

/// A plan with the default budget and no patch artifacts.
pub fn plan(steps: Vec<Step>) -> Plan {
    Plan {
        steps,
        budget: Budget::default(),
        patches: BTreeMap::new(),
    }
}

/// Diff turning `x = 1` into `x = 2` in `src/calc.py`.
pub const CALC_FIX: &str = "--- a/src/calc.py\n+++ b/src/calc.py\n@@ -1 +1 @@\n-x = 1\n+x = 2\n";

/// A temporary directory holding `repo/src/calc.py` with `x = 1`.
pub struct RepoFixture {
    pub temp: tempfile::TempDir,
    pub repo: PathBuf,
}

pub fn repo_fixture() -> RepoFixture {
    let temp = tempfile::tempdir().expect("tempdir");
    let repo = temp.path().join("repo");
    fs::create_dir_all(repo.join("src")).expect("mkdir");
    fs::write(repo.join("src").join("calc.py"), "x = 1\n").expect("write");
    RepoFixture { temp, repo }
}

/// An outcome with `files` distinct touched files and a hash unique to the worker.
pub fn outcome(worker_id: usize, status: OutcomeStatus, diff: usize, files: usize) -> TaskOutcome {
    TaskOutcome {
        patch_diff_size: diff,
        files_touched: (0..files).map(|n| format!("src/file_{n}.py")).collect(),
        patch_hash: sha256_hex(&format!("worker-{worker_id}")),
        ..TaskOutcome::empty(worker_id, status)
    }
}

/// Scripted behaviour for one step id.
#[derive(Debug, Clone)]
pub enum Script {
    /// Fail with the given stdout.
    Fail(String),
    /// Fail with `timed_out` set.
    TimedOut,
    /// Succeed after sleeping.
    SleepMs(u64),
    /// Refuse the step.
    Violation,
    /// Panic inside the executor.
    Panic,
}

/// Executor that succeeds unless told otherwise and records every call.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    scripts: BTreeMap<String, Script>,
    calls: Mutex<Vec<(String, Duration)>>,
}

impl ScriptedExecutor {
    pub fn with(mut self, step_id: &str, script: Script) -> Self {
        self.scripts.insert(step_id.to_string(), script);
        self
    }

    /// Step ids in dispatch order.
    pub fn calls(&self) -> Vec<String> {
        self.lock().iter().map(|(id, _)| id.clone()).collect()
    }

    /// Timeouts handed to each dispatch.
    pub fn timeouts(&self) -> Vec<Duration> {
        self.lock().iter().map(|(_, timeout)| *timeout).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(String, Duration)>> {
        self.calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl StepExecutor for ScriptedExecutor {
    fn execute(&self, step: &Step, ctx: &ExecContext<'_>) -> Result<StepResult, SecurityViolation> {
        self.lock().push((step.id.clone(), ctx.timeout));
        let started_at = Utc::now();
        let mut result = StepResult {
            status: StepStatus::Succeeded,
            exit_code: Some(0),
            ..StepResult::skipped(&step.id, started_at)
        };
        match self.scripts.get(&step.id) {
            None => {}
            Some(Script::Fail(stdout)) => {
                result.status = StepStatus::Failed;
                result.exit_code = Some(1);
                result.stdout = stdout.clone();
            }
            Some(Script::TimedOut) => {
                result.status = StepStatus::Failed;
                result.exit_code = None;
                result.timed_out = true;
            }
            Some(Script::SleepMs(ms)) => thread::sleep(Duration::from_millis(*ms)),
            Some(Script::Violation) => {
                return Err(SecurityViolation::InlineShell {
                    step_id: step.id.clone(),
                    field: "params.selector".to_string(),
                    issue: "command separator ';'".to_string(),
                });
            }
            Some(Script::Panic) => panic!("scripted panic in step {}", step.id),
        }
        result.finished_at = Utc::now();
        result.duration_ms = (result.finished_at - started_at).num_milliseconds().max(0) as u64;
        Ok(result)
    }
}

/// Snapshot provider that touches no filesystem and counts calls.
#[derive(Debug, Default)]
pub struct CountingSnapshots {
    acquired: AtomicUsize,
    released: AtomicUsize,
    releases: Mutex<Vec<PathBuf>>,
}

impl CountingSnapshots {
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Released roots, in release order.
    pub fn released_roots(&self) -> Vec<PathBuf> {
        self.releases
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl SnapshotProvider for CountingSnapshots {
    fn acquire(&self, task_id: &str, worker_id: usize, _source: &Path) -> Result<PathBuf> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(PathBuf::from(format!("{task_id}_w{worker_id}")))
    }

    fn release(&self, root: &Path) -> Result<()> {
        self.released.fetch_add(1, Ordering::SeqCst);
        self.releases
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(root.to_path_buf());
        Ok(())
    }
}
