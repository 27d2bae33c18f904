//! Step results, per-worker outcomes and the task result.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::critique::CritiqueReport;
use crate::core::gate::GateReport;
use crate::core::patch::sha256_hex;

static FAILED_COUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d+)\s+(?:failed|failures?|errors?)\b").expect("failed count regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StepStatus::Pending => "PENDING",
            StepStatus::Running => "RUNNING",
            StepStatus::Succeeded => "SUCCEEDED",
            StepStatus::Failed => "FAILED",
            StepStatus::Skipped => "SKIPPED",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl StepResult {
    /// A step that never ran.
    pub fn skipped(step_id: &str, at: DateTime<Utc>) -> Self {
        Self {
            step_id: step_id.to_string(),
            status: StepStatus::Skipped,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            timed_out: false,
            started_at: at,
            finished_at: at,
            duration_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeStatus {
    Pass,
    FailTests,
    RejectedByGate,
    SecurityViolation,
    Error,
    Timeout,
}

impl OutcomeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeStatus::Pass => "PASS",
            OutcomeStatus::FailTests => "FAIL_TESTS",
            OutcomeStatus::RejectedByGate => "REJECTED_BY_GATE",
            OutcomeStatus::SecurityViolation => "SECURITY_VIOLATION",
            OutcomeStatus::Error => "ERROR",
            OutcomeStatus::Timeout => "TIMEOUT",
        }
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one worker produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub worker_id: usize,
    pub status: OutcomeStatus,
    pub failing_test_count: u32,
    pub patch_diff_size: usize,
    pub files_touched: BTreeSet<String>,
    pub patch_hash: String,
    #[serde(default)]
    pub step_results: Vec<StepResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critique: Option<CritiqueReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl TaskOutcome {
    /// An outcome with nothing applied or run.
    pub fn empty(worker_id: usize, status: OutcomeStatus) -> Self {
        Self {
            worker_id,
            status,
            failing_test_count: 0,
            patch_diff_size: 0,
            files_touched: BTreeSet::new(),
            patch_hash: sha256_hex(""),
            step_results: Vec::new(),
            gate: None,
            critique: None,
            detail: None,
        }
    }

    /// A worker that produced nothing usable: crashed, hung or vanished.
    pub fn failed(worker_id: usize, status: OutcomeStatus, detail: impl Into<String>) -> Self {
        Self {
            detail: Some(detail.into()),
            ..Self::empty(worker_id, status)
        }
    }
}

/// Reduced result for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub winner: TaskOutcome,
    /// Every worker outcome, ordered by worker id.
    pub outcomes: Vec<TaskOutcome>,
}

impl TaskResult {
    pub fn security_violations(&self) -> impl Iterator<Item = &TaskOutcome> {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.status == OutcomeStatus::SecurityViolation)
    }
}

/// Failing test count reported by a test run, or 1 if the run failed without
/// reporting a count.
pub fn count_failing_tests(result: &StepResult) -> u32 {
    if result.status != StepStatus::Failed {
        return 0;
    }
    let mut total: u32 = 0;
    for stream in [&result.stdout, &result.stderr] {
        for captures in FAILED_COUNT.captures_iter(stream) {
            if let Ok(count) = captures[1].parse::<u32>() {
                total = total.saturating_add(count);
            }
        }
    }
    total.max(1)
}
