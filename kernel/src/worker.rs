//! One worker: gate, critique, controller, classification.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use crate::controller::{ControllerLimits, ControllerRun, HaltReason, run_plan};
use crate::core::critique::{CritiquePolicy, critique};
use crate::core::gate::validate;
use crate::core::outcome::{OutcomeStatus, TaskOutcome, count_failing_tests};
use crate::core::patch::summarize;
use crate::core::plan::{Plan, StepType};
use crate::io::audit_log::AuditLog;
use crate::io::sandbox::StepExecutor;

/// Everything one worker needs. The snapshot root is the only filesystem
/// location it may touch.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub worker_id: usize,
    pub plan: Arc<Plan>,
    pub root: PathBuf,
    pub policy: CritiquePolicy,
    pub step_timeout: Duration,
    pub deadline: Instant,
    pub cancel: Arc<AtomicBool>,
    /// Where to write `worker-{n}.audit.jsonl`; in-memory only when `None`.
    pub audit_path: Option<PathBuf>,
}

/// Run one plan variant to a [`TaskOutcome`]. Never fails: every problem is
/// folded into the outcome status.
#[instrument(skip_all, fields(worker_id = ctx.worker_id))]
pub fn run_worker<E: StepExecutor + ?Sized>(executor: &E, ctx: &WorkerContext) -> TaskOutcome {
    let plan = ctx.plan.as_ref();

    let gate = validate(plan);
    if !gate.accepted {
        info!(violations = gate.violations.len(), "plan rejected by gate");
        return TaskOutcome {
            gate: Some(gate),
            ..TaskOutcome::empty(ctx.worker_id, OutcomeStatus::RejectedByGate)
        };
    }

    let review = critique(plan, &gate, &ctx.policy);
    if !review.accepted() {
        info!(
            failures = review.hard_failures.len(),
            "plan rejected by critique"
        );
        return TaskOutcome {
            gate: Some(gate),
            critique: Some(review),
            ..TaskOutcome::empty(ctx.worker_id, OutcomeStatus::RejectedByGate)
        };
    }

    let mut audit = match &ctx.audit_path {
        Some(path) => match AuditLog::with_file(ctx.worker_id, path) {
            Ok(log) => log,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "audit log unavailable");
                return TaskOutcome {
                    gate: Some(gate),
                    critique: Some(review),
                    ..TaskOutcome::failed(
                        ctx.worker_id,
                        OutcomeStatus::Error,
                        format!("audit log unavailable: {err:#}"),
                    )
                };
            }
        },
        None => AuditLog::new(ctx.worker_id),
    };

    let limits = ControllerLimits {
        step_timeout: ctx.step_timeout,
        default_command_secs: ctx.policy.default_command_timeout_secs,
        deadline: ctx.deadline,
        cancel: ctx.cancel.clone(),
    };
    let run = run_plan(plan, &ctx.root, executor, &limits, &mut audit);
    let (status, detail) = classify(&run);
    debug!(status = %status, "worker finished");

    let summary = summarize(&run.applied);
    let failing_test_count = plan
        .steps
        .iter()
        .zip(&run.step_results)
        .filter(|(step, _)| step.kind.known() == Some(StepType::RunTests))
        .map(|(_, result)| count_failing_tests(result))
        .fold(0u32, u32::saturating_add);

    TaskOutcome {
        worker_id: ctx.worker_id,
        status,
        failing_test_count,
        patch_diff_size: summary.diff_lines,
        files_touched: summary.files,
        patch_hash: summary.hash,
        step_results: run.step_results,
        gate: Some(gate),
        critique: Some(review),
        detail,
    }
}

/// Map a controller run to an outcome status. Security beats timeouts, which
/// beat failed verification, which beats any other failure.
pub fn classify(run: &ControllerRun) -> (OutcomeStatus, Option<String>) {
    let Some(halt) = &run.halt else {
        return (OutcomeStatus::Pass, None);
    };
    let any_timed_out = run.step_results.iter().any(|result| result.timed_out);
    let status = match halt {
        HaltReason::Security(_) => OutcomeStatus::SecurityViolation,
        HaltReason::Deadline | HaltReason::Cancelled => OutcomeStatus::Timeout,
        HaltReason::Audit(_) => OutcomeStatus::Error,
        HaltReason::StepFailed { .. } if any_timed_out => OutcomeStatus::Timeout,
        HaltReason::StepFailed {
            verification: true,
            ..
        } => OutcomeStatus::FailTests,
        HaltReason::StepFailed { .. } => OutcomeStatus::Error,
    };
    let detail = match status {
        OutcomeStatus::FailTests => None,
        _ => Some(halt.describe()),
    };
    (status, detail)
}
