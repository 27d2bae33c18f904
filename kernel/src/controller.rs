//! Serial step controller.
//!
//! Runs the steps of an accepted plan one at a time through a
//! [`StepExecutor`]. Each step moves `PENDING -> RUNNING -> terminal` and the
//! controller itself moves `RUNNING -> HALTED` on the first failure, security
//! violation, deadline or cancellation. Every transition is appended to the
//! audit log before the next one happens.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, instrument, warn};

use crate::core::budget::{CommandClock, step_budget};
use crate::core::outcome::{StepResult, StepStatus};
use crate::core::patch::AppliedPatch;
use crate::core::plan::{Capability, Plan, Step};
use crate::io::audit_log::{AuditLog, AuditState};
use crate::io::sandbox::{ExecContext, SecurityViolation, StepExecutor};

/// Limits and signals for one controller run.
#[derive(Debug, Clone)]
pub struct ControllerLimits {
    pub step_timeout: Duration,
    /// Command seconds assumed for a verification step without `timeout_secs`.
    pub default_command_secs: u64,
    pub deadline: Instant,
    pub cancel: Arc<AtomicBool>,
}

/// Why the controller stopped dispatching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaltReason {
    StepFailed {
        step_id: String,
        verification: bool,
        timed_out: bool,
    },
    Security(SecurityViolation),
    Deadline,
    Cancelled,
    /// The audit log could not be written.
    Audit(String),
}

impl HaltReason {
    pub fn describe(&self) -> String {
        match self {
            HaltReason::StepFailed {
                step_id, timed_out, ..
            } => {
                if *timed_out {
                    format!("step '{step_id}' timed out")
                } else {
                    format!("step '{step_id}' failed")
                }
            }
            HaltReason::Security(violation) => violation.to_string(),
            HaltReason::Deadline => "worker deadline exceeded".to_string(),
            HaltReason::Cancelled => "worker cancelled".to_string(),
            HaltReason::Audit(err) => format!("audit log write failed: {err}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControllerRun {
    /// One result per plan step, in plan order.
    pub step_results: Vec<StepResult>,
    pub halt: Option<HaltReason>,
    /// Diffs of mutating steps that succeeded, in order.
    pub applied: Vec<AppliedPatch>,
}

/// Appends to the audit log until the first write error, then goes quiet.
struct Recorder<'a> {
    log: &'a mut AuditLog,
    error: Option<String>,
}

impl Recorder<'_> {
    fn record(
        &mut self,
        step_id: Option<&str>,
        from: AuditState,
        to: AuditState,
        detail: Option<String>,
    ) {
        if self.error.is_some() {
            return;
        }
        if let Err(err) = self.log.append(step_id, from, to, detail) {
            error!(err = %format!("{err:#}"), "audit log write failed");
            self.error = Some(format!("{err:#}"));
        }
    }
}

fn audit_state(status: StepStatus) -> AuditState {
    match status {
        StepStatus::Pending => AuditState::Pending,
        StepStatus::Running => AuditState::Running,
        StepStatus::Succeeded => AuditState::Succeeded,
        StepStatus::Failed => AuditState::Failed,
        StepStatus::Skipped => AuditState::Skipped,
    }
}

/// Execute `plan` serially. The plan must already have passed gate and critique.
#[instrument(skip_all, fields(steps = plan.steps.len()))]
pub fn run_plan<E: StepExecutor + ?Sized>(
    plan: &Plan,
    root: &Path,
    executor: &E,
    limits: &ControllerLimits,
    audit: &mut AuditLog,
) -> ControllerRun {
    let mut recorder = Recorder {
        log: audit,
        error: None,
    };
    let mut step_results = Vec::with_capacity(plan.steps.len());
    let mut applied = Vec::new();
    let mut halt: Option<HaltReason> = None;
    let mut commands =
        CommandClock::new(plan.budget.max_command_secs, limits.default_command_secs);

    recorder.record(None, AuditState::Pending, AuditState::Running, None);

    for step in &plan.steps {
        if halt.is_none()
            && let Some(err) = &recorder.error
        {
            halt = Some(HaltReason::Audit(err.clone()));
        }

        if let Some(reason) = &halt {
            // After an ordinary failure coordination steps still run as signals.
            let signal = matches!(reason, HaltReason::StepFailed { .. })
                && step.kind.is(Capability::Coordination);
            if !signal {
                skip(step, &mut recorder, &mut step_results);
                continue;
            }
        }

        if limits.cancel.load(Ordering::SeqCst) {
            halt_with(&mut halt, HaltReason::Cancelled, &mut recorder);
            skip(step, &mut recorder, &mut step_results);
            continue;
        }
        let timeout = match step_budget(limits.deadline, limits.step_timeout) {
            Ok(timeout) => commands.allowance(step, timeout),
            Err(_) => {
                halt_with(&mut halt, HaltReason::Deadline, &mut recorder);
                skip(step, &mut recorder, &mut step_results);
                continue;
            }
        };

        recorder.record(
            Some(&step.id),
            AuditState::Pending,
            AuditState::Running,
            None,
        );
        let ctx = ExecContext {
            root,
            patches: &plan.patches,
            timeout,
        };
        debug!(step_id = %step.id, step_type = %step.kind, timeout_ms = timeout.as_millis() as u64, "dispatching step");

        let clock = Instant::now();
        let executed = executor.execute(step, &ctx);
        commands.charge(step, clock.elapsed());
        match executed {
            Ok(result) => {
                recorder.record(
                    Some(&step.id),
                    AuditState::Running,
                    audit_state(result.status),
                    result.timed_out.then(|| "timed out".to_string()),
                );
                match result.status {
                    StepStatus::Succeeded if step.kind.is(Capability::Mutating) => {
                        if let Some(diff) = plan.patch_for(step) {
                            applied.push(AppliedPatch {
                                diff: diff.to_string(),
                                target_path: step.target_path.clone(),
                            });
                        }
                    }
                    StepStatus::Succeeded => {}
                    _ if halt.is_none() => {
                        warn!(step_id = %step.id, timed_out = result.timed_out, "step failed, halting");
                        halt_with(
                            &mut halt,
                            HaltReason::StepFailed {
                                step_id: step.id.clone(),
                                verification: step.kind.is(Capability::Verification),
                                timed_out: result.timed_out,
                            },
                            &mut recorder,
                        );
                    }
                    _ => {}
                }
                step_results.push(result);
            }
            Err(violation) => {
                recorder.record(
                    Some(&step.id),
                    AuditState::Running,
                    AuditState::Failed,
                    Some(violation.to_string()),
                );
                let now = Utc::now();
                step_results.push(StepResult {
                    status: StepStatus::Failed,
                    stderr: violation.to_string(),
                    ..StepResult::skipped(&step.id, now)
                });
                // A violation overrides any earlier halt reason.
                halt = None;
                halt_with(&mut halt, HaltReason::Security(violation), &mut recorder);
            }
        }
    }

    if halt.is_none()
        && let Some(err) = recorder.error.take()
    {
        halt = Some(HaltReason::Audit(err));
    }
    if halt.is_none() {
        recorder.record(None, AuditState::Running, AuditState::Succeeded, None);
    }

    ControllerRun {
        step_results,
        halt,
        applied,
    }
}

fn halt_with(halt: &mut Option<HaltReason>, reason: HaltReason, recorder: &mut Recorder<'_>) {
    if halt.is_some() {
        return;
    }
    recorder.record(
        None,
        AuditState::Running,
        AuditState::Halted,
        Some(reason.describe()),
    );
    *halt = Some(reason);
}

fn skip(step: &Step, recorder: &mut Recorder<'_>, results: &mut Vec<StepResult>) {
    recorder.record(
        Some(&step.id),
        AuditState::Pending,
        AuditState::Skipped,
        None,
    );
    results.push(StepResult::skipped(&step.id, Utc::now()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plan::StepType;
    use crate::test_support::{Script, ScriptedExecutor, patched, plan, step, with_param};

    fn limits() -> ControllerLimits {
        ControllerLimits {
            step_timeout: Duration::from_secs(5),
            default_command_secs: 300,
            deadline: Instant::now() + Duration::from_secs(30),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    fn statuses(run: &ControllerRun) -> Vec<StepStatus> {
        run.step_results.iter().map(|result| result.status).collect()
    }

    fn root() -> &'static Path {
        Path::new("snapshot")
    }

    #[test]
    fn runs_steps_serially_in_order() {
        let executor = ScriptedExecutor::default().with("b", Script::SleepMs(20));
        let plan = plan(vec![
            step("a", StepType::ReadFile),
            step("b", StepType::ReadFile),
            step("c", StepType::ReadFile),
        ]);
        let mut audit = AuditLog::new(1);
        let run = run_plan(&plan, root(), &executor, &limits(), &mut audit);

        assert!(run.halt.is_none());
        assert_eq!(executor.calls(), vec!["a", "b", "c"]);
        for pair in run.step_results.windows(2) {
            assert!(pair[1].started_at >= pair[0].finished_at);
        }
        let last = audit.entries().last().expect("entry");
        assert_eq!(last.to, AuditState::Succeeded);
        assert!(last.step_id.is_none());
    }

    #[test]
    fn failure_skips_the_rest_but_still_signals_coordination() {
        let executor = ScriptedExecutor::default().with("t", Script::Fail("1 failed".into()));
        let plan = plan(vec![
            step("t", StepType::RunTests),
            step("r", StepType::ReadFile),
            with_param(step("c", StepType::Checkpoint), "label", "after"),
        ]);
        let mut audit = AuditLog::new(1);
        let run = run_plan(&plan, root(), &executor, &limits(), &mut audit);

        assert_eq!(
            statuses(&run),
            vec![StepStatus::Failed, StepStatus::Skipped, StepStatus::Succeeded]
        );
        assert_eq!(executor.calls(), vec!["t", "c"]);
        assert!(matches!(
            run.halt,
            Some(HaltReason::StepFailed {
                verification: true,
                ..
            })
        ));
        assert!(audit.entries().iter().any(|entry| entry.to == AuditState::Halted));
    }

    #[test]
    fn security_violation_halts_everything() {
        let executor = ScriptedExecutor::default().with("r", Script::Violation);
        let plan = plan(vec![
            step("r", StepType::ReadFile),
            step("c", StepType::Checkpoint),
        ]);
        let mut audit = AuditLog::new(1);
        let run = run_plan(&plan, root(), &executor, &limits(), &mut audit);

        assert_eq!(statuses(&run), vec![StepStatus::Failed, StepStatus::Skipped]);
        assert!(matches!(run.halt, Some(HaltReason::Security(_))));
        assert_eq!(executor.calls(), vec!["r"]);
    }

    #[test]
    fn cancellation_and_deadline_skip_remaining_steps() {
        let executor = ScriptedExecutor::default();
        let plan = plan(vec![step("a", StepType::ReadFile), step("b", StepType::Wait)]);

        let cancelled = limits();
        cancelled.cancel.store(true, Ordering::SeqCst);
        let run = run_plan(&plan, root(), &executor, &cancelled, &mut AuditLog::new(1));
        assert_eq!(run.halt, Some(HaltReason::Cancelled));
        assert_eq!(statuses(&run), vec![StepStatus::Skipped, StepStatus::Skipped]);

        let expired = ControllerLimits {
            deadline: Instant::now(),
            ..limits()
        };
        std::thread::sleep(Duration::from_millis(2));
        let run = run_plan(&plan, root(), &executor, &expired, &mut AuditLog::new(1));
        assert_eq!(run.halt, Some(HaltReason::Deadline));
        assert!(executor.calls().is_empty());
    }

    #[test]
    fn succeeded_mutations_are_collected() {
        let executor = ScriptedExecutor::default();
        let mut plan = plan(vec![
            patched(step("a", StepType::ApplyPatch), "src", "p1"),
            step("t", StepType::RunTests),
        ]);
        plan.patches.insert("p1".to_string(), "--- a/src/x\n+++ b/src/x\n".to_string());
        let run = run_plan(&plan, root(), &executor, &limits(), &mut AuditLog::new(1));
        assert_eq!(run.applied.len(), 1);
        assert_eq!(run.applied[0].target_path.as_deref(), Some("src"));
    }

    #[test]
    fn timeouts_are_clamped_to_the_deadline() {
        let executor = ScriptedExecutor::default();
        let plan = plan(vec![step("a", StepType::ReadFile)]);
        let tight = ControllerLimits {
            step_timeout: Duration::from_secs(600),
            deadline: Instant::now() + Duration::from_secs(10),
            ..limits()
        };
        run_plan(&plan, root(), &executor, &tight, &mut AuditLog::new(1));
        let timeouts = executor.timeouts();
        assert_eq!(timeouts.len(), 1);
        assert!(timeouts[0] <= Duration::from_secs(10));
    }

    #[test]
    fn command_steps_get_their_declared_time_only() {
        let executor = ScriptedExecutor::default();
        let plan = plan(vec![
            with_param(step("t", StepType::RunTests), "timeout_secs", 2_i64),
            step("l", StepType::RunLint),
            step("r", StepType::ReadFile),
        ]);
        let loose = ControllerLimits {
            step_timeout: Duration::from_secs(600),
            default_command_secs: 7,
            ..limits()
        };
        run_plan(&plan, root(), &executor, &loose, &mut AuditLog::new(1));
        let timeouts = executor.timeouts();
        assert_eq!(timeouts[0], Duration::from_secs(2));
        assert!(timeouts[1] <= Duration::from_secs(7));
        assert!(timeouts[1] > Duration::from_secs(6));
        assert!(timeouts[2] > Duration::from_secs(7));
    }

    #[test]
    fn plan_command_budget_bounds_later_steps() {
        let executor = ScriptedExecutor::default().with("t", Script::SleepMs(300));
        let mut plan = plan(vec![
            with_param(step("t", StepType::RunTests), "timeout_secs", 1_i64),
            with_param(step("w", StepType::Wait), "seconds", 60_i64),
        ]);
        plan.budget.max_command_secs = 1;
        run_plan(&plan, root(), &executor, &limits(), &mut AuditLog::new(1));
        let timeouts = executor.timeouts();
        assert_eq!(timeouts[0], Duration::from_secs(1));
        assert!(timeouts[1] <= Duration::from_millis(700));
    }
}
