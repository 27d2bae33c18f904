//! Self-critique rubric run after the gate accepted a plan.
//!
//! The rubric is a fixed table of named checks grouped in five categories. Every
//! check runs; every failure is reported, checks in table order and steps in
//! plan order. Any failure rejects the plan.

use serde::{Deserialize, Serialize};

use crate::core::budget::declared_command_secs;
use crate::core::gate::{GateReport, validate};
use crate::core::patch::touched_files;
use crate::core::plan::{Capability, Plan, Step, StepKind, StepType};
use crate::core::policy::{
    BOOLEAN_KEYS, BYPASS_KEYS, INTEGER_KEYS, allowed_param_keys, check_relative_path,
    contains_bypass_flag, inline_shell_issue, is_vcs_metadata, is_well_formed_step_id, is_within,
    looks_like_shell_invocation, matches_secret_pattern,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CritiqueCategory {
    Structural,
    GateCompatibility,
    CommandSafety,
    PathSafety,
    Verification,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CritiqueVerdict {
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardFailure {
    pub category: CritiqueCategory,
    pub check: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CritiqueReport {
    pub result: CritiqueVerdict,
    pub hard_failures: Vec<HardFailure>,
}

impl CritiqueReport {
    pub fn accepted(&self) -> bool {
        self.result == CritiqueVerdict::Accepted
    }

    /// Names of the failing checks, in report order.
    pub fn failed_checks(&self) -> Vec<&str> {
        self.hard_failures
            .iter()
            .map(|failure| failure.check.as_str())
            .collect()
    }
}

/// Immutable rubric settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CritiquePolicy {
    pub strict: bool,
    pub strict_command_budget_secs: u64,
    pub default_command_timeout_secs: u64,
}

impl Default for CritiquePolicy {
    fn default() -> Self {
        Self {
            strict: false,
            strict_command_budget_secs: 30 * 60,
            default_command_timeout_secs: 5 * 60,
        }
    }
}

struct Input<'a> {
    plan: &'a Plan,
    gate: &'a GateReport,
    policy: &'a CritiquePolicy,
}

/// Findings of one check: optional step id plus message.
type Findings = Vec<(Option<String>, String)>;

struct Check {
    category: CritiqueCategory,
    name: &'static str,
    run: fn(&Input<'_>) -> Findings,
}

const CHECKS: &[Check] = &[
    Check {
        category: CritiqueCategory::Structural,
        name: "step_ids_well_formed",
        run: step_ids_well_formed,
    },
    Check {
        category: CritiqueCategory::Structural,
        name: "params_well_typed",
        run: params_well_typed,
    },
    Check {
        category: CritiqueCategory::Structural,
        name: "required_params_present",
        run: required_params_present,
    },
    Check {
        category: CritiqueCategory::Structural,
        name: "command_time_within_plan_budget",
        run: command_time_within_plan_budget,
    },
    Check {
        category: CritiqueCategory::Structural,
        name: "command_time_within_strict_budget",
        run: command_time_within_strict_budget,
    },
    Check {
        category: CritiqueCategory::GateCompatibility,
        name: "gate_accepted",
        run: gate_accepted,
    },
    Check {
        category: CritiqueCategory::GateCompatibility,
        name: "gate_report_current",
        run: gate_report_current,
    },
    Check {
        category: CritiqueCategory::CommandSafety,
        name: "step_type_allowlisted",
        run: step_type_allowlisted,
    },
    Check {
        category: CritiqueCategory::CommandSafety,
        name: "param_keys_allowlisted",
        run: param_keys_allowlisted,
    },
    Check {
        category: CritiqueCategory::CommandSafety,
        name: "no_raw_shell_invocation",
        run: no_raw_shell_invocation,
    },
    Check {
        category: CritiqueCategory::CommandSafety,
        name: "no_inline_shell_syntax",
        run: no_inline_shell_syntax,
    },
    Check {
        category: CritiqueCategory::PathSafety,
        name: "target_path_confined",
        run: target_path_confined,
    },
    Check {
        category: CritiqueCategory::PathSafety,
        name: "no_secret_paths",
        run: no_secret_paths,
    },
    Check {
        category: CritiqueCategory::PathSafety,
        name: "no_vcs_metadata_mutation",
        run: no_vcs_metadata_mutation,
    },
    Check {
        category: CritiqueCategory::PathSafety,
        name: "patch_files_within_target",
        run: patch_files_within_target,
    },
    Check {
        category: CritiqueCategory::Verification,
        name: "mutation_followed_by_verification",
        run: mutation_followed_by_verification,
    },
    Check {
        category: CritiqueCategory::Verification,
        name: "no_verification_bypass",
        run: no_verification_bypass,
    },
];

/// Run every rubric check. Pure over its three inputs.
pub fn critique(plan: &Plan, gate_report: &GateReport, policy: &CritiquePolicy) -> CritiqueReport {
    let input = Input {
        plan,
        gate: gate_report,
        policy,
    };
    let mut hard_failures = Vec::new();
    for check in CHECKS {
        for (step_id, message) in (check.run)(&input) {
            hard_failures.push(HardFailure {
                category: check.category,
                check: check.name.to_string(),
                step_id,
                message,
            });
        }
    }
    let result = if hard_failures.is_empty() {
        CritiqueVerdict::Accepted
    } else {
        CritiqueVerdict::Rejected
    };
    CritiqueReport {
        result,
        hard_failures,
    }
}

/// Names of every rubric check, in evaluation order.
pub fn check_names() -> impl Iterator<Item = &'static str> {
    CHECKS.iter().map(|check| check.name)
}

/// Declared command time of a plan in seconds. The controller enforces the
/// same per-step figures when the plan runs.
pub fn plan_command_secs(plan: &Plan, policy: &CritiquePolicy) -> u64 {
    plan.steps
        .iter()
        .filter_map(|step| declared_command_secs(step, policy.default_command_timeout_secs))
        .fold(0u64, u64::saturating_add)
}

fn finding(step: &Step, message: String) -> (Option<String>, String) {
    (Some(step.id.clone()), message)
}

/// Target path and every scalar parameter of a step, labelled.
fn step_values(step: &Step) -> Vec<(String, String)> {
    let mut values = Vec::new();
    if let Some(path) = &step.target_path {
        values.push(("target_path".to_string(), path.clone()));
    }
    for (key, value) in &step.params {
        if let Some(text) = value.as_text() {
            values.push((format!("params.{key}"), text));
        }
    }
    values
}

fn step_ids_well_formed(input: &Input<'_>) -> Findings {
    input
        .plan
        .steps
        .iter()
        .filter(|step| !is_well_formed_step_id(&step.id))
        .map(|step| finding(step, format!("step id '{}' is not well formed", step.id)))
        .collect()
}

fn params_well_typed(input: &Input<'_>) -> Findings {
    let mut out = Vec::new();
    for step in &input.plan.steps {
        for (key, value) in &step.params {
            let (ok, expected) = if INTEGER_KEYS.contains(&key.as_str()) {
                (value.as_positive_int().is_some(), "a positive integer")
            } else if BOOLEAN_KEYS.contains(&key.as_str()) {
                (value.as_bool().is_some(), "a boolean")
            } else {
                (value.as_str().is_some(), "a string")
            };
            if !ok {
                out.push(finding(step, format!("params.{key} must be {expected}")));
            }
        }
    }
    out
}

fn required_params_present(input: &Input<'_>) -> Findings {
    let mut out = Vec::new();
    for step in &input.plan.steps {
        let Some(ty) = step.kind.known() else {
            continue;
        };
        match ty {
            StepType::SearchRepo | StepType::GrepSearch => {
                if step.param_str("pattern").is_none_or(str::is_empty) {
                    out.push(finding(step, format!("{ty} requires params.pattern")));
                }
            }
            StepType::ReadFile | StepType::AnalyzeFile => {
                if step.target_path.is_none() {
                    out.push(finding(step, format!("{ty} requires a target_path")));
                }
            }
            StepType::Wait => {
                if step.param("seconds").is_none() {
                    out.push(finding(step, "wait requires params.seconds".to_string()));
                }
            }
            // A mutating step without a patch fails when it runs; a dangling
            // reference is a malformed plan.
            _ if ty.capability() == Capability::Mutating => {
                if let Some(id) = step.param_str("patch")
                    && !input.plan.patches.contains_key(id)
                {
                    out.push(finding(
                        step,
                        format!("patch artifact '{id}' is not in the plan"),
                    ));
                }
            }
            _ => {}
        }
    }
    out
}

fn command_time_within_plan_budget(input: &Input<'_>) -> Findings {
    let declared = plan_command_secs(input.plan, input.policy);
    let limit = input.plan.budget.max_command_secs;
    if declared > limit {
        vec![(
            None,
            format!("declared command time {declared}s exceeds plan budget {limit}s"),
        )]
    } else {
        Vec::new()
    }
}

fn command_time_within_strict_budget(input: &Input<'_>) -> Findings {
    if !input.policy.strict {
        return Vec::new();
    }
    let declared = plan_command_secs(input.plan, input.policy);
    let limit = input.policy.strict_command_budget_secs;
    if declared > limit {
        vec![(
            None,
            format!("declared command time {declared}s exceeds strict budget {limit}s"),
        )]
    } else {
        Vec::new()
    }
}

fn gate_accepted(input: &Input<'_>) -> Findings {
    if input.gate.accepted {
        return Vec::new();
    }
    let codes = input
        .gate
        .violations
        .iter()
        .map(|violation| violation.code.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    vec![(None, format!("gate rejected the plan: {codes}"))]
}

fn gate_report_current(input: &Input<'_>) -> Findings {
    if validate(input.plan) == *input.gate {
        Vec::new()
    } else {
        vec![(
            None,
            "supplied gate report does not match the plan".to_string(),
        )]
    }
}

fn step_type_allowlisted(input: &Input<'_>) -> Findings {
    input
        .plan
        .steps
        .iter()
        .filter_map(|step| match &step.kind {
            StepKind::Unknown(raw) => {
                Some(finding(step, format!("step type '{raw}' is not allowlisted")))
            }
            StepKind::Known(_) => None,
        })
        .collect()
}

fn param_keys_allowlisted(input: &Input<'_>) -> Findings {
    let mut out = Vec::new();
    for step in &input.plan.steps {
        let Some(ty) = step.kind.known() else {
            continue;
        };
        let allowed = allowed_param_keys(ty);
        for key in step.params.keys() {
            if !allowed.contains(&key.as_str()) {
                out.push(finding(
                    step,
                    format!("params.{key} is not allowed for {ty}"),
                ));
            }
        }
    }
    out
}

fn no_raw_shell_invocation(input: &Input<'_>) -> Findings {
    let mut out = Vec::new();
    for step in &input.plan.steps {
        for (label, value) in step_values(step) {
            if looks_like_shell_invocation(&value) {
                out.push(finding(step, format!("{label} invokes a shell")));
            }
        }
    }
    out
}

fn no_inline_shell_syntax(input: &Input<'_>) -> Findings {
    let mut out = Vec::new();
    for step in &input.plan.steps {
        for (label, value) in step_values(step) {
            if let Some(issue) = inline_shell_issue(&value) {
                out.push(finding(step, format!("{label} contains {issue}")));
            }
        }
    }
    out
}

fn target_path_confined(input: &Input<'_>) -> Findings {
    input
        .plan
        .steps
        .iter()
        .filter_map(|step| {
            let path = step.target_path.as_deref()?;
            let issue = check_relative_path(path).err()?;
            Some(finding(
                step,
                format!("target_path '{path}': {}", issue.describe()),
            ))
        })
        .collect()
}

fn no_secret_paths(input: &Input<'_>) -> Findings {
    let mut out = Vec::new();
    for step in &input.plan.steps {
        for (label, value) in step_values(step) {
            if let Some(pattern) = matches_secret_pattern(&value) {
                out.push(finding(
                    step,
                    format!("{label} matches secret pattern '{pattern}'"),
                ));
            }
        }
    }
    out
}

fn no_vcs_metadata_mutation(input: &Input<'_>) -> Findings {
    let mut out = Vec::new();
    for step in &input.plan.steps {
        if !step.kind.is(Capability::Mutating) {
            continue;
        }
        if let Some(path) = step.target_path.as_deref()
            && is_vcs_metadata(path)
        {
            out.push(finding(
                step,
                format!("target_path '{path}' is version-control metadata"),
            ));
        }
        if let Some(diff) = input.plan.patch_for(step) {
            for file in touched_files(diff) {
                if is_vcs_metadata(&file) {
                    out.push(finding(
                        step,
                        format!("patch touches version-control metadata '{file}'"),
                    ));
                }
            }
        }
    }
    out
}

fn patch_files_within_target(input: &Input<'_>) -> Findings {
    let mut out = Vec::new();
    for step in &input.plan.steps {
        if !step.kind.is(Capability::Mutating) {
            continue;
        }
        let Some(diff) = input.plan.patch_for(step) else {
            continue;
        };
        let target = step.target_path.as_deref();
        let files = touched_files(diff);
        if files.is_empty() {
            out.push(finding(step, "patch names no files".to_string()));
        }
        for file in files {
            if let Err(issue) = check_relative_path(&file) {
                out.push(finding(
                    step,
                    format!("patch file '{file}': {}", issue.describe()),
                ));
            } else if let Some(target) = target
                && !is_within(&file, target)
            {
                out.push(finding(
                    step,
                    format!("patch file '{file}' is outside target_path '{target}'"),
                ));
            }
        }
    }
    out
}

fn mutation_followed_by_verification(input: &Input<'_>) -> Findings {
    let steps = &input.plan.steps;
    let last_verification = steps
        .iter()
        .rposition(|step| step.kind.is(Capability::Verification));
    steps
        .iter()
        .enumerate()
        .filter(|(position, step)| {
            step.kind.is(Capability::Mutating)
                && !last_verification.is_some_and(|last| last > *position)
        })
        .map(|(_, step)| {
            finding(
                step,
                format!("mutating step '{}' is never verified", step.id),
            )
        })
        .collect()
}

fn no_verification_bypass(input: &Input<'_>) -> Findings {
    let mut out = Vec::new();
    for step in &input.plan.steps {
        for key in step.params.keys() {
            if BYPASS_KEYS.contains(&key.as_str()) {
                out.push(finding(
                    step,
                    format!("params.{key} disables verification"),
                ));
            }
        }
        for (label, value) in step_values(step) {
            if let Some(flag) = contains_bypass_flag(&value) {
                out.push(finding(step, format!("{label} carries bypass flag '{flag}'")));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{patched, plan, step, step_after, with_param, with_target};

    const CALC_DIFF: &str =
        "--- a/src/calc.py\n+++ b/src/calc.py\n@@ -1 +1 @@\n-x = 1\n+x = 2\n";

    fn run(plan: &Plan) -> CritiqueReport {
        critique(plan, &validate(plan), &CritiquePolicy::default())
    }

    fn good_plan() -> Plan {
        let mut plan = plan(vec![
            patched(step("a", StepType::ApplyPatch), "src", "p1"),
            step_after("b", StepType::RunTests, &["a"]),
        ]);
        plan.patches.insert("p1".to_string(), CALC_DIFF.to_string());
        plan
    }

    #[test]
    fn accepts_a_clean_plan() {
        let report = run(&good_plan());
        assert!(report.accepted(), "{:?}", report.hard_failures);
    }

    #[test]
    fn accepts_an_untargeted_patch_plan_as_written() {
        let plan = Plan::from_json(
            r#"{"steps": [
                {"id": "a", "type": "apply_patch", "depends_on": []},
                {"id": "b", "type": "run_tests", "depends_on": ["a"]}
            ]}"#,
        )
        .expect("plan");
        let gate = validate(&plan);
        assert!(gate.accepted, "{:?}", gate.violations);
        let report = critique(&plan, &gate, &CritiquePolicy::default());
        assert_eq!(report.result, CritiqueVerdict::Accepted, "{:?}", report.hard_failures);
    }

    #[test]
    fn untargeted_patch_files_must_still_be_confined() {
        let mut plan = plan(vec![
            with_param(step("a", StepType::ApplyPatch), "patch", "p1"),
            step("t", StepType::RunTests),
        ]);
        plan.patches.insert(
            "p1".to_string(),
            "--- a/../etc/passwd\n+++ b/../etc/passwd\n@@ -1 +1 @@\n-a\n+b\n".to_string(),
        );
        assert_eq!(run(&plan).failed_checks(), vec!["patch_files_within_target"]);
    }

    #[test]
    fn ships_the_named_checks_in_order() {
        let names: Vec<_> = check_names().collect();
        assert_eq!(names.len(), 17);
        assert_eq!(names[0], "step_ids_well_formed");
        assert_eq!(names[names.len() - 1], "no_verification_bypass");
    }

    #[test]
    fn stale_or_rejecting_gate_report_fails_compatibility() {
        let plan = good_plan();
        let mut stale = validate(&plan);
        stale.accepted = false;
        let report = critique(&plan, &stale, &CritiquePolicy::default());
        assert_eq!(
            report.failed_checks(),
            vec!["gate_accepted", "gate_report_current"]
        );
        assert!(
            report
                .hard_failures
                .iter()
                .all(|failure| failure.category == CritiqueCategory::GateCompatibility)
        );
    }

    #[test]
    fn unknown_step_type_is_a_command_safety_failure() {
        let mut shell = step("x", StepType::ReadFile);
        shell.kind = StepKind::Unknown("run_shell".to_string());
        let report = run(&plan(vec![shell]));
        assert!(!report.accepted());
        assert!(report.hard_failures.iter().any(|failure| {
            failure.category == CritiqueCategory::CommandSafety
                && failure.check == "step_type_allowlisted"
        }));
    }

    #[test]
    fn trailing_mutation_fails_verification_category() {
        let mut plan = plan(vec![patched(step("a", StepType::ApplyPatch), "src", "p1")]);
        plan.patches.insert("p1".to_string(), CALC_DIFF.to_string());
        let report = run(&plan);
        let verification: Vec<_> = report
            .hard_failures
            .iter()
            .filter(|failure| failure.category == CritiqueCategory::Verification)
            .map(|failure| failure.check.as_str())
            .collect();
        assert_eq!(verification, vec!["mutation_followed_by_verification"]);
    }

    #[test]
    fn flags_missing_patch_artifact_and_bad_param_types() {
        let plan = plan(vec![
            patched(step("a", StepType::ApplyPatch), "src", "missing"),
            with_param(step("b", StepType::RunTests), "timeout_secs", "soon"),
        ]);
        let report = run(&plan);
        let checks = report.failed_checks();
        assert!(checks.contains(&"required_params_present"));
        assert!(checks.contains(&"params_well_typed"));
    }

    #[test]
    fn patch_outside_target_is_rejected() {
        let mut plan = good_plan();
        plan.steps[0].target_path = Some("tests".to_string());
        assert_eq!(run(&plan).failed_checks(), vec!["patch_files_within_target"]);
    }

    #[test]
    fn secret_and_vcs_targets_are_rejected() {
        let plan = plan(vec![
            with_target(step("r", StepType::ReadFile), "config/.env"),
            patched(step("a", StepType::ApplyPatch), ".git/hooks", "p"),
            step("t", StepType::RunTests),
        ]);
        let report = run(&plan);
        let checks = report.failed_checks();
        assert!(checks.contains(&"no_secret_paths"));
        assert!(checks.contains(&"no_vcs_metadata_mutation"));
    }

    #[test]
    fn shell_invocations_and_bypass_flags_are_rejected() {
        let plan = plan(vec![
            with_param(step("s", StepType::SearchRepo), "pattern", "bash -c id"),
            with_param(step("t", StepType::RunTests), "selector", "--deselect tests"),
            with_param(step("u", StepType::RunTests), "skip", "yes"),
        ]);
        let report = run(&plan);
        let checks = report.failed_checks();
        assert!(checks.contains(&"no_raw_shell_invocation"));
        assert!(checks.contains(&"no_verification_bypass"));
        assert!(checks.contains(&"param_keys_allowlisted"));
    }

    #[test]
    fn strict_budget_only_applies_in_strict_mode() {
        let plan = plan(vec![
            with_param(step("t", StepType::RunTests), "timeout_secs", 900_i64),
            with_param(step("l", StepType::RunLint), "timeout_secs", 900_i64),
        ]);
        let relaxed = CritiquePolicy {
            strict_command_budget_secs: 600,
            ..CritiquePolicy::default()
        };
        assert!(critique(&plan, &validate(&plan), &relaxed).accepted());

        let strict = CritiquePolicy {
            strict: true,
            ..relaxed
        };
        assert_eq!(
            critique(&plan, &validate(&plan), &strict).failed_checks(),
            vec!["command_time_within_strict_budget"]
        );
        assert_eq!(plan_command_secs(&plan, &strict), 1800);
    }

    #[test]
    fn report_is_deterministic() {
        let mut plan = good_plan();
        plan.steps.push(with_target(step("bad id!", StepType::ReadFile), "/etc"));
        let first = serde_json::to_string(&run(&plan)).expect("json");
        for _ in 0..50 {
            assert_eq!(serde_json::to_string(&run(&plan)).expect("json"), first);
        }
    }
}
