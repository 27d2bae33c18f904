//! Plan gate: the first, purely structural and policy-level validator.
//!
//! `validate` is total. Any malformed input becomes a [`Violation`] and any
//! violation rejects the plan. Checks run in a fixed order so the report for a
//! given plan is always identical.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::core::graph::DependencyGraph;
use crate::core::plan::{Capability, Plan, Step, StepKind};
use crate::core::policy::{
    check_relative_path, find_command_separator, find_shell_metacharacter, has_env_assignment,
};

/// Stable violation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationCode {
    EmptyPlan,
    BudgetExceeded,
    DuplicateStepId,
    UnknownDependency,
    ForwardDependency,
    DependencyCycle,
    UnknownStepType,
    UnsafeTargetPath,
    NonScalarParam,
    CommandSeparator,
    ShellMetacharacter,
    EnvAssignment,
    UnverifiedMutation,
}

/// Error class of a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationClass {
    /// Malformed plan: ids, dependencies, step types, budget.
    Structural,
    /// Disallowed command, path or parameter.
    Policy,
}

impl ViolationCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ViolationCode::EmptyPlan => "empty_plan",
            ViolationCode::BudgetExceeded => "budget_exceeded",
            ViolationCode::DuplicateStepId => "duplicate_step_id",
            ViolationCode::UnknownDependency => "unknown_dependency",
            ViolationCode::ForwardDependency => "forward_dependency",
            ViolationCode::DependencyCycle => "dependency_cycle",
            ViolationCode::UnknownStepType => "unknown_step_type",
            ViolationCode::UnsafeTargetPath => "unsafe_target_path",
            ViolationCode::NonScalarParam => "non_scalar_param",
            ViolationCode::CommandSeparator => "command_separator",
            ViolationCode::ShellMetacharacter => "shell_metacharacter",
            ViolationCode::EnvAssignment => "env_assignment",
            ViolationCode::UnverifiedMutation => "unverified_mutation",
        }
    }

    pub fn class(self) -> ViolationClass {
        match self {
            ViolationCode::EmptyPlan
            | ViolationCode::BudgetExceeded
            | ViolationCode::DuplicateStepId
            | ViolationCode::UnknownDependency
            | ViolationCode::ForwardDependency
            | ViolationCode::DependencyCycle
            | ViolationCode::UnknownStepType => ViolationClass::Structural,
            ViolationCode::UnsafeTargetPath
            | ViolationCode::NonScalarParam
            | ViolationCode::CommandSeparator
            | ViolationCode::ShellMetacharacter
            | ViolationCode::EnvAssignment
            | ViolationCode::UnverifiedMutation => ViolationClass::Policy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub code: ViolationCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateReport {
    pub accepted: bool,
    pub violations: Vec<Violation>,
}

impl GateReport {
    pub fn codes(&self) -> Vec<ViolationCode> {
        self.violations.iter().map(|violation| violation.code).collect()
    }

    pub fn has(&self, code: ViolationCode) -> bool {
        self.violations.iter().any(|violation| violation.code == code)
    }
}

struct Collector {
    violations: Vec<Violation>,
}

impl Collector {
    fn push(&mut self, code: ViolationCode, step: Option<&Step>, message: String) {
        self.violations.push(Violation {
            code,
            step_id: step.map(|step| step.id.clone()),
            message,
        });
    }
}

/// Validate a plan. Never panics, never performs I/O.
pub fn validate(plan: &Plan) -> GateReport {
    let mut out = Collector {
        violations: Vec::new(),
    };

    if plan.steps.is_empty() {
        out.push(ViolationCode::EmptyPlan, None, "plan has no steps".to_string());
    }
    if plan.steps.len() > plan.budget.max_steps {
        out.push(
            ViolationCode::BudgetExceeded,
            None,
            format!(
                "plan has {} steps, budget allows {}",
                plan.steps.len(),
                plan.budget.max_steps
            ),
        );
    }

    check_ids_and_dependencies(plan, &mut out);
    check_cycles(plan, &mut out);

    for step in &plan.steps {
        if let StepKind::Unknown(raw) = &step.kind {
            out.push(
                ViolationCode::UnknownStepType,
                Some(step),
                format!("step type '{raw}' is not allowed"),
            );
        }
    }

    for step in &plan.steps {
        check_target_path(step, &mut out);
    }
    for step in &plan.steps {
        check_params(step, &mut out);
    }

    check_verification_follows_mutation(plan, &mut out);

    GateReport {
        accepted: out.violations.is_empty(),
        violations: out.violations,
    }
}

fn check_ids_and_dependencies(plan: &Plan, out: &mut Collector) {
    let mut seen = HashSet::new();
    for step in &plan.steps {
        if !seen.insert(step.id.as_str()) {
            out.push(
                ViolationCode::DuplicateStepId,
                Some(step),
                format!("duplicate step id '{}'", step.id),
            );
        }
    }

    let mut first_position: HashMap<&str, usize> = HashMap::new();
    for (position, step) in plan.steps.iter().enumerate() {
        first_position.entry(step.id.as_str()).or_insert(position);
    }

    for (position, step) in plan.steps.iter().enumerate() {
        for dep in &step.depends_on {
            match first_position.get(dep.as_str()) {
                None => out.push(
                    ViolationCode::UnknownDependency,
                    Some(step),
                    format!("step '{}' depends on unknown step '{dep}'", step.id),
                ),
                Some(&dep_position) if dep_position >= position => out.push(
                    ViolationCode::ForwardDependency,
                    Some(step),
                    format!(
                        "step '{}' depends on '{dep}', which is not declared before it",
                        step.id
                    ),
                ),
                Some(_) => {}
            }
        }
    }
}

fn check_cycles(plan: &Plan, out: &mut Collector) {
    let graph = DependencyGraph::from_plan(plan);
    for (from, to) in graph.back_edges() {
        out.push(
            ViolationCode::DependencyCycle,
            Some(&plan.steps[from]),
            format!(
                "dependency cycle: '{}' depends on '{}', which leads back to it",
                graph.id(from),
                graph.id(to)
            ),
        );
    }
}

/// A mutating step may omit its target; a declared one must stay confined.
fn check_target_path(step: &Step, out: &mut Collector) {
    if !step.kind.is(Capability::Mutating) {
        return;
    }
    if let Some(path) = &step.target_path
        && let Err(issue) = check_relative_path(path)
    {
        out.push(
            ViolationCode::UnsafeTargetPath,
            Some(step),
            format!("target_path '{path}': {}", issue.describe()),
        );
    }
}

fn check_params(step: &Step, out: &mut Collector) {
    let mut values: Vec<(String, String)> = Vec::new();
    if let Some(path) = &step.target_path {
        values.push(("target_path".to_string(), path.clone()));
    }
    for (key, value) in &step.params {
        match value.as_text() {
            Some(text) => values.push((format!("params.{key}"), text)),
            None => out.push(
                ViolationCode::NonScalarParam,
                Some(step),
                format!("params.{key} is not a scalar"),
            ),
        }
    }

    for (label, value) in &values {
        if let Some(ch) = find_command_separator(value) {
            out.push(
                ViolationCode::CommandSeparator,
                Some(step),
                format!("{label} contains command separator {ch:?}"),
            );
        }
        if let Some(ch) = find_shell_metacharacter(value) {
            out.push(
                ViolationCode::ShellMetacharacter,
                Some(step),
                format!("{label} contains shell metacharacter {ch:?}"),
            );
        }
        if has_env_assignment(value) {
            out.push(
                ViolationCode::EnvAssignment,
                Some(step),
                format!("{label} contains an inline environment assignment"),
            );
        }
    }
}

fn check_verification_follows_mutation(plan: &Plan, out: &mut Collector) {
    let last_verification = plan
        .steps
        .iter()
        .rposition(|step| step.kind.is(Capability::Verification));
    for (position, step) in plan.steps.iter().enumerate() {
        if !step.kind.is(Capability::Mutating) {
            continue;
        }
        let verified = last_verification.is_some_and(|last| last > position);
        if !verified {
            out.push(
                ViolationCode::UnverifiedMutation,
                Some(step),
                format!(
                    "mutating step '{}' is not followed by a verification step",
                    step.id
                ),
            );
        }
    }
}
