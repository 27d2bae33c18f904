//! Typed representation of a repair plan.
//!
//! Plans arrive as JSON from the external plan generator. Deserialization is
//! deliberately permissive about step types and parameter shapes: an unknown
//! type or a non-scalar parameter must still produce a [`Plan`] so the gate can
//! report it as a violation instead of failing the whole load.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Closed set of step types understood by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    SearchRepo,
    ReadFile,
    AnalyzeFile,
    ListDirectory,
    GrepSearch,
    ApplyPatch,
    AddTest,
    RefactorSmall,
    FixImport,
    FixTyping,
    RunTests,
    RunLint,
    CheckSyntax,
    ValidateTypes,
    Wait,
    Checkpoint,
    Replan,
}

/// Capability group of a step type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ReadOnly,
    Mutating,
    Verification,
    Coordination,
}

impl StepType {
    pub const ALL: [StepType; 17] = [
        StepType::SearchRepo,
        StepType::ReadFile,
        StepType::AnalyzeFile,
        StepType::ListDirectory,
        StepType::GrepSearch,
        StepType::ApplyPatch,
        StepType::AddTest,
        StepType::RefactorSmall,
        StepType::FixImport,
        StepType::FixTyping,
        StepType::RunTests,
        StepType::RunLint,
        StepType::CheckSyntax,
        StepType::ValidateTypes,
        StepType::Wait,
        StepType::Checkpoint,
        StepType::Replan,
    ];

    pub fn capability(self) -> Capability {
        match self {
            StepType::SearchRepo
            | StepType::ReadFile
            | StepType::AnalyzeFile
            | StepType::ListDirectory
            | StepType::GrepSearch => Capability::ReadOnly,
            StepType::ApplyPatch
            | StepType::AddTest
            | StepType::RefactorSmall
            | StepType::FixImport
            | StepType::FixTyping => Capability::Mutating,
            StepType::RunTests
            | StepType::RunLint
            | StepType::CheckSyntax
            | StepType::ValidateTypes => Capability::Verification,
            StepType::Wait | StepType::Checkpoint | StepType::Replan => Capability::Coordination,
        }
    }

    /// Wire name used in plan JSON.
    pub fn as_str(self) -> &'static str {
        match self {
            StepType::SearchRepo => "search_repo",
            StepType::ReadFile => "read_file",
            StepType::AnalyzeFile => "analyze_file",
            StepType::ListDirectory => "list_directory",
            StepType::GrepSearch => "grep_search",
            StepType::ApplyPatch => "apply_patch",
            StepType::AddTest => "add_test",
            StepType::RefactorSmall => "refactor_small",
            StepType::FixImport => "fix_import",
            StepType::FixTyping => "fix_typing",
            StepType::RunTests => "run_tests",
            StepType::RunLint => "run_lint",
            StepType::CheckSyntax => "check_syntax",
            StepType::ValidateTypes => "validate_types",
            StepType::Wait => "wait",
            StepType::Checkpoint => "checkpoint",
            StepType::Replan => "replan",
        }
    }

    /// Exact, case-sensitive lookup by wire name.
    pub fn parse(raw: &str) -> Option<StepType> {
        StepType::ALL.into_iter().find(|ty| ty.as_str() == raw)
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared type of a step as it appeared on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepKind {
    Known(StepType),
    Unknown(String),
}

impl StepKind {
    pub fn known(&self) -> Option<StepType> {
        match self {
            StepKind::Known(ty) => Some(*ty),
            StepKind::Unknown(_) => None,
        }
    }

    pub fn capability(&self) -> Option<Capability> {
        self.known().map(StepType::capability)
    }

    pub fn is(&self, capability: Capability) -> bool {
        self.capability() == Some(capability)
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::Known(ty) => f.write_str(ty.as_str()),
            StepKind::Unknown(raw) => f.write_str(raw),
        }
    }
}

impl From<StepType> for StepKind {
    fn from(ty: StepType) -> Self {
        StepKind::Known(ty)
    }
}

impl From<String> for StepKind {
    fn from(raw: String) -> Self {
        match StepType::parse(&raw) {
            Some(ty) => StepKind::Known(ty),
            None => StepKind::Unknown(raw),
        }
    }
}

impl From<StepKind> for String {
    fn from(kind: StepKind) -> Self {
        kind.to_string()
    }
}

impl Serialize for StepKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StepKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(StepKind::from)
    }
}

/// A step parameter value.
///
/// `Other` captures anything that is not a scalar (null, arrays, objects) so
/// that it can be rejected by the gate rather than by the parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Other(serde_json::Value),
}

impl ParamValue {
    pub fn is_scalar(&self) -> bool {
        !matches!(self, ParamValue::Other(_))
    }

    /// Textual form of a scalar, or `None` for non-scalars.
    pub fn as_text(&self) -> Option<String> {
        match self {
            ParamValue::Bool(value) => Some(value.to_string()),
            ParamValue::Int(value) => Some(value.to_string()),
            ParamValue::Float(value) => Some(value.to_string()),
            ParamValue::Str(value) => Some(value.clone()),
            ParamValue::Other(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Str(value) => Some(value),
            _ => None,
        }
    }

    /// Strictly positive integer, or `None`.
    pub fn as_positive_int(&self) -> Option<u64> {
        match self {
            ParamValue::Int(value) if *value > 0 => Some(*value as u64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(value) => Some(*value),
            _ => None,
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Str(value.to_string())
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

/// One typed, parameterized unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_path: Option<String>,
    #[serde(default)]
    pub params: BTreeMap<String, ParamValue>,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
}

impl Step {
    pub fn param(&self, key: &str) -> Option<&ParamValue> {
        self.params.get(key)
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(ParamValue::as_str)
    }
}

/// Declared limits for a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Budget {
    /// Maximum number of steps.
    pub max_steps: usize,
    /// Maximum total declared command time in seconds.
    pub max_command_secs: u64,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            max_steps: 32,
            max_command_secs: 30 * 60,
        }
    }
}

/// An ordered sequence of steps plus a budget and the patch artifacts its
/// mutating steps reference by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<Step>,
    #[serde(default)]
    pub budget: Budget,
    #[serde(default)]
    pub patches: BTreeMap<String, String>,
}

impl Plan {
    /// Parse a plan from JSON.
    pub fn from_json(contents: &str) -> Result<Self> {
        serde_json::from_str(contents).context("parse plan json")
    }

    /// Patch artifact referenced by a step's `patch` parameter.
    pub fn patch_for(&self, step: &Step) -> Option<&str> {
        step.param_str("patch")
            .and_then(|id| self.patches.get(id))
            .map(String::as_str)
    }
}
