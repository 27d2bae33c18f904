//! Kernel configuration (TOML).

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::core::critique::CritiquePolicy;
use crate::core::plan::StepType;

/// Environment variable that turns strict mode on.
pub const STRICT_ENV: &str = "BENCH_STRICT";

/// Kernel configuration. Missing fields take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KernelConfig {
    /// Fail fast on missing inputs instead of skipping them.
    pub strict: bool,

    /// Workers launched per task (capped by the number of plan variants).
    pub worker_count: usize,

    /// Wall-clock budget of one worker.
    pub worker_timeout_secs: u64,

    /// Wall-clock budget of a whole task; bounds every worker deadline too.
    pub task_timeout_secs: u64,

    /// Extra time the scheduler waits past the deadline before declaring a worker hung.
    pub join_grace_ms: u64,

    /// Upper bound for a single step.
    pub step_timeout_secs: u64,

    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Declared command time allowed by the strict critique budget.
    pub strict_command_budget_secs: u64,

    /// Command time assumed for a verification step without `timeout_secs`.
    pub default_command_timeout_secs: u64,

    pub commands: VerificationCommands,
}

/// Argv run for each verification step type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerificationCommands {
    pub run_tests: Vec<String>,
    pub run_lint: Vec<String>,
    pub check_syntax: Vec<String>,
    pub validate_types: Vec<String>,
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| (*part).to_string()).collect()
}

impl Default for VerificationCommands {
    fn default() -> Self {
        Self {
            run_tests: argv(&["python", "-m", "pytest", "-q"]),
            run_lint: argv(&["ruff", "check", "."]),
            check_syntax: argv(&["python", "-m", "compileall", "-q", "."]),
            validate_types: argv(&["mypy", "."]),
        }
    }
}

impl VerificationCommands {
    /// Configured argv for a verification step type.
    pub fn for_step(&self, step_type: StepType) -> Option<&[String]> {
        match step_type {
            StepType::RunTests => Some(self.run_tests.as_slice()),
            StepType::RunLint => Some(self.run_lint.as_slice()),
            StepType::CheckSyntax => Some(self.check_syntax.as_slice()),
            StepType::ValidateTypes => Some(self.validate_types.as_slice()),
            _ => None,
        }
    }

    fn entries(&self) -> [(&'static str, &[String]); 4] {
        [
            ("run_tests", self.run_tests.as_slice()),
            ("run_lint", self.run_lint.as_slice()),
            ("check_syntax", self.check_syntax.as_slice()),
            ("validate_types", self.validate_types.as_slice()),
        ]
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            strict: false,
            worker_count: 4,
            worker_timeout_secs: 30 * 60,
            task_timeout_secs: 60 * 60,
            join_grace_ms: 2_000,
            step_timeout_secs: 10 * 60,
            output_limit_bytes: 100_000,
            strict_command_budget_secs: 30 * 60,
            default_command_timeout_secs: 5 * 60,
            commands: VerificationCommands::default(),
        }
    }
}

impl KernelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            bail!("worker_count must be > 0");
        }
        if self.worker_timeout_secs == 0 {
            bail!("worker_timeout_secs must be > 0");
        }
        if self.task_timeout_secs == 0 {
            bail!("task_timeout_secs must be > 0");
        }
        if self.step_timeout_secs == 0 {
            bail!("step_timeout_secs must be > 0");
        }
        if self.output_limit_bytes == 0 {
            bail!("output_limit_bytes must be > 0");
        }
        if self.default_command_timeout_secs == 0 {
            bail!("default_command_timeout_secs must be > 0");
        }
        for (name, command) in self.commands.entries() {
            if command.first().is_none_or(|program| program.trim().is_empty()) {
                bail!("commands.{name} must be a non-empty array");
            }
        }
        Ok(())
    }

    pub fn critique_policy(&self) -> CritiquePolicy {
        CritiquePolicy {
            strict: self.strict,
            strict_command_budget_secs: self.strict_command_budget_secs,
            default_command_timeout_secs: self.default_command_timeout_secs,
        }
    }

    /// Effective worker budget: the tighter of the worker and task timeouts.
    pub fn worker_budget(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_secs.min(self.task_timeout_secs))
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn join_grace(&self) -> Duration {
        Duration::from_millis(self.join_grace_ms)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `KernelConfig::default()`.
pub fn load_config(path: &Path) -> Result<KernelConfig> {
    if !path.exists() {
        let cfg = KernelConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: KernelConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Interpret a `BENCH_STRICT` value. `1`, `true` and `yes` enable strict mode.
pub fn strict_flag(value: Option<&str>) -> bool {
    value.is_some_and(|raw| {
        matches!(
            raw.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes"
        )
    })
}

/// Strict mode as requested by the environment.
pub fn strict_from_env() -> bool {
    strict_flag(std::env::var(STRICT_ENV).ok().as_deref())
}
