//! Strict-mode preflight over required inputs.
//!
//! Runs before any worker. In strict mode a missing input is fatal; otherwise
//! the run continues degraded and the caller skips what is missing.

use std::path::{Path, PathBuf};

use tracing::warn;

/// Inputs whose absence strict mode refuses to tolerate.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequiredInputs<'a> {
    pub dataset: Option<&'a Path>,
    pub plan_source: Option<&'a Path>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preflight {
    Ready,
    /// Non-strict run with the listed inputs missing.
    Degraded { missing: Vec<PathBuf> },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PreflightError {
    #[error("strict mode: required {what} is missing: {}", .path.display())]
    MissingInput { what: &'static str, path: PathBuf },
    #[error("strict mode: {0}")]
    Invalid(String),
}

/// Check that every named input exists.
pub fn preflight(strict: bool, inputs: RequiredInputs<'_>) -> Result<Preflight, PreflightError> {
    let mut missing = Vec::new();
    let named = [
        ("dataset", inputs.dataset),
        ("plan directory", inputs.plan_source),
    ];
    for (what, path) in named {
        let Some(path) = path else {
            continue;
        };
        if path.exists() {
            continue;
        }
        if strict {
            return Err(PreflightError::MissingInput {
                what,
                path: path.to_path_buf(),
            });
        }
        warn!(input = what, path = %path.display(), "required input missing, continuing degraded");
        missing.push(path.to_path_buf());
    }
    if missing.is_empty() {
        Ok(Preflight::Ready)
    } else {
        Ok(Preflight::Degraded { missing })
    }
}

/// Fail in strict mode, warn otherwise. Used for per-task problems found while
/// loading inputs (no plan variants, unparseable plan files).
pub fn require(
    strict: bool,
    condition: bool,
    message: impl FnOnce() -> String,
) -> Result<bool, PreflightError> {
    if condition {
        return Ok(true);
    }
    let message = message();
    if strict {
        return Err(PreflightError::Invalid(message));
    }
    warn!(%message, "skipping");
    Ok(false)
}
