//! Sandboxed step executor.
//!
//! The [`StepExecutor`] trait is the only way the controller runs a step. The
//! [`Sandbox`] implementation re-screens every step on its own before doing
//! anything, then performs one fixed operation per step type. Nothing is ever
//! passed to a shell.

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use regex::RegexBuilder;
use tracing::{debug, error, instrument};
use walkdir::{DirEntry, WalkDir};

use crate::core::budget::declared_timeout;
use crate::core::outcome::{StepResult, StepStatus};
use crate::core::patch::touched_files;
use crate::core::plan::{Capability, Step, StepKind, StepType};
use crate::core::policy::{
    allowed_param_keys, check_relative_path, inline_shell_issue, is_vcs_metadata, is_within,
    looks_like_shell_invocation, matches_secret_pattern,
};
use crate::io::config::{KernelConfig, VerificationCommands};
use crate::io::process::run_command_with_timeout;

const DEFAULT_MAX_RESULTS: u64 = 100;
const DEFAULT_MAX_DEPTH: u64 = 2;

/// A step the sandbox refused to run. Fatal for the worker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecurityViolation {
    #[error("step '{step_id}': step type '{step_type}' is not allowlisted")]
    UnknownStepType { step_id: String, step_type: String },

    #[error("step '{step_id}': parameter '{key}' is not allowed for {step_type}")]
    DisallowedParam {
        step_id: String,
        step_type: StepType,
        key: String,
    },

    #[error("step '{step_id}': {field} is not a scalar")]
    NonScalarParam { step_id: String, field: String },

    #[error("step '{step_id}': {field} contains {issue}")]
    InlineShell {
        step_id: String,
        field: String,
        issue: String,
    },

    #[error("step '{step_id}': {field} matches secret pattern '{pattern}'")]
    SecretPath {
        step_id: String,
        field: String,
        pattern: String,
    },

    #[error("step '{step_id}': path '{path}' escapes the workspace: {reason}")]
    PathEscape {
        step_id: String,
        path: String,
        reason: String,
    },

    #[error("step '{step_id}': patch touches '{file}' outside target '{target}'")]
    PatchOutsideTarget {
        step_id: String,
        file: String,
        target: String,
    },

    #[error("step '{step_id}': '{path}' is version-control metadata")]
    VcsMutation { step_id: String, path: String },
}

/// Per-call execution context.
#[derive(Debug, Clone, Copy)]
pub struct ExecContext<'a> {
    /// Root of the worker's snapshot.
    pub root: &'a Path,
    /// Patch artifacts of the plan being executed.
    pub patches: &'a BTreeMap<String, String>,
    /// Hard limit for this step.
    pub timeout: Duration,
}

/// Runs a single step.
pub trait StepExecutor: Send + Sync {
    fn execute(&self, step: &Step, ctx: &ExecContext<'_>) -> Result<StepResult, SecurityViolation>;
}

/// Executor that runs steps against a snapshot directory.
#[derive(Debug, Clone)]
pub struct Sandbox {
    commands: VerificationCommands,
    output_limit_bytes: usize,
}

/// Raw result of an operation before timing is attached.
struct Run {
    status: StepStatus,
    stdout: String,
    stderr: String,
    exit_code: Option<i32>,
    timed_out: bool,
}

impl Run {
    fn ok(stdout: String) -> Self {
        Self {
            status: StepStatus::Succeeded,
            stdout,
            stderr: String::new(),
            exit_code: None,
            timed_out: false,
        }
    }

    fn failed(message: String) -> Self {
        Self {
            status: StepStatus::Failed,
            stdout: String::new(),
            stderr: message,
            exit_code: None,
            timed_out: false,
        }
    }
}

impl StepExecutor for Sandbox {
    #[instrument(skip_all, fields(step_id = %step.id, step_type = %step.kind))]
    fn execute(&self, step: &Step, ctx: &ExecContext<'_>) -> Result<StepResult, SecurityViolation> {
        let started_at = Utc::now();
        let clock = Instant::now();

        let (step_type, target) = match screen(step, ctx) {
            Ok(screened) => screened,
            Err(violation) => {
                error!(%violation, "security violation");
                return Err(violation);
            }
        };

        let run = match self.dispatch(step, step_type, target.as_deref(), ctx) {
            Ok(run) => run,
            Err(err) => {
                debug!(err = %format!("{err:#}"), "step failed");
                Run::failed(format!("{err:#}"))
            }
        };

        let finished_at = Utc::now();
        Ok(StepResult {
            step_id: step.id.clone(),
            status: run.status,
            stdout: run.stdout,
            stderr: run.stderr,
            exit_code: run.exit_code,
            timed_out: run.timed_out,
            started_at,
            finished_at,
            duration_ms: clock.elapsed().as_millis() as u64,
        })
    }
}

impl Sandbox {
    pub fn new(commands: VerificationCommands, output_limit_bytes: usize) -> Self {
        Self {
            commands,
            output_limit_bytes,
        }
    }

    pub fn from_config(cfg: &KernelConfig) -> Self {
        Self::new(cfg.commands.clone(), cfg.output_limit_bytes)
    }

    fn dispatch(
        &self,
        step: &Step,
        step_type: StepType,
        target: Option<&Path>,
        ctx: &ExecContext<'_>,
    ) -> Result<Run> {
        let root = ctx
            .root
            .canonicalize()
            .with_context(|| format!("resolve {}", ctx.root.display()))?;
        let base = target.unwrap_or(root.as_path());
        match step_type {
            StepType::SearchRepo => search_repo(step, &root, base),
            StepType::GrepSearch => grep_search(step, &root, base),
            StepType::ReadFile => self.read_file(step, target),
            StepType::AnalyzeFile => analyze_file(target),
            StepType::ListDirectory => list_directory(step, &root, base),
            StepType::ApplyPatch
            | StepType::AddTest
            | StepType::RefactorSmall
            | StepType::FixImport
            | StepType::FixTyping => self.apply_patch(step, ctx),
            StepType::RunTests
            | StepType::RunLint
            | StepType::CheckSyntax
            | StepType::ValidateTypes => self.verify(step, step_type, ctx),
            StepType::Wait => wait(step, ctx.timeout),
            StepType::Checkpoint => Ok(Run::ok(format!(
                "checkpoint: {}\n",
                step.param_str("label").unwrap_or(step.id.as_str())
            ))),
            StepType::Replan => Ok(Run::ok(format!(
                "replan requested: {}\n",
                step.param_str("reason").unwrap_or("unspecified")
            ))),
        }
    }

    fn read_file(&self, step: &Step, target: Option<&Path>) -> Result<Run> {
        let path = target.ok_or_else(|| anyhow!("read_file requires a target_path"))?;
        let limit = step
            .param("max_bytes")
            .and_then(|value| value.as_positive_int())
            .map_or(self.output_limit_bytes, |max| {
                (max as usize).min(self.output_limit_bytes)
            });
        let file = fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
        let mut buf = Vec::new();
        file.take(limit as u64 + 1)
            .read_to_end(&mut buf)
            .with_context(|| format!("read {}", path.display()))?;
        let truncated = buf.len() > limit;
        buf.truncate(limit);
        let mut text = String::from_utf8_lossy(&buf).into_owned();
        if truncated {
            text.push_str(&format!("\n[read_file truncated at {limit} bytes]\n"));
        }
        Ok(Run::ok(text))
    }

    fn apply_patch(&self, step: &Step, ctx: &ExecContext<'_>) -> Result<Run> {
        let patch = patch_body(step, ctx)?;
        let mut cmd = Command::new("git");
        cmd.args(["apply", "--whitespace=nowarn", "-"])
            .current_dir(ctx.root);
        if let Some(parent) = ctx.root.parent() {
            cmd.env("GIT_CEILING_DIRECTORIES", parent);
        }
        let output = run_command_with_timeout(
            cmd,
            Some(patch.as_bytes()),
            ctx.timeout,
            self.output_limit_bytes,
        )
        .context("run git apply")?;
        Ok(from_output(&output))
    }

    fn verify(&self, step: &Step, step_type: StepType, ctx: &ExecContext<'_>) -> Result<Run> {
        let argv = self
            .commands
            .for_step(step_type)
            .ok_or_else(|| anyhow!("no command configured for {step_type}"))?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("command for {step_type} is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(ctx.root);
        if step_type == StepType::RunTests
            && let Some(selector) = step.param_str("selector")
        {
            cmd.arg(selector);
        }
        let timeout =
            declared_timeout(step).map_or(ctx.timeout, |declared| declared.min(ctx.timeout));
        debug!(program = %program, timeout_ms = timeout.as_millis() as u64, "running verification command");
        let output = run_command_with_timeout(cmd, None, timeout, self.output_limit_bytes)
            .with_context(|| format!("run {step_type} command"))?;
        Ok(from_output(&output))
    }
}

fn from_output(output: &crate::io::process::CommandOutput) -> Run {
    Run {
        status: if output.success() {
            StepStatus::Succeeded
        } else {
            StepStatus::Failed
        },
        stdout: output.stdout_text(),
        stderr: output.stderr_text(),
        exit_code: output.status.code(),
        timed_out: output.timed_out,
    }
}

fn patch_body<'a>(step: &Step, ctx: &ExecContext<'a>) -> Result<&'a str> {
    let id = step
        .param_str("patch")
        .ok_or_else(|| anyhow!("step '{}' names no patch", step.id))?;
    ctx.patches
        .get(id)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("patch artifact '{id}' not found"))
}

/// Independent re-validation. Returns the known step type and the resolved
/// target path.
fn screen(
    step: &Step,
    ctx: &ExecContext<'_>,
) -> Result<(StepType, Option<PathBuf>), SecurityViolation> {
    let step_type = match &step.kind {
        StepKind::Known(ty) => *ty,
        StepKind::Unknown(raw) => {
            return Err(SecurityViolation::UnknownStepType {
                step_id: step.id.clone(),
                step_type: raw.clone(),
            });
        }
    };

    let allowed = allowed_param_keys(step_type);
    for key in step.params.keys() {
        if !allowed.contains(&key.as_str()) {
            return Err(SecurityViolation::DisallowedParam {
                step_id: step.id.clone(),
                step_type,
                key: key.clone(),
            });
        }
    }

    let mut values = Vec::new();
    if let Some(path) = &step.target_path {
        values.push(("target_path".to_string(), path.clone()));
    }
    for (key, value) in &step.params {
        let field = format!("params.{key}");
        let Some(text) = value.as_text() else {
            return Err(SecurityViolation::NonScalarParam {
                step_id: step.id.clone(),
                field,
            });
        };
        values.push((field, text));
    }
    for (field, value) in &values {
        let issue = inline_shell_issue(value).or_else(|| {
            looks_like_shell_invocation(value).then(|| "a shell invocation".to_string())
        });
        if let Some(issue) = issue {
            return Err(SecurityViolation::InlineShell {
                step_id: step.id.clone(),
                field: field.clone(),
                issue,
            });
        }
        if let Some(pattern) = matches_secret_pattern(value) {
            return Err(SecurityViolation::SecretPath {
                step_id: step.id.clone(),
                field: field.clone(),
                pattern: pattern.to_string(),
            });
        }
    }

    let target = step
        .target_path
        .as_deref()
        .map(|raw| confine(&step.id, ctx.root, raw))
        .transpose()?;

    if step_type.capability() == Capability::Mutating {
        let raw_target = step.target_path.as_deref();
        if let Some(path) = raw_target
            && is_vcs_metadata(path)
        {
            return Err(SecurityViolation::VcsMutation {
                step_id: step.id.clone(),
                path: path.to_string(),
            });
        }
        let diff = step
            .param_str("patch")
            .and_then(|id| ctx.patches.get(id));
        for file in diff.map(|diff| touched_files(diff)).unwrap_or_default() {
            confine(&step.id, ctx.root, &file)?;
            if is_vcs_metadata(&file) {
                return Err(SecurityViolation::VcsMutation {
                    step_id: step.id.clone(),
                    path: file,
                });
            }
            if let Some(target) = raw_target
                && !is_within(&file, target)
            {
                return Err(SecurityViolation::PatchOutsideTarget {
                    step_id: step.id.clone(),
                    file,
                    target: target.to_string(),
                });
            }
        }
    }

    Ok((step_type, target))
}

/// Resolve `relative` under `root`, lexically and then through the
/// filesystem, so a symlink cannot lead outside the snapshot.
fn confine(step_id: &str, root: &Path, relative: &str) -> Result<PathBuf, SecurityViolation> {
    let escape = |reason: String| SecurityViolation::PathEscape {
        step_id: step_id.to_string(),
        path: relative.to_string(),
        reason,
    };
    check_relative_path(relative).map_err(|issue| escape(issue.describe().to_string()))?;

    let canonical_root = root
        .canonicalize()
        .map_err(|err| escape(format!("workspace root unavailable: {err}")))?;
    let joined = canonical_root.join(relative.replace('\\', "/"));

    // Canonicalize the deepest existing ancestor; the rest does not exist yet
    // and, having passed the lexical check, cannot climb back out.
    let mut existing = joined.as_path();
    let mut missing = Vec::new();
    let resolved = loop {
        match existing.canonicalize() {
            Ok(resolved) => break resolved,
            Err(_) => {
                let (Some(name), Some(parent)) = (existing.file_name(), existing.parent()) else {
                    return Err(escape("path cannot be resolved".to_string()));
                };
                missing.push(name.to_os_string());
                existing = parent;
            }
        }
    };
    if !resolved.starts_with(&canonical_root) {
        return Err(escape("resolves outside the workspace".to_string()));
    }
    Ok(missing
        .into_iter()
        .rev()
        .fold(resolved, |path, part| path.join(part)))
}

fn is_vcs_dir(entry: &DirEntry) -> bool {
    entry.file_type().is_dir()
        && matches!(entry.file_name().to_str(), Some(".git" | ".hg" | ".svn"))
}

fn walk(base: &Path, max_depth: usize) -> impl Iterator<Item = DirEntry> {
    WalkDir::new(base)
        .min_depth(1)
        .max_depth(max_depth)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_vcs_dir(entry))
        .filter_map(|entry| entry.ok())
}

/// `path` relative to the canonical snapshot root, with `/` separators.
fn display_relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

fn max_results(step: &Step) -> usize {
    step.param("max_results")
        .and_then(|value| value.as_positive_int())
        .unwrap_or(DEFAULT_MAX_RESULTS) as usize
}

fn required_pattern(step: &Step) -> Result<&str> {
    match step.param_str("pattern") {
        Some(pattern) if !pattern.is_empty() => Ok(pattern),
        _ => bail!("step '{}' requires params.pattern", step.id),
    }
}

fn search_repo(step: &Step, root: &Path, base: &Path) -> Result<Run> {
    let pattern = required_pattern(step)?;
    let limit = max_results(step);
    let mut lines = Vec::new();
    for entry in walk(base, usize::MAX) {
        if lines.len() >= limit {
            break;
        }
        if entry.file_type().is_file() && entry.file_name().to_string_lossy().contains(pattern) {
            lines.push(display_relative(root, entry.path()));
        }
    }
    Ok(Run::ok(join_lines(&lines)))
}

fn grep_search(step: &Step, root: &Path, base: &Path) -> Result<Run> {
    let pattern = required_pattern(step)?;
    let regex = RegexBuilder::new(pattern)
        .case_insensitive(
            step.param("case_insensitive")
                .and_then(|value| value.as_bool())
                .unwrap_or(false),
        )
        .build()
        .with_context(|| format!("compile pattern {pattern:?}"))?;
    let limit = max_results(step);
    let mut lines = Vec::new();
    let files = if base.is_file() {
        vec![base.to_path_buf()]
    } else {
        walk(base, usize::MAX)
            .filter(|entry| entry.file_type().is_file())
            .map(DirEntry::into_path)
            .collect()
    };
    'files: for path in files {
        // Binary or unreadable files are not searchable text.
        let Ok(contents) = fs::read_to_string(&path) else {
            continue;
        };
        let shown = display_relative(root, &path);
        for (number, line) in contents.lines().enumerate() {
            if regex.is_match(line) {
                lines.push(format!("{shown}:{}:{line}", number + 1));
                if lines.len() >= limit {
                    break 'files;
                }
            }
        }
    }
    Ok(Run::ok(join_lines(&lines)))
}

fn analyze_file(target: Option<&Path>) -> Result<Run> {
    let path = target.ok_or_else(|| anyhow!("analyze_file requires a target_path"))?;
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let text = String::from_utf8_lossy(&bytes);
    let lines = text.lines().count();
    let blank = text.lines().filter(|line| line.trim().is_empty()).count();
    Ok(Run::ok(format!(
        "lines: {lines}\nbytes: {}\nblank_lines: {blank}\n",
        bytes.len()
    )))
}

fn list_directory(step: &Step, root: &Path, base: &Path) -> Result<Run> {
    if !base.is_dir() {
        bail!("{} is not a directory", display_relative(root, base));
    }
    let depth = step
        .param("max_depth")
        .and_then(|value| value.as_positive_int())
        .unwrap_or(DEFAULT_MAX_DEPTH) as usize;
    let lines: Vec<String> = walk(base, depth)
        .map(|entry| {
            let shown = display_relative(root, entry.path());
            if entry.file_type().is_dir() {
                format!("{shown}/")
            } else {
                shown
            }
        })
        .collect();
    Ok(Run::ok(join_lines(&lines)))
}

fn wait(step: &Step, timeout: Duration) -> Result<Run> {
    let seconds = step
        .param("seconds")
        .and_then(|value| value.as_positive_int())
        .ok_or_else(|| anyhow!("wait requires a positive params.seconds"))?;
    let requested = Duration::from_secs(seconds);
    thread::sleep(requested.min(timeout));
    if requested > timeout {
        return Ok(Run {
            timed_out: true,
            ..Run::failed(format!("wait of {seconds}s exceeded the step timeout"))
        });
    }
    Ok(Run::ok(format!("waited {seconds}s\n")))
}

fn join_lines(lines: &[String]) -> String {
    if lines.is_empty() {
        String::new()
    } else {
        format!("{}\n", lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{patched, step, with_param, with_target};

    struct Fixture {
        _temp: tempfile::TempDir,
        root: PathBuf,
        patches: BTreeMap<String, String>,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = tempfile::tempdir().expect("tempdir");
            let root = temp.path().join("snap");
            fs::create_dir_all(root.join("src")).expect("mkdir");
            fs::create_dir_all(root.join(".git")).expect("mkdir");
            fs::write(root.join("src").join("calc.py"), "def add(a, b):\n\n    return a - b\n")
                .expect("write");
            fs::write(root.join(".git").join("calc.py.orig"), "x\n").expect("write");
            Self {
                _temp: temp,
                root,
                patches: BTreeMap::new(),
            }
        }

        fn ctx(&self) -> ExecContext<'_> {
            ExecContext {
                root: &self.root,
                patches: &self.patches,
                timeout: Duration::from_secs(5),
            }
        }
    }

    fn sandbox() -> Sandbox {
        Sandbox::from_config(&KernelConfig::default())
    }

    #[test]
    fn unknown_step_type_is_a_violation() {
        let fixture = Fixture::new();
        let mut shell = step("x", StepType::ReadFile);
        shell.kind = StepKind::Unknown("run_shell".to_string());
        let err = sandbox()
            .execute(&shell, &fixture.ctx())
            .expect_err("violation");
        assert!(matches!(err, SecurityViolation::UnknownStepType { .. }));
    }

    #[test]
    fn rescreens_params_without_the_gate() {
        let fixture = Fixture::new();
        let sneaky = with_param(step("t", StepType::RunTests), "selector", "x; curl evil");
        assert!(matches!(
            sandbox().execute(&sneaky, &fixture.ctx()),
            Err(SecurityViolation::InlineShell { .. })
        ));

        let extra = with_param(step("r", StepType::ReadFile), "cmd", "ls");
        assert!(matches!(
            sandbox().execute(&extra, &fixture.ctx()),
            Err(SecurityViolation::DisallowedParam { .. })
        ));

        let secret = with_target(step("r", StepType::ReadFile), "config/.env");
        assert!(matches!(
            sandbox().execute(&secret, &fixture.ctx()),
            Err(SecurityViolation::SecretPath { .. })
        ));
    }

    #[test]
    fn lexical_escape_is_a_violation() {
        let fixture = Fixture::new();
        let escape = with_target(step("r", StepType::ReadFile), "../outside.txt");
        assert!(matches!(
            sandbox().execute(&escape, &fixture.ctx()),
            Err(SecurityViolation::PathEscape { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_is_a_violation() {
        let fixture = Fixture::new();
        let outside = fixture._temp.path().join("outside");
        fs::create_dir_all(&outside).expect("mkdir");
        fs::write(outside.join("data.txt"), "secret\n").expect("write");
        std::os::unix::fs::symlink(&outside, fixture.root.join("link")).expect("symlink");

        let read = with_target(step("r", StepType::ReadFile), "link/data.txt");
        assert!(matches!(
            sandbox().execute(&read, &fixture.ctx()),
            Err(SecurityViolation::PathEscape { .. })
        ));
    }

    #[test]
    fn patch_outside_target_is_a_violation() {
        let mut fixture = Fixture::new();
        fixture.patches.insert(
            "p1".to_string(),
            "--- a/src/calc.py\n+++ b/src/calc.py\n@@ -1 +1 @@\n-x\n+y\n".to_string(),
        );
        let apply = patched(step("a", StepType::ApplyPatch), "tests", "p1");
        assert!(matches!(
            sandbox().execute(&apply, &fixture.ctx()),
            Err(SecurityViolation::PatchOutsideTarget { .. })
        ));
    }

    #[test]
    fn screen_rejects_every_inline_shell_token() {
        let fixture = Fixture::new();
        let tokens = [
            ";", "|", "&", "\n", "`", "$", "<", ">", "\r", "\0", "CI=1 ", "bash -c ",
        ];
        for token in tokens {
            let selector = with_param(
                step("t", StepType::RunTests),
                "selector",
                format!("{token}tests").as_str(),
            );
            assert!(
                matches!(
                    screen(&selector, &fixture.ctx()),
                    Err(SecurityViolation::InlineShell { ref field, .. }) if field == "params.selector"
                ),
                "selector with {token:?}"
            );

            let target = with_target(step("r", StepType::ReadFile), &format!("{token}src/calc.py"));
            assert!(
                matches!(
                    screen(&target, &fixture.ctx()),
                    Err(SecurityViolation::InlineShell { ref field, .. }) if field == "target_path"
                ),
                "target_path with {token:?}"
            );
        }
    }

    #[test]
    fn untargeted_patch_is_confined_to_the_snapshot() {
        let mut fixture = Fixture::new();
        fixture.patches.insert(
            "hook".to_string(),
            "--- a/.git/hooks/pre-commit\n+++ b/.git/hooks/pre-commit\n@@ -0,0 +1 @@\n+x\n"
                .to_string(),
        );
        let hook = with_param(step("a", StepType::ApplyPatch), "patch", "hook");
        assert!(matches!(
            sandbox().execute(&hook, &fixture.ctx()),
            Err(SecurityViolation::VcsMutation { .. })
        ));

        // No patch artifact is an ordinary step failure.
        let bare = step("b", StepType::ApplyPatch);
        let result = sandbox().execute(&bare, &fixture.ctx()).expect("run");
        assert_eq!(result.status, StepStatus::Failed);
        assert!(result.stderr.contains("names no patch"));
    }

    #[cfg(unix)]
    #[test]
    fn declared_timeout_caps_a_verification_command() {
        let fixture = Fixture::new();
        let commands = VerificationCommands {
            run_tests: vec!["sleep".to_string(), "3".to_string()],
            ..VerificationCommands::default()
        };
        let slow = with_param(step("t", StepType::RunTests), "timeout_secs", 1_i64);
        let mut ctx = fixture.ctx();
        ctx.timeout = Duration::from_secs(10);

        let started = Instant::now();
        let result = Sandbox::new(commands, 1_000)
            .execute(&slow, &ctx)
            .expect("run");
        assert!(started.elapsed() < Duration::from_millis(2_500));
        assert_eq!(result.status, StepStatus::Failed);
        assert!(result.timed_out);
    }

    #[test]
    fn read_and_analyze_file() {
        let fixture = Fixture::new();
        let read = with_param(
            with_target(step("r", StepType::ReadFile), "src/calc.py"),
            "max_bytes",
            3_i64,
        );
        let result = sandbox().execute(&read, &fixture.ctx()).expect("run");
        assert_eq!(result.status, StepStatus::Succeeded);
        assert!(result.stdout.starts_with("def\n[read_file truncated at 3 bytes]"));

        let analyze = with_target(step("s", StepType::AnalyzeFile), "src/calc.py");
        let result = sandbox().execute(&analyze, &fixture.ctx()).expect("run");
        assert_eq!(result.stdout, "lines: 3\nbytes: 33\nblank_lines: 1\n");
    }

    #[test]
    fn missing_file_is_a_failed_step_not_a_violation() {
        let fixture = Fixture::new();
        let read = with_target(step("r", StepType::ReadFile), "src/missing.py");
        let result = sandbox().execute(&read, &fixture.ctx()).expect("run");
        assert_eq!(result.status, StepStatus::Failed);
        assert!(result.stderr.contains("missing.py"));
    }

    #[test]
    fn searches_skip_vcs_metadata() {
        let fixture = Fixture::new();
        let search = with_param(step("s", StepType::SearchRepo), "pattern", "calc");
        let result = sandbox().execute(&search, &fixture.ctx()).expect("run");
        assert_eq!(result.stdout, "src/calc.py\n");

        let grep = with_param(step("g", StepType::GrepSearch), "pattern", "return a - b");
        let result = sandbox().execute(&grep, &fixture.ctx()).expect("run");
        assert_eq!(result.stdout, "src/calc.py:3:    return a - b\n");

        let list = step("l", StepType::ListDirectory);
        let result = sandbox().execute(&list, &fixture.ctx()).expect("run");
        assert_eq!(result.stdout, "src/\nsrc/calc.py\n");
    }

    #[test]
    fn bad_regex_fails_the_step() {
        let fixture = Fixture::new();
        let grep = with_param(step("g", StepType::GrepSearch), "pattern", "(unclosed");
        let result = sandbox().execute(&grep, &fixture.ctx()).expect("run");
        assert_eq!(result.status, StepStatus::Failed);
    }

    #[test]
    fn coordination_steps_are_signals() {
        let fixture = Fixture::new();
        let checkpoint = with_param(step("c", StepType::Checkpoint), "label", "before-fix");
        let result = sandbox().execute(&checkpoint, &fixture.ctx()).expect("run");
        assert_eq!(result.status, StepStatus::Succeeded);
        assert_eq!(result.stdout, "checkpoint: before-fix\n");

        let mut ctx = fixture.ctx();
        ctx.timeout = Duration::from_millis(20);
        let wait = with_param(step("w", StepType::Wait), "seconds", 30_i64);
        let result = sandbox().execute(&wait, &ctx).expect("run");
        assert_eq!(result.status, StepStatus::Failed);
        assert!(result.timed_out);
    }
}
