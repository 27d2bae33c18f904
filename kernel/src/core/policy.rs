//! Policy predicates shared by the gate, the critique rubric and the sandbox.
//!
//! Each predicate is pure and total. The sandbox calls the same predicates the
//! gate does, but on its own, right before running anything.

use std::path::{Component, Path};
use std::sync::LazyLock;

use regex::Regex;

use crate::core::plan::StepType;

/// Characters that chain or pipe commands.
pub const COMMAND_SEPARATORS: &[char] = &[';', '|', '&', '\n'];

/// Characters that trigger substitution or redirection in a shell.
pub const SHELL_METACHARACTERS: &[char] = &['`', '$', '<', '>', '\r', '\0'];

static ENV_ASSIGNMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|\s)[A-Za-z_][A-Za-z0-9_]*=").expect("env assignment regex")
});

static STEP_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.-]{1,64}$").expect("step id regex"));

/// Programs that interpret their arguments as code.
const SHELLS: &[&str] = &[
    "sh",
    "bash",
    "zsh",
    "fish",
    "dash",
    "ksh",
    "csh",
    "tcsh",
    "cmd",
    "cmd.exe",
    "powershell",
    "pwsh",
    "eval",
    "exec",
    "sudo",
    "su",
    "env",
    "xargs",
    "nohup",
];

/// Interpreters that run inline code when given `-c` or `-e`.
const INTERPRETERS: &[&str] = &[
    "python", "python3", "perl", "ruby", "node", "php", "lua", "osascript",
];

/// File and directory names that hold credentials.
const SECRET_NAMES: &[&str] = &[
    ".env",
    ".netrc",
    ".npmrc",
    ".pypirc",
    ".pgpass",
    ".ssh",
    ".aws",
    ".gnupg",
    ".docker",
    "id_rsa",
    "id_dsa",
    "id_ecdsa",
    "id_ed25519",
    "credentials",
    "credentials.json",
];

const SECRET_EXTENSIONS: &[&str] = &["pem", "key", "p12", "pfx", "keystore", "jks"];

/// Parameter keys that turn a verification step off.
pub const BYPASS_KEYS: &[&str] = &[
    "skip",
    "skip_tests",
    "disable",
    "no_verify",
    "deselect",
    "allow_failure",
    "xfail",
];

/// Flags that drop tests from a verification run.
pub const BYPASS_FLAGS: &[&str] = &["--no-verify", "--deselect", "--ignore", "-k not"];

/// Parameter keys that must carry a strictly positive integer.
pub const INTEGER_KEYS: &[&str] = &[
    "timeout_secs",
    "seconds",
    "max_results",
    "max_depth",
    "max_bytes",
];

/// Parameter keys that must carry a boolean.
pub const BOOLEAN_KEYS: &[&str] = &["case_insensitive"];

/// Why a target path is not confined to the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathIssue {
    Empty,
    Absolute,
    HomeRelative,
    ParentSegment,
    NulByte,
}

impl PathIssue {
    pub fn describe(self) -> &'static str {
        match self {
            PathIssue::Empty => "path is empty",
            PathIssue::Absolute => "path is absolute",
            PathIssue::HomeRelative => "path is home-relative",
            PathIssue::ParentSegment => "path contains a parent-directory segment",
            PathIssue::NulByte => "path contains a NUL byte",
        }
    }
}

/// Lexical confinement check: relative, no `..`, no root or prefix.
pub fn check_relative_path(raw: &str) -> Result<(), PathIssue> {
    if raw.trim().is_empty() {
        return Err(PathIssue::Empty);
    }
    if raw.contains('\0') {
        return Err(PathIssue::NulByte);
    }
    if raw.starts_with('~') {
        return Err(PathIssue::HomeRelative);
    }
    // Treat backslashes as separators too so `..\\x` cannot slip through on unix.
    let normalized = raw.replace('\\', "/");
    if normalized.starts_with('/') {
        return Err(PathIssue::Absolute);
    }
    for component in Path::new(&normalized).components() {
        match component {
            Component::ParentDir => return Err(PathIssue::ParentSegment),
            Component::RootDir | Component::Prefix(_) => return Err(PathIssue::Absolute),
            Component::CurDir | Component::Normal(_) => {}
        }
    }
    Ok(())
}

/// True if `path` is `base` or lies under it (both lexically normalized).
pub fn is_within(path: &str, base: &str) -> bool {
    let path = normalize(path);
    let base = normalize(base);
    if base.is_empty() {
        return true;
    }
    path == base || path.starts_with(&format!("{base}/"))
}

/// Drop `.` components and redundant separators.
pub fn normalize(path: &str) -> String {
    path.replace('\\', "/")
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect::<Vec<_>>()
        .join("/")
}

pub fn find_command_separator(value: &str) -> Option<char> {
    value.chars().find(|ch| COMMAND_SEPARATORS.contains(ch))
}

pub fn find_shell_metacharacter(value: &str) -> Option<char> {
    value.chars().find(|ch| SHELL_METACHARACTERS.contains(ch))
}

pub fn has_env_assignment(value: &str) -> bool {
    ENV_ASSIGNMENT.is_match(value)
}

pub fn is_well_formed_step_id(id: &str) -> bool {
    STEP_ID.is_match(id)
}

/// True if the value reads as a shell or interpreter invocation.
pub fn looks_like_shell_invocation(value: &str) -> bool {
    let tokens: Vec<&str> = value.split_whitespace().collect();
    let Some(&first) = tokens.first() else {
        return false;
    };
    let program = first.rsplit(['/', '\\']).next().unwrap_or(first);
    if SHELLS.contains(&program) {
        return true;
    }
    if value.contains("/bin/sh") || value.contains("/bin/bash") {
        return true;
    }
    INTERPRETERS.contains(&program) && tokens.iter().any(|token| *token == "-c" || *token == "-e")
}

/// Name of the secret pattern the value matches, if any.
pub fn matches_secret_pattern(value: &str) -> Option<&'static str> {
    for token in value.split_whitespace() {
        for component in token.split(['/', '\\']) {
            if component.is_empty() {
                continue;
            }
            if let Some(name) = SECRET_NAMES.iter().find(|name| **name == component) {
                return Some(*name);
            }
            if component.starts_with(".env.") {
                return Some(".env.*");
            }
            if component.starts_with("secrets.") {
                return Some("secrets.*");
            }
            if let Some((_, ext)) = component.rsplit_once('.')
                && let Some(found) = SECRET_EXTENSIONS.iter().find(|known| **known == ext)
            {
                return Some(*found);
            }
        }
    }
    None
}

/// True if the path points into version-control metadata.
pub fn is_vcs_metadata(path: &str) -> bool {
    normalize(path)
        .split('/')
        .any(|part| part == ".git" || part == ".hg" || part == ".svn")
}

/// Flag in the value that drops tests from a run, if any.
pub fn contains_bypass_flag(value: &str) -> Option<&'static str> {
    BYPASS_FLAGS.iter().copied().find(|flag| value.contains(flag))
}

/// Allowlisted parameter keys per step type.
pub fn allowed_param_keys(step_type: StepType) -> &'static [&'static str] {
    match step_type {
        StepType::SearchRepo => &["pattern", "max_results"],
        StepType::GrepSearch => &["pattern", "max_results", "case_insensitive"],
        StepType::ReadFile => &["max_bytes"],
        StepType::AnalyzeFile => &[],
        StepType::ListDirectory => &["max_depth"],
        StepType::ApplyPatch
        | StepType::AddTest
        | StepType::RefactorSmall
        | StepType::FixImport
        | StepType::FixTyping => &["patch", "description"],
        StepType::RunTests => &["selector", "timeout_secs"],
        StepType::RunLint | StepType::CheckSyntax | StepType::ValidateTypes => &["timeout_secs"],
        StepType::Wait => &["seconds"],
        StepType::Checkpoint => &["label"],
        StepType::Replan => &["reason"],
    }
}

/// First inline-shell problem in a value: separator, metacharacter, then env assignment.
pub fn inline_shell_issue(value: &str) -> Option<String> {
    if let Some(ch) = find_command_separator(value) {
        return Some(format!("command separator {ch:?}"));
    }
    if let Some(ch) = find_shell_metacharacter(value) {
        return Some(format!("shell metacharacter {ch:?}"));
    }
    if has_env_assignment(value) {
        return Some("inline environment assignment".to_string());
    }
    None
}
