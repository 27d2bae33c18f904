//! Patch normalization and summary used by the tie-break.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Size and identity of everything a worker applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchSummary {
    /// SHA-256 hex of the normalized diff.
    pub hash: String,
    /// Line count of the normalized diff.
    pub diff_lines: usize,
    pub files: BTreeSet<String>,
}

/// A diff that was applied, with the target path of the step that applied it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedPatch {
    pub diff: String,
    pub target_path: Option<String>,
}

/// Concatenate diffs in order, convert CRLF to LF, trim trailing blank lines
/// and end with exactly one newline. No diffs normalize to the empty string.
pub fn normalize_diff<'a>(diffs: impl IntoIterator<Item = &'a str>) -> String {
    let mut joined = String::new();
    for diff in diffs {
        let unix = diff.replace("\r\n", "\n");
        let trimmed = unix.trim_end_matches(['\n', ' ', '\t']);
        if trimmed.is_empty() {
            continue;
        }
        joined.push_str(trimmed);
        joined.push('\n');
    }
    joined
}

/// Files named in unified diff headers, without `a/` / `b/` prefixes.
pub fn touched_files(diff: &str) -> BTreeSet<String> {
    let mut files = BTreeSet::new();
    for line in diff.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(rest) = line.strip_prefix("diff --git ") {
            for part in rest.split_whitespace() {
                if let Some(path) = header_path(part) {
                    files.insert(path);
                }
            }
        } else if let Some(rest) = line
            .strip_prefix("+++ ")
            .or_else(|| line.strip_prefix("--- "))
        {
            // Timestamps follow a tab in traditional diff headers.
            let name = rest.split('\t').next().unwrap_or(rest).trim();
            if let Some(path) = header_path(name) {
                files.insert(path);
            }
        }
    }
    files
}

fn header_path(raw: &str) -> Option<String> {
    if raw.is_empty() || raw == "/dev/null" {
        return None;
    }
    let path = raw
        .strip_prefix("a/")
        .or_else(|| raw.strip_prefix("b/"))
        .unwrap_or(raw);
    Some(path.to_string())
}

pub fn sha256_hex(contents: &str) -> String {
    hex::encode(Sha256::digest(contents.as_bytes()))
}

/// Summarize applied patches. A diff whose headers name no file counts its
/// step target path instead, when there is one.
pub fn summarize(applied: &[AppliedPatch]) -> PatchSummary {
    let normalized = normalize_diff(applied.iter().map(|patch| patch.diff.as_str()));
    let mut files = BTreeSet::new();
    for patch in applied {
        let named = touched_files(&patch.diff);
        if named.is_empty() {
            files.extend(patch.target_path.clone());
        } else {
            files.extend(named);
        }
    }
    PatchSummary {
        hash: sha256_hex(&normalized),
        diff_lines: normalized.lines().count(),
        files,
    }
}
