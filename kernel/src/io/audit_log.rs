//! Append-only audit log of controller and step transitions.
//!
//! Entries are kept in memory and, when a path is given, appended to a JSONL
//! file opened with `create_new`. The file is flushed after every entry and
//! never reopened for writing.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State named on either side of an audit transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Halted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub worker_id: usize,
    /// `None` for controller-level transitions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub from: AuditState,
    pub to: AuditState,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug)]
pub struct AuditLog {
    worker_id: usize,
    entries: Vec<AuditEntry>,
    sink: Option<BufWriter<File>>,
}

impl AuditLog {
    /// In-memory log only.
    pub fn new(worker_id: usize) -> Self {
        Self {
            worker_id,
            entries: Vec::new(),
            sink: None,
        }
    }

    /// Log that also appends to a new file at `path`. Fails if the file exists.
    pub fn with_file(worker_id: usize, path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create audit dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .with_context(|| format!("create audit log {}", path.display()))?;
        Ok(Self {
            worker_id,
            entries: Vec::new(),
            sink: Some(BufWriter::new(file)),
        })
    }

    pub fn append(
        &mut self,
        step_id: Option<&str>,
        from: AuditState,
        to: AuditState,
        detail: Option<String>,
    ) -> Result<&AuditEntry> {
        let entry = AuditEntry {
            seq: self.entries.len() as u64,
            worker_id: self.worker_id,
            step_id: step_id.map(str::to_string),
            from,
            to,
            at: Utc::now(),
            detail,
        };
        if let Some(sink) = self.sink.as_mut() {
            let line = serde_json::to_string(&entry).context("serialize audit entry")?;
            writeln!(sink, "{line}").context("append audit entry")?;
            sink.flush().context("flush audit log")?;
        }
        self.entries.push(entry);
        Ok(&self.entries[self.entries.len() - 1])
    }

    pub fn entries(&self) -> &[AuditEntry] {
        &self.entries
    }
}
