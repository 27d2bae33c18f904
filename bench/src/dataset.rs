//! Dataset parsing and validation.
//!
//! A dataset is a TOML file listing repair tasks:
//!
//! ```toml
//! [[tasks]]
//! id = "calc-sub"
//! repo = "repos/calc"
//!
//! [tasks.context]
//! issue = "add() subtracts"
//! ```
//!
//! `repo` is resolved relative to the dataset file.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use kernel::scheduler::Task;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Dataset {
    #[serde(default)]
    pub tasks: Vec<TaskEntry>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TaskEntry {
    /// Unique identifier (slug format: `[a-z0-9_-]+`).
    pub id: String,
    pub repo: PathBuf,
    /// Read-only context forwarded to the scheduler untouched.
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

impl Dataset {
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read dataset {}", path.display()))?;
        Self::parse_str(&contents).with_context(|| format!("load dataset {}", path.display()))
    }

    pub fn parse_str(contents: &str) -> Result<Self> {
        let dataset: Dataset = toml::from_str(contents).context("parse dataset")?;
        dataset.validate()?;
        Ok(dataset)
    }

    fn validate(&self) -> Result<()> {
        if self.tasks.is_empty() {
            bail!("tasks must be a non-empty array");
        }
        let mut seen = BTreeSet::new();
        for (index, task) in self.tasks.iter().enumerate() {
            validate_task_id(&task.id).with_context(|| format!("tasks[{index}] invalid"))?;
            if task.repo.as_os_str().is_empty() {
                bail!("tasks[{index}].repo must be non-empty");
            }
            if !seen.insert(task.id.as_str()) {
                bail!("duplicate task id {}", task.id);
            }
        }
        Ok(())
    }

    /// Scheduler tasks with `repo` resolved against `base_dir`.
    pub fn tasks(&self, base_dir: &Path) -> Vec<Task> {
        self.tasks
            .iter()
            .map(|entry| Task {
                id: entry.id.clone(),
                repo: base_dir.join(&entry.repo),
                context: entry.context.clone(),
            })
            .collect()
    }

    /// Tasks picked by `--task-id` (all when `ids` is empty), in dataset
    /// order, cut to `max` entries.
    pub fn select(
        &self,
        base_dir: &Path,
        ids: &[String],
        max: Option<usize>,
    ) -> Result<Vec<Task>> {
        let wanted: BTreeSet<&str> = ids.iter().map(String::as_str).collect();
        if let Some(unknown) = wanted
            .iter()
            .find(|id| !self.tasks.iter().any(|task| task.id == **id))
        {
            bail!("unknown task id {unknown}");
        }
        let mut tasks: Vec<Task> = self
            .tasks(base_dir)
            .into_iter()
            .filter(|task| wanted.is_empty() || wanted.contains(task.id.as_str()))
            .collect();
        if let Some(max) = max {
            tasks.truncate(max);
        }
        Ok(tasks)
    }
}

fn validate_task_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        bail!("task id must be non-empty");
    }
    if !id
        .chars()
        .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-' || ch == '_')
    {
        bail!("task id {id:?} must use [a-z0-9_-] only");
    }
    Ok(())
}
