//! Per-worker working-copy snapshots.
//!
//! A worker only ever sees its own snapshot directory. The [`SnapshotLease`]
//! owning that directory releases it exactly once: explicitly from the worker,
//! from the scheduler's sweep, or on drop, whichever happens first.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use rand::{Rng, distributions::Alphanumeric};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Creates and destroys isolated copies of a task repository.
pub trait SnapshotProvider: Send + Sync {
    /// Materialize a snapshot of `source` for one worker and return its root.
    fn acquire(&self, task_id: &str, worker_id: usize, source: &Path) -> Result<PathBuf>;

    /// Destroy a snapshot previously returned by `acquire`.
    fn release(&self, root: &Path) -> Result<()>;
}

/// Copies the repository into `base_dir/{task}_w{n}_{random}`.
#[derive(Debug, Clone)]
pub struct CopySnapshotProvider {
    base_dir: PathBuf,
}

impl CopySnapshotProvider {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }
}

impl SnapshotProvider for CopySnapshotProvider {
    fn acquire(&self, task_id: &str, worker_id: usize, source: &Path) -> Result<PathBuf> {
        if !source.is_dir() {
            bail!("task repository {} is not a directory", source.display());
        }
        fs::create_dir_all(&self.base_dir)
            .with_context(|| format!("create snapshot dir {}", self.base_dir.display()))?;
        let name = build_snapshot_name(task_id, worker_id, &generate_short_id());
        let root = self.base_dir.join(name);
        if let Err(err) = copy_tree(source, &root) {
            // Never leave a half-copied snapshot behind.
            let _ = fs::remove_dir_all(&root);
            return Err(err);
        }
        debug!(root = %root.display(), "snapshot acquired");
        Ok(root)
    }

    fn release(&self, root: &Path) -> Result<()> {
        if root.exists() {
            fs::remove_dir_all(root)
                .with_context(|| format!("remove snapshot {}", root.display()))?;
        }
        debug!(root = %root.display(), "snapshot released");
        Ok(())
    }
}

pub fn build_snapshot_name(task_id: &str, worker_id: usize, short_id: &str) -> String {
    format!("{task_id}_w{worker_id}_{short_id}")
}

fn generate_short_id() -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase()
}

/// Copy a directory tree. Symlinks are recreated as symlinks, never followed.
fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("create {}", dst.display()))?;
    for entry in WalkDir::new(src).min_depth(1).follow_links(false) {
        let entry = entry.with_context(|| format!("walk {}", src.display()))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .with_context(|| format!("relativize {}", entry.path().display()))?;
        let target = dst.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target).with_context(|| format!("create {}", target.display()))?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)
                .with_context(|| format!("copy {}", entry.path().display()))?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    let link = fs::read_link(src).with_context(|| format!("read link {}", src.display()))?;
    std::os::unix::fs::symlink(&link, dst)
        .with_context(|| format!("create link {}", dst.display()))
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, _dst: &Path) -> Result<()> {
    warn!(path = %src.display(), "skipping symlink in snapshot");
    Ok(())
}

struct LeaseInner {
    root: PathBuf,
    provider: Arc<dyn SnapshotProvider>,
    released: AtomicBool,
}

impl LeaseInner {
    fn release(&self) -> Result<bool> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        self.provider.release(&self.root)?;
        Ok(true)
    }
}

impl Drop for LeaseInner {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!(root = %self.root.display(), err = %err, "snapshot release on drop failed");
        }
    }
}

/// Shared handle to one acquired snapshot.
#[derive(Clone)]
pub struct SnapshotLease {
    inner: Arc<LeaseInner>,
}

impl std::fmt::Debug for SnapshotLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotLease")
            .field("root", &self.inner.root)
            .field("released", &self.is_released())
            .finish()
    }
}

impl SnapshotLease {
    pub fn acquire(
        provider: Arc<dyn SnapshotProvider>,
        task_id: &str,
        worker_id: usize,
        source: &Path,
    ) -> Result<Self> {
        let root = provider
            .acquire(task_id, worker_id, source)
            .with_context(|| format!("acquire snapshot for worker {worker_id}"))?;
        Ok(Self {
            inner: Arc::new(LeaseInner {
                root,
                provider,
                released: AtomicBool::new(false),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Release the snapshot. Returns `false` if it was already released.
    pub fn release(&self) -> Result<bool> {
        self.inner.release()
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::CountingSnapshots;

    #[test]
    fn snapshot_name_uses_expected_format() {
        assert_eq!(build_snapshot_name("calc", 3, "ab12cd"), "calc_w3_ab12cd");
    }

    #[test]
    fn copy_provider_isolates_and_removes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = temp.path().join("repo");
        fs::create_dir_all(repo.join("src")).expect("mkdir");
        fs::write(repo.join("src").join("calc.py"), "x = 1\n").expect("write");

        let provider = CopySnapshotProvider::new(temp.path().join("snapshots"));
        let root = provider.acquire("calc", 1, &repo).expect("acquire");
        assert!(root.file_name().is_some_and(|name| {
            name.to_string_lossy().starts_with("calc_w1_")
        }));
        fs::write(root.join("src").join("calc.py"), "x = 2\n").expect("edit copy");
        assert_eq!(
            fs::read_to_string(repo.join("src").join("calc.py")).expect("read"),
            "x = 1\n"
        );

        provider.release(&root).expect("release");
        assert!(!root.exists());
        provider.release(&root).expect("release twice");
    }

    #[test]
    fn lease_releases_exactly_once() {
        let provider = Arc::new(CountingSnapshots::default());
        let lease = SnapshotLease::acquire(provider.clone(), "t", 1, Path::new("repo"))
            .expect("acquire");
        let clone = lease.clone();
        assert!(lease.release().expect("release"));
        assert!(!clone.release().expect("release again"));
        drop(lease);
        drop(clone);
        assert_eq!(provider.acquired(), 1);
        assert_eq!(provider.released(), 1);
    }

    #[test]
    fn dropping_the_last_handle_releases() {
        let provider = Arc::new(CountingSnapshots::default());
        let lease = SnapshotLease::acquire(provider.clone(), "t", 2, Path::new("repo"))
            .expect("acquire");
        drop(lease);
        assert_eq!(provider.released(), 1);
    }
}
