//! Per-project exclusive critical section.
//!
//! All mutating access to a project's working directory and `.git` metadata
//! goes through [`RepoGuard::with_project`]. Entry is FIFO per project
//! (tokio mutexes queue fairly), different projects are independent, and
//! leases are process-local. Pre-entry invariant checks run inside the
//! lease, before the caller's closure.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use crate::errors::{Error, Result};

/// Options for one guarded entry.
#[derive(Debug, Clone, Copy)]
pub struct GuardOptions {
    /// How long to wait for the lease before failing with `LockTimeout`.
    pub timeout: Duration,
    /// Whether the closure needs the project to be a git repository.
    pub require_git: bool,
}

impl Default for GuardOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            require_git: false,
        }
    }
}

/// Read-only view of the guarded project handed to the closure. Privileged
/// writes go through the git safety layer, which the closure composes in.
#[derive(Debug, Clone)]
pub struct ProjectHandle {
    pub project_id: i64,
    pub path: PathBuf,
}

impl ProjectHandle {
    pub fn is_git_repository(&self) -> bool {
        self.path.join(".git").exists()
    }

    pub fn current_branch(&self) -> Result<String> {
        let repo = git2::Repository::open(&self.path)?;
        let head = repo.head()?;
        head.shorthand()
            .map(str::to_string)
            .ok_or(Error::DetachedHead)
    }

    pub fn head_commit(&self) -> Result<String> {
        let repo = git2::Repository::open(&self.path)?;
        let head = repo.head()?.peel_to_commit()?;
        Ok(head.id().to_string())
    }

    /// Uncommitted changes of any sort: staged, unstaged, or untracked.
    pub fn is_dirty(&self) -> Result<bool> {
        Ok(self.dirty_file_count()? > 0)
    }

    pub fn dirty_file_count(&self) -> Result<usize> {
        let repo = git2::Repository::open(&self.path)?;
        let mut opts = git2::StatusOptions::new();
        opts.include_untracked(true).include_ignored(false);
        let statuses = repo.statuses(Some(&mut opts))?;
        Ok(statuses.len())
    }
}

/// Keyed lock registry: one fair mutex per project id.
pub struct RepoGuard {
    locks: std::sync::Mutex<HashMap<i64, Arc<AsyncMutex<()>>>>,
    stale_lock_max_age: Duration,
}

impl RepoGuard {
    pub fn new(stale_lock_max_age: Duration) -> Self {
        Self {
            locks: std::sync::Mutex::new(HashMap::new()),
            stale_lock_max_age,
        }
    }

    fn lock_for(&self, project_id: i64) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().expect("guard registry poisoned");
        locks
            .entry(project_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Run `f` while holding the project's exclusive lease.
    ///
    /// The closure runs as its own task so a panic inside it becomes an
    /// error instead of unwinding through the caller; the lease is released
    /// in every outcome.
    pub async fn with_project<T, F, Fut>(
        &self,
        project_id: i64,
        path: &Path,
        opts: GuardOptions,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(ProjectHandle) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let lock = self.lock_for(project_id);
        let _lease = tokio::time::timeout(opts.timeout, lock.lock_owned())
            .await
            .map_err(|_| Error::LockTimeout {
                waited_secs: opts.timeout.as_secs(),
            })?;

        self.pre_entry_checks(path, opts.require_git)?;

        let handle = ProjectHandle {
            project_id,
            path: path.to_path_buf(),
        };
        match tokio::spawn(f(handle)).await {
            Ok(result) => result,
            Err(join_err) if join_err.is_panic() => Err(Error::Internal(format!(
                "guarded section panicked: {}",
                join_err
            ))),
            Err(join_err) => Err(Error::Internal(format!(
                "guarded section aborted: {}",
                join_err
            ))),
        }
    }

    fn pre_entry_checks(&self, path: &Path, require_git: bool) -> Result<()> {
        if !path.is_dir() {
            return Err(Error::ProjectMissing {
                path: path.to_path_buf(),
            });
        }

        let git_dir = path.join(".git");
        if !git_dir.exists() {
            if require_git {
                return Err(Error::NotARepository {
                    path: path.to_path_buf(),
                });
            }
            // Plain directory project; nothing more to check.
            return Ok(());
        }

        self.clear_or_reject_stale_locks(&git_dir)?;

        let repo = git2::Repository::open(path)?;
        // An unborn branch (fresh repo, no commits) has no HEAD to resolve;
        // that is not the detached case.
        if let Ok(head) = repo.head() {
            if !head.is_branch() {
                return Err(Error::DetachedHead);
            }
        }
        Ok(())
    }

    /// Abandoned `index.lock`/`HEAD.lock` files block every git command.
    /// Locks older than the configured age are assumed dead and removed;
    /// younger ones are surfaced so a live git process is not raced.
    fn clear_or_reject_stale_locks(&self, git_dir: &Path) -> Result<()> {
        for name in ["index.lock", "HEAD.lock"] {
            let lock_path = git_dir.join(name);
            if !lock_path.exists() {
                continue;
            }
            let age = lock_path
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.elapsed().ok())
                .unwrap_or(Duration::ZERO);
            if age >= self.stale_lock_max_age {
                warn!(lock = %lock_path.display(), age_secs = age.as_secs(), "clearing stale git lock");
                std::fs::remove_file(&lock_path)?;
            } else {
                return Err(Error::StaleLock { path: lock_path });
            }
        }
        Ok(())
    }
}
