//! Transactional Git operations.
//!
//! Every mutating operation records a [`GitOperation`] row, may capture a
//! [`Snapshot`] first (caller opt-in), and attempts a best-effort restore of
//! HEAD and index to pre-operation values if it fails mid-flight. Callers
//! must hold the project's repo guard lease; methods take the guard's
//! [`ProjectHandle`] as proof.
//!
//! The git work itself is synchronous libgit2 and runs on the blocking pool.

use std::path::{Path, PathBuf};

use chrono::{Duration as ChronoDuration, Utc};
use git2::{BranchType, DiffFormat, DiffOptions, IndexAddOption, Repository, ResetType};
use tracing::{info, warn};

use crate::db::DbHandle;
use crate::errors::{Error, Result};
use crate::guard::ProjectHandle;
use crate::models::{GitOpKind, GitOpStatus, GitOperation, Snapshot, SnapshotKind};

/// Orchestrates git mutations against the store. One instance per process.
pub struct GitSafety {
    db: DbHandle,
    snapshots_dir: PathBuf,
    /// Serialises the GC sweep so concurrent cleanup calls cannot race on
    /// marking rows inactive and removing storage.
    gc_lock: tokio::sync::Mutex<()>,
}

/// What a capture recorded about the repository at snapshot time.
#[derive(Debug, Clone)]
pub struct CaptureInfo {
    pub branch: String,
    pub commit: String,
}

impl GitSafety {
    pub fn new(db: DbHandle, snapshots_dir: PathBuf) -> Self {
        Self {
            db,
            snapshots_dir,
            gc_lock: tokio::sync::Mutex::new(()),
        }
    }

    // ── Snapshot ──────────────────────────────────────────────────────

    /// Capture the repository state into the snapshot store and record it.
    /// `ttl_days = None` creates a snapshot that never expires.
    pub async fn snapshot(
        &self,
        handle: &ProjectHandle,
        kind: SnapshotKind,
        ttl_days: Option<i64>,
        operation_id: Option<i64>,
    ) -> Result<Snapshot> {
        let storage = self
            .snapshots_dir
            .join(handle.project_id.to_string())
            .join(uuid::Uuid::new_v4().to_string());
        let project_path = handle.path.clone();
        let storage_clone = storage.clone();

        let info = tokio::task::spawn_blocking(move || {
            capture_snapshot(&project_path, &storage_clone, kind)
        })
        .await
        .map_err(|e| Error::Internal(format!("snapshot task failed: {}", e)))??;

        let expires_at = ttl_days
            .map(|days| (Utc::now() + ChronoDuration::days(days)).to_rfc3339());
        let project_id = handle.project_id;
        let storage_str = storage.to_string_lossy().to_string();
        let snapshot = self
            .db
            .call(move |db| {
                db.create_snapshot(
                    project_id,
                    kind,
                    &info.branch,
                    &info.commit,
                    &storage_str,
                    expires_at.as_deref(),
                    operation_id,
                )
            })
            .await
            .map_err(internal)?;

        info!(
            project_id,
            snapshot_id = snapshot.id,
            kind = kind.as_str(),
            "captured repository snapshot"
        );
        Ok(snapshot)
    }

    /// Snapshot wrapped in an auditable `backup` operation. Used by the
    /// pipeline pre-flight and the manual backup endpoint.
    pub async fn backup(
        &self,
        handle: &ProjectHandle,
        kind: SnapshotKind,
        ttl_days: Option<i64>,
    ) -> Result<(GitOperation, Snapshot)> {
        let op = self
            .begin_operation(handle, GitOpKind::Backup, None, None, &[])
            .await?;
        match self.snapshot(handle, kind, ttl_days, Some(op.id)).await {
            Ok(snapshot) => {
                self.link_snapshot(op.id, snapshot.id).await?;
                self.finish(op.id, GitOpStatus::Completed, op.pre_commit.as_deref(), None)
                    .await?;
                let op_id = op.id;
                let op = self
                    .db
                    .call(move |db| db.get_git_operation(op_id))
                    .await
                    .map_err(internal)?
                    .ok_or_else(|| Error::Internal("operation record vanished".into()))?;
                Ok((op, snapshot))
            }
            Err(e) => {
                self.finish(op.id, GitOpStatus::Failed, None, Some(&e.to_string()))
                    .await?;
                Err(e)
            }
        }
    }

    // ── Branch switch ─────────────────────────────────────────────────

    /// Switch to `branch`, optionally creating it from the current HEAD.
    /// Refuses on a dirty working tree; verifies HEAD afterwards.
    pub async fn checkout_branch(
        &self,
        handle: &ProjectHandle,
        branch: &str,
        create_if_missing: bool,
    ) -> Result<GitOperation> {
        let kind = if create_if_missing && !branch_exists(&handle.path, branch)? {
            GitOpKind::BranchCreate
        } else {
            GitOpKind::BranchSwitch
        };
        let op = self
            .begin_operation(handle, kind, Some(branch), None, &[])
            .await?;

        let path = handle.path.clone();
        let branch_owned = branch.to_string();
        let result = tokio::task::spawn_blocking(move || {
            checkout_branch_sync(&path, &branch_owned, create_if_missing)
        })
        .await
        .map_err(|e| Error::Internal(format!("checkout task failed: {}", e)))?;

        self.conclude(handle, op, None, result).await
    }

    // ── Commit ────────────────────────────────────────────────────────

    /// Stage the supplied paths (or all tracked modifications when empty),
    /// commit, and verify the HEAD moved unless `allow_empty`.
    pub async fn atomic_commit(
        &self,
        handle: &ProjectHandle,
        message: &str,
        paths: &[String],
        allow_empty: bool,
        with_snapshot: bool,
    ) -> Result<GitOperation> {
        let branch = handle.current_branch()?;
        let op = self
            .begin_operation(handle, GitOpKind::Commit, Some(&branch), Some(message), paths)
            .await?;

        let snapshot = if with_snapshot {
            Some(
                self.snapshot(handle, SnapshotKind::Light, Some(30), Some(op.id))
                    .await?,
            )
        } else {
            None
        };
        if let Some(ref snap) = snapshot {
            self.link_snapshot(op.id, snap.id).await?;
        }

        let path = handle.path.clone();
        let message_owned = message.to_string();
        let paths_owned = paths.to_vec();
        let result = tokio::task::spawn_blocking(move || {
            atomic_commit_sync(&path, &message_owned, &paths_owned, allow_empty)
        })
        .await
        .map_err(|e| Error::Internal(format!("commit task failed: {}", e)))?;

        self.conclude(handle, op, snapshot, result.map(Some)).await
    }

    // ── Rollback ──────────────────────────────────────────────────────

    /// Hard reset the current branch to `target`, which must be an ancestor
    /// of HEAD. This is the "undo recent work" path, not arbitrary rewrites.
    pub async fn rollback(
        &self,
        handle: &ProjectHandle,
        target: &str,
        with_snapshot: bool,
    ) -> Result<GitOperation> {
        let branch = handle.current_branch()?;
        let op = self
            .begin_operation(handle, GitOpKind::Rollback, Some(&branch), Some(target), &[])
            .await?;

        let snapshot = if with_snapshot {
            Some(
                self.snapshot(handle, SnapshotKind::Light, Some(30), Some(op.id))
                    .await?,
            )
        } else {
            None
        };
        if let Some(ref snap) = snapshot {
            self.link_snapshot(op.id, snap.id).await?;
        }

        let path = handle.path.clone();
        let target_owned = target.to_string();
        let result =
            tokio::task::spawn_blocking(move || rollback_sync(&path, &target_owned))
                .await
                .map_err(|e| Error::Internal(format!("rollback task failed: {}", e)))?;

        self.conclude(handle, op, snapshot, result.map(Some)).await
    }

    // ── Working tree reset ────────────────────────────────────────────

    /// Discard unstaged changes and remove untracked files; HEAD unchanged.
    /// Returns the number of paths that were touched. No snapshot and no
    /// GitOperation row: this is the recovery primitive itself.
    pub async fn reset_working_tree(&self, handle: &ProjectHandle) -> Result<usize> {
        let path = handle.path.clone();
        tokio::task::spawn_blocking(move || reset_working_tree_sync(&path))
            .await
            .map_err(|e| Error::Internal(format!("reset task failed: {}", e)))?
    }

    // ── Restore ───────────────────────────────────────────────────────

    /// Replace the repository state from a snapshot. Refuses on a dirty
    /// working tree unless `force`.
    pub async fn restore_snapshot(
        &self,
        handle: &ProjectHandle,
        snapshot_id: i64,
        force: bool,
    ) -> Result<GitOperation> {
        let snapshot = self
            .db
            .call(move |db| db.get_snapshot(snapshot_id))
            .await
            .map_err(internal)?
            .ok_or(Error::SnapshotMissing { id: snapshot_id })?;
        if !snapshot.active || !Path::new(&snapshot.storage_path).exists() {
            return Err(Error::SnapshotMissing { id: snapshot_id });
        }

        if !force {
            let dirty = handle.dirty_file_count()?;
            if dirty > 0 {
                return Err(Error::WorkingTreeDirty { files: dirty });
            }
        }

        let op = self
            .begin_operation(
                handle,
                GitOpKind::Restore,
                Some(&snapshot.branch),
                Some(&format!("restore snapshot {}", snapshot_id)),
                &[],
            )
            .await?;
        self.link_snapshot(op.id, snapshot.id).await?;

        let path = handle.path.clone();
        let storage = PathBuf::from(&snapshot.storage_path);
        let kind = snapshot.kind;
        let snap_for_restore = snapshot.clone();
        let result = tokio::task::spawn_blocking(move || {
            restore_snapshot_sync(&path, &storage, kind, &snap_for_restore)
        })
        .await
        .map_err(|e| Error::Internal(format!("restore task failed: {}", e)))?;

        match result {
            Ok(()) => {
                let post = head_commit_of(&handle.path).ok();
                self.finish(op.id, GitOpStatus::Completed, post.as_deref(), None)
                    .await?;
                self.db
                    .call(move |db| db.get_git_operation(op.id))
                    .await
                    .map_err(internal)?
                    .ok_or_else(|| Error::Internal("operation record vanished".into()))
            }
            Err(e) => {
                // A failed restore must keep its snapshot recoverable forever.
                let snap_id = snapshot.id;
                let _ = self.db.call(move |db| db.clear_snapshot_expiry(snap_id)).await;
                self.finish(op.id, GitOpStatus::Failed, None, Some(&e.to_string()))
                    .await?;
                Err(Error::RestoreFailed {
                    message: e.to_string(),
                })
            }
        }
    }

    // ── Cleanup ───────────────────────────────────────────────────────

    /// Mark expired snapshots inactive and remove their storage. The row is
    /// flipped before the files go, so an active record always has its
    /// directory on disk.
    pub async fn cleanup_expired(&self) -> Result<usize> {
        let _gc = self.gc_lock.lock().await;
        let now = crate::now_rfc3339();
        let expired = self
            .db
            .call(move |db| db.list_expired_snapshots(&now))
            .await
            .map_err(internal)?;

        let mut removed = 0;
        for snapshot in expired {
            let id = snapshot.id;
            let marked = self
                .db
                .call(move |db| db.mark_snapshot_inactive(id))
                .await
                .map_err(internal)?;
            if !marked {
                continue;
            }
            if let Err(e) = tokio::fs::remove_dir_all(&snapshot.storage_path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(snapshot_id = id, error = %e, "failed to remove snapshot storage");
                    continue;
                }
            }
            removed += 1;
        }
        if removed > 0 {
            info!(removed, "garbage-collected expired snapshots");
        }
        Ok(removed)
    }

    // ── Internals ─────────────────────────────────────────────────────

    async fn begin_operation(
        &self,
        handle: &ProjectHandle,
        kind: GitOpKind,
        branch: Option<&str>,
        message: Option<&str>,
        files: &[String],
    ) -> Result<GitOperation> {
        let project_id = handle.project_id;
        let branch_owned = branch.map(str::to_string);
        let message_owned = message.map(str::to_string);
        let files_owned = files.to_vec();
        let op = self
            .db
            .call(move |db| {
                db.create_git_operation(
                    project_id,
                    kind,
                    branch_owned.as_deref(),
                    message_owned.as_deref(),
                    &files_owned,
                )
            })
            .await
            .map_err(internal)?;

        let pre = head_commit_of(&handle.path).ok();
        let op_id = op.id;
        self.db
            .call(move |db| {
                db.set_git_operation_in_progress(op_id, pre.as_deref())?;
                db.get_git_operation(op_id)
            })
            .await
            .map_err(internal)?
            .ok_or_else(|| Error::Internal("operation record vanished".into()))
    }

    async fn link_snapshot(&self, op_id: i64, snapshot_id: i64) -> Result<()> {
        self.db
            .call(move |db| db.set_git_operation_snapshot(op_id, snapshot_id))
            .await
            .map_err(internal)
    }

    async fn finish(
        &self,
        op_id: i64,
        status: GitOpStatus,
        post_commit: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        let post = post_commit.map(str::to_string);
        let err = error.map(str::to_string);
        self.db
            .call(move |db| db.finish_git_operation(op_id, status, post.as_deref(), err.as_deref()))
            .await
            .map_err(internal)
    }

    /// Common tail: on success record the post-commit; on failure attempt a
    /// best-effort reset of HEAD and index to pre-operation values, then
    /// record both the original failure and the rollback outcome.
    async fn conclude(
        &self,
        handle: &ProjectHandle,
        op: GitOperation,
        snapshot: Option<Snapshot>,
        result: Result<Option<String>>,
    ) -> Result<GitOperation> {
        match result {
            Ok(post) => {
                let post = post.or_else(|| head_commit_of(&handle.path).ok());
                self.finish(op.id, GitOpStatus::Completed, post.as_deref(), None)
                    .await?;
                let op_id = op.id;
                self.db
                    .call(move |db| db.get_git_operation(op_id))
                    .await
                    .map_err(internal)?
                    .ok_or_else(|| Error::Internal("operation record vanished".into()))
            }
            Err(e) => {
                let mut error_note = e.to_string();
                if let Some(pre) = op.pre_commit.clone().or_else(|| {
                    snapshot.as_ref().map(|s| s.commit.clone())
                }) {
                    let path = handle.path.clone();
                    let recovered = tokio::task::spawn_blocking(move || {
                        restore_head_and_index(&path, &pre)
                    })
                    .await
                    .ok()
                    .and_then(|r| r.ok())
                    .is_some();
                    if recovered {
                        error_note.push_str("; HEAD and index restored to pre-operation state");
                    } else if let Some(ref snap) = snapshot {
                        // Recovery itself failed: pin the snapshot for manual use.
                        let snap_id = snap.id;
                        let _ =
                            self.db.call(move |db| db.clear_snapshot_expiry(snap_id)).await;
                        error_note.push_str("; automatic recovery failed, snapshot preserved");
                    }
                }
                self.finish(op.id, GitOpStatus::Failed, None, Some(&error_note))
                    .await?;
                Err(e)
            }
        }
    }
}

fn internal(e: anyhow::Error) -> Error {
    Error::Internal(e.to_string())
}

// ── Synchronous git core ─────────────────────────────────────────────

pub fn head_commit_of(path: &Path) -> Result<String> {
    let repo = Repository::open(path)?;
    Ok(repo.head()?.peel_to_commit()?.id().to_string())
}

pub fn branch_exists(path: &Path, branch: &str) -> Result<bool> {
    let repo = Repository::open(path)?;
    Ok(repo.find_branch(branch, BranchType::Local).is_ok())
}

/// Local branch names.
pub fn list_branches(path: &Path) -> Result<Vec<String>> {
    let repo = Repository::open(path)?;
    let mut names = Vec::new();
    for entry in repo.branches(Some(BranchType::Local))? {
        let (branch, _) = entry?;
        if let Some(name) = branch.name()? {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

/// Most recent commits on HEAD: (hash, summary, author, rfc3339 time).
pub fn recent_commits(path: &Path, limit: usize) -> Result<Vec<(String, String, String, String)>> {
    let repo = Repository::open(path)?;
    let mut walk = repo.revwalk()?;
    walk.push_head()?;
    let mut commits = Vec::new();
    for oid in walk.take(limit) {
        let commit = repo.find_commit(oid?)?;
        let when = commit.time();
        let time = chrono::DateTime::from_timestamp(when.seconds(), 0)
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        commits.push((
            commit.id().to_string(),
            commit.summary().unwrap_or("").to_string(),
            commit.author().name().unwrap_or("").to_string(),
            time,
        ));
    }
    Ok(commits)
}

fn capture_snapshot(project: &Path, storage: &Path, kind: SnapshotKind) -> Result<CaptureInfo> {
    let repo = Repository::open(project)?;
    let head = repo.head()?;
    let branch = head.shorthand().ok_or(Error::DetachedHead)?.to_string();
    let commit = head.peel_to_commit()?.id().to_string();

    std::fs::create_dir_all(storage)?;
    match kind {
        SnapshotKind::Full => {
            // Working tree and .git wholesale, hooks included.
            copy_dir_recursive(project, &storage.join("tree"))?;
        }
        SnapshotKind::Light => {
            let head_tree = repo.head()?.peel_to_tree()?;
            let mut opts = DiffOptions::new();
            opts.include_untracked(true).show_untracked_content(true);
            let diff = repo.diff_tree_to_workdir_with_index(Some(&head_tree), Some(&mut opts))?;
            let mut buf = Vec::new();
            diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
                match line.origin() {
                    '+' | '-' | ' ' => buf.push(line.origin() as u8),
                    _ => {}
                }
                buf.extend_from_slice(line.content());
                true
            })?;
            std::fs::write(storage.join("changes.patch"), &buf)?;

            let index = repo.index()?;
            let tracked: Vec<String> = index
                .iter()
                .map(|entry| String::from_utf8_lossy(&entry.path).to_string())
                .collect();
            std::fs::write(storage.join("tracked.txt"), tracked.join("\n"))?;
        }
    }
    Ok(CaptureInfo { branch, commit })
}

fn checkout_branch_sync(path: &Path, branch: &str, create_if_missing: bool) -> Result<Option<String>> {
    let repo = Repository::open(path)?;

    let mut status_opts = git2::StatusOptions::new();
    status_opts.include_untracked(true).include_ignored(false);
    let dirty = repo.statuses(Some(&mut status_opts))?.len();
    if dirty > 0 {
        return Err(Error::WorkingTreeDirty { files: dirty });
    }

    if repo.find_branch(branch, BranchType::Local).is_err() {
        if !create_if_missing {
            return Err(Error::BranchNotFound {
                branch: branch.to_string(),
            });
        }
        let head = repo.head()?.peel_to_commit()?;
        repo.branch(branch, &head, false)?;
    }

    let refname = format!("refs/heads/{}", branch);
    let obj = repo.revparse_single(&refname)?;
    // Safe (non-force) checkout: conflicts abort with the tree unchanged.
    repo.checkout_tree(&obj, None)?;
    repo.set_head(&refname)?;

    // Post-condition: HEAD matches the requested branch tip.
    let head = repo.head()?;
    let tip = repo
        .find_branch(branch, BranchType::Local)?
        .get()
        .peel_to_commit()?
        .id();
    if head.shorthand() != Some(branch) || head.peel_to_commit()?.id() != tip {
        return Err(Error::Internal(format!(
            "HEAD does not match branch '{}' after checkout",
            branch
        )));
    }
    Ok(Some(tip.to_string()))
}

fn atomic_commit_sync(
    path: &Path,
    message: &str,
    paths: &[String],
    allow_empty: bool,
) -> Result<String> {
    let repo = Repository::open(path)?;
    let mut index = repo.index()?;
    if paths.is_empty() {
        // All tracked modifications; untracked files are not swept in.
        index.update_all(["*"].iter(), None)?;
    } else {
        index.add_all(paths.iter(), IndexAddOption::DEFAULT, None)?;
    }
    index.write()?;
    let tree_id = index.write_tree()?;

    let old_head = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
    if let Some(ref head) = old_head {
        if head.tree_id() == tree_id && !allow_empty {
            return Err(Error::Internal(
                "nothing to commit and allow_empty is false".into(),
            ));
        }
    }

    let tree = repo.find_tree(tree_id)?;
    let sig = repo
        .signature()
        .or_else(|_| git2::Signature::now("apkwright", "apkwright@localhost"))?;
    let new_id = match old_head {
        Some(parent) => repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?,
        None => repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[])?,
    };
    Ok(new_id.to_string())
}

fn rollback_sync(path: &Path, target: &str) -> Result<String> {
    let repo = Repository::open(path)?;
    let target_obj = repo.revparse_single(target)?;
    let target_commit = target_obj.peel_to_commit()?;
    let head = repo.head()?.peel_to_commit()?;

    let is_ancestor = target_commit.id() == head.id()
        || repo.graph_descendant_of(head.id(), target_commit.id())?;
    if !is_ancestor {
        return Err(Error::Internal(format!(
            "target {} is not an ancestor of HEAD; refusing to rewrite history",
            target
        )));
    }

    repo.reset(target_commit.as_object(), ResetType::Hard, None)?;
    Ok(target_commit.id().to_string())
}

fn reset_working_tree_sync(path: &Path) -> Result<usize> {
    let repo = Repository::open(path)?;
    let mut status_opts = git2::StatusOptions::new();
    status_opts.include_untracked(true).include_ignored(false);
    let touched = repo.statuses(Some(&mut status_opts))?.len();

    let mut checkout = git2::build::CheckoutBuilder::new();
    checkout.force().remove_untracked(true);
    repo.checkout_head(Some(&mut checkout))?;
    Ok(touched)
}

fn restore_snapshot_sync(
    project: &Path,
    storage: &Path,
    kind: SnapshotKind,
    snapshot: &Snapshot,
) -> Result<()> {
    match kind {
        SnapshotKind::Full => {
            let tree = storage.join("tree");
            if !tree.is_dir() {
                return Err(Error::RestoreFailed {
                    message: format!("snapshot tree missing at {}", tree.display()),
                });
            }
            // Wipe and copy back; the snapshot contains .git, so history,
            // branches, and hooks all return to the captured state.
            for entry in std::fs::read_dir(project)? {
                let entry = entry?;
                let path = entry.path();
                if entry.file_type()?.is_dir() {
                    std::fs::remove_dir_all(&path)?;
                } else {
                    std::fs::remove_file(&path)?;
                }
            }
            copy_dir_recursive(&tree, project)?;
        }
        SnapshotKind::Light => {
            let repo = Repository::open(project)?;
            // Return to the recorded branch and commit, then replay the
            // captured uncommitted changes.
            let refname = format!("refs/heads/{}", snapshot.branch);
            if repo.find_reference(&refname).is_ok() {
                repo.set_head(&refname)?;
            }
            let oid = git2::Oid::from_str(&snapshot.commit)
                .map_err(|e| Error::RestoreFailed { message: e.to_string() })?;
            let commit = repo.find_commit(oid).map_err(|_| Error::RestoreFailed {
                message: format!("snapshot commit {} no longer exists", snapshot.commit),
            })?;
            repo.reset(commit.as_object(), ResetType::Hard, None)?;

            let patch = std::fs::read(storage.join("changes.patch"))?;
            if !patch.is_empty() {
                let diff = git2::Diff::from_buffer(&patch)?;
                repo.apply(&diff, git2::ApplyLocation::WorkDir, None)?;
            }
        }
    }
    Ok(())
}

/// Best-effort recovery after a failed mutation: move HEAD back and make the
/// index match it, leaving the working tree for inspection.
fn restore_head_and_index(path: &Path, commit: &str) -> Result<()> {
    let repo = Repository::open(path)?;
    let oid = git2::Oid::from_str(commit)?;
    let commit = repo.find_commit(oid)?;
    repo.reset(commit.as_object(), ResetType::Mixed, None)?;
    Ok(())
}

pub(crate) fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = dst.join(entry.file_name());
        if file_type.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            #[cfg(unix)]
            {
                let link = std::fs::read_link(entry.path())?;
                std::os::unix::fs::symlink(link, &target)?;
            }
            #[cfg(not(unix))]
            {
                std::fs::copy(entry.path(), &target)?;
            }
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;

    fn init_repo(dir: &Path) {
        let repo = Repository::init(dir).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "test").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
    }

    fn commit_file(dir: &Path, name: &str, content: &str, msg: &str) -> String {
        let repo = Repository::open(dir).unwrap();
        if let Some(parent) = dir.join(name).parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(dir.join(name), content).unwrap();
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = git2::Signature::now("test", "test@test.com").unwrap();
        let id = match repo.head() {
            Ok(head) => {
                let parent = head.peel_to_commit().unwrap();
                repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &[&parent])
                    .unwrap()
            }
            Err(_) => repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &[]).unwrap(),
        };
        id.to_string()
    }

    struct Fixture {
        _project_dir: tempfile::TempDir,
        _store_dir: tempfile::TempDir,
        safety: GitSafety,
        handle: ProjectHandle,
        db: DbHandle,
    }

    async fn fixture() -> Fixture {
        let project_dir = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir().unwrap();
        init_repo(project_dir.path());
        commit_file(project_dir.path(), "README.md", "hello\n", "init");

        let db = DbHandle::new(Db::new_in_memory().unwrap());
        let project_path = project_dir.path().to_string_lossy().to_string();
        let project = db
            .call(move |db| db.create_project("fixture", &project_path, None))
            .await
            .unwrap();

        let handle = ProjectHandle {
            project_id: project.id,
            path: project_dir.path().to_path_buf(),
        };
        let safety = GitSafety::new(db.clone(), store_dir.path().to_path_buf());
        Fixture {
            _project_dir: project_dir,
            _store_dir: store_dir,
            safety,
            handle,
            db,
        }
    }

    #[tokio::test]
    async fn test_full_snapshot_restore_round_trip() {
        let fx = fixture().await;
        let pre_head = head_commit_of(&fx.handle.path).unwrap();
        let snap = fx
            .safety
            .snapshot(&fx.handle, SnapshotKind::Full, Some(7), None)
            .await
            .unwrap();
        assert!(Path::new(&snap.storage_path).join("tree/.git").exists());

        // Mutate: new commit plus extra uncommitted file.
        commit_file(&fx.handle.path, "README.md", "changed\n", "change");
        std::fs::write(fx.handle.path.join("stray.txt"), "stray").unwrap();
        assert_ne!(head_commit_of(&fx.handle.path).unwrap(), pre_head);

        let op = fx
            .safety
            .restore_snapshot(&fx.handle, snap.id, true)
            .await
            .unwrap();
        assert_eq!(op.kind, GitOpKind::Restore);
        assert_eq!(op.status, GitOpStatus::Completed);

        // Byte-identical tracked file and restored HEAD.
        assert_eq!(
            std::fs::read_to_string(fx.handle.path.join("README.md")).unwrap(),
            "hello\n"
        );
        assert_eq!(head_commit_of(&fx.handle.path).unwrap(), pre_head);
        assert!(!fx.handle.path.join("stray.txt").exists());
    }

    #[tokio::test]
    async fn test_light_snapshot_captures_uncommitted_diff() {
        let fx = fixture().await;
        std::fs::write(fx.handle.path.join("README.md"), "hello\nmore\n").unwrap();
        let snap = fx
            .safety
            .snapshot(&fx.handle, SnapshotKind::Light, Some(30), None)
            .await
            .unwrap();
        let patch =
            std::fs::read_to_string(Path::new(&snap.storage_path).join("changes.patch")).unwrap();
        assert!(patch.contains("+more"));
        assert!(Path::new(&snap.storage_path).join("tracked.txt").exists());
    }

    #[tokio::test]
    async fn test_light_snapshot_restore_reapplies_changes() {
        let fx = fixture().await;
        std::fs::write(fx.handle.path.join("README.md"), "hello\nwip\n").unwrap();
        let snap = fx
            .safety
            .snapshot(&fx.handle, SnapshotKind::Light, Some(30), None)
            .await
            .unwrap();

        // Lose the uncommitted work, then restore it.
        fx.safety.reset_working_tree(&fx.handle).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(fx.handle.path.join("README.md")).unwrap(),
            "hello\n"
        );

        fx.safety
            .restore_snapshot(&fx.handle, snap.id, true)
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(fx.handle.path.join("README.md")).unwrap(),
            "hello\nwip\n"
        );
    }

    #[tokio::test]
    async fn test_checkout_branch_create_and_switch() {
        let fx = fixture().await;
        let op = fx
            .safety
            .checkout_branch(&fx.handle, "release", true)
            .await
            .unwrap();
        assert_eq!(op.kind, GitOpKind::BranchCreate);
        assert_eq!(op.status, GitOpStatus::Completed);
        assert_eq!(fx.handle.current_branch().unwrap(), "release");

        // Switching back is a plain branch_switch.
        let default_branch = {
            let branches = list_branches(&fx.handle.path).unwrap();
            branches
                .into_iter()
                .find(|b| b != "release")
                .expect("default branch present")
        };
        let op = fx
            .safety
            .checkout_branch(&fx.handle, &default_branch, false)
            .await
            .unwrap();
        assert_eq!(op.kind, GitOpKind::BranchSwitch);
        assert_eq!(fx.handle.current_branch().unwrap(), default_branch);
    }

    #[tokio::test]
    async fn test_checkout_refuses_dirty_tree() {
        let fx = fixture().await;
        std::fs::write(fx.handle.path.join("dirty.txt"), "x").unwrap();
        let err = fx
            .safety
            .checkout_branch(&fx.handle, "release", true)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "working_tree_dirty");
        // The failed operation is recorded as such.
        let ops = fx
            .db
            .call(move |db| db.list_git_operations(1, None, 10))
            .await
            .unwrap();
        assert_eq!(ops[0].status, GitOpStatus::Failed);
    }

    #[tokio::test]
    async fn test_checkout_missing_branch_without_create() {
        let fx = fixture().await;
        let err = fx
            .safety
            .checkout_branch(&fx.handle, "ghost", false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "branch_not_found");
    }

    #[tokio::test]
    async fn test_atomic_commit_tracked_modifications() {
        let fx = fixture().await;
        let pre = head_commit_of(&fx.handle.path).unwrap();
        std::fs::write(fx.handle.path.join("README.md"), "edited\n").unwrap();

        let op = fx
            .safety
            .atomic_commit(&fx.handle, "edit readme", &[], false, true)
            .await
            .unwrap();
        assert_eq!(op.status, GitOpStatus::Completed);
        assert_eq!(op.pre_commit.as_deref(), Some(pre.as_str()));
        let post = op.post_commit.clone().unwrap();
        assert_ne!(post, pre);
        assert_eq!(head_commit_of(&fx.handle.path).unwrap(), post);
        assert!(op.snapshot_id.is_some());
    }

    #[tokio::test]
    async fn test_atomic_commit_rejects_empty() {
        let fx = fixture().await;
        let err = fx
            .safety
            .atomic_commit(&fx.handle, "no-op", &[], false, false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "internal");
        assert!(err.to_string().contains("nothing to commit"));
    }

    #[tokio::test]
    async fn test_atomic_commit_allow_empty() {
        let fx = fixture().await;
        let pre = head_commit_of(&fx.handle.path).unwrap();
        let op = fx
            .safety
            .atomic_commit(&fx.handle, "marker", &[], true, false)
            .await
            .unwrap();
        assert_eq!(op.status, GitOpStatus::Completed);
        assert_ne!(op.post_commit.unwrap(), pre);
    }

    #[tokio::test]
    async fn test_atomic_commit_stages_only_supplied_paths() {
        let fx = fixture().await;
        commit_file(&fx.handle.path, "other.txt", "base\n", "add other");
        std::fs::write(fx.handle.path.join("README.md"), "one\n").unwrap();
        std::fs::write(fx.handle.path.join("other.txt"), "two\n").unwrap();

        fx.safety
            .atomic_commit(
                &fx.handle,
                "partial",
                &["README.md".to_string()],
                false,
                false,
            )
            .await
            .unwrap();

        // other.txt is still dirty.
        assert_eq!(fx.handle.dirty_file_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rollback_to_ancestor() {
        let fx = fixture().await;
        let first = head_commit_of(&fx.handle.path).unwrap();
        commit_file(&fx.handle.path, "README.md", "v2\n", "second");

        let op = fx
            .safety
            .rollback(&fx.handle, &first, true)
            .await
            .unwrap();
        assert_eq!(op.kind, GitOpKind::Rollback);
        assert_eq!(op.post_commit.as_deref(), Some(first.as_str()));
        assert_eq!(head_commit_of(&fx.handle.path).unwrap(), first);
        assert_eq!(
            std::fs::read_to_string(fx.handle.path.join("README.md")).unwrap(),
            "hello\n"
        );
    }

    #[tokio::test]
    async fn test_rollback_rejects_non_ancestor() {
        let fx = fixture().await;
        let base_branch = fx.handle.current_branch().unwrap();

        // A commit on a side branch is not an ancestor of the base branch tip.
        fx.safety
            .checkout_branch(&fx.handle, "side", true)
            .await
            .unwrap();
        let side = commit_file(&fx.handle.path, "side.txt", "side\n", "side work");
        fx.safety
            .checkout_branch(&fx.handle, &base_branch, false)
            .await
            .unwrap();

        let err = fx.safety.rollback(&fx.handle, &side, false).await.unwrap_err();
        assert!(err.to_string().contains("not an ancestor"));
        // Tree untouched by the refused rollback.
        assert_eq!(
            std::fs::read_to_string(fx.handle.path.join("README.md")).unwrap(),
            "hello\n"
        );
    }

    #[tokio::test]
    async fn test_reset_working_tree_discards_changes() {
        let fx = fixture().await;
        let head = head_commit_of(&fx.handle.path).unwrap();
        std::fs::write(fx.handle.path.join("README.md"), "scratch\n").unwrap();
        std::fs::write(fx.handle.path.join("untracked.bin"), "junk").unwrap();

        let touched = fx.safety.reset_working_tree(&fx.handle).await.unwrap();
        assert_eq!(touched, 2);
        assert_eq!(
            std::fs::read_to_string(fx.handle.path.join("README.md")).unwrap(),
            "hello\n"
        );
        assert!(!fx.handle.path.join("untracked.bin").exists());
        assert_eq!(head_commit_of(&fx.handle.path).unwrap(), head);
    }

    #[tokio::test]
    async fn test_restore_refuses_dirty_tree_without_force() {
        let fx = fixture().await;
        let snap = fx
            .safety
            .snapshot(&fx.handle, SnapshotKind::Full, Some(7), None)
            .await
            .unwrap();
        std::fs::write(fx.handle.path.join("dirty.txt"), "x").unwrap();

        let err = fx
            .safety
            .restore_snapshot(&fx.handle, snap.id, false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "working_tree_dirty");

        // Force overrides.
        fx.safety
            .restore_snapshot(&fx.handle, snap.id, true)
            .await
            .unwrap();
        assert!(!fx.handle.path.join("dirty.txt").exists());
    }

    #[tokio::test]
    async fn test_restore_missing_snapshot() {
        let fx = fixture().await;
        let err = fx
            .safety
            .restore_snapshot(&fx.handle, 999, false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "snapshot_missing");
    }

    #[tokio::test]
    async fn test_cleanup_removes_expired_storage_after_marking_inactive() {
        let fx = fixture().await;
        let snap = fx
            .safety
            .snapshot(&fx.handle, SnapshotKind::Full, Some(7), None)
            .await
            .unwrap();

        // Force the snapshot to look expired.
        let snap_id = snap.id;
        fx.db
            .call(move |db| {
                db.conn_for_tests().execute(
                    "UPDATE snapshots SET expires_at = '2020-01-01T00:00:00+00:00' WHERE id = ?1",
                    rusqlite::params![snap_id],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let removed = fx.safety.cleanup_expired().await.unwrap();
        assert_eq!(removed, 1);
        assert!(!Path::new(&snap.storage_path).exists());
        let row = fx
            .db
            .call(move |db| db.get_snapshot(snap_id))
            .await
            .unwrap()
            .unwrap();
        assert!(!row.active);
    }

    #[tokio::test]
    async fn test_snapshot_with_no_ttl_survives_cleanup() {
        let fx = fixture().await;
        let snap = fx
            .safety
            .snapshot(&fx.handle, SnapshotKind::Light, None, None)
            .await
            .unwrap();
        assert!(snap.expires_at.is_none());
        assert_eq!(fx.safety.cleanup_expired().await.unwrap(), 0);
        assert!(Path::new(&snap.storage_path).exists());
    }
}
