use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use crate::models::*;
use crate::now_rfc3339;

/// Async-safe handle to the store.
///
/// Wraps `Db` behind `Arc<Mutex>` and runs all access on tokio's blocking
/// thread pool via `spawn_blocking`, preventing synchronous SQLite I/O from
/// tying up async worker threads. The single connection behind one mutex also
/// gives `update_status` calls against the same row a total order.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<Db>>,
}

impl DbHandle {
    pub fn new(db: Db) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Db) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. For startup initialization
    /// and tests only; must not be called from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, Db>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct Db {
    conn: Connection,
}

impl Db {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS projects (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL UNIQUE,
                    path TEXT NOT NULL,
                    description TEXT,
                    active INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS tasks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    kind TEXT NOT NULL,
                    branch TEXT NOT NULL,
                    archive_path TEXT,
                    config TEXT NOT NULL DEFAULT '{}',
                    status TEXT NOT NULL DEFAULT 'pending',
                    progress INTEGER NOT NULL DEFAULT 0,
                    error_kind TEXT,
                    error_message TEXT,
                    result TEXT,
                    created_at TEXT NOT NULL,
                    started_at TEXT,
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS artifacts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                    file_name TEXT NOT NULL,
                    path TEXT NOT NULL,
                    size INTEGER NOT NULL,
                    sha256 TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    variant TEXT,
                    partial INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS git_operations (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    kind TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    pre_commit TEXT,
                    post_commit TEXT,
                    branch TEXT,
                    files_affected TEXT NOT NULL DEFAULT '[]',
                    message TEXT,
                    error TEXT,
                    snapshot_id INTEGER,
                    created_at TEXT NOT NULL,
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS snapshots (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    kind TEXT NOT NULL,
                    branch TEXT NOT NULL,
                    commit_hash TEXT NOT NULL,
                    storage_path TEXT NOT NULL,
                    active INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL,
                    expires_at TEXT,
                    operation_id INTEGER
                );

                CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project_id);
                CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(project_id, status);
                CREATE INDEX IF NOT EXISTS idx_artifacts_task ON artifacts(task_id);
                CREATE INDEX IF NOT EXISTS idx_git_ops_project ON git_operations(project_id);
                CREATE INDEX IF NOT EXISTS idx_snapshots_project ON snapshots(project_id, active);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Projects ──────────────────────────────────────────────────────

    pub fn create_project(
        &self,
        name: &str,
        path: &str,
        description: Option<&str>,
    ) -> Result<Project> {
        let now = now_rfc3339();
        self.conn
            .execute(
                "INSERT INTO projects (name, path, description, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![name, path, description, now],
            )
            .context("Failed to insert project")?;
        let id = self.conn.last_insert_rowid();
        self.get_project(id)?
            .context("Project vanished after insert")
    }

    pub fn get_project(&self, id: i64) -> Result<Option<Project>> {
        self.conn
            .query_row(
                "SELECT id, name, path, description, active, created_at, updated_at
                 FROM projects WHERE id = ?1",
                params![id],
                row_to_project,
            )
            .optional()
            .context("Failed to query project")
    }

    pub fn get_project_by_name(&self, name: &str) -> Result<Option<Project>> {
        self.conn
            .query_row(
                "SELECT id, name, path, description, active, created_at, updated_at
                 FROM projects WHERE name = ?1",
                params![name],
                row_to_project,
            )
            .optional()
            .context("Failed to query project by name")
    }

    /// Active projects only, newest first.
    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, path, description, active, created_at, updated_at
             FROM projects WHERE active = 1 ORDER BY id DESC",
        )?;
        let rows = stmt.query_map([], row_to_project)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list projects")
    }

    pub fn update_project(
        &self,
        id: i64,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<Project> {
        let now = now_rfc3339();
        if let Some(name) = name {
            self.conn.execute(
                "UPDATE projects SET name = ?1, updated_at = ?2 WHERE id = ?3",
                params![name, now, id],
            )?;
        }
        if let Some(description) = description {
            self.conn.execute(
                "UPDATE projects SET description = ?1, updated_at = ?2 WHERE id = ?3",
                params![description, now, id],
            )?;
        }
        self.get_project(id)?
            .context("Project not found after update")
    }

    /// Soft delete: the row stays for task/operation history.
    pub fn soft_delete_project(&self, id: i64) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE projects SET active = 0, updated_at = ?1 WHERE id = ?2 AND active = 1",
            params![now_rfc3339(), id],
        )?;
        Ok(changed > 0)
    }

    // ── Tasks ─────────────────────────────────────────────────────────

    pub fn create_task(
        &self,
        project_id: i64,
        kind: TaskKind,
        branch: &str,
        archive_path: Option<&str>,
        config: &TaskConfig,
    ) -> Result<BuildTask> {
        let config_json = serde_json::to_string(config)?;
        self.conn
            .execute(
                "INSERT INTO tasks (project_id, kind, branch, archive_path, config, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    project_id,
                    kind.as_str(),
                    branch,
                    archive_path,
                    config_json,
                    now_rfc3339()
                ],
            )
            .context("Failed to insert task")?;
        let id = self.conn.last_insert_rowid();
        self.get_task(id)?.context("Task vanished after insert")
    }

    pub fn get_task(&self, id: i64) -> Result<Option<BuildTask>> {
        self.conn
            .query_row(
                "SELECT id, project_id, kind, branch, archive_path, config, status, progress,
                        error_kind, error_message, result, created_at, started_at, completed_at
                 FROM tasks WHERE id = ?1",
                params![id],
                row_to_task,
            )
            .optional()
            .context("Failed to query task")
    }

    pub fn list_tasks_by_project(&self, project_id: i64, limit: i64) -> Result<Vec<BuildTask>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, project_id, kind, branch, archive_path, config, status, progress,
                    error_kind, error_message, result, created_at, started_at, completed_at
             FROM tasks WHERE project_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![project_id, limit], row_to_task)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list tasks")
    }

    /// Invariant: at most one task per project may be non-terminal.
    pub fn count_non_terminal_tasks(&self, project_id: i64) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM tasks
                 WHERE project_id = ?1 AND status IN ('pending', 'running')",
                params![project_id],
                |row| row.get(0),
            )
            .context("Failed to count non-terminal tasks")
    }

    pub fn mark_task_started(&self, id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE tasks SET status = 'running', started_at = ?1 WHERE id = ?2",
            params![now_rfc3339(), id],
        )?;
        Ok(())
    }

    /// Progress writes are clamped monotone at the SQL level as well, so a
    /// late out-of-order persistence write can never move a task backwards.
    pub fn update_task_progress(&self, id: i64, progress: u8) -> Result<()> {
        self.conn.execute(
            "UPDATE tasks SET progress = MAX(progress, ?1) WHERE id = ?2",
            params![progress as i64, id],
        )?;
        Ok(())
    }

    pub fn finish_task(
        &self,
        id: i64,
        status: TaskStatus,
        error_kind: Option<&str>,
        error_message: Option<&str>,
        result: Option<&serde_json::Value>,
    ) -> Result<()> {
        let result_json = result.map(|v| v.to_string());
        self.conn.execute(
            "UPDATE tasks SET status = ?1, error_kind = ?2, error_message = ?3,
                              result = ?4, completed_at = ?5
             WHERE id = ?6",
            params![
                status.as_str(),
                error_kind,
                error_message,
                result_json,
                now_rfc3339(),
                id
            ],
        )?;
        Ok(())
    }

    /// Startup reconciliation: any task left non-terminal by a previous
    /// process is marked failed with kind `abandoned`.
    pub fn mark_abandoned_tasks(&self) -> Result<usize> {
        let changed = self.conn.execute(
            "UPDATE tasks SET status = 'failed', error_kind = 'abandoned',
                              error_message = 'Task was abandoned by a server restart',
                              completed_at = ?1
             WHERE status IN ('pending', 'running')",
            params![now_rfc3339()],
        )?;
        Ok(changed)
    }

    pub fn append_artifact(
        &self,
        task_id: i64,
        file_name: &str,
        path: &str,
        size: i64,
        sha256: &str,
        kind: ArtifactKind,
        variant: Option<&str>,
        partial: bool,
    ) -> Result<ArtifactDescriptor> {
        self.conn.execute(
            "INSERT INTO artifacts (task_id, file_name, path, size, sha256, kind, variant, partial)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                task_id,
                file_name,
                path,
                size,
                sha256,
                kind.as_str(),
                variant,
                partial
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.conn
            .query_row(
                "SELECT id, task_id, file_name, path, size, sha256, kind, variant, partial
                 FROM artifacts WHERE id = ?1",
                params![id],
                row_to_artifact,
            )
            .context("Artifact vanished after insert")
    }

    pub fn list_artifacts(&self, task_id: i64) -> Result<Vec<ArtifactDescriptor>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, task_id, file_name, path, size, sha256, kind, variant, partial
             FROM artifacts WHERE task_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![task_id], row_to_artifact)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list artifacts")
    }

    // ── Git operations ────────────────────────────────────────────────

    pub fn create_git_operation(
        &self,
        project_id: i64,
        kind: GitOpKind,
        branch: Option<&str>,
        message: Option<&str>,
        files_affected: &[String],
    ) -> Result<GitOperation> {
        let files_json = serde_json::to_string(files_affected)?;
        self.conn.execute(
            "INSERT INTO git_operations (project_id, kind, branch, message, files_affected, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                project_id,
                kind.as_str(),
                branch,
                message,
                files_json,
                now_rfc3339()
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_git_operation(id)?
            .context("Git operation vanished after insert")
    }

    pub fn get_git_operation(&self, id: i64) -> Result<Option<GitOperation>> {
        self.conn
            .query_row(
                "SELECT id, project_id, kind, status, pre_commit, post_commit, branch,
                        files_affected, message, error, snapshot_id, created_at, completed_at
                 FROM git_operations WHERE id = ?1",
                params![id],
                row_to_git_operation,
            )
            .optional()
            .context("Failed to query git operation")
    }

    pub fn set_git_operation_in_progress(&self, id: i64, pre_commit: Option<&str>) -> Result<()> {
        self.conn.execute(
            "UPDATE git_operations SET status = 'in_progress', pre_commit = ?1 WHERE id = ?2",
            params![pre_commit, id],
        )?;
        Ok(())
    }

    pub fn set_git_operation_snapshot(&self, id: i64, snapshot_id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE git_operations SET snapshot_id = ?1 WHERE id = ?2",
            params![snapshot_id, id],
        )?;
        Ok(())
    }

    pub fn finish_git_operation(
        &self,
        id: i64,
        status: GitOpStatus,
        post_commit: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE git_operations SET status = ?1, post_commit = ?2, error = ?3,
                                       completed_at = ?4
             WHERE id = ?5",
            params![status.as_str(), post_commit, error, now_rfc3339(), id],
        )?;
        Ok(())
    }

    pub fn list_git_operations(
        &self,
        project_id: i64,
        kind: Option<GitOpKind>,
        limit: i64,
    ) -> Result<Vec<GitOperation>> {
        let mut ops = Vec::new();
        match kind {
            Some(kind) => {
                let mut stmt = self.conn.prepare(
                    "SELECT id, project_id, kind, status, pre_commit, post_commit, branch,
                            files_affected, message, error, snapshot_id, created_at, completed_at
                     FROM git_operations WHERE project_id = ?1 AND kind = ?2
                     ORDER BY id DESC LIMIT ?3",
                )?;
                let rows =
                    stmt.query_map(params![project_id, kind.as_str(), limit], row_to_git_operation)?;
                for row in rows {
                    ops.push(row?);
                }
            }
            None => {
                let mut stmt = self.conn.prepare(
                    "SELECT id, project_id, kind, status, pre_commit, post_commit, branch,
                            files_affected, message, error, snapshot_id, created_at, completed_at
                     FROM git_operations WHERE project_id = ?1
                     ORDER BY id DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![project_id, limit], row_to_git_operation)?;
                for row in rows {
                    ops.push(row?);
                }
            }
        }
        Ok(ops)
    }

    // ── Snapshots ─────────────────────────────────────────────────────

    pub fn create_snapshot(
        &self,
        project_id: i64,
        kind: SnapshotKind,
        branch: &str,
        commit: &str,
        storage_path: &str,
        expires_at: Option<&str>,
        operation_id: Option<i64>,
    ) -> Result<Snapshot> {
        self.conn.execute(
            "INSERT INTO snapshots (project_id, kind, branch, commit_hash, storage_path,
                                    created_at, expires_at, operation_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                project_id,
                kind.as_str(),
                branch,
                commit,
                storage_path,
                now_rfc3339(),
                expires_at,
                operation_id
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_snapshot(id)?
            .context("Snapshot vanished after insert")
    }

    pub fn get_snapshot(&self, id: i64) -> Result<Option<Snapshot>> {
        self.conn
            .query_row(
                "SELECT id, project_id, kind, branch, commit_hash, storage_path, active,
                        created_at, expires_at, operation_id
                 FROM snapshots WHERE id = ?1",
                params![id],
                row_to_snapshot,
            )
            .optional()
            .context("Failed to query snapshot")
    }

    pub fn list_active_snapshots(&self, project_id: i64) -> Result<Vec<Snapshot>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, project_id, kind, branch, commit_hash, storage_path, active,
                    created_at, expires_at, operation_id
             FROM snapshots WHERE project_id = ?1 AND active = 1 ORDER BY id DESC",
        )?;
        let rows = stmt.query_map(params![project_id], row_to_snapshot)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list snapshots")
    }

    pub fn mark_snapshot_inactive(&self, id: i64) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE snapshots SET active = 0 WHERE id = ?1 AND active = 1",
            params![id],
        )?;
        Ok(changed > 0)
    }

    /// Preserve a snapshot past its TTL (after a failed restore): a NULL
    /// expiry is never selected by the GC sweep.
    pub fn clear_snapshot_expiry(&self, id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE snapshots SET expires_at = NULL WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Raw connection escape hatch for tests that need to shape rows directly.
    #[cfg(test)]
    pub fn conn_for_tests(&self) -> &Connection {
        &self.conn
    }

    /// Active snapshots whose expiry has elapsed. RFC3339 strings compare
    /// lexicographically in UTC, so a plain string comparison is ordered.
    pub fn list_expired_snapshots(&self, now: &str) -> Result<Vec<Snapshot>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, project_id, kind, branch, commit_hash, storage_path, active,
                    created_at, expires_at, operation_id
             FROM snapshots
             WHERE active = 1 AND expires_at IS NOT NULL AND expires_at < ?1",
        )?;
        let rows = stmt.query_map(params![now], row_to_snapshot)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list expired snapshots")
    }
}

// ── Row mappers ──────────────────────────────────────────────────────

fn row_to_project(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        path: row.get(2)?,
        description: row.get(3)?,
        active: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<BuildTask> {
    let kind_str: String = row.get(2)?;
    let config_str: String = row.get(5)?;
    let status_str: String = row.get(6)?;
    let progress: i64 = row.get(7)?;
    let result_str: Option<String> = row.get(10)?;
    Ok(BuildTask {
        id: row.get(0)?,
        project_id: row.get(1)?,
        kind: TaskKind::from_str(&kind_str).map_err(|_| invalid_column(2))?,
        branch: row.get(3)?,
        archive_path: row.get(4)?,
        config: serde_json::from_str(&config_str).map_err(|_| invalid_column(5))?,
        status: TaskStatus::from_str(&status_str).map_err(|_| invalid_column(6))?,
        progress: progress.clamp(0, 100) as u8,
        error_kind: row.get(8)?,
        error_message: row.get(9)?,
        result: result_str.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: row.get(11)?,
        started_at: row.get(12)?,
        completed_at: row.get(13)?,
    })
}

fn row_to_artifact(row: &rusqlite::Row<'_>) -> rusqlite::Result<ArtifactDescriptor> {
    let kind_str: String = row.get(6)?;
    Ok(ArtifactDescriptor {
        id: row.get(0)?,
        task_id: row.get(1)?,
        file_name: row.get(2)?,
        path: row.get(3)?,
        size: row.get(4)?,
        sha256: row.get(5)?,
        kind: ArtifactKind::from_str(&kind_str).map_err(|_| invalid_column(6))?,
        variant: row.get(7)?,
        partial: row.get(8)?,
    })
}

fn row_to_git_operation(row: &rusqlite::Row<'_>) -> rusqlite::Result<GitOperation> {
    let kind_str: String = row.get(2)?;
    let status_str: String = row.get(3)?;
    let files_str: String = row.get(7)?;
    Ok(GitOperation {
        id: row.get(0)?,
        project_id: row.get(1)?,
        kind: GitOpKind::from_str(&kind_str).map_err(|_| invalid_column(2))?,
        status: GitOpStatus::from_str(&status_str).map_err(|_| invalid_column(3))?,
        pre_commit: row.get(4)?,
        post_commit: row.get(5)?,
        branch: row.get(6)?,
        files_affected: serde_json::from_str(&files_str).unwrap_or_default(),
        message: row.get(8)?,
        error: row.get(9)?,
        snapshot_id: row.get(10)?,
        created_at: row.get(11)?,
        completed_at: row.get(12)?,
    })
}

fn row_to_snapshot(row: &rusqlite::Row<'_>) -> rusqlite::Result<Snapshot> {
    let kind_str: String = row.get(2)?;
    Ok(Snapshot {
        id: row.get(0)?,
        project_id: row.get(1)?,
        kind: SnapshotKind::from_str(&kind_str).map_err(|_| invalid_column(2))?,
        branch: row.get(3)?,
        commit: row.get(4)?,
        storage_path: row.get(5)?,
        active: row.get(6)?,
        created_at: row.get(7)?,
        expires_at: row.get(8)?,
        operation_id: row.get(9)?,
    })
}

fn invalid_column(idx: usize) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(idx, "enum".to_string(), rusqlite::types::Type::Text)
}
