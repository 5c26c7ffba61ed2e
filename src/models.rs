use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A registered Android project. `path` must point at a checkout that
/// contains a Gradle wrapper and the asset root `app/src/main/assets/apps`;
/// this is verified when a build is validated, not at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub path: String,
    pub description: Option<String>,
    pub active: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Build,
    ResourceReplace,
    ExtractApk,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::ResourceReplace => "resource_replace",
            Self::ExtractApk => "extract_apk",
        }
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "build" => Ok(Self::Build),
            "resource_replace" => Ok(Self::ResourceReplace),
            "extract_apk" => Ok(Self::ExtractApk),
            _ => Err(format!("Invalid task kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `from -> to` is a legal task transition. The runtime refuses
    /// everything else, so a task walks exactly one path through the machine.
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        matches!(
            (from, to),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Pending, TaskStatus::Cancelled)
                | (TaskStatus::Pending, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Cancelled)
        )
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

/// Per-task configuration supplied at creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Gradle task line, split on whitespace before spawning.
    #[serde(default = "default_gradle_args")]
    pub gradle_args: String,
    /// Extra environment for the Gradle child process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Whether the pipeline takes a pre-flight snapshot (git projects only).
    #[serde(default = "default_true")]
    pub snapshot: bool,
}

fn default_gradle_args() -> String {
    "clean :app:assembleRelease".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            gradle_args: default_gradle_args(),
            env: HashMap::new(),
            snapshot: true,
        }
    }
}

/// One unit of orchestrated work. Created by the HTTP layer, mutated only
/// by the task runtime and the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildTask {
    pub id: i64,
    pub project_id: i64,
    pub kind: TaskKind,
    pub branch: String,
    pub archive_path: Option<String>,
    pub config: TaskConfig,
    pub status: TaskStatus,
    pub progress: u8,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub result: Option<serde_json::Value>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Apk,
    Log,
    Metadata,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Apk => "apk",
            Self::Log => "log",
            Self::Metadata => "metadata",
        }
    }
}

impl FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "apk" => Ok(Self::Apk),
            "log" => Ok(Self::Log),
            "metadata" => Ok(Self::Metadata),
            _ => Err(format!("Invalid artifact kind: {}", s)),
        }
    }
}

/// A file emitted by a task, usually an APK found during harvest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    pub id: i64,
    pub task_id: i64,
    pub file_name: String,
    pub path: String,
    pub size: i64,
    pub sha256: String,
    pub kind: ArtifactKind,
    /// Build variant parsed from the output path (`release`, `debug`, ...).
    pub variant: Option<String>,
    /// Set when the producing Gradle run did not finish cleanly; such
    /// artifacts are recorded for inspection but never promoted.
    pub partial: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    /// Working tree and `.git` copied wholesale into the snapshot store.
    Full,
    /// HEAD commit + branch + saved diff of uncommitted changes.
    Light,
}

impl SnapshotKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Light => "light",
        }
    }
}

impl FromStr for SnapshotKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Self::Full),
            "light" => Ok(Self::Light),
            _ => Err(format!("Invalid snapshot kind: {}", s)),
        }
    }
}

/// A capture of repository state taken immediately before a mutating
/// operation. An active snapshot's storage directory exists on disk;
/// cleanup flips `active` off before removing the storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: i64,
    pub project_id: i64,
    pub kind: SnapshotKind,
    pub branch: String,
    pub commit: String,
    pub storage_path: String,
    pub active: bool,
    pub created_at: String,
    /// None means the snapshot never expires (set after a failed restore
    /// so the capture is preserved for manual recovery).
    pub expires_at: Option<String>,
    pub operation_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GitOpKind {
    Commit,
    Rollback,
    BranchSwitch,
    BranchCreate,
    Backup,
    Restore,
}

impl GitOpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Rollback => "rollback",
            Self::BranchSwitch => "branch_switch",
            Self::BranchCreate => "branch_create",
            Self::Backup => "backup",
            Self::Restore => "restore",
        }
    }
}

impl FromStr for GitOpKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "commit" => Ok(Self::Commit),
            "rollback" => Ok(Self::Rollback),
            "branch_switch" => Ok(Self::BranchSwitch),
            "branch_create" => Ok(Self::BranchCreate),
            "backup" => Ok(Self::Backup),
            "restore" => Ok(Self::Restore),
            _ => Err(format!("Invalid git operation kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GitOpStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl GitOpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// `cancelled` is reachable from `pending` only; once in progress a git
    /// operation runs to `completed` or `failed`.
    pub fn is_valid_transition(from: GitOpStatus, to: GitOpStatus) -> bool {
        matches!(
            (from, to),
            (GitOpStatus::Pending, GitOpStatus::InProgress)
                | (GitOpStatus::Pending, GitOpStatus::Cancelled)
                | (GitOpStatus::InProgress, GitOpStatus::Completed)
                | (GitOpStatus::InProgress, GitOpStatus::Failed)
        )
    }
}

impl FromStr for GitOpStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid git operation status: {}", s)),
        }
    }
}

/// Audit record of one git action against a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitOperation {
    pub id: i64,
    pub project_id: i64,
    pub kind: GitOpKind,
    pub status: GitOpStatus,
    pub pre_commit: Option<String>,
    pub post_commit: Option<String>,
    pub branch: Option<String>,
    pub files_affected: Vec<String>,
    pub message: Option<String>,
    pub error: Option<String>,
    pub snapshot_id: Option<i64>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Success,
    Debug,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Success => "success",
            Self::Debug => "debug",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "success" => Ok(Self::Success),
            "debug" => Ok(Self::Debug),
            _ => Err(format!("Invalid log level: {}", s)),
        }
    }
}

/// One line of task output as carried by the log bus. `seq` is dense and
/// strictly increasing per task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub task_id: i64,
    pub seq: u64,
    pub timestamp: String,
    pub level: LogLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
}

impl LogRecord {
    pub fn new(task_id: i64, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            task_id,
            seq: 0,
            timestamp: crate::now_rfc3339(),
            level,
            message: message.into(),
            source: None,
            progress: None,
        }
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.source = Some(source.to_string());
        self
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }
}
