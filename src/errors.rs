//! Typed error hierarchy for the build server.
//!
//! Two enums cover the two error surfaces:
//! - `Error`: the closed taxonomy of failure kinds shared by the guard,
//!   the git layer, the task runtime, and the pipeline. `kind()` returns a
//!   stable string that the HTTP layer and the task records persist.
//! - `ExtractError`: archive extractor failures; the pipeline folds these
//!   into `Error::ExtractorFailure`.

use std::path::PathBuf;
use thiserror::Error;

/// Failure kinds of the build-orchestration core.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Project path missing or not a directory: {path}")]
    ProjectMissing { path: PathBuf },

    #[error("Not a git repository: {path}")]
    NotARepository { path: PathBuf },

    #[error("HEAD is detached; check out a branch first")]
    DetachedHead,

    #[error("Working tree has uncommitted changes ({files} files)")]
    WorkingTreeDirty { files: usize },

    #[error("Stale git lock file present: {path}")]
    StaleLock { path: PathBuf },

    #[error("Timed out waiting for the project lock after {waited_secs}s")]
    LockTimeout { waited_secs: u64 },

    #[error(
        "Resource package '{package}' does not match any directory under apps/ (candidates: {})",
        .candidates.join(", ")
    )]
    ResourcePackageMismatch {
        package: String,
        candidates: Vec<String>,
    },

    #[error("Archive extraction failed: {0}")]
    ExtractorFailure(#[from] ExtractError),

    #[error("Gradle exited with code {code}")]
    GradleExitNonZero { code: i32 },

    #[error("Task exceeded its deadline of {limit_secs}s")]
    Timeout { limit_secs: u64 },

    #[error("Task was cancelled")]
    Cancelled,

    #[error("Gradle succeeded but produced no APK artifacts under {search_root}")]
    NoArtifacts { search_root: PathBuf },

    #[error("Task was abandoned by a server restart")]
    Abandoned,

    #[error("Snapshot {id} not found or no longer on disk")]
    SnapshotMissing { id: i64 },

    #[error("Snapshot restore failed: {message}")]
    RestoreFailed { message: String },

    #[error("Branch '{branch}' not found")]
    BranchNotFound { branch: String },

    // Carrier variants for faults outside the closed taxonomy. These are
    // internal errors as far as the HTTP layer is concerned.
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Stable kind name, persisted on failed task and operation records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ProjectMissing { .. } => "project_missing",
            Self::NotARepository { .. } => "not_a_repository",
            Self::DetachedHead => "detached_head",
            Self::WorkingTreeDirty { .. } => "working_tree_dirty",
            Self::StaleLock { .. } => "stale_lock",
            Self::LockTimeout { .. } => "lock_timeout",
            Self::ResourcePackageMismatch { .. } => "resource_package_mismatch",
            Self::ExtractorFailure(_) => "extractor_failure",
            Self::GradleExitNonZero { .. } => "gradle_exit_non_zero",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
            Self::NoArtifacts { .. } => "no_artifacts",
            Self::Abandoned => "abandoned",
            Self::SnapshotMissing { .. } => "snapshot_missing",
            Self::RestoreFailed { .. } => "restore_failed",
            Self::BranchNotFound { .. } => "branch_not_found",
            Self::Git(_) | Self::Io(_) | Self::Internal(_) => "internal",
        }
    }

    /// True for the two terminal kinds produced by the cancellation pathway.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Archive extractor failures. Folded into [`Error::ExtractorFailure`]
/// by the pipeline.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Archive not found: {path}")]
    NotFound { path: PathBuf },

    #[error("Unsupported archive format: {extension}")]
    UnsupportedFormat { extension: String },

    #[error("Archive is corrupt or unreadable: {message}")]
    Corrupt { message: String },

    #[error("Archive entry escapes the extraction directory: {entry}")]
    PathTraversal { entry: String },

    #[error("Archive has no usable top-level directory")]
    NoTopLevel,

    #[error("Archive has multiple top-level entries: {}", .entries.join(", "))]
    MultipleTopLevel { entries: Vec<String> },

    #[error("Extractor binary '{tool}' is not available: {message}")]
    ToolUnavailable { tool: String, message: String },
}
