use std::path::PathBuf;

use anyhow::{Context, Result};

/// Server configuration. Paths default to subdirectories of the data dir;
/// tunables default to the values the pipeline and bus were designed around.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    /// Snapshot store root; snapshots live at `<root>/<project-id>/<uuid>/`.
    pub snapshots_dir: PathBuf,
    /// Staging area for uploaded archives (owned by the transport shell).
    pub uploads_dir: PathBuf,
    /// Staging for extraction and rename-in-place copies.
    pub temp_dir: PathBuf,
    pub dev_mode: bool,
    pub limits: Limits,
}

/// Tunables with the defaults the rest of the system assumes.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Max concurrently running tasks across the whole process.
    pub max_running_tasks: usize,
    /// Per-run deadline; exceeding it fails the task with kind `timeout`.
    pub task_deadline_secs: u64,
    /// How long a pipeline waits for the project lock.
    pub lock_timeout_secs: u64,
    /// Git lock files older than this are cleared automatically.
    pub stale_lock_max_age_secs: u64,
    /// Grace between cooperative termination and SIGKILL of the Gradle group.
    pub gradle_grace_secs: u64,
    /// Inactivity watchdog: no Gradle output for this long cancels the build.
    pub gradle_idle_timeout_secs: u64,
    pub log_ring_capacity: usize,
    pub subscriber_buffer: usize,
    pub heartbeat_secs: u64,
    /// How long a closed task stream keeps serving its replay.
    pub stream_grace_secs: u64,
    /// Subscriber drop count past which the stream emits `limit_reached`.
    pub drop_warn_threshold: u64,
    pub preflight_snapshot_ttl_days: i64,
    pub backup_snapshot_ttl_days: i64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_running_tasks: 3,
            task_deadline_secs: 30 * 60,
            lock_timeout_secs: 30,
            stale_lock_max_age_secs: 10 * 60,
            gradle_grace_secs: 10,
            gradle_idle_timeout_secs: 10 * 60,
            log_ring_capacity: 2_000,
            subscriber_buffer: 128,
            heartbeat_secs: 15,
            stream_grace_secs: 60,
            drop_warn_threshold: 1_000,
            preflight_snapshot_ttl_days: 7,
            backup_snapshot_ttl_days: 30,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::with_data_dir(PathBuf::from(".apkwright"))
    }
}

impl ServerConfig {
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            port: 3456,
            db_path: data_dir.join("apkwright.db"),
            snapshots_dir: data_dir.join("snapshots"),
            uploads_dir: data_dir.join("uploads"),
            temp_dir: std::env::temp_dir().join("apkwright"),
            data_dir,
            dev_mode: false,
            limits: Limits::default(),
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir).context("Failed to create data directory")?;
        std::fs::create_dir_all(&self.snapshots_dir)
            .context("Failed to create snapshot directory")?;
        std::fs::create_dir_all(&self.uploads_dir).context("Failed to create upload directory")?;
        std::fs::create_dir_all(&self.temp_dir).context("Failed to create temp directory")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_paths_derive_from_data_dir() {
        let config = ServerConfig::with_data_dir(PathBuf::from("/var/lib/apkwright"));
        assert_eq!(config.db_path, PathBuf::from("/var/lib/apkwright/apkwright.db"));
        assert_eq!(
            config.snapshots_dir,
            PathBuf::from("/var/lib/apkwright/snapshots")
        );
        assert_eq!(
            config.uploads_dir,
            PathBuf::from("/var/lib/apkwright/uploads")
        );
    }

    #[test]
    fn test_default_limits() {
        let limits = Limits::default();
        assert_eq!(limits.max_running_tasks, 3);
        assert_eq!(limits.task_deadline_secs, 1800);
        assert_eq!(limits.log_ring_capacity, 2000);
        assert_eq!(limits.subscriber_buffer, 128);
        assert_eq!(limits.heartbeat_secs, 15);
        assert_eq!(limits.stream_grace_secs, 60);
        assert_eq!(limits.gradle_grace_secs, 10);
    }

    #[test]
    fn test_ensure_directories_creates_tree() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::with_data_dir(dir.path().join("data"));
        config.ensure_directories().unwrap();
        assert!(config.snapshots_dir.is_dir());
        assert!(config.uploads_dir.is_dir());
    }
}
