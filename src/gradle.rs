//! Gradle wrapper supervision.
//!
//! Spawns the project's own `./gradlew` in its own process group, merges
//! stdout and stderr into a single line channel, and exposes group-wide
//! termination: cooperative signal first, SIGKILL after the grace period.
//! Gradle forks daemon and worker processes that a plain child kill would
//! orphan. `wait` resolves only after both streams have hit EOF.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::errors::{Error, Result};

/// Environment kept from the parent process. Everything else is dropped so a
/// build sees only these plus the project's configured variables.
const INHERITED_ENV: &[&str] = &[
    "PATH",
    "HOME",
    "JAVA_HOME",
    "ANDROID_HOME",
    "ANDROID_SDK_ROOT",
    "GRADLE_USER_HOME",
    "TMPDIR",
];

pub struct GradleRunner;

impl GradleRunner {
    /// Spawn `./gradlew <args>` with `project_dir` as the working directory.
    pub fn spawn(
        project_dir: &Path,
        args: &[String],
        extra_env: &HashMap<String, String>,
    ) -> Result<RunningBuild> {
        let wrapper = project_dir.join("gradlew");
        if !wrapper.is_file() {
            return Err(Error::ProjectMissing {
                path: wrapper.clone(),
            });
        }

        let mut cmd = Command::new(&wrapper);
        cmd.args(args)
            .current_dir(project_dir)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for key in INHERITED_ENV {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        for (key, value) in extra_env {
            cmd.env(key, value);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn()?;
        debug!(wrapper = %wrapper.display(), ?args, "spawned gradle wrapper");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("gradle stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Internal("gradle stderr not captured".into()))?;

        // Line-merge both streams. Each reader holds a sender clone; the
        // channel closes once both hit EOF, which is the drain signal.
        let (tx, rx) = mpsc::channel::<String>(256);
        let tx_err = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx_err.send(line).await.is_err() {
                    break;
                }
            }
        });

        let pid = child.id();
        Ok(RunningBuild {
            lines: rx,
            process: ProcessHandle { child, pid },
        })
    }
}

/// A live build: a merged line stream plus the process handle. The two
/// halves are separate fields so a supervisor can poll lines and terminate
/// the process without borrow conflicts.
#[derive(Debug)]
pub struct RunningBuild {
    pub lines: mpsc::Receiver<String>,
    pub process: ProcessHandle,
}

#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pid: Option<u32>,
}

impl ProcessHandle {
    /// Wait for process exit. Call after the line channel has drained; the
    /// combination satisfies "exit code known and both streams at EOF".
    pub async fn wait(&mut self) -> Result<i32> {
        let status = self.child.wait().await?;
        Ok(status.code().unwrap_or(-1))
    }

    /// Cooperative termination: signal the whole process group, give it the
    /// grace period, then kill the group.
    pub async fn terminate(&mut self, grace: Duration) -> Result<i32> {
        self.signal_group(libc_sigterm());
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => Ok(status?.code().unwrap_or(-1)),
            Err(_) => {
                warn!(pid = ?self.pid, "gradle ignored termination; killing process group");
                self.signal_group(libc_sigkill());
                // start_kill is the portable fallback when group signalling
                // is unavailable.
                let _ = self.child.start_kill();
                let status = self.child.wait().await?;
                Ok(status.code().unwrap_or(-1))
            }
        }
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: i32) {
        if let Some(pid) = self.pid {
            unsafe {
                libc::kill(-(pid as i32), signal);
            }
        }
    }

    #[cfg(not(unix))]
    fn signal_group(&self, _signal: i32) {}
}

#[cfg(unix)]
fn libc_sigterm() -> i32 {
    libc::SIGTERM
}

#[cfg(unix)]
fn libc_sigkill() -> i32 {
    libc::SIGKILL
}

#[cfg(not(unix))]
fn libc_sigterm() -> i32 {
    0
}

#[cfg(not(unix))]
fn libc_sigkill() -> i32 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;

    /// Drop a fake `gradlew` script into `dir`.
    fn fake_gradlew(dir: &Path, body: &str) {
        let path = dir.join("gradlew");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        #[cfg(unix)]
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    async fn drain(build: &mut RunningBuild) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = build.lines.recv().await {
            lines.push(line);
        }
        lines
    }

    #[tokio::test]
    async fn test_merged_line_stream_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        fake_gradlew(
            dir.path(),
            "echo 'out one'\necho 'err one' >&2\necho 'out two'",
        );

        let mut build =
            GradleRunner::spawn(dir.path(), &["assembleRelease".to_string()], &HashMap::new())
                .unwrap();
        let lines = drain(&mut build).await;
        let code = build.process.wait().await.unwrap();

        assert_eq!(code, 0);
        assert!(lines.contains(&"out one".to_string()));
        assert!(lines.contains(&"err one".to_string()));
        assert!(lines.contains(&"out two".to_string()));
    }

    #[tokio::test]
    async fn test_nonzero_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        fake_gradlew(dir.path(), "echo 'BUILD FAILED'\nexit 3");

        let mut build = GradleRunner::spawn(dir.path(), &[], &HashMap::new()).unwrap();
        let lines = drain(&mut build).await;
        let code = build.process.wait().await.unwrap();

        assert_eq!(code, 3);
        assert_eq!(lines, vec!["BUILD FAILED".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_wrapper_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = GradleRunner::spawn(dir.path(), &[], &HashMap::new()).unwrap_err();
        assert_eq!(err.kind(), "project_missing");
    }

    #[tokio::test]
    async fn test_extra_env_reaches_child() {
        let dir = tempfile::tempdir().unwrap();
        fake_gradlew(dir.path(), "echo \"flavor=$BUILD_FLAVOR\"");

        let mut env = HashMap::new();
        env.insert("BUILD_FLAVOR".to_string(), "beta".to_string());
        let mut build = GradleRunner::spawn(dir.path(), &[], &env).unwrap();
        let lines = drain(&mut build).await;
        build.process.wait().await.unwrap();
        assert_eq!(lines, vec!["flavor=beta".to_string()]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_kills_sleeping_build() {
        let dir = tempfile::tempdir().unwrap();
        fake_gradlew(dir.path(), "echo started\nsleep 60");

        let mut build = GradleRunner::spawn(dir.path(), &[], &HashMap::new()).unwrap();
        // First line proves the process is up.
        assert_eq!(build.lines.recv().await.unwrap(), "started");

        let begin = std::time::Instant::now();
        let code = build
            .process
            .terminate(Duration::from_secs(2))
            .await
            .unwrap();
        assert!(begin.elapsed() < Duration::from_secs(10));
        // Killed by signal: no clean zero exit.
        assert_ne!(code, 0);
    }
}
