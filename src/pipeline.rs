//! The build pipeline: validate → acquire → pre-flight git → extract →
//! name check → replace → gradle → harvest → release.
//!
//! Stage failures abort the remainder and trigger recovery, with two
//! deliberate exceptions: a Gradle non-zero exit and a zero-APK harvest
//! leave the resource change on disk so the user can inspect it and then
//! commit or roll back explicitly. Cancellation is observed at stage
//! boundaries and at every Gradle read iteration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::db::DbHandle;
use crate::errors::{Error, Result};
use crate::extract::ArchiveExtractor;
use crate::gitsafe::{self, GitSafety};
use crate::gradle::GradleRunner;
use crate::guard::{GuardOptions, ProjectHandle, RepoGuard};
use crate::logbus::LogBus;
use crate::models::{ArtifactKind, BuildTask, LogLevel, Project, SnapshotKind, TaskKind};
use crate::runtime::{TaskContext, TaskExecutor};

/// Asset root inside the project, relative to its checkout.
pub const APPS_ROOT: &str = "app/src/main/assets/apps";
/// Where gradle drops APKs, relative to the checkout.
pub const APK_OUTPUT_ROOT: &str = "app/build/outputs/apk";

/// Progress milestones, one per stage. Gradle interpolates 45..85.
const PROGRESS_VALIDATE: u8 = 5;
const PROGRESS_SNAPSHOT: u8 = 10;
const PROGRESS_BRANCH: u8 = 15;
const PROGRESS_EXTRACT: u8 = 25;
const PROGRESS_REPLACE: u8 = 40;
const PROGRESS_GRADLE_START: u8 = 45;
const PROGRESS_GRADLE_END: u8 = 85;
const PROGRESS_HARVEST: u8 = 90;

/// Damping constant for the asymptotic 45→85 ramp: Gradle does not announce
/// a task total up front, so progress approaches 85 as `> Task :` lines
/// accumulate and never overshoots.
const GRADLE_PROGRESS_DAMPING: u64 = 24;

pub struct BuildPipeline {
    db: DbHandle,
    bus: LogBus,
    guard: Arc<RepoGuard>,
    gitsafe: Arc<GitSafety>,
    config: ServerConfig,
}

/// What the stages accumulated, for the task's result record.
#[derive(Default)]
struct StageOutcome {
    top_level: Option<String>,
    files_replaced: Option<usize>,
    gradle_exit: Option<i32>,
    artifact_count: usize,
    snapshot_id: Option<i64>,
    /// Once the gradle exit status is known, stage failures no longer
    /// trigger git recovery.
    gradle_finished: bool,
}

impl BuildPipeline {
    pub fn new(
        db: DbHandle,
        bus: LogBus,
        guard: Arc<RepoGuard>,
        gitsafe: Arc<GitSafety>,
        config: ServerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            bus,
            guard,
            gitsafe,
            config,
        })
    }

    /// Adapter for the task runtime's executor seam.
    pub fn executor(self: &Arc<Self>) -> TaskExecutor {
        let pipeline = Arc::clone(self);
        Arc::new(move |task, ctx| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move { pipeline.run(task, ctx).await })
        })
    }

    async fn run(self: Arc<Self>, task: BuildTask, ctx: TaskContext) -> Result<serde_json::Value> {
        let project_id = task.project_id;
        let project = self
            .db
            .call(move |db| db.get_project(project_id))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?
            .ok_or_else(|| Error::Internal(format!("project {} not found", project_id)))?;

        // Stage 1: validate, before taking the lease. This task is already
        // running, so any second non-terminal row is a foreign one.
        let active = self
            .db
            .call(move |db| db.count_non_terminal_tasks(project_id))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;
        if active > 1 {
            return Err(Error::Internal(format!(
                "project {} has another non-terminal task",
                project_id
            )));
        }
        self.validate(&task, &project)?;
        self.milestone(&ctx, PROGRESS_VALIDATE, "validation passed");
        ctx.check_cancelled()?;

        // Stage 2: acquire. Everything else runs under the lease.
        let pipeline = Arc::clone(&self);
        let task_clone = task.clone();
        let ctx_clone = ctx.clone();
        let project_path = PathBuf::from(&project.path);
        self.guard
            .with_project(
                project.id,
                &project_path,
                GuardOptions {
                    timeout: Duration::from_secs(self.config.limits.lock_timeout_secs),
                    require_git: false,
                },
                move |handle| async move {
                    pipeline.run_guarded(task_clone, ctx_clone, handle).await
                },
            )
            .await
    }

    fn validate(&self, task: &BuildTask, project: &Project) -> Result<()> {
        let root = Path::new(&project.path);
        if !root.is_dir() {
            return Err(Error::ProjectMissing {
                path: root.to_path_buf(),
            });
        }
        if task.kind == TaskKind::Build && !root.join("gradlew").is_file() {
            return Err(Error::ProjectMissing {
                path: root.join("gradlew"),
            });
        }
        if matches!(task.kind, TaskKind::Build | TaskKind::ResourceReplace) {
            if !root.join(APPS_ROOT).is_dir() {
                return Err(Error::ProjectMissing {
                    path: root.join(APPS_ROOT),
                });
            }
            let archive = task
                .archive_path
                .as_deref()
                .ok_or_else(|| Error::Internal("task has no archive".into()))?;
            let archive = Path::new(archive);
            if !archive.is_file() {
                return Err(crate::errors::ExtractError::NotFound {
                    path: archive.to_path_buf(),
                }
                .into());
            }
            let extension = archive
                .extension()
                .and_then(|e| e.to_str())
                .map(str::to_lowercase)
                .unwrap_or_default();
            if !matches!(extension.as_str(), "zip" | "rar" | "7z") {
                return Err(crate::errors::ExtractError::UnsupportedFormat { extension }.into());
            }
        }
        Ok(())
    }

    async fn run_guarded(
        self: Arc<Self>,
        task: BuildTask,
        ctx: TaskContext,
        handle: ProjectHandle,
    ) -> Result<serde_json::Value> {
        let mut outcome = StageOutcome::default();
        match self.run_stages(&task, &ctx, &handle, &mut outcome).await {
            Ok(()) => {
                self.log(&ctx, LogLevel::Success, "build pipeline finished");
                Ok(outcome.to_json(&task))
            }
            Err(e) => {
                if self.should_recover(&e, &outcome) {
                    self.recover(&ctx, &handle, outcome.snapshot_id).await;
                } else if outcome.gradle_finished && !e.is_cancellation() {
                    self.log(
                        &ctx,
                        LogLevel::Warning,
                        "resource change kept on disk for inspection; commit or roll back explicitly",
                    );
                }
                Err(e)
            }
        }
    }

    async fn run_stages(
        &self,
        task: &BuildTask,
        ctx: &TaskContext,
        handle: &ProjectHandle,
        outcome: &mut StageOutcome,
    ) -> Result<()> {
        // Stage 3: pre-flight git.
        if handle.is_git_repository() {
            if task.config.snapshot {
                let (_op, snapshot) = self
                    .gitsafe
                    .backup(
                        handle,
                        SnapshotKind::Full,
                        Some(self.config.limits.preflight_snapshot_ttl_days),
                    )
                    .await?;
                outcome.snapshot_id = Some(snapshot.id);
                self.milestone(ctx, PROGRESS_SNAPSHOT, "pre-flight snapshot captured");
            }
            if handle.current_branch()? != task.branch {
                self.gitsafe
                    .checkout_branch(handle, &task.branch, false)
                    .await?;
            }
            self.milestone(ctx, PROGRESS_BRANCH, &format!("on branch {}", task.branch));
        }
        ctx.check_cancelled()?;

        if matches!(task.kind, TaskKind::Build | TaskKind::ResourceReplace) {
            // Stage 4: extract.
            let staging = tempfile::Builder::new()
                .prefix("apkwright-extract-")
                .tempdir_in(&self.config.temp_dir)
                .map_err(Error::Io)?;
            let archive = PathBuf::from(task.archive_path.as_deref().unwrap_or_default());
            let extracted = ArchiveExtractor::extract(&archive, staging.path()).await?;
            self.milestone(
                ctx,
                PROGRESS_EXTRACT,
                &format!(
                    "extracted '{}' ({} files)",
                    extracted.top_level_name, extracted.total_files
                ),
            );
            ctx.check_cancelled()?;

            // Stage 5: name check, strict equality against apps/.
            let apps_root = handle.path.join(APPS_ROOT);
            let candidates = list_package_dirs(&apps_root)?;
            if !candidates.contains(&extracted.top_level_name) {
                return Err(Error::ResourcePackageMismatch {
                    package: extracted.top_level_name.clone(),
                    candidates,
                });
            }

            // Stage 6: replace via staging directory + rename swap.
            let source = staging.path().join(&extracted.top_level_name);
            let files_replaced = self
                .replace_package(&apps_root, &extracted.top_level_name, &source)
                .await?;
            outcome.top_level = Some(extracted.top_level_name.clone());
            outcome.files_replaced = Some(files_replaced);
            self.milestone(
                ctx,
                PROGRESS_REPLACE,
                &format!(
                    "replaced apps/{} ({} files)",
                    extracted.top_level_name, files_replaced
                ),
            );
            ctx.check_cancelled()?;
        }

        if task.kind == TaskKind::Build {
            // Stage 7: gradle.
            let exit = self.run_gradle(task, ctx, handle).await?;
            outcome.gradle_finished = true;
            outcome.gradle_exit = Some(exit);
            if exit != 0 {
                return Err(Error::GradleExitNonZero { code: exit });
            }
            self.log(ctx, LogLevel::Success, "gradle build succeeded");
        }

        if matches!(task.kind, TaskKind::Build | TaskKind::ExtractApk) {
            // Stage 8: harvest.
            let artifacts = self.harvest(ctx.task_id, &handle.path, false).await?;
            outcome.artifact_count = artifacts;
            self.milestone(
                ctx,
                PROGRESS_HARVEST,
                &format!("harvested {} artifact(s)", artifacts),
            );
            if artifacts == 0 {
                if task.kind == TaskKind::ExtractApk {
                    // Mark as gradle-finished so the no-artifact failure is
                    // not treated as a recoverable infrastructure fault.
                    outcome.gradle_finished = true;
                }
                return Err(Error::NoArtifacts {
                    search_root: handle.path.join(APK_OUTPUT_ROOT),
                });
            }
        }
        Ok(())
    }

    // ── Gradle supervision ────────────────────────────────────────────

    async fn run_gradle(
        &self,
        task: &BuildTask,
        ctx: &TaskContext,
        handle: &ProjectHandle,
    ) -> Result<i32> {
        let args: Vec<String> = task
            .config
            .gradle_args
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let env: HashMap<String, String> = task.config.env.clone();

        self.log(
            ctx,
            LogLevel::Info,
            format!("starting gradle: ./gradlew {}", args.join(" ")),
        );
        let mut build = GradleRunner::spawn(&handle.path, &args, &env)?;
        self.milestone(ctx, PROGRESS_GRADLE_START, "gradle started");

        let grace = Duration::from_secs(self.config.limits.gradle_grace_secs);
        let idle_limit = Duration::from_secs(self.config.limits.gradle_idle_timeout_secs);
        let mut tasks_seen: u64 = 0;

        loop {
            tokio::select! {
                maybe_line = build.lines.recv() => match maybe_line {
                    Some(line) => {
                        if line.starts_with("> Task :") {
                            tasks_seen += 1;
                            ctx.runtime
                                .update_progress(ctx.task_id, gradle_progress(tasks_seen));
                        }
                        let level = classify_gradle_line(&line);
                        self.bus.publish(
                            crate::models::LogRecord::new(ctx.task_id, level, line)
                                .with_source("gradle"),
                        );
                    }
                    // Both streams at EOF; the exit status can now settle.
                    None => break,
                },
                _ = ctx.cancel.cancelled() => {
                    self.log(ctx, LogLevel::Warning, "cancellation requested; terminating gradle");
                    let _ = build.process.terminate(grace).await;
                    // Partially written APKs are recorded for inspection but
                    // never promoted.
                    let _ = self.harvest(ctx.task_id, &handle.path, true).await;
                    return Err(ctx.cancel_error());
                }
                _ = tokio::time::sleep(idle_limit) => {
                    self.log(
                        ctx,
                        LogLevel::Error,
                        format!(
                            "no gradle output for {}s; terminating",
                            idle_limit.as_secs()
                        ),
                    );
                    let _ = build.process.terminate(grace).await;
                    let _ = self.harvest(ctx.task_id, &handle.path, true).await;
                    return Err(Error::Timeout {
                        limit_secs: idle_limit.as_secs(),
                    });
                }
            }
        }

        let exit = build.process.wait().await?;
        info!(task_id = ctx.task_id, exit, "gradle exited");
        Ok(exit)
    }

    // ── Replace ───────────────────────────────────────────────────────

    /// Copy into a sibling staging directory first, then swap by rename, so
    /// a crash mid-copy leaves the previous directory intact.
    async fn replace_package(
        &self,
        apps_root: &Path,
        name: &str,
        source: &Path,
    ) -> Result<usize> {
        let apps_root = apps_root.to_path_buf();
        let name = name.to_string();
        let source = source.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let nonce = uuid::Uuid::new_v4().simple().to_string();
            let staging = apps_root.join(format!(".{}.staging-{}", name, nonce));
            let retired = apps_root.join(format!(".{}.old-{}", name, nonce));
            let target = apps_root.join(&name);

            gitsafe::copy_dir_recursive(&source, &staging)?;
            let files = count_files(&staging);

            std::fs::rename(&target, &retired)?;
            if let Err(e) = std::fs::rename(&staging, &target) {
                // Swap back; the old tree must survive a failed swap.
                let _ = std::fs::rename(&retired, &target);
                let _ = std::fs::remove_dir_all(&staging);
                return Err(Error::Io(e));
            }
            std::fs::remove_dir_all(&retired)?;
            Ok(files)
        })
        .await
        .map_err(|e| Error::Internal(format!("replace task failed: {}", e)))?
    }

    // ── Harvest ───────────────────────────────────────────────────────

    /// Scan the APK output tree, hash each file, and record artifacts.
    /// Returns how many were recorded.
    async fn harvest(&self, task_id: i64, project_path: &Path, partial: bool) -> Result<usize> {
        let root = project_path.join(APK_OUTPUT_ROOT);
        let apks = tokio::task::spawn_blocking(move || find_apks(&root))
            .await
            .map_err(|e| Error::Internal(format!("harvest task failed: {}", e)))?;

        let mut recorded = 0;
        for path in apks {
            let bytes = tokio::fs::read(&path).await?;
            let size = bytes.len() as i64;
            let sha256 = hex_digest(&bytes);
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let variant = variant_from_path(&path);
            let path_str = path.to_string_lossy().to_string();

            self.db
                .call(move |db| {
                    db.append_artifact(
                        task_id,
                        &file_name,
                        &path_str,
                        size,
                        &sha256,
                        ArtifactKind::Apk,
                        variant.as_deref(),
                        partial,
                    )
                })
                .await
                .map_err(|e| Error::Internal(e.to_string()))?;
            recorded += 1;
        }
        Ok(recorded)
    }

    // ── Recovery ──────────────────────────────────────────────────────

    fn should_recover(&self, error: &Error, outcome: &StageOutcome) -> bool {
        if outcome.gradle_finished || error.is_cancellation() {
            return false;
        }
        !matches!(
            error,
            Error::GradleExitNonZero { .. } | Error::NoArtifacts { .. }
        )
    }

    /// Reset the working tree; if that leaves residue (for example a
    /// half-renamed replacement), fall back to restoring the pre-flight
    /// snapshot wholesale.
    async fn recover(&self, ctx: &TaskContext, handle: &ProjectHandle, snapshot_id: Option<i64>) {
        if !handle.is_git_repository() {
            return;
        }
        self.log(ctx, LogLevel::Warning, "stage failed; recovering working tree");

        let reset_ok = match self.gitsafe.reset_working_tree(handle).await {
            Ok(_) => handle.dirty_file_count().map(|n| n == 0).unwrap_or(false),
            Err(e) => {
                warn!(task_id = ctx.task_id, error = %e, "working tree reset failed");
                false
            }
        };
        if reset_ok {
            self.log(ctx, LogLevel::Info, "working tree reset to pre-flight state");
            return;
        }

        let Some(snapshot_id) = snapshot_id else {
            self.log(
                ctx,
                LogLevel::Error,
                "recovery incomplete and no snapshot available",
            );
            return;
        };
        match self.gitsafe.restore_snapshot(handle, snapshot_id, true).await {
            Ok(_) => self.log(ctx, LogLevel::Info, "restored pre-flight snapshot"),
            Err(e) => self.log(
                ctx,
                LogLevel::Error,
                format!("snapshot restore failed, snapshot preserved: {}", e),
            ),
        }
    }

    // ── Logging helpers ───────────────────────────────────────────────

    fn milestone(&self, ctx: &TaskContext, progress: u8, message: &str) {
        ctx.runtime.update_progress(ctx.task_id, progress);
        self.bus.publish(
            crate::models::LogRecord::new(ctx.task_id, LogLevel::Info, message)
                .with_source("pipeline")
                .with_progress(progress),
        );
    }

    fn log(&self, ctx: &TaskContext, level: LogLevel, message: impl Into<String>) {
        self.bus.log(ctx.task_id, level, message, "pipeline");
    }
}

impl StageOutcome {
    fn to_json(&self, task: &BuildTask) -> serde_json::Value {
        serde_json::json!({
            "kind": task.kind.as_str(),
            "top_level": self.top_level,
            "files_replaced": self.files_replaced,
            "gradle_exit": self.gradle_exit,
            "artifact_count": self.artifact_count,
            "snapshot_id": self.snapshot_id,
        })
    }
}

/// Directory names directly under `apps/`, sorted for stable error output.
fn list_package_dirs(apps_root: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(apps_root)? {
        let entry = entry?;
        if entry.path().is_dir() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with('.') {
                names.push(name);
            }
        }
    }
    names.sort();
    Ok(names)
}

fn classify_gradle_line(line: &str) -> LogLevel {
    let trimmed = line.trim_start();
    if trimmed.starts_with("FAILURE:")
        || trimmed.starts_with("ERROR")
        || trimmed.contains("BUILD FAILED")
    {
        LogLevel::Error
    } else if trimmed.starts_with("WARNING:") || trimmed.starts_with("w:") {
        LogLevel::Warning
    } else if trimmed.contains("BUILD SUCCESSFUL") {
        LogLevel::Success
    } else {
        LogLevel::Info
    }
}

/// 45→85 ramp over observed `> Task :` lines.
fn gradle_progress(tasks_seen: u64) -> u8 {
    let span = (PROGRESS_GRADLE_END - PROGRESS_GRADLE_START) as u64;
    let ramp = span * tasks_seen / (tasks_seen + GRADLE_PROGRESS_DAMPING);
    PROGRESS_GRADLE_START + ramp as u8
}

fn find_apks(root: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if path.extension().and_then(|e| e.to_str()) == Some("apk") {
                    found.push(path);
                }
            }
        }
    }
    found.sort();
    found
}

fn count_files(root: &Path) -> usize {
    let mut count = 0;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    count += 1;
                }
            }
        }
    }
    count
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// `.../apk/release/app-release.apk` → `release`.
fn variant_from_path(path: &Path) -> Option<String> {
    let mut components: Vec<String> = path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    components.pop()?; // file name
    let apk_idx = components.iter().rposition(|c| c == "apk")?;
    let tail = &components[apk_idx + 1..];
    if tail.is_empty() {
        None
    } else {
        Some(tail.join("/"))
    }
}
