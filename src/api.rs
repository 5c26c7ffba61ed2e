use std::path::Path as FsPath;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;

use crate::config::ServerConfig;
use crate::db::DbHandle;
use crate::errors::Error;
use crate::gitsafe::{self, GitSafety};
use crate::guard::{GuardOptions, RepoGuard};
use crate::logbus::LogBus;
use crate::models::{GitOpKind, Project, SnapshotKind, TaskConfig, TaskKind};
use crate::runtime::TaskRuntime;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub bus: LogBus,
    pub runtime: TaskRuntime,
    pub guard: Arc<RepoGuard>,
    pub gitsafe: Arc<GitSafety>,
    pub config: ServerConfig,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    pub path: String,
    pub description: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateProjectRequest {
    pub name: Option<String>,
    pub description: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateTaskRequest {
    pub kind: Option<String>,
    pub branch: String,
    pub archive_path: Option<String>,
    pub config: Option<TaskConfig>,
}

#[derive(Deserialize)]
pub struct CommitRequest {
    pub message: String,
    pub paths: Option<Vec<String>>,
    pub allow_empty: Option<bool>,
    pub snapshot: Option<bool>,
}

#[derive(Deserialize)]
pub struct RollbackRequest {
    pub target_commit: String,
    pub snapshot: Option<bool>,
}

#[derive(Deserialize)]
pub struct BackupRequest {
    pub kind: Option<String>,
    pub ttl_days: Option<i64>,
}

#[derive(Deserialize)]
pub struct RestoreRequest {
    pub force: Option<bool>,
}

#[derive(Deserialize)]
struct OperationsQuery {
    kind: Option<String>,
    limit: Option<i64>,
}

#[derive(Deserialize)]
struct CommitsQuery {
    limit: Option<usize>,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Locked(String),
    Internal(String),
}

impl ApiError {
    fn parts(self) -> (StatusCode, String) {
        match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, msg),
            Self::Locked(msg) => (StatusCode::LOCKED, msg),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = self.parts();
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err.to_string())
    }
}

/// The single place core error kinds become HTTP statuses. The transport is
/// free to choose codes; the kinds themselves are stable.
impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let message = format!("{} ({})", err, err.kind());
        match &err {
            Error::ProjectMissing { .. }
            | Error::SnapshotMissing { .. }
            | Error::BranchNotFound { .. } => ApiError::NotFound(message),
            Error::WorkingTreeDirty { .. }
            | Error::DetachedHead
            | Error::NotARepository { .. }
            | Error::StaleLock { .. }
            | Error::ResourcePackageMismatch { .. } => ApiError::Conflict(message),
            Error::LockTimeout { .. } => ApiError::Locked(message),
            Error::ExtractorFailure(_) => ApiError::BadRequest(message),
            _ => ApiError::Internal(message),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/projects", get(list_projects).post(create_project))
        .route(
            "/api/projects/:id",
            get(get_project).patch(update_project).delete(delete_project),
        )
        .route("/api/projects/:id/branches", get(list_branches))
        .route("/api/projects/:id/git/status", get(git_status))
        .route("/api/projects/:id/git/commits", get(list_commits))
        .route("/api/projects/:id/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/:id", get(get_task))
        .route("/api/tasks/:id/start", post(start_task))
        .route("/api/tasks/:id/cancel", post(cancel_task))
        .route("/api/tasks/:id/artifacts", get(list_artifacts))
        .route("/api/tasks/:id/logs/stream", get(crate::sse::stream_task_logs))
        .route("/api/projects/:id/git/commit", post(git_commit))
        .route("/api/projects/:id/git/rollback", post(git_rollback))
        .route("/api/projects/:id/git/reset", post(git_reset))
        .route("/api/projects/:id/git/backup", post(git_backup))
        .route("/api/projects/:id/git/operations", get(list_operations))
        .route("/api/projects/:id/snapshots", get(list_snapshots))
        .route("/api/snapshots/:id/restore", post(restore_snapshot))
        .route("/api/snapshots/cleanup", post(cleanup_snapshots))
        .route("/health", get(health_check))
}

// ── Helpers ───────────────────────────────────────────────────────────

async fn fetch_project(state: &SharedState, id: i64) -> Result<Project, ApiError> {
    state
        .db
        .call(move |db| db.get_project(id))
        .await?
        .filter(|p| p.active)
        .ok_or_else(|| ApiError::NotFound(format!("Project {} not found", id)))
}

fn guard_opts(state: &SharedState) -> GuardOptions {
    GuardOptions {
        timeout: Duration::from_secs(state.config.limits.lock_timeout_secs),
        require_git: true,
    }
}

// ── Handlers: health & projects ───────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_projects(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let projects = state.db.call(|db| db.list_projects()).await?;
    Ok(Json(projects))
}

async fn create_project(
    State(state): State<SharedState>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError::BadRequest("Project name is required".into()));
    }
    if !FsPath::new(&req.path).is_absolute() {
        return Err(ApiError::BadRequest(
            "Project path must be absolute".into(),
        ));
    }
    let project = state
        .db
        .call(move |db| db.create_project(&req.name, &req.path, req.description.as_deref()))
        .await
        .map_err(|e| {
            if e.to_string().contains("UNIQUE") {
                ApiError::Conflict("A project with this name already exists".into())
            } else {
                ApiError::Internal(e.to_string())
            }
        })?;
    Ok((StatusCode::CREATED, Json(project)))
}

async fn get_project(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(fetch_project(&state, id).await?))
}

async fn update_project(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    fetch_project(&state, id).await?;
    let project = state
        .db
        .call(move |db| db.update_project(id, req.name.as_deref(), req.description.as_deref()))
        .await?;
    Ok(Json(project))
}

async fn delete_project(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    match state.db.call(move |db| db.soft_delete_project(id)).await? {
        true => Ok(StatusCode::NO_CONTENT),
        false => Err(ApiError::NotFound(format!("Project {} not found", id))),
    }
}

// ── Handlers: repository reads ────────────────────────────────────────

async fn list_branches(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let project = fetch_project(&state, id).await?;
    let branches = tokio::task::spawn_blocking(move || {
        gitsafe::list_branches(FsPath::new(&project.path))
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))?
    .map_err(ApiError::from)?;
    Ok(Json(branches))
}

async fn git_status(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let project = fetch_project(&state, id).await?;
    let handle = crate::guard::ProjectHandle {
        project_id: project.id,
        path: std::path::PathBuf::from(&project.path),
    };
    let status = tokio::task::spawn_blocking(move || -> Result<serde_json::Value, Error> {
        if !handle.is_git_repository() {
            return Ok(serde_json::json!({
                "is_repository": false,
            }));
        }
        let dirty_files = handle.dirty_file_count()?;
        Ok(serde_json::json!({
            "is_repository": true,
            "branch": handle.current_branch()?,
            "head": handle.head_commit()?,
            "clean": dirty_files == 0,
            "dirty_files": dirty_files,
        }))
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))?
    .map_err(ApiError::from)?;
    Ok(Json(status))
}

async fn list_commits(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Query(query): Query<CommitsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let project = fetch_project(&state, id).await?;
    let limit = query.limit.unwrap_or(20).min(200);
    let commits = tokio::task::spawn_blocking(move || {
        gitsafe::recent_commits(FsPath::new(&project.path), limit)
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))?
    .map_err(ApiError::from)?;

    let body: Vec<serde_json::Value> = commits
        .into_iter()
        .map(|(hash, summary, author, time)| {
            serde_json::json!({
                "hash": hash,
                "summary": summary,
                "author": author,
                "time": time,
            })
        })
        .collect();
    Ok(Json(body))
}

// ── Handlers: tasks ───────────────────────────────────────────────────

async fn create_task(
    State(state): State<SharedState>,
    Path(project_id): Path<i64>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let project = fetch_project(&state, project_id).await?;

    let kind = match req.kind.as_deref() {
        None => TaskKind::Build,
        Some(s) => TaskKind::from_str(s).map_err(ApiError::BadRequest)?,
    };
    if matches!(kind, TaskKind::Build | TaskKind::ResourceReplace) && req.archive_path.is_none() {
        return Err(ApiError::BadRequest(
            "archive_path is required for this task kind".into(),
        ));
    }

    // One live task per project, full stop.
    let active = state
        .db
        .call(move |db| db.count_non_terminal_tasks(project.id))
        .await?;
    if active > 0 {
        return Err(ApiError::Conflict(format!(
            "Project {} already has an active task",
            project_id
        )));
    }

    let config = req.config.unwrap_or_default();
    let task = state
        .db
        .call(move |db| {
            db.create_task(
                project_id,
                kind,
                &req.branch,
                req.archive_path.as_deref(),
                &config,
            )
        })
        .await?;
    state.runtime.register(task.id);
    Ok((StatusCode::CREATED, Json(task)))
}

async fn list_tasks(
    State(state): State<SharedState>,
    Path(project_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    fetch_project(&state, project_id).await?;
    let tasks = state
        .db
        .call(move |db| db.list_tasks_by_project(project_id, 100))
        .await?;
    Ok(Json(tasks))
}

async fn get_task(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let mut task = state
        .db
        .call(move |db| db.get_task(id))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Task {} not found", id)))?;

    // Live state is authoritative while the task is in flight; the store
    // write-behind may lag by a beat.
    if let Some(status) = state.runtime.status(id) {
        task.status = status;
    }
    if let Some(progress) = state.runtime.progress(id) {
        task.progress = task.progress.max(progress);
    }
    Ok(Json(task))
}

async fn start_task(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .db
        .call(move |db| db.get_task(id))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Task {} not found", id)))?;
    let status = state
        .runtime
        .start(id)
        .map_err(|e| ApiError::Conflict(e.to_string()))?;
    Ok(Json(serde_json::json!({"id": id, "status": status})))
}

async fn cancel_task(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .db
        .call(move |db| db.get_task(id))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Task {} not found", id)))?;
    let status = state
        .runtime
        .cancel(id)
        .map_err(|e| ApiError::Conflict(e.to_string()))?;
    Ok(Json(serde_json::json!({"id": id, "status": status})))
}

async fn list_artifacts(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .db
        .call(move |db| db.get_task(id))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Task {} not found", id)))?;
    let artifacts = state.db.call(move |db| db.list_artifacts(id)).await?;
    Ok(Json(artifacts))
}

// ── Handlers: git operations ──────────────────────────────────────────

async fn git_commit(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<CommitRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let project = fetch_project(&state, id).await?;
    let gitsafe = Arc::clone(&state.gitsafe);
    let op = state
        .guard
        .with_project(
            project.id,
            FsPath::new(&project.path),
            guard_opts(&state),
            move |handle| async move {
                gitsafe
                    .atomic_commit(
                        &handle,
                        &req.message,
                        &req.paths.unwrap_or_default(),
                        req.allow_empty.unwrap_or(false),
                        req.snapshot.unwrap_or(true),
                    )
                    .await
            },
        )
        .await?;
    Ok(Json(op))
}

async fn git_rollback(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<RollbackRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let project = fetch_project(&state, id).await?;
    let gitsafe = Arc::clone(&state.gitsafe);
    let op = state
        .guard
        .with_project(
            project.id,
            FsPath::new(&project.path),
            guard_opts(&state),
            move |handle| async move {
                gitsafe
                    .rollback(&handle, &req.target_commit, req.snapshot.unwrap_or(true))
                    .await
            },
        )
        .await?;
    Ok(Json(op))
}

async fn git_reset(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let project = fetch_project(&state, id).await?;
    let gitsafe = Arc::clone(&state.gitsafe);
    let touched = state
        .guard
        .with_project(
            project.id,
            FsPath::new(&project.path),
            guard_opts(&state),
            move |handle| async move { gitsafe.reset_working_tree(&handle).await },
        )
        .await?;
    Ok(Json(serde_json::json!({"files_touched": touched})))
}

async fn git_backup(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<BackupRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let project = fetch_project(&state, id).await?;
    let kind = match req.kind.as_deref() {
        None => SnapshotKind::Full,
        Some(s) => SnapshotKind::from_str(s).map_err(ApiError::BadRequest)?,
    };
    let ttl = req
        .ttl_days
        .unwrap_or(state.config.limits.backup_snapshot_ttl_days);
    let gitsafe = Arc::clone(&state.gitsafe);
    let (op, snapshot) = state
        .guard
        .with_project(
            project.id,
            FsPath::new(&project.path),
            guard_opts(&state),
            move |handle| async move { gitsafe.backup(&handle, kind, Some(ttl)).await },
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({"operation": op, "snapshot": snapshot})),
    ))
}

async fn list_operations(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Query(query): Query<OperationsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    fetch_project(&state, id).await?;
    let kind = match query.kind.as_deref() {
        None => None,
        Some(s) => Some(GitOpKind::from_str(s).map_err(ApiError::BadRequest)?),
    };
    let limit = query.limit.unwrap_or(50).min(500);
    let ops = state
        .db
        .call(move |db| db.list_git_operations(id, kind, limit))
        .await?;
    Ok(Json(ops))
}

async fn list_snapshots(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    fetch_project(&state, id).await?;
    let snapshots = state
        .db
        .call(move |db| db.list_active_snapshots(id))
        .await?;
    Ok(Json(snapshots))
}

async fn restore_snapshot(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<RestoreRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state
        .db
        .call(move |db| db.get_snapshot(id))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Snapshot {} not found", id)))?;
    let project = fetch_project(&state, snapshot.project_id).await?;

    let gitsafe = Arc::clone(&state.gitsafe);
    let force = req.force.unwrap_or(false);
    let op = state
        .guard
        .with_project(
            project.id,
            FsPath::new(&project.path),
            guard_opts(&state),
            move |handle| async move { gitsafe.restore_snapshot(&handle, id, force).await },
        )
        .await?;
    Ok(Json(op))
}

async fn cleanup_snapshots(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    let removed = state.gitsafe.cleanup_expired().await?;
    Ok(Json(serde_json::json!({"removed": removed})))
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::logbus::BusConfig;
    use crate::runtime::{RuntimeConfig, TaskExecutor};
    use crate::testutil::{commit_all, init_repo};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn quick_executor() -> TaskExecutor {
        Arc::new(|_task, _ctx| Box::pin(async { Ok(serde_json::json!({"stub": true})) }))
    }

    fn test_state_with(executor: TaskExecutor, data_dir: &FsPath) -> SharedState {
        let mut config = ServerConfig::with_data_dir(data_dir.to_path_buf());
        config.temp_dir = data_dir.join("tmp");
        config.ensure_directories().unwrap();

        let db = DbHandle::new(Db::new_in_memory().unwrap());
        let bus = LogBus::new(BusConfig::default());
        let guard = Arc::new(RepoGuard::new(Duration::from_secs(600)));
        let gitsafe = Arc::new(GitSafety::new(db.clone(), config.snapshots_dir.clone()));
        let runtime = TaskRuntime::new(
            db.clone(),
            bus.clone(),
            RuntimeConfig::default(),
            executor,
        );
        Arc::new(AppState {
            db,
            bus,
            runtime,
            guard,
            gitsafe,
            config,
        })
    }

    fn test_app() -> (Router, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state_with(quick_executor(), dir.path());
        (api_router().with_state(state), dir)
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn create_project(app: &Router, name: &str, path: &str) -> serde_json::Value {
        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/projects",
                serde_json::json!({"name": name, "path": path}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        body_json(resp.into_body()).await
    }

    #[tokio::test]
    async fn test_health_check() {
        let (app, _dir) = test_app();
        let resp = app.oneshot(get_req("/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_project_crud() {
        let (app, _dir) = test_app();

        let project = create_project(&app, "demo", "/tmp/demo").await;
        assert_eq!(project["name"], "demo");
        let id = project["id"].as_i64().unwrap();

        // List contains it.
        let resp = app.clone().oneshot(get_req("/api/projects")).await.unwrap();
        let listed: Vec<serde_json::Value> = body_json(resp.into_body()).await;
        assert_eq!(listed.len(), 1);

        // Patch.
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("PATCH")
                    .uri(format!("/api/projects/{}", id))
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({"description": "updated"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let updated: serde_json::Value = body_json(resp.into_body()).await;
        assert_eq!(updated["description"], "updated");

        // Soft delete hides from listing.
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/projects/{}", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        let resp = app.clone().oneshot(get_req("/api/projects")).await.unwrap();
        let listed: Vec<serde_json::Value> = body_json(resp.into_body()).await;
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn test_create_project_validations() {
        let (app, _dir) = test_app();

        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/projects",
                serde_json::json!({"name": "", "path": "/tmp/x"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/projects",
                serde_json::json!({"name": "x", "path": "relative/path"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        create_project(&app, "dup", "/tmp/dup").await;
        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/projects",
                serde_json::json!({"name": "dup", "path": "/tmp/dup2"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_project_not_found() {
        let (app, _dir) = test_app();
        let resp = app.oneshot(get_req("/api/projects/99")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_task_create_start_and_single_active_invariant() {
        let (app, _dir) = test_app();
        let project = create_project(&app, "tasks", "/tmp/tasks").await;
        let pid = project["id"].as_i64().unwrap();

        let resp = app
            .clone()
            .oneshot(post_json(
                &format!("/api/projects/{}/tasks", pid),
                serde_json::json!({"branch": "main", "archive_path": "/tmp/pack.zip"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let task: serde_json::Value = body_json(resp.into_body()).await;
        assert_eq!(task["status"], "pending");
        assert_eq!(task["kind"], "build");
        let task_id = task["id"].as_i64().unwrap();

        // A second task for the same project is refused while one is live.
        let resp = app
            .clone()
            .oneshot(post_json(
                &format!("/api/projects/{}/tasks", pid),
                serde_json::json!({"branch": "main", "archive_path": "/tmp/pack.zip"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        // Start it; the stub executor completes immediately.
        let resp = app
            .clone()
            .oneshot(post_json(&format!("/api/tasks/{}/start", task_id), serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        // Eventually reported completed via GET (runtime overlay).
        for _ in 0..200 {
            let resp = app
                .clone()
                .oneshot(get_req(&format!("/api/tasks/{}", task_id)))
                .await
                .unwrap();
            let task: serde_json::Value = body_json(resp.into_body()).await;
            if task["status"] == "completed" {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task never completed");
    }

    #[tokio::test]
    async fn test_task_requires_archive_for_build_kinds() {
        let (app, _dir) = test_app();
        let project = create_project(&app, "noarch", "/tmp/noarch").await;
        let pid = project["id"].as_i64().unwrap();

        let resp = app
            .clone()
            .oneshot(post_json(
                &format!("/api/projects/{}/tasks", pid),
                serde_json::json!({"branch": "main"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        // extract_apk needs no archive.
        let resp = app
            .clone()
            .oneshot(post_json(
                &format!("/api/projects/{}/tasks", pid),
                serde_json::json!({"branch": "main", "kind": "extract_apk"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_cancel_pending_task() {
        // An executor that never finishes on its own.
        let executor: TaskExecutor = Arc::new(|_task, ctx| {
            Box::pin(async move {
                loop {
                    ctx.check_cancelled()?;
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
        });
        let dir = tempfile::tempdir().unwrap();
        let state = test_state_with(executor, dir.path());
        let app = api_router().with_state(state);

        let project = create_project(&app, "cancel", "/tmp/cancel").await;
        let pid = project["id"].as_i64().unwrap();
        let resp = app
            .clone()
            .oneshot(post_json(
                &format!("/api/projects/{}/tasks", pid),
                serde_json::json!({"branch": "main", "archive_path": "/tmp/p.zip"}),
            ))
            .await
            .unwrap();
        let task: serde_json::Value = body_json(resp.into_body()).await;
        let task_id = task["id"].as_i64().unwrap();

        // Cancel before start: immediate.
        let resp = app
            .clone()
            .oneshot(post_json(&format!("/api/tasks/{}/cancel", task_id), serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = body_json(resp.into_body()).await;
        assert_eq!(body["status"], "cancelled");
    }

    #[tokio::test]
    async fn test_task_not_found() {
        let (app, _dir) = test_app();
        let resp = app
            .clone()
            .oneshot(get_req("/api/tasks/404"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = app
            .oneshot(post_json("/api/tasks/404/start", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    // ── Git endpoints against a real repo ─────────────────────────────

    struct GitWorld {
        app: Router,
        project_id: i64,
        repo_dir: tempfile::TempDir,
        _data_dir: tempfile::TempDir,
    }

    async fn git_world() -> GitWorld {
        let repo_dir = tempfile::tempdir().unwrap();
        init_repo(repo_dir.path());
        std::fs::write(repo_dir.path().join("README.md"), "hello\n").unwrap();
        commit_all(repo_dir.path(), "init");

        let data_dir = tempfile::tempdir().unwrap();
        let state = test_state_with(quick_executor(), data_dir.path());
        let app = api_router().with_state(state);
        let project =
            create_project(&app, "gitproj", &repo_dir.path().to_string_lossy()).await;
        GitWorld {
            app,
            project_id: project["id"].as_i64().unwrap(),
            repo_dir,
            _data_dir: data_dir,
        }
    }

    #[tokio::test]
    async fn test_git_commit_endpoint() {
        let w = git_world().await;
        std::fs::write(w.repo_dir.path().join("README.md"), "edited\n").unwrap();

        let resp = w
            .app
            .clone()
            .oneshot(post_json(
                &format!("/api/projects/{}/git/commit", w.project_id),
                serde_json::json!({"message": "update readme"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let op: serde_json::Value = body_json(resp.into_body()).await;
        assert_eq!(op["kind"], "commit");
        assert_eq!(op["status"], "completed");
        assert!(op["post_commit"].is_string());

        // Operation history shows it.
        let resp = w
            .app
            .clone()
            .oneshot(get_req(&format!(
                "/api/projects/{}/git/operations",
                w.project_id
            )))
            .await
            .unwrap();
        let ops: Vec<serde_json::Value> = body_json(resp.into_body()).await;
        assert!(ops.iter().any(|o| o["kind"] == "commit"));
    }

    #[tokio::test]
    async fn test_git_rollback_endpoint() {
        let w = git_world().await;
        let first = gitsafe::head_commit_of(w.repo_dir.path()).unwrap();
        std::fs::write(w.repo_dir.path().join("README.md"), "v2\n").unwrap();
        commit_all(w.repo_dir.path(), "second");

        let resp = w
            .app
            .clone()
            .oneshot(post_json(
                &format!("/api/projects/{}/git/rollback", w.project_id),
                serde_json::json!({"target_commit": first}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(gitsafe::head_commit_of(w.repo_dir.path()).unwrap(), first);
    }

    #[tokio::test]
    async fn test_git_backup_restore_cycle() {
        let w = git_world().await;

        let resp = w
            .app
            .clone()
            .oneshot(post_json(
                &format!("/api/projects/{}/git/backup", w.project_id),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body: serde_json::Value = body_json(resp.into_body()).await;
        let snapshot_id = body["snapshot"]["id"].as_i64().unwrap();
        assert_eq!(body["operation"]["kind"], "backup");

        // Snapshot listed as active.
        let resp = w
            .app
            .clone()
            .oneshot(get_req(&format!("/api/projects/{}/snapshots", w.project_id)))
            .await
            .unwrap();
        let snapshots: Vec<serde_json::Value> = body_json(resp.into_body()).await;
        assert_eq!(snapshots.len(), 1);

        // Mutate then restore.
        std::fs::write(w.repo_dir.path().join("README.md"), "garbage\n").unwrap();
        commit_all(w.repo_dir.path(), "bad change");

        let resp = w
            .app
            .clone()
            .oneshot(post_json(
                &format!("/api/snapshots/{}/restore", snapshot_id),
                serde_json::json!({"force": true}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let op: serde_json::Value = body_json(resp.into_body()).await;
        assert_eq!(op["kind"], "restore");
        assert_eq!(
            std::fs::read_to_string(w.repo_dir.path().join("README.md")).unwrap(),
            "hello\n"
        );
    }

    #[tokio::test]
    async fn test_git_reset_endpoint() {
        let w = git_world().await;
        std::fs::write(w.repo_dir.path().join("scratch.txt"), "x").unwrap();

        let resp = w
            .app
            .clone()
            .oneshot(post_json(
                &format!("/api/projects/{}/git/reset", w.project_id),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = body_json(resp.into_body()).await;
        assert_eq!(body["files_touched"], 1);
        assert!(!w.repo_dir.path().join("scratch.txt").exists());
    }

    #[tokio::test]
    async fn test_git_commit_on_non_repo_is_conflict() {
        let (app, _dir) = test_app();
        let plain_dir = tempfile::tempdir().unwrap();
        let project =
            create_project(&app, "plain", &plain_dir.path().to_string_lossy()).await;

        let resp = app
            .clone()
            .oneshot(post_json(
                &format!("/api/projects/{}/git/commit", project["id"]),
                serde_json::json!({"message": "nope"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_branches_and_commits_endpoints() {
        let w = git_world().await;

        let resp = w
            .app
            .clone()
            .oneshot(get_req(&format!("/api/projects/{}/branches", w.project_id)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let branches: Vec<String> = body_json(resp.into_body()).await;
        assert_eq!(branches.len(), 1);

        let resp = w
            .app
            .clone()
            .oneshot(get_req(&format!(
                "/api/projects/{}/git/commits?limit=5",
                w.project_id
            )))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let commits: Vec<serde_json::Value> = body_json(resp.into_body()).await;
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0]["summary"], "init");
    }

    #[tokio::test]
    async fn test_git_status_endpoint() {
        let w = git_world().await;

        let resp = w
            .app
            .clone()
            .oneshot(get_req(&format!(
                "/api/projects/{}/git/status",
                w.project_id
            )))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let status: serde_json::Value = body_json(resp.into_body()).await;
        assert_eq!(status["is_repository"], true);
        assert_eq!(status["clean"], true);

        std::fs::write(w.repo_dir.path().join("wip.txt"), "x").unwrap();
        let resp = w
            .app
            .clone()
            .oneshot(get_req(&format!(
                "/api/projects/{}/git/status",
                w.project_id
            )))
            .await
            .unwrap();
        let status: serde_json::Value = body_json(resp.into_body()).await;
        assert_eq!(status["clean"], false);
        assert_eq!(status["dirty_files"], 1);
    }

    #[tokio::test]
    async fn test_cleanup_endpoint() {
        let (app, _dir) = test_app();
        let resp = app
            .oneshot(post_json("/api/snapshots/cleanup", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = body_json(resp.into_body()).await;
        assert_eq!(body["removed"], 0);
    }
}
