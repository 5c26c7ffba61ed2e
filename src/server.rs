use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::api::{self, AppState};
use crate::config::ServerConfig;
use crate::db::{Db, DbHandle};
use crate::gitsafe::GitSafety;
use crate::guard::RepoGuard;
use crate::logbus::{BusConfig, LogBus};
use crate::pipeline::BuildPipeline;
use crate::runtime::{RuntimeConfig, TaskRuntime};

/// Wire the full application state from a configuration.
///
/// Startup reconciliation happens here: tasks left non-terminal by a
/// previous process are marked failed/abandoned before anything can
/// observe them, and an initial snapshot GC sweep is scheduled.
pub fn build_state(config: ServerConfig) -> Result<Arc<AppState>> {
    config.ensure_directories()?;
    let db = Db::new(&config.db_path).context("Failed to open database")?;
    let abandoned = db
        .mark_abandoned_tasks()
        .context("Failed to reconcile abandoned tasks")?;
    if abandoned > 0 {
        warn!(abandoned, "marked tasks abandoned by a previous process");
    }
    let db = DbHandle::new(db);

    let limits = &config.limits;
    let bus = LogBus::new(BusConfig {
        ring_capacity: limits.log_ring_capacity,
        subscriber_buffer: limits.subscriber_buffer,
        heartbeat: Duration::from_secs(limits.heartbeat_secs),
        grace: Duration::from_secs(limits.stream_grace_secs),
        drop_warn_threshold: limits.drop_warn_threshold,
    });
    let guard = Arc::new(RepoGuard::new(Duration::from_secs(
        limits.stale_lock_max_age_secs,
    )));
    let gitsafe = Arc::new(GitSafety::new(db.clone(), config.snapshots_dir.clone()));
    let pipeline = BuildPipeline::new(
        db.clone(),
        bus.clone(),
        Arc::clone(&guard),
        Arc::clone(&gitsafe),
        config.clone(),
    );
    let runtime = TaskRuntime::new(
        db.clone(),
        bus.clone(),
        RuntimeConfig {
            max_running: limits.max_running_tasks,
            deadline: Duration::from_secs(limits.task_deadline_secs),
        },
        pipeline.executor(),
    );

    Ok(Arc::new(AppState {
        db,
        bus,
        runtime,
        guard,
        gitsafe,
        config,
    }))
}

pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router().with_state(state)
}

/// Start the server and run until Ctrl+C.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    let dev_mode = config.dev_mode;
    let port = config.port;
    let state = build_state(config)?;

    // Periodic snapshot GC; the first sweep collects anything that expired
    // while the server was down.
    {
        let gitsafe = Arc::clone(&state.gitsafe);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60 * 60));
            loop {
                tick.tick().await;
                if let Err(e) = gitsafe.cleanup_expired().await {
                    warn!(error = %e, "snapshot cleanup sweep failed");
                }
            }
        });
    }

    let mut app = build_router(state);
    if dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!(addr = %listener.local_addr()?, "apkwright listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("server shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("shutdown requested");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn test_config() -> (ServerConfig, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::with_data_dir(dir.path().join("data"));
        (config, dir)
    }

    #[tokio::test]
    async fn test_build_state_and_health_route() {
        let (config, _dir) = test_config();
        let state = build_state(config).unwrap();
        let app = build_router(state);

        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_routes_mounted() {
        let (config, _dir) = test_config();
        let state = build_state(config).unwrap();
        let app = build_router(state);

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/projects")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_startup_marks_abandoned_tasks() {
        let (config, _dir) = test_config();
        config.ensure_directories().unwrap();

        // A previous process left a running task behind.
        {
            let db = Db::new(&config.db_path).unwrap();
            db.create_project("left-behind", "/tmp/lb", None).unwrap();
            let task = db
                .create_task(
                    1,
                    crate::models::TaskKind::Build,
                    "main",
                    None,
                    &crate::models::TaskConfig::default(),
                )
                .unwrap();
            db.mark_task_started(task.id).unwrap();
        }

        let state = build_state(config).unwrap();
        let task = state
            .db
            .call(|db| db.get_task(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.status, crate::models::TaskStatus::Failed);
        assert_eq!(task.error_kind.as_deref(), Some("abandoned"));
    }
}
