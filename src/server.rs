//! HTTP task API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/scrape` | Start a scrape task, returns its ID (202) |
//! | `GET`  | `/api/task-status/{task_id}` | Progress summary (`PENDING` if unknown) |
//! | `GET`  | `/api/tasks` | Active tasks |
//! | `POST` | `/api/tasks/{task_id}/revoke` | Cancel a task running in this process |
//! | `POST` | `/api/cleanup` | Delete old progress records |
//! | `GET`  | `/api/health` | Liveness plus a database check |
//! | `GET`  | `/api/system-status` | Resource assessment, worker sizing, table counts |
//! | `GET`  | `/api/logs?limit=N` | Newest scraping-log rows (default 50) |
//!
//! Errors use `{ "error": { "code": "...", "message": "..." } }` with codes
//! `bad_request` (400), `not_found` (404), and `internal` (500).

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use policy_harvest_core::models::{ScrapeLog, TaskProgress};
use policy_harvest_core::store::{RecordStore, StoreCounts};
use policy_harvest_core::throttle::{ResourceMonitor, ThrottleAssessment};
use policy_harvest_core::tracker::{ProgressSummary, ProgressTracker};
use policy_harvest_core::validate::is_well_formed_url;

use crate::config::Config;
use crate::monitor_loop::{LatestAssessment, MonitorLoop};
use crate::pipeline::{spawn_scrape, Pipeline, ScrapeRequest};
use crate::services::Services;
use crate::tasks::TaskRegistry;

const DEFAULT_CLEANUP_HOURS: u64 = 24;
const DEFAULT_LOG_LIMIT: usize = 50;
const MAX_LOG_LIMIT: usize = 1000;

#[derive(Clone)]
pub struct AppState {
    records: Arc<dyn RecordStore>,
    tracker: Arc<ProgressTracker>,
    monitor: Arc<ResourceMonitor>,
    pipeline: Pipeline,
    registry: TaskRegistry,
    latest: Option<LatestAssessment>,
}

impl AppState {
    pub fn new(services: &Services, pipeline: Pipeline) -> Self {
        Self {
            records: services.records.clone(),
            tracker: services.tracker.clone(),
            monitor: services.monitor.clone(),
            pipeline,
            registry: TaskRegistry::new(),
            latest: None,
        }
    }

    /// Serve `/api/system-status` from a running monitor loop.
    pub fn with_latest(mut self, latest: LatestAssessment) -> Self {
        self.latest = Some(latest);
        self
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/scrape", post(handle_scrape))
        .route("/api/task-status/{task_id}", get(handle_task_status))
        .route("/api/tasks", get(handle_tasks))
        .route("/api/tasks/{task_id}/revoke", post(handle_revoke))
        .route("/api/cleanup", post(handle_cleanup))
        .route("/api/health", get(handle_health))
        .route("/api/system-status", get(handle_system_status))
        .route("/api/logs", get(handle_logs))
        .layer(cors)
        .with_state(state)
}

/// Binds `[server].bind`, runs the resource monitor loop alongside, and
/// serves until Ctrl-C.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let services = Services::from_config(config).await?;
    let pipeline = services.pipeline(config)?;

    let mut monitor_loop = MonitorLoop::new(
        services.monitor.clone(),
        Duration::from_secs(config.throttle.monitor_interval_secs),
    );
    monitor_loop.start();
    let state = AppState::new(&services, pipeline).with_latest(monitor_loop.latest_handle());

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, "task API listening");
    println!("Task API listening on http://{}", config.server.bind);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    monitor_loop.stop().await;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn internal(err: impl std::fmt::Display) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: err.to_string(),
    }
}

/// Empty body means defaults.
fn parse_body<T: for<'de> Deserialize<'de> + Default>(body: &Bytes) -> Result<T, AppError> {
    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| bad_request(format!("invalid JSON body: {}", e)))
}

// ============ POST /api/scrape ============

#[derive(Serialize)]
struct ScrapeResponse {
    task_id: String,
    status: String,
    message: String,
}

async fn handle_scrape(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<ScrapeResponse>), AppError> {
    let request: ScrapeRequest = parse_body(&body)?;
    if let Some(url) = &request.month_url {
        if !is_well_formed_url(url) {
            return Err(bad_request(format!("month_url is not a valid URL: {}", url)));
        }
    }
    if request.limit == Some(0) {
        return Err(bad_request("limit must be > 0"));
    }

    let message = match &request.month_url {
        Some(url) => format!("Scraping monthly update {}", url),
        None => "Scraping all monthly updates".to_string(),
    };
    let task_id = spawn_scrape(state.pipeline.clone(), state.registry.clone(), request);
    info!(task_id = %task_id, "scrape task started");

    Ok((
        StatusCode::ACCEPTED,
        Json(ScrapeResponse {
            task_id,
            status: "started".to_string(),
            message,
        }),
    ))
}

// ============ GET /api/task-status/{task_id} ============

async fn handle_task_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<ProgressSummary>, AppError> {
    state
        .tracker
        .summary(&task_id)
        .await
        .map(Json)
        .map_err(internal)
}

// ============ GET /api/tasks ============

#[derive(Serialize)]
struct TasksResponse {
    active: Vec<TaskProgress>,
    running_here: Vec<String>,
}

async fn handle_tasks(State(state): State<AppState>) -> Result<Json<TasksResponse>, AppError> {
    let active = state.tracker.list_active().await.map_err(internal)?;
    Ok(Json(TasksResponse {
        active,
        running_here: state.registry.running(),
    }))
}

// ============ POST /api/tasks/{task_id}/revoke ============

#[derive(Serialize)]
struct RevokeResponse {
    task_id: String,
    revoked: bool,
}

async fn handle_revoke(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<RevokeResponse>, AppError> {
    if !state.registry.revoke(&task_id) {
        return Err(not_found(format!("no running task {}", task_id)));
    }
    info!(task_id = %task_id, "revoke requested");
    Ok(Json(RevokeResponse {
        task_id,
        revoked: true,
    }))
}

// ============ POST /api/cleanup ============

#[derive(Deserialize, Default)]
struct CleanupRequest {
    #[serde(default)]
    max_age_hours: Option<u64>,
}

#[derive(Serialize)]
struct CleanupResponse {
    removed: usize,
    max_age_hours: u64,
}

async fn handle_cleanup(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<CleanupResponse>, AppError> {
    let request: CleanupRequest = parse_body(&body)?;
    let max_age_hours = request.max_age_hours.unwrap_or(DEFAULT_CLEANUP_HOURS);
    let removed = state
        .tracker
        .cleanup(max_age_hours)
        .await
        .map_err(internal)?;
    Ok(Json(CleanupResponse {
        removed,
        max_age_hours,
    }))
}

// ============ GET /api/health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    database: String,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let (status, database) = match state.records.count_policies().await {
        Ok(_) => ("ok", "ok".to_string()),
        Err(e) => ("degraded", e.to_string()),
    };
    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database,
    })
}

// ============ GET /api/system-status ============

#[derive(Serialize)]
struct SystemStatusResponse {
    resources: ThrottleAssessment,
    /// False when the monitor loop has no tick yet and `resources` was
    /// sampled for this request.
    from_monitor: bool,
    optimal_workers: usize,
    counts: StoreCounts,
    active_tasks: usize,
}

async fn handle_system_status(
    State(state): State<AppState>,
) -> Result<Json<SystemStatusResponse>, AppError> {
    let latest = match &state.latest {
        Some(latest) => latest.get().await,
        None => None,
    };
    let from_monitor = latest.is_some();
    let resources = match latest {
        Some(assessment) => assessment,
        None => state.monitor.assess().await,
    };
    let optimal_workers = state.monitor.optimal_worker_count().await;
    let counts = state.records.counts().await.map_err(internal)?;
    let active_tasks = state.tracker.list_active().await.map_err(internal)?.len();
    Ok(Json(SystemStatusResponse {
        resources,
        from_monitor,
        optimal_workers,
        counts,
        active_tasks,
    }))
}

// ============ GET /api/logs ============

#[derive(Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
}

async fn handle_logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Vec<ScrapeLog>>, AppError> {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT);
    if limit == 0 || limit > MAX_LOG_LIMIT {
        return Err(bad_request(format!("limit must be between 1 and {}", MAX_LOG_LIMIT)));
    }
    state
        .records
        .recent_logs(limit)
        .await
        .map(Json)
        .map_err(internal)
}
