//! JSON HTTP surface over the task service.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use listwatch_core::{NewTask, Task, TaskStatus};
use listwatch_sync::{
    build_service, CreatedTask, InitialRun, PipelineError, ServiceError, SyncConfig, TaskService,
    TaskStatusReport, TickSummary,
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "listwatch-web";

#[derive(Clone)]
pub struct AppState {
    pub service: TaskService,
}

impl AppState {
    pub fn new(service: TaskService) -> Self {
        Self { service }
    }
}

#[derive(Debug)]
enum ApiError {
    NotFound(String),
    Service(ServiceError),
    Pipeline(PipelineError),
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        Self::Service(err)
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        Self::Pipeline(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(id) => (StatusCode::NOT_FOUND, format!("task {id} not found")),
            Self::Service(ServiceError::Validation(err)) => {
                (StatusCode::UNPROCESSABLE_ENTITY, err.to_string())
            }
            Self::Service(ServiceError::Store(err)) => {
                warn!(error = %err, "store error while serving request");
                (StatusCode::SERVICE_UNAVAILABLE, err.to_string())
            }
            Self::Pipeline(PipelineError::TaskNotFound(id)) => {
                (StatusCode::NOT_FOUND, format!("task {id} not found"))
            }
            Self::Pipeline(err @ PipelineError::LeaseLost(_)) => {
                (StatusCode::CONFLICT, err.to_string())
            }
            Self::Pipeline(err @ PipelineError::Store(_)) => {
                warn!(error = %err, "store error while serving request");
                (StatusCode::SERVICE_UNAVAILABLE, err.to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[derive(Debug, Deserialize, Default)]
struct CreateTaskQuery {
    /// Run the initial scrape or seeding pass before responding.
    #[serde(default)]
    wait: bool,
}

#[derive(Debug, Deserialize, Default)]
struct ListTasksQuery {
    user_id: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/tasks", get(list_tasks_handler).post(create_task_handler))
        .route("/tasks/{id}", get(get_task_handler).delete(delete_task_handler))
        .route("/tasks/{id}/status", get(task_status_handler))
        .route("/tasks/{id}/pause", post(pause_task_handler))
        .route("/tasks/{id}/resume", post(resume_task_handler))
        .route("/run", post(run_eligible_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(service: TaskService, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "listening");
    axum::serve(listener, app(AppState::new(service))).await?;
    Ok(())
}

/// Serves the API, running the cron tick in-process when enabled.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let service = build_service(&config).await?;
    let _scheduler = if config.scheduler_enabled {
        let sched = service.scheduler().build_cron_scheduler(&config.tick_cron).await?;
        sched.start().await.context("starting scheduler")?;
        info!(cron = %config.tick_cron, "scheduler started");
        Some(sched)
    } else {
        None
    };
    serve(service, config.web_port).await
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "service": CRATE_NAME }))
}

async fn create_task_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CreateTaskQuery>,
    Json(request): Json<NewTask>,
) -> Result<(StatusCode, Json<CreatedTask>), ApiError> {
    let initial = if query.wait {
        InitialRun::Inline
    } else {
        InitialRun::Background
    };
    let created = state.service.create_task(request, initial).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn list_tasks_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListTasksQuery>,
) -> Result<Json<Vec<Task>>, ApiError> {
    Ok(Json(state.service.list_tasks(query.user_id.as_deref()).await?))
}

async fn get_task_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<Task>, ApiError> {
    let task = state.service.get_task(&id).await?;
    task.map(Json).ok_or(ApiError::NotFound(id))
}

async fn task_status_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Result<(StatusCode, Json<TaskStatusReport>), ApiError> {
    let report = state.service.task_status(&id).await?;
    let code = if report.status == TaskStatus::NotFound {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::OK
    };
    Ok((code, Json(report)))
}

async fn pause_task_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<Task>, ApiError> {
    let task = state.service.pause_task(&id).await?;
    task.map(Json).ok_or(ApiError::NotFound(id))
}

async fn resume_task_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<Task>, ApiError> {
    let task = state.service.resume_task(&id).await?;
    task.map(Json).ok_or(ApiError::NotFound(id))
}

async fn delete_task_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Result<StatusCode, ApiError> {
    if state.service.delete_task(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(id))
    }
}

async fn run_eligible_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<TickSummary>, ApiError> {
    Ok(Json(state.service.scheduler().run_eligible().await?))
}
