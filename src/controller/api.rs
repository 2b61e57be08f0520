//! The controller's HTTP surface.
//!
//! Two sets of endpoints with separate authentication:
//!
//! - the task API used by agents (`/{backend}/tasks/`,
//!   `/{backend}/task/update/`), authenticated by per-backend agent token;
//! - the RAP API used by external clients such as the job-server
//!   (`/rap/create/`, `/rap/cancel/`, `/rap/status/`, `/backend/status/`),
//!   authenticated by per-backend client token lists.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::builder::update_cancelled_jobs;
use crate::config::ControllerConfig;
use crate::error::{Result, RunnerError};
use crate::models::{now_secs, timestamp_to_isoformat};
use crate::schema::{ActiveTasksResponse, AgentTask, TaskUpdate};

use super::sync::{aggregate_state, flags_header, job_request_from_remote, job_to_remote};
use super::tasks::handle_task_update;
use super::SharedDb;

/// Flag updated on every authenticated agent poll, so operators can see
/// which backends are in contact.
const LAST_SEEN_FLAG: &str = "last-seen-at";

#[derive(Clone)]
pub struct ApiState {
    pub db: SharedDb,
    pub config: Arc<ControllerConfig>,
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/:backend/tasks/", get(active_tasks))
        .route("/:backend/task/update/", post(update_task))
        .route("/rap/create/", post(rap_create))
        .route("/rap/cancel/", post(rap_cancel))
        .route("/rap/status/", get(rap_status))
        .route("/backend/status/", get(backend_status))
        .layer(cors)
        .with_state(state)
}

/// Serve the API until the shutdown token fires.
pub async fn serve(state: ApiState, addr: SocketAddr, shutdown: CancellationToken) -> Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Task API listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

enum ApiError {
    Unauthorized,
    Forbidden,
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl From<RunnerError> for ApiError {
    fn from(err: RunnerError) -> Self {
        match err {
            RunnerError::TaskNotFound(id) | RunnerError::JobNotFound(id) => ApiError::NotFound(id),
            RunnerError::BackendMismatch { .. } => ApiError::Forbidden,
            RunnerError::Serialization(e) => ApiError::BadRequest(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "Forbidden".to_string()),
            ApiError::NotFound(id) => (StatusCode::NOT_FOUND, format!("Not found: {id}")),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Internal(message) => {
                tracing::error!(error = %message, "API internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal error".to_string(),
                )
            }
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let raw = headers.get("authorization")?.to_str().ok()?;
    Some(raw.strip_prefix("Bearer ").unwrap_or(raw).trim())
}

/// Agent authentication: 401 on missing/unknown token, 403 when the token is
/// valid but scoped to a different backend than the URL names.
fn authenticate_agent(
    state: &ApiState,
    headers: &HeaderMap,
    backend: &str,
) -> std::result::Result<(), ApiError> {
    let Some(token) = bearer_token(headers) else {
        return Err(ApiError::Unauthorized);
    };
    match state.config.task_api_tokens.get(backend) {
        Some(expected) if expected == token => Ok(()),
        _ => {
            let valid_elsewhere = state
                .config
                .task_api_tokens
                .values()
                .any(|t| t == token);
            if valid_elsewhere {
                Err(ApiError::Forbidden)
            } else {
                Err(ApiError::Unauthorized)
            }
        }
    }
}

fn authenticate_client(
    state: &ApiState,
    headers: &HeaderMap,
    backend: &str,
) -> std::result::Result<(), ApiError> {
    let Some(token) = bearer_token(headers) else {
        return Err(ApiError::Unauthorized);
    };
    match state.config.client_tokens.get(backend) {
        Some(tokens) if tokens.iter().any(|t| t == token) => Ok(()),
        _ => {
            if backends_for_client_token(&state.config, token).is_empty() {
                Err(ApiError::Unauthorized)
            } else {
                Err(ApiError::Forbidden)
            }
        }
    }
}

fn backends_for_client_token(config: &ControllerConfig, token: &str) -> Vec<String> {
    config
        .client_tokens
        .iter()
        .filter(|(_, tokens)| tokens.iter().any(|t| t == token))
        .map(|(backend, _)| backend.clone())
        .collect()
}

// ---- task API ----

async fn active_tasks(
    Path(backend): Path<String>,
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> std::result::Result<Json<ActiveTasksResponse>, ApiError> {
    authenticate_agent(&state, &headers, &backend)?;
    let mut db = state.db.lock().unwrap();
    let tasks: Vec<AgentTask> = db
        .active_tasks(&backend)
        .map_err(ApiError::from)?
        .iter()
        .map(AgentTask::from_task)
        .collect();
    // Record that this backend has been in contact
    db.set_flag(
        LAST_SEEN_FLAG,
        Some(&timestamp_to_isoformat(now_secs())),
        &backend,
    )
    .map_err(ApiError::from)?;
    Ok(Json(ActiveTasksResponse { tasks }))
}

async fn update_task(
    Path(backend): Path<String>,
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(update): Json<TaskUpdate>,
) -> std::result::Result<Response, ApiError> {
    authenticate_agent(&state, &headers, &backend)?;
    let mut db = state.db.lock().unwrap();
    let response =
        handle_task_update(&mut db, &state.config, &backend, &update).map_err(ApiError::from)?;
    Ok(Json(response).into_response())
}

// ---- RAP API ----

async fn rap_create(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(payload): Json<serde_json::Value>,
) -> std::result::Result<Response, ApiError> {
    let request = job_request_from_remote(&payload)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    authenticate_client(&state, &headers, &request.backend)?;
    if !state.config.backends.contains(&request.backend) {
        return Err(ApiError::BadRequest(format!(
            "unknown backend '{}'",
            request.backend
        )));
    }
    let created = {
        let mut db = state.db.lock().unwrap();
        db.upsert_job_request(&request).map_err(ApiError::from)?
    };
    // Jobs are created by the scheduler's next intake pass
    Ok((
        StatusCode::CREATED,
        Json(json!({"result": "accepted", "job_request_id": request.id, "created": created})),
    )
        .into_response())
}

#[derive(Deserialize)]
struct CancelPayload {
    job_request_id: String,
    actions: Vec<String>,
}

async fn rap_cancel(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(payload): Json<CancelPayload>,
) -> std::result::Result<Response, ApiError> {
    let mut db = state.db.lock().unwrap();
    let Some(mut request) = db
        .get_job_request(&payload.job_request_id)
        .map_err(ApiError::from)?
    else {
        return Err(ApiError::NotFound(payload.job_request_id));
    };
    authenticate_client(&state, &headers, &request.backend)?;
    request.cancelled_actions = payload.actions;
    update_cancelled_jobs(&mut db, &request).map_err(ApiError::from)?;
    Ok(Json(json!({"result": "ok"})).into_response())
}

#[derive(Deserialize)]
struct StatusQuery {
    /// Comma-separated job request identifiers.
    ids: String,
}

async fn rap_status(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<StatusQuery>,
) -> std::result::Result<Response, ApiError> {
    let Some(token) = bearer_token(&headers) else {
        return Err(ApiError::Unauthorized);
    };
    let backends = backends_for_client_token(&state.config, token);
    if backends.is_empty() {
        return Err(ApiError::Unauthorized);
    }

    let db = state.db.lock().unwrap();
    let mut statuses = Vec::new();
    for id in query.ids.split(',').filter(|s| !s.is_empty()) {
        let jobs: Vec<_> = db
            .jobs_for_request(id)
            .map_err(ApiError::from)?
            .into_iter()
            .filter(|j| backends.contains(&j.backend))
            .collect();
        let remote_jobs: Vec<_> = jobs.iter().map(|j| job_to_remote(j, None)).collect();
        statuses.push(json!({
            "job_request_id": id,
            "state": aggregate_state(&jobs),
            "jobs": remote_jobs,
        }));
    }
    Ok(Json(json!({"rap_statuses": statuses})).into_response())
}

#[derive(Deserialize)]
struct BackendQuery {
    backend: String,
}

async fn backend_status(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<BackendQuery>,
) -> std::result::Result<Response, ApiError> {
    authenticate_client(&state, &headers, &query.backend)?;
    let db = state.db.lock().unwrap();
    let flags = flags_header(&db.current_flags(&query.backend).map_err(ApiError::from)?);
    Ok(Json(json!({"flags": flags})).into_response())
}
