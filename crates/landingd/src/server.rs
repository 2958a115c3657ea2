//! HTTP control plane for landingd.
//!
//! Thin translation over the finalize trigger and the task store. Bound to
//! 127.0.0.1 only; bearer auth is enforced when a token is configured.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::{self, Stream};
use landing_core::events::{TaskCreatedPayload, TaskDeletedPayload};
use landing_core::{
    Event, EventPayload, FinalizeStatus, FinalizeView, Id, PrInfo, Task, TaskStatus, TaskWeight,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::finalize::{FinalizeTrigger, ManualTrigger, TriggerError};
use crate::projects::Project;
use crate::publisher::{Broadcaster, EventPublisher};
use crate::storage::StorageError;

/// Shared state for HTTP handlers.
pub struct AppState {
    pub trigger: FinalizeTrigger,
    pub broadcaster: Arc<Broadcaster>,
    pub auth_token: Option<String>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("trigger", &self.trigger)
            .field("auth", &self.auth_token.is_some())
            .finish_non_exhaustive()
    }
}

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/tasks", post(create_task))
        .route("/tasks/{id}", get(get_task).delete(delete_task))
        .route(
            "/tasks/{id}/finalize",
            post(start_finalize)
                .get(finalize_status)
                .delete(cancel_finalize),
        )
        .route("/tasks/{id}/finalize/approval", post(approval_hook))
        .route("/events", get(stream_events))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve on 127.0.0.1:`port` until `shutdown` is cancelled.
pub async fn start_server(
    state: Arc<AppState>,
    port: u16,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let router = create_router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on http://{}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

/// Validate auth token if configured.
fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = &state.auth_token else {
        return Ok(());
    };
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.strip_prefix("Bearer ").unwrap_or(s));

    match provided {
        Some(token) if token == expected => Ok(()),
        Some(_) => Err(api_error(StatusCode::UNAUTHORIZED, "invalid auth token")),
        None => Err(api_error(StatusCode::UNAUTHORIZED, "missing auth token")),
    }
}

fn trigger_error(err: TriggerError) -> ApiError {
    let status = match &err {
        TriggerError::TaskNotFound(_) | TriggerError::Project(_) => StatusCode::NOT_FOUND,
        TriggerError::NotFinalizable { .. } | TriggerError::Gated { .. } => StatusCode::BAD_REQUEST,
        TriggerError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!(error = %err, "finalize request failed");
    }
    api_error(status, err.to_string())
}

fn storage_error(err: StorageError) -> ApiError {
    match err {
        StorageError::TaskNotFound(id) => {
            api_error(StatusCode::NOT_FOUND, format!("task not found: {id}"))
        }
        other => {
            error!(error = %other, "storage request failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
        }
    }
}

fn project<'a>(state: &'a AppState, query: &ProjectQuery) -> Result<&'a Project, ApiError> {
    state
        .trigger
        .projects()
        .resolve(query.project.as_deref().unwrap_or_default())
        .map_err(|e| api_error(StatusCode::NOT_FOUND, e.to_string()))
}

// --- Request/Response types ---

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// `?project=` selector; absent means the default workspace.
#[derive(Debug, Deserialize, Default)]
pub struct ProjectQuery {
    #[serde(default)]
    pub project: Option<String>,
}

/// Request payload for POST /tasks. Existing ids are overwritten.
#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub weight: TaskWeight,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub pr: Option<PrInfo>,
}

#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub task: Task,
}

/// Response for POST /tasks/{id}/finalize.
#[derive(Debug, Serialize)]
pub struct FinalizeStartResponse {
    pub task_id: Id,
    pub status: FinalizeStatus,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct FinalizeCancelResponse {
    pub task_id: Id,
    pub cancelled: bool,
}

#[derive(Debug, Serialize)]
pub struct ApprovalResponse {
    pub task_id: Id,
    pub triggered: bool,
}

/// Query params for GET /events.
#[derive(Debug, Deserialize, Default)]
pub struct StreamEventsQuery {
    /// Only forward events for this task.
    #[serde(default)]
    pub task_id: Option<String>,
}

// --- Handlers ---

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// POST /tasks - Create or import a task.
async fn create_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ProjectQuery>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let project = project(&state, &query)?;

    if req.title.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "title must not be empty"));
    }
    let id = req.id.filter(|id| !id.is_empty()).map_or_else(Id::new, Id::from_string);
    let mut task = Task::new(id, req.title, req.weight);
    task.status = req.status;
    task.pr = req.pr;

    project.store.save_task(&task).await.map_err(storage_error)?;
    state.broadcaster.publish(Event::for_task(
        &task.id,
        EventPayload::TaskCreated(TaskCreatedPayload {
            title: task.title.clone(),
            status: task.status,
        }),
    ));

    info!(task_id = %task.id, project = %project.id, "created task");
    Ok((StatusCode::CREATED, Json(TaskResponse { task })))
}

/// GET /tasks/{id}
async fn get_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<ProjectQuery>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let project = project(&state, &query)?;

    let task = project
        .store
        .load_task(&Id::from_string(id))
        .await
        .map_err(storage_error)?;
    Ok(Json(TaskResponse { task }))
}

/// DELETE /tasks/{id} - Delete a task, cancelling any finalize run.
async fn delete_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<ProjectQuery>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let project = project(&state, &query)?;

    let task_id = Id::from_string(id);
    project
        .store
        .delete_task(&task_id)
        .await
        .map_err(storage_error)?;
    state.trigger.discard(&task_id);
    state.broadcaster.publish(Event::for_task(
        &task_id,
        EventPayload::TaskDeleted(TaskDeletedPayload {
            reason: "deleted".to_string(),
        }),
    ));

    info!(task_id = %task_id, "deleted task");
    Ok(StatusCode::NO_CONTENT)
}

/// POST /tasks/{id}/finalize - Start a finalize run. The body is optional.
async fn start_finalize(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<ProjectQuery>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let flags: ManualTrigger = if body.is_empty() {
        ManualTrigger::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| api_error(StatusCode::BAD_REQUEST, format!("invalid request body: {e}")))?
    };

    let task_id = Id::from_string(id);
    let (started, snapshot) = state
        .trigger
        .trigger_manual(&task_id, query.project.as_deref().unwrap_or_default(), flags)
        .await
        .map_err(trigger_error)?;

    if started {
        Ok((
            StatusCode::ACCEPTED,
            Json(FinalizeStartResponse {
                task_id,
                status: FinalizeStatus::Pending,
                message: "Finalize started".to_string(),
            }),
        ))
    } else {
        Ok((
            StatusCode::OK,
            Json(FinalizeStartResponse {
                task_id,
                status: snapshot.status,
                message: "Finalize already in progress".to_string(),
            }),
        ))
    }
}

/// GET /tasks/{id}/finalize
async fn finalize_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<ProjectQuery>,
) -> Result<Json<FinalizeView>, ApiError> {
    check_auth(&state, &headers)?;

    let view = state
        .trigger
        .finalize_status(
            &Id::from_string(id),
            query.project.as_deref().unwrap_or_default(),
        )
        .await
        .map_err(trigger_error)?;
    Ok(Json(view))
}

/// DELETE /tasks/{id}/finalize - Request cancellation.
async fn cancel_finalize(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let task_id = Id::from_string(id);
    let cancelled = state.trigger.cancel_finalize(&task_id);
    Ok(Json(FinalizeCancelResponse { task_id, cancelled }))
}

/// POST /tasks/{id}/finalize/approval - Approval hook.
async fn approval_hook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<ProjectQuery>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let task_id = Id::from_string(id);
    let triggered = state
        .trigger
        .trigger_on_approval(&task_id, query.project.as_deref().unwrap_or_default())
        .await
        .map_err(trigger_error)?;
    Ok(Json(ApprovalResponse { task_id, triggered }))
}

/// GET /events - Live event stream (SSE).
///
/// Only events published after the client connects are delivered. A client
/// that falls behind skips the events it missed.
async fn stream_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<StreamEventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    check_auth(&state, &headers)?;

    let rx = state.broadcaster.subscribe();
    debug!(
        subscribers = state.broadcaster.subscriber_count(),
        "event stream connected"
    );
    let filter = query.task_id.map(Id::from_string);

    let stream = stream::unfold((rx, filter), |(mut rx, filter)| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if filter
                        .as_ref()
                        .is_some_and(|id| event.task_id.as_ref() != Some(id))
                    {
                        continue;
                    }
                    let json = match event.to_json() {
                        Ok(json) => json,
                        Err(e) => {
                            warn!(error = %e, "failed to encode event");
                            continue;
                        }
                    };
                    let sse = SseEvent::default()
                        .event(event.event_type().as_str())
                        .id(event.id.to_string())
                        .data(json);
                    return Some((Ok(sse), (rx, filter)));
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event stream subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
