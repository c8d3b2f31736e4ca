//! HTTP request handlers: model/tool metadata, task snapshots, and the
//! workspace file surface.

use super::AppState;
use crate::error::ErrorKind;
use crate::task::TaskError;
use crate::workspace::WorkspaceError;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

/// Error envelope for HTTP responses.
pub struct ApiError {
    status: StatusCode,
    kind: ErrorKind,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            detail: detail.into(),
        }
    }

    fn bad_request(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, kind, detail)
    }

    fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, ErrorKind::TaskNotFound, detail)
    }
}

impl From<TaskError> for ApiError {
    fn from(e: TaskError) -> Self {
        let status = match e.kind {
            ErrorKind::TaskNotFound => StatusCode::NOT_FOUND,
            ErrorKind::StorageError | ErrorKind::Bug => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        };
        Self::new(status, e.kind, e.detail)
    }
}

impl From<WorkspaceError> for ApiError {
    fn from(e: WorkspaceError) -> Self {
        match &e {
            WorkspaceError::PathEscape(_) => {
                Self::bad_request(ErrorKind::PathEscape, e.to_string())
            }
            WorkspaceError::NotFound(_) => Self::not_found(e.to_string()),
            WorkspaceError::Io(_) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorKind::StorageError,
                e.to_string(),
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.kind,
            "detail": self.detail,
        }));
        (self.status, body).into_response()
    }
}

// ==================== Metadata ====================

pub async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    let models = state.manager.gateway().registry().available_model_info();
    Json(json!({ "models": models }))
}

pub async fn list_tools(State(state): State<AppState>) -> impl IntoResponse {
    let tools = state.manager.tools().list();
    Json(json!({ "tools": tools }))
}

// ==================== Tasks ====================

pub async fn list_tasks(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let tasks = state.manager.list_tasks()?;
    Ok(Json(json!({ "tasks": tasks })))
}

pub async fn task_snapshot(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state.manager.snapshot(&task_id)?;
    Ok(Json(snapshot))
}

// ==================== Workspace files ====================

#[derive(Debug, Deserialize)]
pub struct WorkspaceQuery {
    pub task_id: String,
    #[serde(default)]
    pub path: Option<String>,
}

/// Serve a workspace listing (for directories) or file content (for files).
pub async fn workspace_browse(
    State(state): State<AppState>,
    Query(query): Query<WorkspaceQuery>,
) -> Result<Response, ApiError> {
    // Only existing tasks expose a workspace.
    state
        .manager
        .bus()
        .store()
        .get_task(&query.task_id)
        .map_err(|e| ApiError::not_found(e.to_string()))?;

    let ws = state.manager.workspaces().handle(&query.task_id)?;
    let rel = query.path.unwrap_or_else(|| ".".to_string());

    let resolved = ws.resolve(&rel)?;
    if resolved.is_dir() {
        let entries = ws.list(&rel)?;
        return Ok(Json(json!({ "entries": entries })).into_response());
    }

    let bytes = ws.read(&rel)?;
    let mime = mime_guess::from_path(&resolved).first_or_octet_stream();
    Ok((
        [(header::CONTENT_TYPE, mime.essence_str().to_string())],
        bytes,
    )
        .into_response())
}

/// Multipart upload into a task workspace. Field `task_id` names the task;
/// each file part is stored under its declared filename.
pub async fn workspace_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let mut task_id: Option<String> = None;
    let mut stored: Vec<String> = Vec::new();
    let mut pending: Vec<(String, Vec<u8>)> = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        ApiError::bad_request(ErrorKind::InvalidArguments, format!("bad multipart: {e}"))
    })? {
        if field.name() == Some("task_id") {
            let value = field.text().await.map_err(|e| {
                ApiError::bad_request(ErrorKind::InvalidArguments, e.to_string())
            })?;
            task_id = Some(value);
            continue;
        }

        let Some(filename) = field.file_name().map(String::from) else {
            continue;
        };
        let data = field.bytes().await.map_err(|e| {
            ApiError::bad_request(ErrorKind::InvalidArguments, e.to_string())
        })?;
        pending.push((filename, data.to_vec()));
    }

    let Some(task_id) = task_id else {
        return Err(ApiError::bad_request(
            ErrorKind::InvalidArguments,
            "missing task_id field",
        ));
    };
    state
        .manager
        .bus()
        .store()
        .get_task(&task_id)
        .map_err(|e| ApiError::not_found(e.to_string()))?;

    let ws = state.manager.workspaces().handle(&task_id)?;
    for (filename, data) in pending {
        stored.push(ws.upload(&filename, &data)?);
    }

    Ok(Json(json!({ "uploaded": stored })))
}
