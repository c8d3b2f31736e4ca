//! HTTP/WebSocket surface.
//!
//! One WebSocket endpoint carries the bidirectional session (task commands
//! in, event streams out); plain HTTP serves metadata, snapshots, and
//! workspace files.

mod handlers;
mod types;
mod ws;

pub use types::{ClientMessage, ServerMessage};

use crate::task::TaskManager;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<TaskManager>,
}

/// Create the API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Bidirectional session
        .route("/ws", get(ws::ws_handler))
        // Metadata
        .route("/api/models", get(handlers::list_models))
        .route("/api/tools", get(handlers::list_tools))
        // Tasks
        .route("/api/tasks", get(handlers::list_tasks))
        .route("/api/tasks/:id/snapshot", get(handlers::task_snapshot))
        // Workspace files
        .route("/api/workspace", get(handlers::workspace_browse))
        .route("/api/workspace/upload", post(handlers::workspace_upload))
        .with_state(state)
}
