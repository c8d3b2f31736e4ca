//! Worksite - an orchestration server for multi-stage agent research tasks.
//!
//! A single command starts the server: configuration comes from the
//! environment, state lives in sqlite, clients connect over WebSocket.
//! Exit codes: 0 clean shutdown, 2 configuration error, 3 storage error.

mod api;
mod bus;
mod config;
mod error;
mod events;
mod llm;
mod plan;
mod store;
mod task;
mod tools;
mod workspace;

use api::{create_router, AppState};
use bus::EventBus;
use config::Config;
use llm::{Gateway, ModelRegistry};
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use store::Store;
use task::TaskManager;
use tools::ToolRegistry;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use workspace::WorkspaceManager;

const EXIT_CONFIG: u8 = 2;
const EXIT_STORAGE: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "worksite=info,tower_http=warn".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(exit) => ExitCode::from(exit),
    }
}

async fn run(config: Config) -> Result<(), u8> {
    // Storage
    if let Some(parent) = config.db_path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::error!(error = %e, path = %parent.display(), "cannot create data directory");
            return Err(EXIT_STORAGE);
        }
    }
    tracing::info!(path = %config.db_path.display(), "opening event store");
    let store = match Store::open(&config.db_path) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to open event store");
            return Err(EXIT_STORAGE);
        }
    };

    // Tasks interrupted by the previous shutdown go back to idle; suspended
    // HITL gates survive.
    match store.recover_interrupted() {
        Ok(0) => {}
        Ok(n) => tracing::info!(count = n, "reset interrupted tasks to idle"),
        Err(e) => {
            tracing::error!(error = %e, "startup recovery failed");
            return Err(EXIT_STORAGE);
        }
    }

    // Workspaces
    let workspaces = match WorkspaceManager::new(&config.workspace_root) {
        Ok(w) => w,
        Err(e) => {
            tracing::error!(error = %e, "cannot initialize workspace root");
            return Err(EXIT_STORAGE);
        }
    };

    // LLM gateway
    let registry = Arc::new(ModelRegistry::new(&config.llm));
    if registry.has_models() {
        tracing::info!(
            models = ?registry.available_models(),
            default = %registry.default_model_id(),
            "model registry initialized"
        );
    } else {
        tracing::warn!(
            "no LLM providers configured; set ANTHROPIC_API_KEY, OPENAI_API_KEY, or LLM_GATEWAY"
        );
    }
    let gateway = Arc::new(Gateway::new(
        registry,
        config.role_models.clone(),
        config.llm_retries,
    ));

    // Tools (read-only after this point)
    let tools = Arc::new(ToolRegistry::standard(config.tool_timeouts));

    // Event bus + task manager
    let bus = EventBus::new(store);
    let manager = TaskManager::new(
        bus,
        gateway,
        tools,
        workspaces,
        config.controller_config(),
        config.max_concurrent_tasks,
    );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(AppState { manager })
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(%addr, "worksite server listening");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, "failed to bind listener");
            return Err(EXIT_STORAGE);
        }
    };

    let serve = axum::serve(listener, app).with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    });

    if let Err(e) = serve.await {
        tracing::error!(error = %e, "server error");
        return Err(EXIT_STORAGE);
    }

    Ok(())
}
