//! Reflow HTTP surface
//!
//! Routes:
//! - `POST /{workflow_name}` — execute a workflow; optional JSON body is the
//!   input; returns the context summary
//! - `POST /{workflow_name}/{execution_id}` — resume or rerun an execution;
//!   optional JSON body replaces the input at a pause-with-input point
//! - `GET /inspect/{execution_id}` — full context including events
//! - `GET /health`
//!
//! Engine errors map to status codes: catalog and store misses are 404,
//! everything else is 500. A paused or failed run is still a 200 — the
//! summary carries the status.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use reflow_core::{ContextSummary, EngineError, ExecutionContext, RunOptions, WorkflowRuntime};

/// App state shared across routes
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<WorkflowRuntime>,
    /// Static bearer token; `None` accepts any non-empty token
    pub api_token: Option<String>,
}

impl AppState {
    pub fn new(runtime: Arc<WorkflowRuntime>) -> Self {
        let api_token = runtime.services().config.api_token.clone();
        Self { runtime, api_token }
    }
}

/// Build the router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/inspect/:execution_id", get(inspect))
        .route("/:workflow_name", post(execute))
        .route("/:workflow_name/:execution_id", post(resume))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_headers(Any))
        .with_state(state)
}

/// Bind and serve until the process exits
pub async fn serve(runtime: Arc<WorkflowRuntime>) -> anyhow::Result<()> {
    let config = &runtime.services().config;
    let addr = format!("{}:{}", config.server_host, config.server_port);

    let app = router(AppState::new(runtime.clone()));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "reflow api listening");
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(serde::Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), StatusCode> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|t| !t.is_empty())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    match &state.api_token {
        Some(expected) if expected != token => Err(StatusCode::UNAUTHORIZED),
        _ => Ok(()),
    }
}

fn error_status(error: &EngineError) -> StatusCode {
    match error {
        EngineError::WorkflowNotFound(_) | EngineError::ContextNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// POST /{workflow_name} — start a new execution
async fn execute(
    State(state): State<AppState>,
    Path(workflow_name): Path<String>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Result<Json<ContextSummary>, StatusCode> {
    authorize(&state, &headers)?;

    let mut options = RunOptions::new();
    if let Some(Json(input)) = body {
        options = options.with_input(input);
    }

    run_to_summary(&state, &workflow_name, options).await
}

/// POST /{workflow_name}/{execution_id} — resume or rerun
async fn resume(
    State(state): State<AppState>,
    Path((workflow_name, execution_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Result<Json<ContextSummary>, StatusCode> {
    authorize(&state, &headers)?;

    let mut options = RunOptions::new().with_execution_id(execution_id);
    if let Some(Json(input)) = body {
        options = options.with_input(input);
    }

    run_to_summary(&state, &workflow_name, options).await
}

async fn run_to_summary(
    state: &AppState,
    workflow_name: &str,
    options: RunOptions,
) -> Result<Json<ContextSummary>, StatusCode> {
    state
        .runtime
        .run(workflow_name, options)
        .await
        .map(|ctx| Json(ctx.summary()))
        .map_err(|e| {
            error!(workflow = workflow_name, error = %e, "execution request failed");
            error_status(&e)
        })
}

/// GET /inspect/{execution_id} — full context including events
async fn inspect(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
) -> Result<Json<ExecutionContext>, StatusCode> {
    state
        .runtime
        .inspect(&execution_id)
        .await
        .map(Json)
        .map_err(|e| {
            error!(%execution_id, error = %e, "inspect request failed");
            error_status(&e)
        })
}
