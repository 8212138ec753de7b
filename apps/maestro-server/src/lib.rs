//! # Maestro Server
//!
//! The HTTP surface: routes a query into a plan + run, starts and cancels
//! runs, and serves run status, artifacts and metrics.

mod config;
mod metrics;
mod runtime;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use anyhow::Context as _;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use maestro_core::types::{NodeRun, Query};

pub use config::{load_config, ConfigError, ObservabilityConfig, ServerConfig};
pub use metrics::Metrics;
pub use runtime::{ApiError, BootstrapError, RouteOutcome, Runtime, RunView};

static TRACING_INIT: OnceLock<()> = OnceLock::new();

#[derive(Clone)]
struct AppState {
    runtime: Arc<Runtime>,
}

#[derive(Debug, Deserialize)]
struct RouteRequest {
    query: String,
    #[serde(default)]
    file_path: Option<String>,
}

#[derive(Debug, Serialize)]
struct RouteResponse {
    run_id: String,
    plan_id: String,
    flow: String,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: &'static str,
    run_id: String,
}

#[derive(Debug, Serialize)]
struct NodeView {
    node_id: String,
    state: String,
    attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct RunStatusResponse {
    run_id: String,
    state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<serde_json::Value>,
    nodes: Vec<NodeView>,
    artifacts: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

pub async fn run_server(config_path: PathBuf, listen: SocketAddr) -> anyhow::Result<()> {
    let config = load_config(&config_path)
        .with_context(|| format!("load config {}", config_path.display()))?;
    init_tracing(&config.observability.log_level);

    let runtime = Arc::new(
        Runtime::from_config(&config)
            .await
            .context("build maestro runtime")?,
    );
    let state = AppState { runtime };

    let app = Router::new()
        .route("/health", get(health))
        .route("/v1/route", post(route_query))
        .route("/v1/runs/{run_id}/start", post(start_run))
        .route("/v1/runs/{run_id}/cancel", post(cancel_run))
        .route("/v1/runs/{run_id}", get(get_run))
        .route("/v1/metrics", get(get_metrics))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .context("bind server listener failed")?;
    tracing::info!(listen = %listen, "maestro-server listening");
    axum::serve(listener, app)
        .await
        .context("server terminated with error")
}

fn init_tracing(log_level: &str) {
    TRACING_INIT.get_or_init(|| {
        let fallback = match log_level.trim().to_ascii_lowercase().as_str() {
            "trace" => "trace",
            "debug" => "debug",
            "warn" => "warn",
            "error" => "error",
            _ => "info",
        };
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .or_else(|_| tracing_subscriber::EnvFilter::try_new(fallback))
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
    });
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn route_query(
    State(state): State<AppState>,
    Json(payload): Json<RouteRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorBody>)> {
    let query = Query {
        text: payload.query,
        file_path: payload.file_path,
    };
    let outcome = state.runtime.route(&query).await.map_err(map_api_error)?;
    Ok(Json(RouteResponse {
        run_id: outcome.run_id,
        plan_id: outcome.plan_id,
        flow: outcome.flow.to_string(),
    }))
}

async fn start_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorBody>)> {
    state.runtime.start(&run_id).await.map_err(map_api_error)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(StatusResponse {
            status: "started",
            run_id,
        }),
    ))
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorBody>)> {
    let delivered = state.runtime.cancel(&run_id).await.map_err(map_api_error)?;
    Ok(Json(StatusResponse {
        status: if delivered { "cancelling" } else { "not_running" },
        run_id,
    }))
}

async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorBody>)> {
    let view = state.runtime.run_view(&run_id).await.map_err(map_api_error)?;
    Ok(Json(run_status_response(view)))
}

async fn get_metrics(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.runtime.metrics().snapshot())
}

fn run_status_response(view: RunView) -> RunStatusResponse {
    let nodes = view.nodes.iter().map(node_view).collect();
    RunStatusResponse {
        run_id: view.run.run_id.clone(),
        state: view.run.state.to_string(),
        result: view.run.result,
        error: view
            .run
            .error
            .as_ref()
            .and_then(|e| serde_json::to_value(e).ok()),
        nodes,
        artifacts: view.artifacts,
    }
}

fn node_view(node: &NodeRun) -> NodeView {
    NodeView {
        node_id: node.node_id.clone(),
        state: node.state.to_string(),
        attempts: node.attempts,
        error: node
            .error
            .as_ref()
            .and_then(|e| serde_json::to_value(e).ok()),
    }
}

fn map_api_error(err: ApiError) -> (StatusCode, Json<ErrorBody>) {
    let (status, code) = match &err {
        ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        ApiError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
        ApiError::InvalidArgument(_) => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_argument"),
        ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    };
    (
        status,
        Json(ErrorBody {
            code: code.to_string(),
            message: err.to_string(),
        }),
    )
}
