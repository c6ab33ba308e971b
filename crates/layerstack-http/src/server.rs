//! HTTP server side: a layer's publication endpoint and approval routes
//!
//! Routes:
//! - `GET /health`
//! - `GET /nodes` - names of published nodes
//! - `GET /nodes/:name` - current record (404 when not published)
//! - `GET /actions` - every action in the ledger
//! - `POST /actions/:id/approve` - approve and apply
//! - `POST /actions/:id/discard`
//!
//! Requests that take longer than the router's timeout get `408`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use layerstack_engine::{Action, ApplyOutcome, Layer, LayerError, PublishedValue};
use tokio::net::{TcpListener, ToSocketAddrs};
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;

use crate::error::ServeError;

type ServerState = Arc<Layer>;
type ApiError = (StatusCode, Json<serde_json::Value>);

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Router serving one layer
pub fn router(layer: Arc<Layer>) -> Router {
    router_with_timeout(layer, DEFAULT_REQUEST_TIMEOUT)
}

/// Router serving one layer, cutting off requests after `timeout`
pub fn router_with_timeout(layer: Arc<Layer>, timeout: Duration) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/nodes", get(list_handler))
        .route("/nodes/:name", get(node_handler))
        .route("/actions", get(actions_handler))
        .route("/actions/:id/approve", post(approve_handler))
        .route("/actions/:id/discard", post(discard_handler))
        .layer(TimeoutLayer::new(timeout))
        .layer(cors)
        .with_state(layer)
}

/// Serve a layer on `addr` (use port 0 for any free port)
///
/// Returns the bound address and the server task.
pub async fn serve(
    layer: Arc<Layer>,
    addr: impl ToSocketAddrs,
) -> Result<(SocketAddr, tokio::task::JoinHandle<()>), ServeError> {
    let name = layer.name().to_string();
    let app = router(layer);

    let listener = TcpListener::bind(addr).await?;
    let addr = listener.local_addr()?;
    log::info!("Layer '{}' publishing on http://{}", name, addr);

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            log::error!("Layer '{}' HTTP server error: {}", name, e);
        }
    });

    Ok((addr, handle))
}

fn error_response(e: LayerError) -> ApiError {
    let status = match &e {
        LayerError::NotPublished(_)
        | LayerError::ActionNotFound(_)
        | LayerError::UnknownNode(_) => StatusCode::NOT_FOUND,
        LayerError::NotApproved(_) => StatusCode::FORBIDDEN,
        LayerError::StaleAction { .. } | LayerError::ActionDiscarded(_) => StatusCode::CONFLICT,
        LayerError::ApplyFailed { .. } => StatusCode::BAD_GATEWAY,
        LayerError::SchedulerClosed => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": e.to_string() })))
}

// --- Axum Handlers ---

async fn health_handler() -> &'static str {
    "ok"
}

async fn list_handler(State(layer): State<ServerState>) -> Json<Vec<String>> {
    Json(layer.publication().list())
}

async fn node_handler(
    State(layer): State<ServerState>,
    Path(name): Path<String>,
) -> Result<Json<PublishedValue>, ApiError> {
    layer.get(&name).map(Json).map_err(error_response)
}

async fn actions_handler(State(layer): State<ServerState>) -> Json<Vec<Action>> {
    Json(layer.actions())
}

async fn approve_handler(
    State(layer): State<ServerState>,
    Path(id): Path<String>,
) -> Result<Json<ApplyOutcome>, ApiError> {
    log::info!("Approval received for action '{}'", id);
    layer.approve(&id).await.map(Json).map_err(error_response)
}

async fn discard_handler(
    State(layer): State<ServerState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let discarded = layer.discard(&id).await.map_err(error_response)?;
    Ok(Json(serde_json::json!({ "discarded": discarded })))
}
