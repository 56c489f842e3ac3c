//! Read-only status API
//!
//! - `GET /health`: 200 when every bundle is OK, 503 otherwise
//! - `GET /v1/status`: all bundle statuses
//! - `GET /v1/data/*path`: committed store content (diagnostic)

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

use crate::status::{Snapshot, StatusRegistry};
use crate::storage::{StoragePath, Store};

#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<StatusRegistry>,
    pub store: Arc<dyn Store>,
}

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/status", get(status))
        .route("/v1/data/*path", get(data))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    healthy: bool,
    not_ready: Vec<String>,
}

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let not_ready: Vec<String> = state
        .registry
        .snapshot()
        .into_values()
        .filter(|s| !s.is_ok())
        .map(|s| s.name)
        .collect();
    let healthy = not_ready.is_empty();
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(HealthResponse { healthy, not_ready }))
}

async fn status(State(state): State<ApiState>) -> Json<Snapshot> {
    Json(state.registry.snapshot())
}

async fn data(State(state): State<ApiState>, Path(path): Path<String>) -> Response {
    let path = match StoragePath::parse(&format!("/{}", path.trim_start_matches('/'))) {
        Ok(path) => path,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    let store = state.store.clone();
    let read = tokio::task::spawn_blocking(move || store.read(&path)).await;
    match read {
        Ok(Ok(Some(value))) => Json(serde_json::json!({ "result": value })).into_response(),
        Ok(Ok(None)) => Json(serde_json::json!({})).into_response(),
        Ok(Err(e)) => {
            warn!(error = %e, "Store read failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Serve the API until `shutdown` resolves
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: ApiState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
