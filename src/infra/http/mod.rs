//! Operational status endpoint for the caches.
//!
//! | route                    | purpose                                   |
//! |--------------------------|-------------------------------------------|
//! | `GET  /api/cache/stats`  | hit/miss counters for both caches         |
//! | `GET  /api/cache/health` | health reports; `503` when unhealthy      |
//! | `POST /api/cache/clear`  | optional `?namespace=`; returns counts    |
//! | `POST /api/cache/repair` | drop expired and corrupted entries        |

mod middleware;

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    middleware as axum_middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;

use crate::application::error::AppError;
use crate::application::status::{ClearReport, RepairSummary, StatusService, StatusSnapshot};

use self::middleware::{log_responses, set_request_context};

#[derive(Clone)]
pub struct HttpState {
    pub status: Arc<StatusService>,
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/api/cache/stats", get(cache_stats))
        .route("/api/cache/health", get(cache_health))
        .route("/api/cache/clear", post(cache_clear))
        .route("/api/cache/repair", post(cache_repair))
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
struct ClearParams {
    namespace: Option<String>,
}

async fn cache_stats(State(state): State<HttpState>) -> Json<StatusSnapshot> {
    Json(state.status.snapshot())
}

async fn cache_health(State(state): State<HttpState>) -> Result<Response, AppError> {
    let health = blocking(move || state.status.health()).await?;
    let status = if health.overall_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok((status, Json(health)).into_response())
}

async fn cache_clear(
    State(state): State<HttpState>,
    Query(params): Query<ClearParams>,
) -> Result<Json<ClearReport>, AppError> {
    let report = blocking(move || state.status.clear(params.namespace.as_deref())).await??;
    Ok(Json(report))
}

async fn cache_repair(State(state): State<HttpState>) -> Result<Json<RepairSummary>, AppError> {
    Ok(Json(blocking(move || state.status.repair()).await?))
}

/// Cache maintenance touches the filesystem; keep it off the async workers.
async fn blocking<T, F>(work: F) -> Result<T, AppError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| AppError::unexpected(format!("status task failed: {err}")))
}
