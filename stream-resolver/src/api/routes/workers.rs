//! Worker inspection, cancellation and configuration.

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::get,
};
use uuid::Uuid;

use super::unavailable;
use crate::api::error::ApiResult;
use crate::api::models::{ActionResponse, WorkerListResponse};
use crate::api::server::AppState;
use crate::error::Error;
use crate::worker::{StreamWorker, WorkerConfig, WorkerConfigUpdate, WorkerManager};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_workers))
        .route("/config", get(get_config).put(update_config))
        .route("/{id}", get(get_worker).delete(cancel_worker))
}

fn manager(state: &AppState) -> ApiResult<&WorkerManager> {
    state
        .workers
        .as_deref()
        .ok_or_else(|| unavailable("Worker manager"))
}

async fn list_workers(State(state): State<AppState>) -> ApiResult<Json<WorkerListResponse>> {
    let workers = manager(&state)?;
    Ok(Json(WorkerListResponse {
        workers: workers.list(),
        stats: workers.stats(),
    }))
}

async fn get_config(State(state): State<AppState>) -> ApiResult<Json<WorkerConfig>> {
    Ok(Json(manager(&state)?.config()))
}

/// Partial update; omitted fields keep their current values.
async fn update_config(
    State(state): State<AppState>,
    Json(update): Json<WorkerConfigUpdate>,
) -> ApiResult<Json<WorkerConfig>> {
    let workers = manager(&state)?;
    let next = workers.config().merged(update)?;
    workers.update_config(next.clone())?;
    tracing::info!(config = ?next, "Worker configuration updated");
    Ok(Json(next))
}

async fn get_worker(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<StreamWorker>> {
    manager(&state)?
        .get(&id)
        .map(Json)
        .ok_or_else(|| Error::not_found("Worker", id.to_string()).into())
}

async fn cancel_worker(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ActionResponse>> {
    let cancelled = manager(&state)?.cancel(&id)?;
    let message = if cancelled {
        format!("Worker {id} cancelled")
    } else {
        format!("Worker {id} already finished")
    };
    Ok(Json(ActionResponse {
        success: cancelled,
        message,
    }))
}
