//! Message queue inspection endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use event_bus::{FailedJob, QueueStats};
use event_store::EventStore;
use serde::Serialize;

use super::AppState;
use crate::error::ApiError;

#[derive(Serialize)]
pub struct RetriedResponse {
    pub queue: String,
    pub retried: usize,
}

/// GET /queues
pub async fn list<S: EventStore>(State(state): State<Arc<AppState<S>>>) -> Json<Vec<String>> {
    Json(state.queues.queue_names().await)
}

/// GET /queues/{name}/stats
pub async fn stats<S: EventStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(name): Path<String>,
) -> Result<Json<QueueStats>, ApiError> {
    Ok(Json(state.queues.queue_stats(&name).await?))
}

/// GET /queues/{name}/failed
pub async fn failed<S: EventStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(name): Path<String>,
) -> Result<Json<Vec<FailedJob>>, ApiError> {
    Ok(Json(state.queues.failed_jobs(&name).await?))
}

/// POST /queues/{name}/retry: re-enqueues every failed job.
pub async fn retry<S: EventStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(name): Path<String>,
) -> Result<Json<RetriedResponse>, ApiError> {
    let retried = state.queues.retry_failed_jobs(&name).await?;
    Ok(Json(RetriedResponse {
        queue: name,
        retried,
    }))
}
