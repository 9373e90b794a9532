//! Event bus inspection endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use event_bus::{BusStatistics, DeadLetter, SubscriptionInfo};
use event_store::EventStore;
use serde::Serialize;

use super::AppState;
use crate::error::ApiError;

#[derive(Serialize)]
pub struct RedeliveredResponse {
    pub redelivered: usize,
}

/// GET /bus/stats
pub async fn stats<S: EventStore>(State(state): State<Arc<AppState<S>>>) -> Json<BusStatistics> {
    Json(state.bus.statistics().await)
}

/// GET /bus/dead-letters
pub async fn dead_letters<S: EventStore>(
    State(state): State<Arc<AppState<S>>>,
) -> Json<Vec<DeadLetter>> {
    Json(state.bus.dead_letters().await)
}

/// POST /bus/dead-letters/redeliver
pub async fn redeliver<S: EventStore>(
    State(state): State<Arc<AppState<S>>>,
) -> Result<Json<RedeliveredResponse>, ApiError> {
    let redelivered = state.bus.redeliver_dead_letters().await?;
    Ok(Json(RedeliveredResponse { redelivered }))
}

/// GET /bus/subscriptions/{event_type}
pub async fn subscriptions<S: EventStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(event_type): Path<String>,
) -> Json<Vec<SubscriptionInfo>> {
    Json(state.bus.subscriptions_for(&event_type).await)
}
