//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use event_store::EventStore;
use serde::Serialize;

use super::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub bus_running: bool,
}

/// GET /health: 200 while the bus is running, 503 otherwise.
pub async fn check<S: EventStore>(
    State(state): State<Arc<AppState<S>>>,
) -> (StatusCode, Json<HealthResponse>) {
    let bus_running = state.bus.is_running();
    let (status, label) = if bus_running {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "stopped")
    };
    (
        status,
        Json(HealthResponse {
            status: label,
            bus_running,
        }),
    )
}
