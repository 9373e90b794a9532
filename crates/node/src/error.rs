//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use event_bus::{BusError, QueueError};
use event_store::EventStoreError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    Bus(BusError),
    Queue(QueueError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Bus(err) => bus_error_to_response(err),
            ApiError::Queue(err) => queue_error_to_response(err),
        };

        if status.is_server_error() {
            tracing::error!(error = %message, "internal server error");
        }
        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn bus_error_to_response(err: BusError) -> (StatusCode, String) {
    match &err {
        BusError::NotRunning => (StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
        BusError::Validation(_) => (StatusCode::BAD_REQUEST, err.to_string()),
        BusError::SubscriptionNotFound(_) => (StatusCode::NOT_FOUND, err.to_string()),
        BusError::EventStore(EventStoreError::ConcurrencyConflict { .. }) => {
            (StatusCode::CONFLICT, err.to_string())
        }
        BusError::EventStore(_) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

fn queue_error_to_response(err: QueueError) -> (StatusCode, String) {
    match &err {
        QueueError::QueueNotFound(_) => (StatusCode::NOT_FOUND, err.to_string()),
        QueueError::InvalidName(_) => (StatusCode::BAD_REQUEST, err.to_string()),
    }
}

impl From<BusError> for ApiError {
    fn from(err: BusError) -> Self {
        ApiError::Bus(err)
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        ApiError::Queue(err)
    }
}
