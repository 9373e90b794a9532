//! Operational server for the event bus and message queues.
//!
//! Exposes health, Prometheus metrics, and inspection endpoints for bus
//! statistics, dead letters and queue state. Business endpoints are left to
//! the services embedding the bus.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use event_bus::{EventBus, MessageQueue};
use event_store::EventStore;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;
use routes::AppState;

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: EventStore + 'static>(
    state: Arc<AppState<S>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check::<S>))
        .route("/bus/stats", get(routes::bus::stats::<S>))
        .route("/bus/dead-letters", get(routes::bus::dead_letters::<S>))
        .route(
            "/bus/dead-letters/redeliver",
            post(routes::bus::redeliver::<S>),
        )
        .route(
            "/bus/subscriptions/{event_type}",
            get(routes::bus::subscriptions::<S>),
        )
        .route("/queues", get(routes::queues::list::<S>))
        .route("/queues/{name}/stats", get(routes::queues::stats::<S>))
        .route("/queues/{name}/failed", get(routes::queues::failed::<S>))
        .route("/queues/{name}/retry", post(routes::queues::retry::<S>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Builds the bus over `event_store` and an empty set of queues.
pub fn create_state<S: EventStore>(event_store: S, config: &Config) -> Arc<AppState<S>> {
    Arc::new(AppState {
        bus: Arc::new(EventBus::with_config(event_store, config.bus.clone())),
        queues: Arc::new(MessageQueue::new()),
    })
}
