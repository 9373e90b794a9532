//! Integration tests for the node's HTTP surface.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use event_bus::{
    EventHandler, HandlerError, Message, MessageHandler, RetryPolicy, SubscriptionOptions,
};
use event_store::{EventEnvelope, InMemoryEventStore, StoredEvent, Version};
use metrics_exporter_prometheus::PrometheusHandle;
use node::config::Config;
use node::routes::AppState;
use tower::ServiceExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            builder
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

struct AlwaysFails;

#[async_trait]
impl EventHandler for AlwaysFails {
    fn name(&self) -> &str {
        "always-fails"
    }

    fn event_type(&self) -> &str {
        "UserCreated"
    }

    async fn process_event(&self, _event: &StoredEvent) -> Result<(), HandlerError> {
        Err(HandlerError::failed("downstream unavailable"))
    }
}

struct Rejects;

#[async_trait]
impl MessageHandler for Rejects {
    async fn handle(&self, _message: &Message) -> Result<(), HandlerError> {
        Err(HandlerError::failed("rejected"))
    }
}

async fn setup() -> (axum::Router, Arc<AppState<InMemoryEventStore>>) {
    let state = node::create_state(InMemoryEventStore::new(), &Config::default());
    state.bus.start().await;
    let app = node::create_app(state.clone(), get_metrics_handle());
    (app, state)
}

fn user_created(aggregate_id: &str) -> EventEnvelope {
    EventEnvelope::builder()
        .event_type("UserCreated")
        .aggregate_id(aggregate_id)
        .aggregate_type("User")
        .version(Version::first())
        .build()
}

async fn send(app: axum::Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null)
    };
    (status, json)
}

#[tokio::test]
async fn test_health_check() {
    let (app, state) = setup().await;

    let (status, json) = send(app.clone(), "GET", "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["bus_running"], true);

    state.bus.stop().await;
    let (status, json) = send(app, "GET", "/health").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["bus_running"], false);
}

#[tokio::test]
async fn test_bus_stats() {
    let (app, state) = setup().await;
    state
        .bus
        .publish_all(vec![user_created("u1"), user_created("u2")], None)
        .await
        .unwrap();

    let (status, json) = send(app, "GET", "/bus/stats").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["is_running"], true);
    assert_eq!(json["total_published"], 2);
    assert_eq!(json["dead_letter_queue_size"], 0);
}

#[tokio::test]
async fn test_dead_letters_and_redelivery() {
    let (app, state) = setup().await;
    state
        .bus
        .subscribe(
            "UserCreated",
            Arc::new(AlwaysFails),
            SubscriptionOptions::new().with_retry_policy(RetryPolicy::no_retries()),
        )
        .await
        .unwrap();
    state.bus.publish(user_created("u1"), None).await.unwrap();

    let (status, json) = send(app.clone(), "GET", "/bus/dead-letters").await;
    assert_eq!(status, StatusCode::OK);
    let letters = json.as_array().unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0]["handler_name"], "always-fails");
    assert_eq!(letters[0]["attempts"], 1);

    let (status, json) = send(app.clone(), "POST", "/bus/dead-letters/redeliver").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["redelivered"], 1);

    let (_, json) = send(app, "GET", "/bus/subscriptions/UserCreated").await;
    assert_eq!(json[0]["handler_name"], "always-fails");
    assert_eq!(json[0]["max_retries"], 0);
}

#[tokio::test]
async fn test_redeliver_requires_running_bus() {
    let (app, state) = setup().await;
    state.bus.stop().await;

    let (status, json) = send(app, "POST", "/bus/dead-letters/redeliver").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(json["error"].as_str().unwrap().contains("not running"));
}

#[tokio::test]
async fn test_unknown_queue_is_not_found() {
    let (app, _state) = setup().await;

    let (status, json) = send(app, "GET", "/queues/missing/stats").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json["error"].as_str().unwrap().contains("missing"));
}

#[tokio::test]
async fn test_queue_stats_and_retry() {
    let (app, state) = setup().await;
    state
        .queues
        .publish(
            "emails",
            Message::command(serde_json::json!({"to": "ada@example.com"})).with_max_attempts(1),
        )
        .await
        .unwrap();
    state.queues.process_next("emails", &Rejects).await.unwrap();

    let (_, json) = send(app.clone(), "GET", "/queues").await;
    assert_eq!(json, serde_json::json!(["emails"]));

    let (status, json) = send(app.clone(), "GET", "/queues/emails/failed").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json[0]["error"], "Handler failed: rejected");

    let (status, json) = send(app.clone(), "POST", "/queues/emails/retry").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["retried"], 1);

    let (_, json) = send(app, "GET", "/queues/emails/stats").await;
    assert_eq!(json["pending"], 1);
    assert_eq!(json["failed"], 0);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let (app, state) = setup().await;
    state.bus.publish(user_created("m1"), None).await.unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("event_bus_events_published_total"));
}
