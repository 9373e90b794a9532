//! The per-subscriber unit of work and its retrying wrapper.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use event_store::StoredEvent;

use crate::error::HandlerError;
use crate::retry::RetryPolicy;

/// State tracked across the attempts of one [`EventHandler::handle`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingContext {
    pub event_id: String,
    pub handler_name: String,
    pub started_at: DateTime<Utc>,

    /// Zero-based index of the current attempt.
    pub retry_count: u32,

    pub max_retries: u32,
    pub success: bool,
    pub last_error: Option<String>,
}

/// Outcome of a successful [`EventHandler::handle`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingResult {
    pub event_id: String,
    pub handler_name: String,
    pub attempts: u32,
    pub duration: Duration,
}

/// Processes stored events of one type.
///
/// Implementors provide [`process_event`](Self::process_event). The event bus
/// calls it once per delivery attempt and owns retry scheduling itself;
/// [`handle`](Self::handle) wraps it in an in-place retry loop for callers
/// that drive a handler directly.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    /// The event type this handler processes.
    fn event_type(&self) -> &str;

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }

    async fn process_event(&self, event: &StoredEvent) -> Result<(), HandlerError>;

    fn can_handle(&self, event_type: &str) -> bool {
        self.event_type() == event_type
    }

    async fn on_processing_success(&self, _event: &StoredEvent, context: &ProcessingContext) {
        tracing::debug!(
            handler = %context.handler_name,
            event_id = %context.event_id,
            attempts = context.retry_count + 1,
            "event processed"
        );
    }

    async fn on_processing_failure(
        &self,
        _event: &StoredEvent,
        context: &ProcessingContext,
        error: &HandlerError,
    ) {
        tracing::error!(
            handler = %context.handler_name,
            event_id = %context.event_id,
            attempts = context.retry_count + 1,
            error = %error,
            "event processing failed"
        );
    }

    /// Processes `event`, retrying failures per [`retry_policy`](Self::retry_policy).
    ///
    /// Waits `delay_for_retry(n)` before retry `n`. Returns the last error
    /// once every attempt has failed.
    async fn handle(&self, event: &StoredEvent) -> Result<ProcessingResult, HandlerError> {
        let policy = self.retry_policy();
        let started = Instant::now();
        let mut context = ProcessingContext {
            event_id: event.id(),
            handler_name: self.name().to_string(),
            started_at: Utc::now(),
            retry_count: 0,
            max_retries: policy.max_retries,
            success: false,
            last_error: None,
        };

        validate_handler(self)?;
        validate_event(self, event)?;

        let mut last_error = HandlerError::failed("no attempt was made");
        for attempt in 0..=policy.max_retries {
            context.retry_count = attempt;
            match self.process_event(event).await {
                Ok(()) => {
                    context.success = true;
                    context.last_error = None;
                    self.on_processing_success(event, &context).await;
                    return Ok(ProcessingResult {
                        event_id: context.event_id,
                        handler_name: context.handler_name,
                        attempts: attempt + 1,
                        duration: started.elapsed(),
                    });
                }
                Err(error) => {
                    tracing::warn!(
                        handler = %context.handler_name,
                        event_id = %context.event_id,
                        attempt = attempt + 1,
                        error = %error,
                        "handler attempt failed"
                    );
                    context.last_error = Some(error.to_string());
                    last_error = error;
                    if attempt < policy.max_retries {
                        tokio::time::sleep(policy.delay_for_retry(attempt + 1)).await;
                    }
                }
            }
        }

        self.on_processing_failure(event, &context, &last_error).await;
        Err(last_error)
    }
}

/// Rejects handlers without a name or event type.
pub fn validate_handler<H: EventHandler + ?Sized>(handler: &H) -> Result<(), HandlerError> {
    if handler.name().trim().is_empty() {
        return Err(HandlerError::InvalidHandler("handler name is empty".to_string()));
    }
    if handler.event_type().trim().is_empty() {
        return Err(HandlerError::InvalidHandler(format!(
            "handler {} has no event type",
            handler.name()
        )));
    }
    Ok(())
}

/// Rejects events that are malformed or not of the handler's type.
pub fn validate_event<H: EventHandler + ?Sized>(
    handler: &H,
    event: &StoredEvent,
) -> Result<(), HandlerError> {
    if event.aggregate_id().is_empty() {
        return Err(HandlerError::InvalidEvent("aggregate id is empty".to_string()));
    }
    if event.event_type().trim().is_empty() {
        return Err(HandlerError::InvalidEvent("event type is empty".to_string()));
    }
    if !handler.can_handle(event.event_type()) {
        return Err(HandlerError::InvalidEvent(format!(
            "{} cannot handle {}",
            handler.name(),
            event.event_type()
        )));
    }
    Ok(())
}
