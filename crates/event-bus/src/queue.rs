//! Named priority queues with delayed delivery and failed-job tracking.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{SharedClock, instant_after, system_clock};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::error::{HandlerError, QueueError};
use crate::retry::RetryPolicy;
use crate::schedule::DelayedQueue;

/// Priority used when a message does not set one.
pub const DEFAULT_MESSAGE_PRIORITY: i32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    DomainEvent,
    Command,
    Query,
    IntegrationEvent,
}

/// A unit of work carried by a [`MessageQueue`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub kind: MessageKind,
    pub data: serde_json::Value,

    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,

    /// Lower values are processed first.
    pub priority: i32,

    /// Time to wait after publishing before the message becomes pending.
    pub delay: Duration,

    /// Failed processing attempts so far.
    pub attempts: u32,

    /// Filled from the queue's `retry_attempts` on publish when unset.
    pub max_attempts: Option<u32>,

    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Creates a message of `kind` with default priority and no delay.
    pub fn new(kind: MessageKind, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            data,
            metadata: HashMap::new(),
            priority: DEFAULT_MESSAGE_PRIORITY,
            delay: Duration::ZERO,
            attempts: 0,
            max_attempts: None,
            created_at: Utc::now(),
        }
    }

    /// Creates a domain event message.
    pub fn domain_event(data: serde_json::Value) -> Self {
        Self::new(MessageKind::DomainEvent, data)
    }

    /// Creates a command message.
    pub fn command(data: serde_json::Value) -> Self {
        Self::new(MessageKind::Command, data)
    }

    /// Creates a query message.
    pub fn query(data: serde_json::Value) -> Self {
        Self::new(MessageKind::Query, data)
    }

    /// Creates an integration event message.
    pub fn integration_event(data: serde_json::Value) -> Self {
        Self::new(MessageKind::IntegrationEvent, data)
    }

    /// Sets the priority. Lower values run first.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Holds the message back for `delay` after publishing.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Overrides the queue's attempt limit for this message.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Adds a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Per-queue processing settings.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Messages a worker processes per tick.
    pub concurrency: usize,

    /// Total attempts per message, including the first.
    pub retry_attempts: u32,

    pub retry_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_retry_delay: Duration,

    /// Forget completed messages instead of keeping them for inspection.
    pub remove_on_complete: bool,

    /// Discard messages that exhaust their attempts instead of recording a
    /// [`FailedJob`].
    pub remove_on_fail: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_retry_delay: Duration::from_secs(30),
            remove_on_complete: true,
            remove_on_fail: false,
        }
    }
}

impl QueueConfig {
    /// Backoff between attempts, as a [`RetryPolicy`].
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry_attempts.saturating_sub(1),
            retry_delay: self.retry_delay,
            backoff_multiplier: self.backoff_multiplier,
            max_retry_delay: self.max_retry_delay,
        }
    }
}

/// A message that used up its attempts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedJob {
    pub id: Uuid,
    pub message: Message,
    pub error: String,
    pub failed_at: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStats {
    pub name: String,
    pub pending: usize,
    pub delayed: usize,
    pub in_flight: usize,
    pub failed: usize,
    pub total_completed: u64,
    pub total_failed: u64,
}

/// What [`MessageQueue::process_next`] did with the message it took.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    Completed {
        message_id: Uuid,
    },
    Retrying {
        message_id: Uuid,
        attempts: u32,
        retry_at: DateTime<Utc>,
    },
    Failed {
        message_id: Uuid,
        attempts: u32,
    },
}

/// Consumes messages from a queue.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError>;
}

struct NamedQueue {
    config: QueueConfig,
    pending: VecDeque<Message>,
    delayed: DelayedQueue<Message>,
    in_flight: HashSet<Uuid>,
    completed: Vec<Message>,
    failed: Vec<FailedJob>,
    total_completed: u64,
    total_failed: u64,
}

impl NamedQueue {
    fn new(config: QueueConfig) -> Self {
        Self {
            config,
            pending: VecDeque::new(),
            delayed: DelayedQueue::new(),
            in_flight: HashSet::new(),
            completed: Vec::new(),
            failed: Vec::new(),
            total_completed: 0,
            total_failed: 0,
        }
    }

    /// Inserts before the first message with a greater priority value.
    fn enqueue(&mut self, message: Message) {
        let position = self
            .pending
            .iter()
            .position(|queued| queued.priority > message.priority)
            .unwrap_or(self.pending.len());
        self.pending.insert(position, message);
    }

    fn stats(&self, name: &str) -> QueueStats {
        QueueStats {
            name: name.to_string(),
            pending: self.pending.len(),
            delayed: self.delayed.len(),
            in_flight: self.in_flight.len(),
            failed: self.failed.len(),
            total_completed: self.total_completed,
            total_failed: self.total_failed,
        }
    }
}

/// A set of named in-memory queues.
///
/// Publishing to a queue that does not exist creates it with
/// [`QueueConfig::default`]. Failed messages are retried with the queue's
/// backoff until they reach their attempt limit.
pub struct MessageQueue {
    queues: Mutex<HashMap<String, NamedQueue>>,
    clock: SharedClock,
    shutdown: watch::Sender<bool>,
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageQueue {
    /// Creates an empty queue registry on the system clock.
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    /// Creates an empty queue registry that schedules delays from `clock`.
    pub fn with_clock(clock: SharedClock) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            queues: Mutex::new(HashMap::new()),
            clock,
            shutdown,
        }
    }

    /// Creates `name`, or replaces its configuration if it already exists.
    pub async fn create_queue(&self, name: &str, config: QueueConfig) -> Result<(), QueueError> {
        validate_name(name)?;
        let mut queues = self.queues.lock().await;
        match queues.get_mut(name) {
            Some(queue) => queue.config = config,
            None => {
                queues.insert(name.to_string(), NamedQueue::new(config));
            }
        }
        tracing::info!(queue = name, "queue created");
        Ok(())
    }

    /// Adds `message` to `queue` and returns its id.
    ///
    /// Messages with a delay wait in the delayed list until
    /// [`promote_due_messages`](Self::promote_due_messages) moves them.
    pub async fn publish(&self, queue: &str, mut message: Message) -> Result<Uuid, QueueError> {
        validate_name(queue)?;
        let now = self.clock.now();
        let mut queues = self.queues.lock().await;
        let target = queues.entry(queue.to_string()).or_insert_with(|| {
            tracing::info!(queue, "queue auto-created with default configuration");
            NamedQueue::new(QueueConfig::default())
        });

        message.max_attempts = Some(message.max_attempts.unwrap_or(target.config.retry_attempts));
        let id = message.id;

        if message.delay.is_zero() {
            target.enqueue(message);
        } else {
            let execute_at = instant_after(now, message.delay);
            tracing::debug!(queue, message_id = %id, %execute_at, "message delayed");
            target.delayed.schedule(execute_at, message);
        }

        Ok(id)
    }

    /// Moves every due delayed message into its queue's pending order.
    pub async fn promote_due_messages(&self) -> usize {
        let now = self.clock.now();
        let mut queues = self.queues.lock().await;
        let mut promoted = 0;
        for queue in queues.values_mut() {
            for message in queue.delayed.drain_due(now) {
                queue.enqueue(message);
                promoted += 1;
            }
        }
        if promoted > 0 {
            tracing::debug!(promoted, "delayed messages promoted");
        }
        promoted
    }

    /// Takes the next pending message from `queue` and runs `handler` on it.
    ///
    /// Returns `None` when nothing is pending.
    #[tracing::instrument(skip(self, handler))]
    pub async fn process_next(
        &self,
        queue: &str,
        handler: &dyn MessageHandler,
    ) -> Result<Option<ProcessOutcome>, QueueError> {
        let message = {
            let mut queues = self.queues.lock().await;
            let target = queues
                .get_mut(queue)
                .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))?;
            let Some(message) = target.pending.pop_front() else {
                return Ok(None);
            };
            target.in_flight.insert(message.id);
            message
        };

        let result = handler.handle(&message).await;

        let now = self.clock.now();
        let mut queues = self.queues.lock().await;
        let target = queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))?;
        target.in_flight.remove(&message.id);

        let message_id = message.id;
        let outcome = match result {
            Ok(()) => {
                target.total_completed += 1;
                if !target.config.remove_on_complete {
                    target.completed.push(message);
                }
                metrics::counter!("message_queue_messages_processed_total", "queue" => queue.to_string())
                    .increment(1);
                ProcessOutcome::Completed { message_id }
            }
            Err(error) => {
                let mut message = message;
                message.attempts += 1;
                let attempts = message.attempts;
                let max_attempts = message
                    .max_attempts
                    .unwrap_or(target.config.retry_attempts);

                if attempts < max_attempts {
                    let retry_at = instant_after(
                        now,
                        target.config.retry_policy().delay_for_retry(attempts),
                    );
                    tracing::warn!(message_id = %message_id, attempts, %retry_at, %error, "message failed, retry scheduled");
                    target.delayed.schedule(retry_at, message);
                    ProcessOutcome::Retrying {
                        message_id,
                        attempts,
                        retry_at,
                    }
                } else {
                    target.total_failed += 1;
                    tracing::error!(message_id = %message_id, attempts, %error, "message failed permanently");
                    if !target.config.remove_on_fail {
                        target.failed.push(FailedJob {
                            id: Uuid::new_v4(),
                            message,
                            error: error.to_string(),
                            failed_at: now,
                            attempts,
                            max_attempts,
                        });
                    }
                    metrics::counter!("message_queue_jobs_failed_total", "queue" => queue.to_string())
                        .increment(1);
                    ProcessOutcome::Failed {
                        message_id,
                        attempts,
                    }
                }
            }
        };

        Ok(Some(outcome))
    }

    /// Processes `queue` on an interval until [`shutdown`](Self::shutdown).
    ///
    /// Each tick promotes due messages and then runs up to the queue's
    /// `concurrency` messages at once.
    pub fn spawn_worker(
        self: &Arc<Self>,
        queue: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
        poll_interval: Duration,
    ) -> JoinHandle<()> {
        let name = queue.into();
        let queues = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            if *shutdown.borrow() {
                return;
            }
            queues.ensure_queue(&name).await;
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        queues.promote_due_messages().await;
                        let concurrency = queues.concurrency(&name).await;
                        let batch = (0..concurrency).map(|_| queues.process_next(&name, handler.as_ref()));
                        for result in join_all(batch).await {
                            if let Err(error) = result {
                                tracing::warn!(queue = %name, %error, "queue worker tick failed");
                            }
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            tracing::debug!(queue = %name, "queue worker stopped");
        })
    }

    /// Promotes due delayed messages on an interval until
    /// [`shutdown`](Self::shutdown).
    pub fn spawn_scheduler(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let queues = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            if *shutdown.borrow() {
                return;
            }
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        queues.promote_due_messages().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Signals workers and schedulers to exit.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        tracing::info!("message queue shutting down");
    }

    /// Re-enqueues every failed job of `queue` with one more attempt counted
    /// and returns how many were re-enqueued.
    pub async fn retry_failed_jobs(&self, queue: &str) -> Result<usize, QueueError> {
        let mut queues = self.queues.lock().await;
        let target = queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))?;

        let jobs = std::mem::take(&mut target.failed);
        let count = jobs.len();
        for job in jobs {
            let mut message = job.message;
            message.attempts += 1;
            target.enqueue(message);
        }

        tracing::info!(queue, count, "failed jobs re-enqueued");
        Ok(count)
    }

    /// Returns the failed jobs of `queue`, oldest first.
    pub async fn failed_jobs(&self, queue: &str) -> Result<Vec<FailedJob>, QueueError> {
        self.with_queue(queue, |target| target.failed.clone()).await
    }

    /// Drops the failed jobs of `queue` and returns how many there were.
    pub async fn clear_failed_jobs(&self, queue: &str) -> Result<usize, QueueError> {
        let mut queues = self.queues.lock().await;
        let target = queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))?;
        let count = target.failed.len();
        target.failed.clear();
        Ok(count)
    }

    /// Completed messages kept because the queue has `remove_on_complete` off.
    pub async fn completed_jobs(&self, queue: &str) -> Result<Vec<Message>, QueueError> {
        self.with_queue(queue, |target| target.completed.clone()).await
    }

    /// Returns current counts for `queue`.
    pub async fn queue_stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        self.with_queue(queue, |target| target.stats(queue)).await
    }

    /// Names of every queue, sorted.
    pub async fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.queues.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    async fn with_queue<T>(
        &self,
        queue: &str,
        read: impl FnOnce(&NamedQueue) -> T,
    ) -> Result<T, QueueError> {
        let queues = self.queues.lock().await;
        queues
            .get(queue)
            .map(read)
            .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))
    }

    async fn ensure_queue(&self, name: &str) {
        self.queues
            .lock()
            .await
            .entry(name.to_string())
            .or_insert_with(|| NamedQueue::new(QueueConfig::default()));
    }

    async fn concurrency(&self, name: &str) -> usize {
        self.queues
            .lock()
            .await
            .get(name)
            .map_or(1, |queue| queue.config.concurrency.max(1))
    }
}

fn validate_name(name: &str) -> Result<(), QueueError> {
    if name.trim().is_empty() {
        return Err(QueueError::InvalidName(name.to_string()));
    }
    Ok(())
}
