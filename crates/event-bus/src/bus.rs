//! Publish/subscribe dispatch over an event store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use common::{AggregateId, SharedClock, instant_after, system_clock};
use event_store::store::validate_save_request;
use event_store::{
    EventEnvelope, EventMetadata, EventStore, EventStoreError, StoredEvent, Version,
};
use futures_util::future::join_all;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::config::EventBusConfig;
use crate::dead_letter::DeadLetter;
use crate::error::{BusError, HandlerError, Result};
use crate::handler::{EventHandler, validate_handler};
use crate::schedule::DelayedQueue;
use crate::stats::{BusStatistics, Counters};
use crate::subscription::{Subscription, SubscriptionId, SubscriptionInfo, SubscriptionOptions};

struct RetryEntry {
    subscription_id: SubscriptionId,
    failures: u32,
    first_failed_at: DateTime<Utc>,
}

struct PendingRetry {
    key: String,
    subscription_id: SubscriptionId,
    event: StoredEvent,
}

#[derive(Default)]
struct RetryState {
    entries: HashMap<String, RetryEntry>,
    schedule: DelayedQueue<PendingRetry>,
}

/// `{aggregateId}-{eventType}-{subscriptionId}` qualified by the stored
/// event, so each delivery of each event keeps its own failure count.
fn retry_key(event: &StoredEvent, subscription_id: SubscriptionId) -> String {
    format!(
        "{}-{}-{}:{}",
        event.aggregate_id(),
        event.event_type(),
        subscription_id,
        event.id()
    )
}

/// Appends events to a store and fans them out to subscribed handlers.
///
/// Subscribers of an event are dispatched in ascending priority order
/// (registration order breaks ties) and run concurrently; a publish returns
/// once every dispatch has settled. Handler failures never fail the publish.
/// A failed delivery is retried with capped exponential backoff by
/// [`process_due_retries`](Self::process_due_retries) and moves to the
/// dead-letter queue once the subscription's retry budget is spent.
pub struct EventBus<S: EventStore> {
    store: S,
    config: EventBusConfig,
    clock: SharedClock,
    running: watch::Sender<bool>,
    started_at: RwLock<Option<DateTime<Utc>>>,
    subscriptions: RwLock<Vec<Subscription>>,
    retries: Mutex<RetryState>,
    dead_letters: RwLock<Vec<DeadLetter>>,
    counters: Mutex<Counters>,
}

impl<S: EventStore> EventBus<S> {
    /// Creates a stopped bus with the default configuration.
    pub fn new(store: S) -> Self {
        Self::with_config(store, EventBusConfig::default())
    }

    /// Creates a stopped bus with `config`.
    pub fn with_config(store: S, config: EventBusConfig) -> Self {
        let (running, _) = watch::channel(false);
        Self {
            store,
            config,
            clock: system_clock(),
            running,
            started_at: RwLock::new(None),
            subscriptions: RwLock::new(Vec::new()),
            retries: Mutex::new(RetryState::default()),
            dead_letters: RwLock::new(Vec::new()),
            counters: Mutex::new(Counters::default()),
        }
    }

    /// Replaces the clock used for retry scheduling and timestamps.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Returns the underlying event store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Returns the bus configuration.
    pub fn config(&self) -> &EventBusConfig {
        &self.config
    }

    /// Starts accepting publishes and resets the uptime clock.
    pub async fn start(&self) {
        if self.running.send_replace(true) {
            return;
        }
        *self.started_at.write().await = Some(self.clock.now());
        tracing::info!("event bus started");
    }

    /// Stops accepting publishes. Running retry workers exit.
    pub async fn stop(&self) {
        if !self.running.send_replace(false) {
            return;
        }
        *self.started_at.write().await = None;
        tracing::info!("event bus stopped");
    }

    /// Returns whether the bus accepts publishes.
    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(BusError::NotRunning)
        }
    }

    /// Registers `handler` for events of `event_type`.
    ///
    /// Allowed whether or not the bus is running.
    pub async fn subscribe(
        &self,
        event_type: impl Into<String>,
        handler: Arc<dyn EventHandler>,
        options: SubscriptionOptions,
    ) -> Result<SubscriptionId> {
        let event_type = event_type.into();
        if event_type.trim().is_empty() {
            return Err(BusError::validation("subscription event type is empty"));
        }
        validate_handler(handler.as_ref()).map_err(|e| BusError::validation(e.to_string()))?;

        let subscription = Subscription {
            id: SubscriptionId::new(),
            event_type,
            handler,
            priority: options.priority,
            retry_policy: options
                .retry_policy
                .unwrap_or(self.config.default_retry_policy),
            is_active: true,
            created_at: self.clock.now(),
        };
        let id = subscription.id;

        tracing::info!(
            subscription_id = %id,
            event_type = %subscription.event_type,
            handler = subscription.handler.name(),
            priority = subscription.priority,
            "subscription registered"
        );
        self.subscriptions.write().await.push(subscription);

        Ok(id)
    }

    /// Removes a subscription and drops its pending retries.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        {
            let mut subscriptions = self.subscriptions.write().await;
            let position = subscriptions
                .iter()
                .position(|s| s.id == id)
                .ok_or(BusError::SubscriptionNotFound(id))?;
            subscriptions.remove(position);
        }

        let mut retries = self.retries.lock().await;
        retries.entries.retain(|_, entry| entry.subscription_id != id);
        retries.schedule.retain(|pending| pending.subscription_id != id);

        tracing::info!(subscription_id = %id, "subscription removed");
        Ok(())
    }

    /// Stops dispatching to a subscription without removing it.
    pub async fn pause_subscription(&self, id: SubscriptionId) -> Result<()> {
        self.set_active(id, false).await
    }

    /// Resumes dispatching to a paused subscription.
    pub async fn resume_subscription(&self, id: SubscriptionId) -> Result<()> {
        self.set_active(id, true).await
    }

    async fn set_active(&self, id: SubscriptionId, active: bool) -> Result<()> {
        let mut subscriptions = self.subscriptions.write().await;
        let subscription = subscriptions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(BusError::SubscriptionNotFound(id))?;
        subscription.is_active = active;
        tracing::info!(subscription_id = %id, active, "subscription state changed");
        Ok(())
    }

    /// Subscriptions for `event_type` in dispatch order.
    pub async fn subscriptions_for(&self, event_type: &str) -> Vec<SubscriptionInfo> {
        let mut infos: Vec<_> = self
            .subscriptions
            .read()
            .await
            .iter()
            .filter(|s| s.event_type == event_type)
            .map(Subscription::info)
            .collect();
        infos.sort_by_key(|info| info.priority);
        infos
    }

    /// Appends one event, which must follow its aggregate's current version,
    /// and dispatches it.
    pub async fn publish(
        &self,
        event: EventEnvelope,
        metadata: Option<EventMetadata>,
    ) -> Result<StoredEvent> {
        let mut stored = self.publish_all(vec![event], metadata).await?;
        stored
            .pop()
            .ok_or_else(|| BusError::validation("store returned no event"))
    }

    /// Appends `events` and dispatches each stored event to its subscribers.
    ///
    /// Every event is validated before anything is written. Consecutive
    /// events of the same aggregate are appended as one batch, expecting the
    /// aggregate's current stored version; envelopes whose versions do not
    /// follow it fail with a concurrency conflict. If a later batch fails,
    /// the batches already committed are still dispatched before the error
    /// is returned.
    #[tracing::instrument(skip(self, events, metadata), fields(count = events.len()))]
    pub async fn publish_all(
        &self,
        events: Vec<EventEnvelope>,
        metadata: Option<EventMetadata>,
    ) -> Result<Vec<StoredEvent>> {
        self.ensure_running()?;
        for event in &events {
            validate_publishable(event)?;
        }
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let groups = group_by_aggregate(events);
        for group in &groups {
            validate_group(group)?;
        }

        let mut stored = Vec::new();
        let mut failure = None;
        for group in groups {
            match self.append_at_current(group, metadata.clone()).await {
                Ok(saved) => stored.extend(saved),
                Err(error) => {
                    failure = Some(error);
                    break;
                }
            }
        }

        self.announce(&stored).await;

        match failure {
            None => Ok(stored),
            Some(error) => {
                if !stored.is_empty() {
                    tracing::warn!(
                        committed = stored.len(),
                        %error,
                        "publish stopped after a partial commit"
                    );
                }
                Err(error)
            }
        }
    }

    /// Appends one aggregate's events at `expected_version` and dispatches
    /// them.
    ///
    /// This is the optimistic-concurrency path for an aggregate publishing
    /// its uncommitted events: pass the version it was loaded at (for example
    /// `AggregateRoot::committed_version`). A stale expected version fails
    /// with a concurrency conflict and nothing is written.
    #[tracing::instrument(skip(self, events, metadata), fields(count = events.len(), expected = %expected_version))]
    pub async fn publish_all_at(
        &self,
        events: Vec<EventEnvelope>,
        expected_version: Version,
        metadata: Option<EventMetadata>,
    ) -> Result<Vec<StoredEvent>> {
        self.ensure_running()?;
        for event in &events {
            validate_publishable(event)?;
        }
        let Some(aggregate_id) = events.first().map(|e| e.aggregate_id.clone()) else {
            return Ok(Vec::new());
        };
        validate_save_request(&aggregate_id, &events, expected_version)
            .map_err(|e| BusError::validation(e.to_string()))?;

        let stored = self
            .save(&aggregate_id, events, expected_version, metadata)
            .await?;
        self.announce(&stored).await;
        Ok(stored)
    }

    async fn append_at_current(
        &self,
        group: Vec<EventEnvelope>,
        metadata: Option<EventMetadata>,
    ) -> Result<Vec<StoredEvent>> {
        let Some(first) = group.first() else {
            return Ok(Vec::new());
        };
        let aggregate_id = first.aggregate_id.clone();
        let produced_at = first.version.rewound_by(1);

        let current = self.store.get_aggregate_version(&aggregate_id).await?;
        if produced_at != current {
            metrics::counter!("event_bus_publish_conflicts_total").increment(1);
            tracing::warn!(aggregate_id = %aggregate_id, expected = %produced_at, actual = %current, "stale events rejected");
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_id,
                expected: produced_at,
                actual: current,
            }
            .into());
        }

        self.save(&aggregate_id, group, current, metadata).await
    }

    async fn save(
        &self,
        aggregate_id: &AggregateId,
        events: Vec<EventEnvelope>,
        expected_version: Version,
        metadata: Option<EventMetadata>,
    ) -> Result<Vec<StoredEvent>> {
        let stored = self
            .store
            .save_events(aggregate_id, events, expected_version, metadata)
            .await
            .inspect_err(|error| {
                tracing::error!(aggregate_id = %aggregate_id, %error, "failed to append events");
            })?;
        Ok(stored)
    }

    /// Counts freshly stored events and dispatches them in append order.
    async fn announce(&self, stored: &[StoredEvent]) {
        if stored.is_empty() {
            return;
        }
        self.counters.lock().await.record_published(stored.len());
        for event in stored {
            metrics::counter!("event_bus_events_published_total", "event_type" => event.event_type().to_string())
                .increment(1);
        }
        for event in stored {
            self.dispatch(event).await;
        }
    }

    /// Delivers `event` to every active subscription of its type and returns
    /// how many were attempted.
    async fn dispatch(&self, event: &StoredEvent) -> usize {
        let mut targets: Vec<Subscription> = self
            .subscriptions
            .read()
            .await
            .iter()
            .filter(|s| s.is_active && s.event_type == event.event_type())
            .cloned()
            .collect();
        targets.sort_by_key(|s| s.priority);

        if targets.is_empty() {
            tracing::debug!(event_id = %event.id(), event_type = event.event_type(), "no subscribers");
            return 0;
        }

        join_all(targets.iter().map(|s| self.deliver(event, s)))
            .await
            .len()
    }

    /// One delivery attempt. Returns whether the handler succeeded.
    async fn deliver(&self, event: &StoredEvent, subscription: &Subscription) -> bool {
        let handler = &subscription.handler;
        let started = Instant::now();
        let outcome = match self.config.handler_timeout {
            Some(limit) => tokio::time::timeout(limit, handler.process_event(event))
                .await
                .unwrap_or(Err(HandlerError::Timeout(limit))),
            None => handler.process_event(event).await,
        };
        let elapsed = started.elapsed();

        metrics::histogram!("event_bus_handler_duration_seconds", "handler" => handler.name().to_string())
            .record(elapsed.as_secs_f64());
        self.counters
            .lock()
            .await
            .record_outcome(outcome.is_ok(), elapsed);

        match outcome {
            Ok(()) => {
                metrics::counter!("event_bus_events_processed_total", "event_type" => event.event_type().to_string())
                    .increment(1);
                self.retries
                    .lock()
                    .await
                    .entries
                    .remove(&retry_key(event, subscription.id));
                true
            }
            Err(error) => {
                metrics::counter!("event_bus_events_failed_total", "event_type" => event.event_type().to_string())
                    .increment(1);
                self.record_failure(event, subscription, error).await;
                false
            }
        }
    }

    async fn record_failure(
        &self,
        event: &StoredEvent,
        subscription: &Subscription,
        error: HandlerError,
    ) {
        let now = self.clock.now();
        let key = retry_key(event, subscription.id);
        let policy = subscription.retry_policy;

        let mut retries = self.retries.lock().await;
        let (failures, first_failed_at) = {
            let entry = retries.entries.entry(key.clone()).or_insert(RetryEntry {
                subscription_id: subscription.id,
                failures: 0,
                first_failed_at: now,
            });
            entry.failures += 1;
            (entry.failures, entry.first_failed_at)
        };

        if policy.allows_retry(failures) {
            let retry_at = instant_after(now, policy.delay_for_retry(failures));
            retries.schedule.schedule(
                retry_at,
                PendingRetry {
                    key,
                    subscription_id: subscription.id,
                    event: event.clone(),
                },
            );
            drop(retries);

            tracing::warn!(
                event_id = %event.id(),
                handler = subscription.handler.name(),
                retry = failures,
                %retry_at,
                %error,
                "handler failed, retry scheduled"
            );
            return;
        }

        retries.entries.remove(&key);
        drop(retries);

        if !self.config.enable_dead_letter_queue {
            tracing::error!(
                event_id = %event.id(),
                handler = subscription.handler.name(),
                attempts = failures,
                %error,
                "handler retries exhausted, event dropped"
            );
            return;
        }

        let letter = DeadLetter {
            id: Uuid::new_v4(),
            event: event.clone(),
            subscription_id: subscription.id,
            handler_name: subscription.handler.name().to_string(),
            error: error.to_string(),
            attempts: failures,
            first_failed_at,
            dead_lettered_at: now,
        };
        self.dead_letters.write().await.push(letter);

        metrics::counter!("event_bus_dead_lettered_total", "handler" => subscription.handler.name().to_string())
            .increment(1);
        tracing::error!(
            event_id = %event.id(),
            handler = subscription.handler.name(),
            attempts = failures,
            %error,
            "handler retries exhausted, event dead-lettered"
        );
    }

    /// Redelivers every retry whose backoff has elapsed. Returns how many
    /// deliveries were attempted.
    ///
    /// Retries for a paused subscription are held back by one retry delay;
    /// retries for a removed subscription are dropped.
    pub async fn process_due_retries(&self) -> Result<usize> {
        self.ensure_running()?;
        let now = self.clock.now();
        let due = self.retries.lock().await.schedule.drain_due(now);

        let mut attempted = 0;
        for pending in due {
            let subscription = self
                .subscriptions
                .read()
                .await
                .iter()
                .find(|s| s.id == pending.subscription_id)
                .cloned();

            match subscription {
                Some(subscription) if subscription.is_active => {
                    metrics::counter!("event_bus_retries_total").increment(1);
                    self.deliver(&pending.event, &subscription).await;
                    attempted += 1;
                }
                Some(subscription) => {
                    let retry_at = instant_after(now, subscription.retry_policy.retry_delay);
                    self.retries.lock().await.schedule.schedule(retry_at, pending);
                }
                None => {
                    self.retries.lock().await.entries.remove(&pending.key);
                }
            }
        }

        Ok(attempted)
    }

    /// Runs [`process_due_retries`](Self::process_due_retries) every
    /// `retry_poll_interval` until the bus stops. Spawn after
    /// [`start`](Self::start).
    pub fn spawn_retry_worker(self: &Arc<Self>) -> JoinHandle<()>
    where
        S: 'static,
    {
        let bus = Arc::clone(self);
        let mut running = self.running.subscribe();
        let period = self.config.retry_poll_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match bus.process_due_retries().await {
                            Ok(0) => {}
                            Ok(count) => tracing::debug!(count, "retries redelivered"),
                            Err(BusError::NotRunning) => break,
                            Err(error) => tracing::warn!(%error, "retry sweep failed"),
                        }
                    }
                    changed = running.changed() => {
                        if changed.is_err() || !*running.borrow() {
                            break;
                        }
                    }
                }
            }

            tracing::debug!("retry worker stopped");
        })
    }

    /// Re-dispatches an aggregate's stored events without appending them.
    #[tracing::instrument(skip(self, aggregate_id), fields(aggregate_id = %aggregate_id))]
    pub async fn replay_events(
        &self,
        aggregate_id: &AggregateId,
        from_version: Version,
        to_version: Option<Version>,
    ) -> Result<usize> {
        self.ensure_running()?;
        let events = self
            .store
            .get_events(aggregate_id, from_version, to_version)
            .await?;
        self.replay(&events).await;
        Ok(events.len())
    }

    /// Re-dispatches stored events of one type, optionally bounded by
    /// occurrence time.
    #[tracing::instrument(skip(self))]
    pub async fn replay_events_by_type(
        &self,
        event_type: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<usize> {
        self.ensure_running()?;
        let events = self
            .store
            .get_events_by_type(event_type, from, to, None)
            .await?;
        self.replay(&events).await;
        Ok(events.len())
    }

    async fn replay(&self, events: &[StoredEvent]) {
        let mut deliveries = 0;
        for event in events {
            deliveries += self.dispatch(event).await;
        }
        metrics::counter!("event_bus_events_replayed_total").increment(events.len() as u64);
        tracing::info!(events = events.len(), deliveries, "events replayed");
    }

    /// Returns a copy of the dead-letter queue, oldest first.
    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.read().await.clone()
    }

    /// Empties the dead-letter queue and returns how many entries it held.
    pub async fn clear_dead_letters(&self) -> usize {
        let mut letters = self.dead_letters.write().await;
        let count = letters.len();
        letters.clear();
        count
    }

    /// Gives each dead letter one more delivery to its subscription.
    ///
    /// A failed redelivery starts a fresh retry cycle. Letters whose
    /// subscription is gone or paused stay in the queue.
    pub async fn redeliver_dead_letters(&self) -> Result<usize> {
        self.ensure_running()?;
        let letters = std::mem::take(&mut *self.dead_letters.write().await);
        let subscriptions = self.subscriptions.read().await.clone();

        let mut kept = Vec::new();
        let mut redelivered = 0;
        for letter in letters {
            match subscriptions
                .iter()
                .find(|s| s.id == letter.subscription_id && s.is_active)
            {
                Some(subscription) => {
                    self.deliver(&letter.event, subscription).await;
                    redelivered += 1;
                }
                None => kept.push(letter),
            }
        }

        if !kept.is_empty() {
            let mut letters = self.dead_letters.write().await;
            kept.append(&mut letters);
            *letters = kept;
        }

        tracing::info!(redelivered, "dead letters redelivered");
        Ok(redelivered)
    }

    /// Number of (event, subscription) deliveries with failures that have not
    /// yet succeeded or been dead-lettered.
    pub async fn tracked_retries(&self) -> usize {
        self.retries.lock().await.entries.len()
    }

    /// Returns a snapshot of the bus counters.
    pub async fn statistics(&self) -> BusStatistics {
        let (total_published, total_processed, total_failed, average_processing_time_ms) = {
            let counters = self.counters.lock().await;
            (
                counters.published,
                counters.processed,
                counters.failed,
                counters.average_ms,
            )
        };
        let active_subscriptions = self
            .subscriptions
            .read()
            .await
            .iter()
            .filter(|s| s.is_active)
            .count();
        let dead_letter_queue_size = self.dead_letters.read().await.len();
        let retry_queue_size = self.retries.lock().await.schedule.len();
        let uptime_seconds = self
            .started_at
            .read()
            .await
            .map(|started| (self.clock.now() - started).num_seconds().max(0))
            .unwrap_or(0);

        BusStatistics {
            is_running: self.is_running(),
            total_published,
            total_processed,
            total_failed,
            active_subscriptions,
            average_processing_time_ms,
            dead_letter_queue_size,
            retry_queue_size,
            uptime_seconds,
        }
    }
}

fn validate_publishable(event: &EventEnvelope) -> Result<()> {
    if event.aggregate_id.is_empty() {
        return Err(BusError::validation(format!(
            "event {} has an empty aggregate id",
            event.event_id
        )));
    }
    if event.event_type.trim().is_empty() {
        return Err(BusError::validation(format!(
            "event {} has an empty event type",
            event.event_id
        )));
    }
    Ok(())
}

/// Runs the store's batch checks on one same-aggregate run.
fn validate_group(group: &[EventEnvelope]) -> Result<()> {
    let Some(first) = group.first() else {
        return Ok(());
    };
    validate_save_request(&first.aggregate_id, group, first.version.rewound_by(1))
        .map_err(|e| BusError::validation(e.to_string()))
}

/// Splits events into runs of consecutive events for the same aggregate.
fn group_by_aggregate(events: Vec<EventEnvelope>) -> Vec<Vec<EventEnvelope>> {
    let mut groups: Vec<Vec<EventEnvelope>> = Vec::new();
    for event in events {
        match groups.last_mut() {
            Some(group)
                if group
                    .last()
                    .is_some_and(|last| last.aggregate_id == event.aggregate_id) =>
            {
                group.push(event)
            }
            _ => groups.push(vec![event]),
        }
    }
    groups
}
