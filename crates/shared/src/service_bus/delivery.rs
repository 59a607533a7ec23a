//! Priority-aware delivery of directed messages
//!
//! Every directed send is driven by its own task: an immediate attempt, then
//! retries governed by the priority's [`RetryPolicy`]. Each attempt resolves
//! the destination again, so a service that re-registers under a new address
//! is picked up by the next retry.
//!
//! ## Key Features
//!
//! - **Attempt Ceilings**: the `attempt` counter never exceeds the policy's ceiling
//! - **Outcome Events**: `<event>.completed` on success, `<event>.error` on
//!   terminal failure, both dispatched to local subscribers
//! - **Durable Fallback**: CRITICAL messages are persisted before every retry
//!   wait and removed once delivered
//! - **Crash Recovery**: stored messages are re-attempted before new traffic
//! - **Non-blocking**: submitting never waits for delivery
//!
//! ## Outcome Payloads
//!
//! ```json
//! {"messageId": "…", "event": "document.created", "destination": "document-service", "attempt": 1}
//! {"messageId": "…", "event": "document.created", "destination": "document-service",
//!  "reason": "HTTP 503", "kind": "RetryExhausted", "attempt": 3}
//! ```

use super::dispatch::Dispatcher;
use super::durable::DurableStore;
use super::errors::{BusError, BusResult};
use super::events::{completed_event, error_event};
use super::registry::ServiceRegistry;
use super::retry::{RetryPolicies, RetryPolicy};
use super::types::{DeliveryState, Message, Priority, ServiceRecord};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};

/// Counters for delivery operations
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryMetrics {
    /// Delivery attempts made, recovery included
    pub attempts: u64,
    /// Messages delivered
    pub delivered: u64,
    /// Retries scheduled after a failed attempt
    pub retries_scheduled: u64,
    /// Messages that failed terminally
    pub failed: u64,
    /// Successful writes to the durable store
    pub persisted: u64,
    /// Stored messages delivered during recovery
    pub recovered: u64,
    /// Failed writes to the durable store
    pub persistence_failures: u64,
}

/// Result of the startup recovery pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Messages found in the durable store
    pub loaded: usize,
    /// Messages delivered on their recovery attempt
    pub delivered: usize,
    /// Messages handed back to the retry loop
    pub rescheduled: usize,
}

struct Inner {
    registry: ServiceRegistry,
    dispatcher: Arc<Dispatcher>,
    store: Option<Arc<dyn DurableStore>>,
    policies: RetryPolicies,
    source: String,
    metrics: RwLock<DeliveryMetrics>,
    states: RwLock<HashMap<String, DeliveryState>>,
}

/// Delivery manager for directed sends
///
/// Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct DeliveryManager {
    inner: Arc<Inner>,
}

impl DeliveryManager {
    pub(crate) fn new(
        registry: ServiceRegistry,
        dispatcher: Arc<Dispatcher>,
        store: Option<Arc<dyn DurableStore>>,
        policies: RetryPolicies,
        source: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                dispatcher,
                store,
                policies,
                source: source.into(),
                metrics: RwLock::new(DeliveryMetrics::default()),
                states: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Returns a snapshot of the delivery counters
    pub async fn metrics(&self) -> DeliveryMetrics {
        self.inner.metrics.read().await.clone()
    }

    /// Returns the state of an in-flight message
    ///
    /// Messages that reached `DELIVERED` or `FAILED` are no longer tracked.
    pub async fn delivery_state(&self, message_id: &str) -> Option<DeliveryState> {
        self.inner.states.read().await.get(message_id).copied()
    }

    /// Number of messages currently being delivered or awaiting a retry
    pub async fn in_flight(&self) -> usize {
        self.inner.states.read().await.len()
    }

    /// Returns whether a durable store is configured
    pub fn has_durable_store(&self) -> bool {
        self.inner.store.is_some()
    }

    /// Queues a directed message for delivery and returns immediately
    ///
    /// The delivery task waits until the bus is running, so sends issued
    /// before startup are held until recovery completes.
    pub(crate) async fn submit(&self, message: Message) {
        self.transition(&message.id, DeliveryState::Created).await;
        self.transition(&message.id, DeliveryState::Queued).await;

        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.inner.dispatcher.wait_until_running().await {
                debug!(message_id = %message.id, error = %e, "Dropping queued delivery");
                manager.forget(&message.id).await;
                return;
            }
            manager.drive(message).await;
        });
    }

    /// Reports a send to an unregistered destination
    ///
    /// Terminal: no attempt is made and `<event>.error` is emitted with
    /// `kind = "DestinationUnknown"` once the bus is running.
    pub(crate) async fn reject_unknown(&self, message: Message) {
        let manager = self.clone();
        tokio::spawn(async move {
            if manager.inner.dispatcher.wait_until_running().await.is_err() {
                return;
            }
            let destination = message.destination.clone().unwrap_or_default();
            manager
                .fail(&message, BusError::DestinationUnknown(destination))
                .await;
        });
    }

    /// Re-attempts every message in the durable store once
    ///
    /// Runs while the bus is in its recovery phase; messages that still
    /// fail continue in the normal CRITICAL retry loop.
    #[instrument(skip(self))]
    pub(crate) async fn recover(&self) -> BusResult<RecoveryReport> {
        let Some(store) = self.inner.store.clone() else {
            return Ok(RecoveryReport::default());
        };

        let messages = store.load_all().await?;
        let mut report = RecoveryReport {
            loaded: messages.len(),
            ..Default::default()
        };

        if messages.is_empty() {
            debug!(store = store.name(), "Durable queue empty, nothing to recover");
            return Ok(report);
        }

        info!(count = messages.len(), store = store.name(), "Recovering durable messages");

        for mut message in messages {
            self.transition(&message.id, DeliveryState::Created).await;
            self.transition(&message.id, DeliveryState::Queued).await;

            match self.attempt(&mut message).await {
                Ok(()) => {
                    self.inner.metrics.write().await.recovered += 1;
                    self.succeed(&message).await;
                    report.delivered += 1;
                }
                Err(err) => {
                    report.rescheduled += 1;
                    let policy = self.policy_for(message.priority);
                    let manager = self.clone();
                    tokio::spawn(async move {
                        if manager.schedule_retry(&mut message, &policy, &err).await {
                            manager.drive(message).await;
                        }
                    });
                }
            }
        }

        info!(
            delivered = report.delivered,
            rescheduled = report.rescheduled,
            "Durable recovery completed"
        );
        Ok(report)
    }

    fn policy_for(&self, priority: Priority) -> RetryPolicy {
        self.inner.policies.for_priority(priority).clone()
    }

    /// Attempt loop for one message
    async fn drive(&self, mut message: Message) {
        let policy = self.policy_for(message.priority);
        loop {
            match self.attempt(&mut message).await {
                Ok(()) => {
                    self.succeed(&message).await;
                    return;
                }
                Err(err) => {
                    if !self.schedule_retry(&mut message, &policy, &err).await {
                        return;
                    }
                }
            }
        }
    }

    /// One delivery attempt against a freshly resolved destination
    async fn attempt(&self, message: &mut Message) -> BusResult<()> {
        message.attempt += 1;
        self.transition(&message.id, DeliveryState::Delivering).await;
        self.inner.metrics.write().await.attempts += 1;

        let destination = message.destination.clone().unwrap_or_default();
        let record = self.resolve(&destination).await?;

        debug!(
            message_id = %message.id,
            event = %message.event,
            destination = %destination,
            attempt = message.attempt,
            local = record.local,
            "Delivering message"
        );

        if record.local {
            self.inner.dispatcher.deliver_local(message).await.map(|_| ())
        } else {
            self.inner
                .dispatcher
                .transport()
                .deliver_remote(&record, message)
                .await
        }
    }

    async fn resolve(&self, destination: &str) -> BusResult<ServiceRecord> {
        self.inner
            .registry
            .lookup(destination)
            .await
            .map_err(|_| BusError::unreachable(destination, "Service is no longer registered"))
    }

    /// Persists (CRITICAL only) and waits out the backoff
    ///
    /// # Returns
    ///
    /// `true` if another attempt should follow; `false` if the message
    /// failed terminally or the bus stopped while waiting.
    async fn schedule_retry(&self, message: &mut Message, policy: &RetryPolicy, err: &BusError) -> bool {
        if !policy.allows_retry(message.attempt) {
            let destination = message.destination.clone().unwrap_or_default();
            let exhausted = BusError::RetryExhausted {
                event: message.event.clone(),
                destination,
                attempts: message.attempt,
                reason: err.to_string(),
            };
            self.fail(message, exhausted).await;
            return false;
        }

        self.transition(&message.id, DeliveryState::RetryScheduled).await;
        self.inner.metrics.write().await.retries_scheduled += 1;

        if message.priority.is_durable() {
            self.persist(message).await;
        }

        let delay = policy.delay_for(message.attempt);
        warn!(
            message_id = %message.id,
            event = %message.event,
            destination = %message.destination_label(),
            priority = %message.priority,
            attempt = message.attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Delivery failed, retry scheduled"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.inner.dispatcher.stopped() => {
                debug!(message_id = %message.id, "Retry cancelled by shutdown");
                self.forget(&message.id).await;
                false
            }
        }
    }

    async fn persist(&self, message: &Message) {
        let Some(store) = self.inner.store.as_ref() else {
            return;
        };

        match store.persist(message).await {
            Ok(()) => self.inner.metrics.write().await.persisted += 1,
            Err(e) => {
                self.inner.metrics.write().await.persistence_failures += 1;
                error!(
                    message_id = %message.id,
                    event = %message.event,
                    store = store.name(),
                    error = %e,
                    "Failed to persist critical message, continuing in memory"
                );
            }
        }
    }

    async fn succeed(&self, message: &Message) {
        self.transition(&message.id, DeliveryState::Delivered).await;
        self.inner.metrics.write().await.delivered += 1;

        if message.priority.is_durable() {
            if let Some(store) = self.inner.store.as_ref() {
                if let Err(e) = store.remove(&message.id).await {
                    error!(message_id = %message.id, error = %e, "Failed to remove delivered message from durable store");
                }
            }
        }

        let destination = message.destination.clone().unwrap_or_default();
        let payload = json!({
            "messageId": message.id,
            "event": message.event,
            "destination": destination,
            "attempt": message.attempt,
        });
        let outcome = Message::new(completed_event(&message.event), &self.inner.source, payload);
        self.emit(outcome).await;
    }

    async fn fail(&self, message: &Message, err: BusError) {
        self.transition(&message.id, DeliveryState::Failed).await;
        self.inner.metrics.write().await.failed += 1;

        let destination = message.destination.clone().unwrap_or_default();
        warn!(
            message_id = %message.id,
            event = %message.event,
            destination = %destination,
            attempt = message.attempt,
            kind = err.kind(),
            error = %err,
            "Delivery failed"
        );

        let payload = json!({
            "messageId": message.id,
            "event": message.event,
            "destination": destination,
            "reason": err.to_string(),
            "kind": err.kind(),
            "attempt": message.attempt,
        });

        if let Some(request_id) = message.request_id.as_deref() {
            self.inner.dispatcher.fail_reply(request_id, err.clone()).await;
        }

        let outcome = Message::new(error_event(&message.event), &self.inner.source, payload);
        self.emit(outcome).await;
    }

    async fn emit(&self, outcome: Message) {
        if let Err(e) = self.inner.dispatcher.deliver_local(&outcome).await {
            warn!(event = %outcome.event, error = %e, "Failed to dispatch delivery outcome");
        }
    }

    async fn transition(&self, message_id: &str, next: DeliveryState) {
        let mut states = self.inner.states.write().await;
        if let Some(current) = states.get(message_id) {
            if !current.can_transition_to(next) {
                debug!(message_id, ?current, ?next, "Unexpected delivery state transition");
            }
        }

        if next.is_terminal() {
            states.remove(message_id);
        } else {
            states.insert(message_id.to_string(), next);
        }
    }

    async fn forget(&self, message_id: &str) {
        self.inner.states.write().await.remove(message_id);
    }
}
