//! Message bus
//!
//! Publish/subscribe core of the service bus. Owns the subscription table,
//! forwards registry events to local handlers and hands directed sends to the
//! [`DeliveryManager`].
//!
//! ## Key Features
//!
//! - **Fire-and-forget Publish**: handlers run on a spawned task; the
//!   returned [`DispatchHandle`] can be awaited for a [`DispatchReport`]
//! - **Directed Sends**: resolved through the registry, delivered with the
//!   priority's retry policy
//! - **Request/Reply**: correlation by `request_id` / `reply_to`
//! - **Held Startup**: traffic issued before [`MessageBus::start`] is held
//!   until crash recovery has re-attempted every stored CRITICAL message
//!
//! ## Usage Example
//!
//! ```rust
//! use meridian_shared::service_bus::{HandlerFn, Message, MessageBus, MessageOptions, ServiceRegistry};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = MessageBus::builder(ServiceRegistry::new()).build()?;
//! bus.start().await?;
//!
//! bus.subscribe("document.created", HandlerFn::arc("indexer", |message: Message| async move {
//!     println!("indexing {}", message.payload);
//!     Ok(())
//! }))
//! .await;
//!
//! let report = bus
//!     .publish("document.created", json!({"id": 42}), MessageOptions::default())
//!     .wait()
//!     .await?;
//! assert_eq!(report.handlers_invoked, 1);
//! # Ok(())
//! # }
//! ```

use super::config::BusConfig;
use super::delivery::{DeliveryManager, DeliveryMetrics, RecoveryReport};
use super::dispatch::{BusPhase, Dispatcher};
use super::durable::{DurableStore, FileDurableQueue};
use super::errors::{BusError, BusResult};
use super::events::reply_event;
use super::registry::{RegistryEvent, ServiceRegistry};
use super::subscription::{DispatchReport, MessageHandler, SubscriptionHandle, SubscriptionTable};
use super::transport::{HttpTransport, Transport};
use super::types::{Message, MessageOptions, BROADCAST_SOURCE, REGISTRY_SOURCE};
use crate::error::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Handle to a spawned local dispatch
///
/// Dropping the handle keeps fire-and-forget semantics; awaiting
/// [`wait`](Self::wait) yields the dispatch report.
#[derive(Debug)]
pub struct DispatchHandle {
    message_id: String,
    task: JoinHandle<BusResult<DispatchReport>>,
}

impl DispatchHandle {
    /// Id of the published message
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Waits for every handler to finish
    ///
    /// # Returns
    ///
    /// The dispatch report, or `BusStopped` if the bus stopped before the
    /// message was dispatched.
    pub async fn wait(self) -> BusResult<DispatchReport> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => {
                debug!(error = %e, "Dispatch task did not complete");
                Err(BusError::BusStopped)
            }
        }
    }
}

/// Builder for [`MessageBus`]
pub struct MessageBusBuilder {
    registry: ServiceRegistry,
    config: BusConfig,
    transport: Option<Arc<dyn Transport>>,
    store: Option<Arc<dyn DurableStore>>,
}

impl MessageBusBuilder {
    /// Sets the configuration
    pub fn config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the default [`HttpTransport`]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Sets the durable store used for CRITICAL messages
    pub fn durable_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Validates the configuration and builds the bus
    pub fn build(self) -> BusResult<MessageBus> {
        self.config.validate()?;

        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(HttpTransport::new(self.config.delivery_timeout)));
        let subscriptions = Arc::new(SubscriptionTable::new());
        let dispatcher = Arc::new(Dispatcher::new(subscriptions, transport));
        let delivery = DeliveryManager::new(
            self.registry.clone(),
            dispatcher.clone(),
            self.store,
            self.config.retry.clone(),
            self.config.service_name.clone(),
        );
        let registry_events = self.registry.subscribe_events();

        Ok(MessageBus {
            config: self.config,
            registry: self.registry,
            dispatcher,
            delivery,
            registry_events: Mutex::new(Some(registry_events)),
            forwarder: Mutex::new(None),
            lifecycle: Mutex::new(()),
        })
    }
}

/// Publish/subscribe message bus
pub struct MessageBus {
    config: BusConfig,
    registry: ServiceRegistry,
    dispatcher: Arc<Dispatcher>,
    delivery: DeliveryManager,
    registry_events: Mutex<Option<broadcast::Receiver<RegistryEvent>>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    lifecycle: Mutex<()>,
}

impl MessageBus {
    /// Starts building a bus around `registry`
    pub fn builder(registry: ServiceRegistry) -> MessageBusBuilder {
        MessageBusBuilder {
            registry,
            config: BusConfig::default(),
            transport: None,
            store: None,
        }
    }

    /// Builds a bus from configuration, opening the file-backed durable
    /// queue when `durable_queue_dir` is set
    pub async fn from_config(registry: ServiceRegistry, config: BusConfig) -> Result<Self> {
        let mut builder = Self::builder(registry).config(config.clone());
        if let Some(dir) = &config.durable_queue_dir {
            let queue = FileDurableQueue::open(dir).await?;
            builder = builder.durable_store(Arc::new(queue));
        }
        Ok(builder.build()?)
    }

    /// Configuration the bus was built with
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Registry the bus resolves destinations against
    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> BusPhase {
        self.dispatcher.phase()
    }

    /// Snapshot of the delivery counters
    pub async fn delivery_metrics(&self) -> DeliveryMetrics {
        self.delivery.metrics().await
    }

    /// Delivery manager driving directed sends
    pub fn delivery(&self) -> &DeliveryManager {
        &self.delivery
    }

    /// Runs crash recovery, then opens the bus
    ///
    /// Recovery is exclusive: every stored CRITICAL message is attempted
    /// once before any held or new traffic flows. Calling `start` on a
    /// running bus is a no-op.
    ///
    /// # Returns
    ///
    /// The recovery report, or `BusStopped` if the bus was already stopped.
    #[instrument(skip(self), fields(service = %self.config.service_name))]
    pub async fn start(&self) -> BusResult<RecoveryReport> {
        let _guard = self.lifecycle.lock().await;
        match self.dispatcher.phase() {
            BusPhase::Running => {
                debug!("Message bus already running");
                return Ok(RecoveryReport::default());
            }
            BusPhase::Stopped => return Err(BusError::BusStopped),
            BusPhase::Created | BusPhase::Recovering => {}
        }

        self.dispatcher.set_phase(BusPhase::Recovering);
        let report = match self.delivery.recover().await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "Durable recovery failed, starting without recovered messages");
                RecoveryReport::default()
            }
        };

        if let Some(events) = self.registry_events.lock().await.take() {
            let dispatcher = self.dispatcher.clone();
            *self.forwarder.lock().await = Some(tokio::spawn(forward_registry_events(
                events, dispatcher,
            )));
        }

        self.dispatcher.set_phase(BusPhase::Running);
        info!(
            recovered = report.delivered,
            rescheduled = report.rescheduled,
            "Message bus started"
        );
        Ok(report)
    }

    /// Stops the bus
    ///
    /// Cancels retry timers (CRITICAL messages stay in the durable store),
    /// stops registry forwarding and fails pending requests. Idempotent.
    #[instrument(skip(self), fields(service = %self.config.service_name))]
    pub async fn stop(&self) {
        let _guard = self.lifecycle.lock().await;
        if self.dispatcher.phase() == BusPhase::Stopped {
            debug!("Message bus already stopped");
            return;
        }

        self.dispatcher.set_phase(BusPhase::Stopped);
        if let Some(forwarder) = self.forwarder.lock().await.take() {
            forwarder.abort();
        }
        self.dispatcher.fail_all_replies().await;
        info!("Message bus stopped");
    }

    /// Appends a handler to the subscriber list of `event`
    pub async fn subscribe(
        &self,
        event: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> SubscriptionHandle {
        self.dispatcher.subscriptions().subscribe(event, handler).await
    }

    /// Subscribes a handler on behalf of `service`
    ///
    /// Messages sent to another service skip the handler; see
    /// [`SubscriptionTable::subscribe_for`].
    pub async fn subscribe_for(
        &self,
        service: &str,
        event: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> SubscriptionHandle {
        self.dispatcher
            .subscriptions()
            .subscribe_for(Some(service.to_string()), event, handler)
            .await
    }

    /// Removes a subscription; in-flight invocations are not cancelled
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.dispatcher.subscriptions().unsubscribe(handle).await
    }

    /// Number of handlers subscribed to `event`
    pub async fn subscriber_count(&self, event: &str) -> usize {
        self.dispatcher.subscriptions().subscriber_count(event).await
    }

    /// Publishes an event to local subscribers
    ///
    /// Never blocks on handlers. Handler errors and panics are logged and
    /// collected in the report; they never fail the publish.
    pub fn publish(
        &self,
        event: impl Into<String>,
        payload: Value,
        options: MessageOptions,
    ) -> DispatchHandle {
        let message = Message::from_options(event, payload, &options, &self.config.service_name);
        self.publish_message(message)
    }

    /// Publishes an already-built envelope to local subscribers
    ///
    /// Used for envelopes received over HTTP; the id and correlation fields
    /// are kept as received.
    pub fn publish_message(&self, message: Message) -> DispatchHandle {
        let dispatcher = self.dispatcher.clone();
        let message_id = message.id.clone();
        debug!(message_id = %message.id, event = %message.event, source = %message.source, "Publishing");

        let task = tokio::spawn(async move {
            dispatcher.wait_until_running().await?;
            dispatcher.deliver_local(&message).await
        });

        DispatchHandle { message_id, task }
    }

    /// Broadcasts an event through the transport's broadcast path
    ///
    /// The source defaults to `"broadcast"`.
    pub fn broadcast(
        &self,
        event: impl Into<String>,
        payload: Value,
        options: MessageOptions,
    ) -> DispatchHandle {
        let message = Message::from_options(event, payload, &options, BROADCAST_SOURCE);
        let dispatcher = self.dispatcher.clone();
        let message_id = message.id.clone();

        let task = tokio::spawn(async move {
            dispatcher.wait_until_running().await?;
            dispatcher.broadcast(&message).await
        });

        DispatchHandle { message_id, task }
    }

    /// Sends an event to one service
    ///
    /// Returns the message id as soon as the message is queued. An
    /// unregistered destination is reported through `<event>.error` with
    /// `kind = "DestinationUnknown"` and no delivery attempt.
    ///
    /// # Returns
    ///
    /// The message id, or `BusStopped` if the bus no longer accepts work.
    #[instrument(skip(self, payload, options), fields(priority = %options.priority))]
    pub async fn send_to_service(
        &self,
        service: &str,
        event: &str,
        payload: Value,
        options: MessageOptions,
    ) -> BusResult<String> {
        let message = Message::from_options(event, payload, &options, &self.config.service_name)
            .with_destination(service);
        self.send_message(message).await
    }

    async fn send_message(&self, message: Message) -> BusResult<String> {
        if self.dispatcher.phase() == BusPhase::Stopped {
            return Err(BusError::BusStopped);
        }

        let id = message.id.clone();
        let destination = message.destination.clone().unwrap_or_default();

        if self.registry.contains(&destination).await {
            self.delivery.submit(message).await;
        } else {
            warn!(message_id = %id, destination = %destination, "Destination not registered");
            self.delivery.reject_unknown(message).await;
        }

        Ok(id)
    }

    /// Publishes a reply to `original`
    ///
    /// The reply event is derived with [`reply_event`]; it carries
    /// `reply_to = original.request_id` and the original priority. When the
    /// original sender is a registered service the reply is sent to it,
    /// otherwise it is published locally.
    ///
    /// With `error` set, the payload becomes `{"error": <error>, "details": <payload>}`.
    ///
    /// For events other than `<domain>.request` the reply name matches the
    /// delivery outcome of the original send (`E.completed` / `E.error`).
    /// Subscribers of those names tell them apart by `reply_to`: a reply to
    /// a request carries it, a delivery outcome never does and has the
    /// `{messageId, event, destination, attempt}` payload instead.
    pub async fn respond(
        &self,
        original: &Message,
        payload: Value,
        error: Option<&str>,
    ) -> BusResult<String> {
        let event = reply_event(&original.event, error.is_some());
        let payload = match error {
            Some(reason) => json!({ "error": reason, "details": payload }),
            None => payload,
        };
        let responder = original
            .destination
            .clone()
            .unwrap_or_else(|| self.config.service_name.clone());

        let mut options = MessageOptions::priority(original.priority).with_source(responder);
        options.reply_to = original.request_id.clone();
        let reply = Message::from_options(event, payload, &options, &self.config.service_name);

        if self.registry.contains(&original.source).await {
            self.send_message(reply.with_destination(original.source.clone()))
                .await
        } else {
            let handle = self.publish_message(reply);
            Ok(handle.message_id().to_string())
        }
    }

    /// Sends a request and waits for the first matching reply
    ///
    /// # Returns
    ///
    /// The reply message; `Timeout` when no reply arrived in time; the
    /// delivery error when the request could not be delivered.
    #[instrument(skip(self, payload), fields(timeout_ms = timeout.as_millis() as u64))]
    pub async fn request(
        &self,
        service: &str,
        event: &str,
        payload: Value,
        timeout: Duration,
    ) -> BusResult<Message> {
        self.request_with(service, event, payload, MessageOptions::default(), timeout)
            .await
    }

    /// [`request`](Self::request) with explicit options
    ///
    /// A fresh `request_id` always replaces the one in `options`.
    pub async fn request_with(
        &self,
        service: &str,
        event: &str,
        payload: Value,
        options: MessageOptions,
        timeout: Duration,
    ) -> BusResult<Message> {
        let request_id = Uuid::new_v4().to_string();
        let reply = self.dispatcher.await_reply(&request_id).await;

        let options = options.with_request_id(request_id.clone());
        if let Err(e) = self.send_to_service(service, event, payload, options).await {
            self.dispatcher.cancel_reply(&request_id).await;
            return Err(e);
        }

        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BusError::BusStopped),
            Err(_) => {
                self.dispatcher.cancel_reply(&request_id).await;
                Err(BusError::Timeout {
                    operation: format!("{} request to {}", event, service),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

/// Forwards registry events to local subscribers as `registry` messages
async fn forward_registry_events(
    mut events: broadcast::Receiver<RegistryEvent>,
    dispatcher: Arc<Dispatcher>,
) {
    if dispatcher.wait_until_running().await.is_err() {
        return;
    }

    loop {
        match events.recv().await {
            Ok(event) => {
                let message = Message::new(event.kind.as_str(), REGISTRY_SOURCE, event.payload());
                if let Err(e) = dispatcher.deliver_local(&message).await {
                    warn!(event = %message.event, error = %e, "Failed to forward registry event");
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Registry event forwarder lagged, events dropped");
            }
            Err(RecvError::Closed) => {
                debug!("Registry event channel closed");
                return;
            }
        }
    }
}
