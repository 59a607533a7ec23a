//! Gateway facade
//!
//! Thin layer an in-process service uses to join the bus: it registers the
//! service as local, announces readiness, and scopes publishes, sends and
//! subscriptions to the service's name.
//!
//! ## Usage Example
//!
//! ```rust
//! use meridian_shared::service_bus::{
//!     GatewayFacade, MessageBus, Route, ServiceRegistration, ServiceRegistry,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = Arc::new(MessageBus::builder(ServiceRegistry::new()).build()?);
//! bus.start().await?;
//!
//! let gateway = GatewayFacade::new(bus.clone());
//! let users = gateway
//!     .attach(ServiceRegistration::new("user-service", "localhost", 3001))
//!     .await?;
//! users
//!     .register_routes(vec![Route::new("/api/users", &["GET", "POST"])])
//!     .await?;
//!
//! users.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use super::bus::MessageBus;
use super::dispatch::BusPhase;
use super::errors::BusResult;
use super::events::CoreEvent;
use super::subscription::{MessageHandler, SubscriptionHandle};
use super::types::{Message, MessageOptions, Route, ServiceRecord, ServiceRegistration};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Entry point for services hosted in this process
#[derive(Clone)]
pub struct GatewayFacade {
    bus: Arc<MessageBus>,
}

impl GatewayFacade {
    /// Creates a facade over `bus`
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self { bus }
    }

    /// Bus the facade is attached to
    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// Registers a local service and publishes `service.ready`
    ///
    /// # Arguments
    ///
    /// * `registration` - Name, address, health endpoint and routes
    ///
    /// # Returns
    ///
    /// A [`ServiceHandle`] scoped to the service, or `InvalidServiceRecord`
    /// if the registration fails validation.
    #[instrument(skip(self, registration), fields(service = %registration.name))]
    pub async fn attach(&self, registration: ServiceRegistration) -> BusResult<ServiceHandle> {
        let record = self
            .bus
            .registry()
            .register(registration.into_record(true))
            .await?;

        let ready = json!({
            "name": record.name,
            "address": record.address,
            "routes": record.routes,
        });
        self.bus.publish(
            CoreEvent::ServiceReady.as_str(),
            ready,
            MessageOptions::default().with_source(record.name.clone()),
        );

        info!(address = %record.address, routes = record.routes.len(), "Service attached");
        Ok(ServiceHandle {
            bus: self.bus.clone(),
            name: record.name.clone(),
            record: Mutex::new(record),
            subscriptions: Mutex::new(Vec::new()),
        })
    }
}

/// Per-service view of the bus returned by [`GatewayFacade::attach`]
pub struct ServiceHandle {
    bus: Arc<MessageBus>,
    name: String,
    record: Mutex<ServiceRecord>,
    subscriptions: Mutex<Vec<SubscriptionHandle>>,
}

impl ServiceHandle {
    /// Name the service is registered under
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Routes declared so far
    pub async fn routes(&self) -> Vec<Route> {
        self.record.lock().await.routes.clone()
    }

    /// Appends routes to the declared set
    ///
    /// A registered record keeps its status and heartbeat. A record that
    /// was evicted or deregistered meanwhile is registered again.
    pub async fn register_routes(&self, routes: Vec<Route>) -> BusResult<()> {
        let mut record = self.record.lock().await;
        let mut declared = record.routes.clone();
        declared.extend(routes);

        let registry = self.bus.registry();
        *record = match registry.update_routes(&self.name, declared.clone()).await? {
            Some(updated) => updated,
            None => {
                let mut restored = record.clone();
                restored.routes = declared;
                registry.register(restored).await?
            }
        };
        debug!(service = %self.name, routes = record.routes.len(), "Routes declared");
        Ok(())
    }

    /// Records an explicit heartbeat
    ///
    /// Returns `false` once the service has been deregistered or evicted.
    pub async fn heartbeat(&self) -> bool {
        self.bus.registry().heartbeat(&self.name).await
    }

    /// Subscribes a handler owned by this service
    ///
    /// The handler sees publishes, broadcasts and messages sent to this
    /// service, never messages sent to another one. The subscription is
    /// dropped on shutdown.
    pub async fn subscribe(
        &self,
        event: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> SubscriptionHandle {
        let handle = self.bus.subscribe_for(&self.name, event, handler).await;
        self.subscriptions.lock().await.push(handle.clone());
        handle
    }

    /// Publishes an event with this service as source
    pub fn publish(&self, event: impl Into<String>, payload: Value, options: MessageOptions) -> String {
        let handle = self
            .bus
            .publish(event, payload, options.with_source(self.name.clone()));
        handle.message_id().to_string()
    }

    /// Sends an event to another service with this service as source
    pub async fn send(
        &self,
        service: &str,
        event: &str,
        payload: Value,
        options: MessageOptions,
    ) -> BusResult<String> {
        self.bus
            .send_to_service(service, event, payload, options.with_source(self.name.clone()))
            .await
    }

    /// Sends a request to another service and waits for the reply
    pub async fn request(
        &self,
        service: &str,
        event: &str,
        payload: Value,
        timeout: Duration,
    ) -> BusResult<Message> {
        let options = MessageOptions::default().with_source(self.name.clone());
        self.bus
            .request_with(service, event, payload, options, timeout)
            .await
    }

    /// Replies to a message received by this service
    pub async fn respond(
        &self,
        original: &Message,
        payload: Value,
        error: Option<&str>,
    ) -> BusResult<String> {
        self.bus.respond(original, payload, error).await
    }

    /// Publishes `service.shutdown`, drops subscriptions and deregisters
    ///
    /// Queued deliveries addressed to the service are not cancelled.
    #[instrument(skip(self), fields(service = %self.name))]
    pub async fn shutdown(&self) -> BusResult<()> {
        let notice = self.bus.publish(
            CoreEvent::ServiceShutdown.as_str(),
            json!({ "name": self.name }),
            MessageOptions::default().with_source(self.name.clone()),
        );
        if self.bus.phase() == BusPhase::Running {
            if let Err(e) = notice.wait().await {
                warn!(error = %e, "Shutdown notice was not dispatched");
            }
        }

        for handle in self.subscriptions.lock().await.drain(..) {
            self.bus.unsubscribe(&handle).await;
        }

        self.bus.registry().deregister(&self.name).await;
        info!("Service detached");
        Ok(())
    }
}
