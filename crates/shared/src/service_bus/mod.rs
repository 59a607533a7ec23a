//! Service Bus Module
//!
//! Inter-service communication layer for Meridian: services register with a
//! registry, are health-polled, and exchange events over a publish/subscribe
//! bus with priority-dependent delivery guarantees.
//!
//! ## Protocol Overview
//!
//! 1. **Registration**: a service registers its name, address, health
//!    endpoint and routes, in-process through [`GatewayFacade`] or remotely
//!    through `POST /bus/register`
//! 2. **Health Monitoring**: [`HealthMonitor`] polls every record and
//!    evicts services whose last heartbeat is older than the eviction window
//! 3. **Messaging**: publish to local subscribers, send to one service,
//!    or correlate a request with its reply
//! 4. **Delivery**: [`DeliveryManager`] retries per priority class;
//!    CRITICAL messages are persisted and recovered after a restart
//!
//! ## Priority Classes
//!
//! | Priority | Attempts | Backoff | Durable |
//! |---|---|---|---|
//! | `LOW` | 1 | none | no |
//! | `NORMAL` | 3 | linear, 1s steps | no |
//! | `HIGH` | 10 | linear, capped at 30s | no |
//! | `CRITICAL` | until success | exponential, capped at 300s | yes |
//!
//! ## Modular Architecture
//!
//! - `types`: records, registrations, envelopes and priorities
//! - `errors`: bus error taxonomy
//! - `config`: bus configuration and validation
//! - `registry`: in-memory service registry and its change events
//! - `health`: health probes and the polling monitor
//! - `subscription`: handlers and the event → subscriber table
//! - `transport`: local dispatch and remote HTTP delivery
//! - `durable`: persistence tier for CRITICAL messages
//! - `delivery`: retry, backoff and recovery
//! - `bus`: publish/subscribe core
//! - `gateway`: per-service facade
//! - `server`: HTTP endpoints of the bus
//!
//! ## Usage Example
//!
//! ```rust
//! use meridian_shared::service_bus::{
//!     MessageBus, MessageOptions, Priority, ServiceRecord, ServiceRegistry,
//! };
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = ServiceRegistry::new();
//! registry
//!     .register(ServiceRecord::new("user-service", "localhost:3001", "/health", vec![], false))
//!     .await?;
//!
//! let bus = MessageBus::builder(registry).build()?;
//! bus.start().await?;
//!
//! let id = bus
//!     .send_to_service(
//!         "user-service",
//!         "user.profile.updated",
//!         json!({"userId": 7}),
//!         MessageOptions::priority(Priority::High),
//!     )
//!     .await?;
//! println!("queued {}", id);
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod config;
pub mod delivery;
pub mod dispatch;
pub mod durable;
pub mod errors;
pub mod events;
pub mod gateway;
pub mod health;
pub mod registry;
pub mod retry;
pub mod server;
pub mod subscription;
pub mod transport;
pub mod types;
pub mod validation;

#[cfg(test)]
pub mod tests;

pub use bus::{DispatchHandle, MessageBus, MessageBusBuilder};
pub use config::BusConfig;
pub use delivery::{DeliveryManager, DeliveryMetrics, RecoveryReport};
pub use dispatch::BusPhase;
pub use durable::{DurableStore, FileDurableQueue, MemoryDurableQueue};
pub use errors::{BusError, BusResult};
pub use events::{completed_event, error_event, reply_event, CoreEvent};
pub use gateway::{GatewayFacade, ServiceHandle};
pub use health::{HealthMonitor, HealthProbe, HttpHealthProbe, ProbeOutcome};
pub use registry::{RegistryEvent, ServiceRegistry};
pub use retry::{BackoffStrategy, RetryPolicies, RetryPolicy};
pub use server::{BusServer, RunningBusServer};
pub use subscription::{
    DispatchReport, HandlerFn, HandlerResult, MessageHandler, SubscriptionHandle,
    SubscriptionTable,
};
pub use transport::{HttpTransport, Transport};
pub use types::{
    DeliveryState, Message, MessageOptions, Priority, Route, ServiceRecord, ServiceRegistration,
    ServiceStatus,
};

/// HTTP paths served by [`BusServer`] and targeted by [`HttpTransport`]
pub mod protocol {
    /// Health contract endpoint
    pub const HEALTH_PATH: &str = "/health";

    /// Envelope intake endpoint
    pub const MESSAGES_PATH: &str = "/bus/messages";

    /// Remote registration endpoint
    pub const REGISTER_PATH: &str = "/bus/register";

    /// Registry listing; `DELETE <SERVICES_PATH>/<name>` deregisters
    pub const SERVICES_PATH: &str = "/bus/services";

    /// Largest request body the bus server accepts
    pub const MAX_BODY_BYTES: usize = 256 * 1024;
}
