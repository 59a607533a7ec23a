//! # Meridian Shared Library
//!
//! Inter-service communication layer for the Meridian platform. Backend
//! services and the API gateway use this crate to register themselves,
//! report health, and exchange events with priority-dependent delivery
//! guarantees.
//!
//! ## Features
//!
//! - **Service Registry**: named services with address, health endpoint and
//!   declared routes, evicted once their heartbeat expires
//! - **Health Monitoring**: concurrent polling of every registered service
//! - **Message Bus**: publish/subscribe, directed sends and request/reply
//! - **Delivery Guarantees**: per-priority retry with a durable fallback
//!   queue for CRITICAL messages
//! - **Error Handling**: process-level and bus-level error types with HTTP
//!   status mapping
//!
//! ## Design Principles
//!
//! - **No Global State**: registry, monitor and bus are explicit values with
//!   injected configuration and `start`/`stop`
//! - **Isolation**: a failing handler never affects other handlers or the
//!   publisher
//! - **Observability**: structured `tracing` events on every state change

pub mod cli;
pub mod error;
pub mod paths;
pub mod service_bus;

// Re-export commonly used types for convenience
pub use cli::{BusOptions, LoggingOptions};
pub use error::{MeridianError, Result};
pub use paths::{default_cache_dir, default_durable_queue_dir, expand_home_dir};
pub use service_bus::{
    BusConfig, BusError, BusResult, BusServer, GatewayFacade, HealthMonitor, Message, MessageBus,
    MessageOptions, Priority, ServiceRecord, ServiceRegistration, ServiceRegistry, ServiceStatus,
};
