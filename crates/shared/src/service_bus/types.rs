//! Core data structures for the service bus
//!
//! This module contains the fundamental data types shared by the registry,
//! the health monitor, the message bus and the delivery manager: service
//! records, the message envelope, priorities and delivery states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Source marker used for messages that originate from a broadcast
pub const BROADCAST_SOURCE: &str = "broadcast";

/// Source name used for events emitted by the service registry
pub const REGISTRY_SOURCE: &str = "registry";

/// Default health endpoint path declared by services
pub const DEFAULT_HEALTH_ENDPOINT: &str = "/health";

/// Liveness status of a registered service
///
/// Serialized as lowercase strings in JSON.
///
/// # Examples
///
/// ```rust
/// use meridian_shared::service_bus::ServiceStatus;
///
/// let json = serde_json::to_string(&ServiceStatus::Degraded).unwrap();
/// assert_eq!(json, "\"degraded\"");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// Registered but not yet probed successfully
    Starting,
    /// Last probe succeeded within the timeout
    Healthy,
    /// Last probe reached the service but got a non-success outcome
    Degraded,
    /// Last probe timed out or could not connect
    Unhealthy,
}

impl ServiceStatus {
    /// Returns the lowercase protocol representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Starting => "starting",
            ServiceStatus::Healthy => "healthy",
            ServiceStatus::Degraded => "degraded",
            ServiceStatus::Unhealthy => "unhealthy",
        }
    }

    /// Returns whether this status counts as a successful heartbeat
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, ServiceStatus::Healthy)
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Route declared by a service
///
/// Informational only; consumed by the gateway facade, never by the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Path exposed by the service (e.g. `/api/free-zones`)
    pub path: String,
    /// HTTP methods accepted on the path
    #[serde(default)]
    pub methods: Vec<String>,
}

impl Route {
    /// Creates a route from a path and a list of methods
    ///
    /// # Examples
    ///
    /// ```rust
    /// use meridian_shared::service_bus::Route;
    ///
    /// let route = Route::new("/api/documents", &["GET", "POST"]);
    /// assert_eq!(route.methods, vec!["GET", "POST"]);
    /// ```
    pub fn new(path: impl Into<String>, methods: &[&str]) -> Self {
        Self {
            path: path.into(),
            methods: methods.iter().map(|m| m.to_ascii_uppercase()).collect(),
        }
    }
}

/// Registration call payload sent by a service
///
/// Mirrors the wire contract
/// `{ name, host, port, healthEndpoint: "/health", routes: [{path, methods}] }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRegistration {
    /// Unique service name
    pub name: String,
    /// Host the service listens on
    pub host: String,
    /// Port the service listens on
    pub port: u16,
    /// Path polled by the health monitor
    #[serde(default = "default_health_endpoint")]
    pub health_endpoint: String,
    /// Routes the service exposes
    #[serde(default)]
    pub routes: Vec<Route>,
}

fn default_health_endpoint() -> String {
    DEFAULT_HEALTH_ENDPOINT.to_string()
}

impl ServiceRegistration {
    /// Creates a registration with the default `/health` endpoint and no routes
    ///
    /// # Examples
    ///
    /// ```rust
    /// use meridian_shared::service_bus::ServiceRegistration;
    ///
    /// let registration = ServiceRegistration::new("user-service", "localhost", 3001);
    /// assert_eq!(registration.health_endpoint, "/health");
    /// assert_eq!(registration.address(), "localhost:3001");
    /// ```
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            health_endpoint: default_health_endpoint(),
            routes: Vec::new(),
        }
    }

    /// Sets the health endpoint path
    pub fn with_health_endpoint(mut self, path: impl Into<String>) -> Self {
        self.health_endpoint = path.into();
        self
    }

    /// Appends a declared route
    pub fn with_route(mut self, route: Route) -> Self {
        self.routes.push(route);
        self
    }

    /// Returns the `host:port` address
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Converts the registration into a service record
    ///
    /// `local` marks services hosted inside this process.
    pub fn into_record(self, local: bool) -> ServiceRecord {
        let address = self.address();
        ServiceRecord::new(self.name, address, self.health_endpoint, self.routes, local)
    }
}

/// Registry entry describing a known service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRecord {
    /// Unique service name
    pub name: String,
    /// `host:port` or base URL at which the service is reachable
    pub address: String,
    /// Path polled to determine liveness
    pub health_endpoint: String,
    /// Declared routes in registration order
    pub routes: Vec<Route>,
    /// Current liveness status
    pub status: ServiceStatus,
    /// Most recent successful health check or explicit heartbeat
    pub last_heartbeat: DateTime<Utc>,
    /// Time the record was (re-)registered
    pub registered_at: DateTime<Utc>,
    /// Whether the service is hosted in this process
    #[serde(default)]
    pub local: bool,
}

impl ServiceRecord {
    /// Creates a record in the `starting` state with a fresh heartbeat
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        health_endpoint: impl Into<String>,
        routes: Vec<Route>,
        local: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            address: address.into(),
            health_endpoint: health_endpoint.into(),
            routes,
            status: ServiceStatus::Starting,
            last_heartbeat: now,
            registered_at: now,
            local,
        }
    }

    /// Returns the base URL of the service
    ///
    /// # Examples
    ///
    /// ```rust
    /// use meridian_shared::service_bus::ServiceRecord;
    ///
    /// let record = ServiceRecord::new("user-service", "localhost:3001", "/health", vec![], false);
    /// assert_eq!(record.base_url(), "http://localhost:3001");
    ///
    /// let record = ServiceRecord::new("ai", "https://ai.internal", "/health", vec![], false);
    /// assert_eq!(record.base_url(), "https://ai.internal");
    /// ```
    pub fn base_url(&self) -> String {
        if self.address.starts_with("http://") || self.address.starts_with("https://") {
            self.address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", self.address)
        }
    }

    /// Returns the full URL of the health endpoint
    pub fn health_url(&self) -> String {
        let path = if self.health_endpoint.starts_with('/') {
            self.health_endpoint.clone()
        } else {
            format!("/{}", self.health_endpoint)
        };
        format!("{}{}", self.base_url(), path)
    }

    /// Returns how long ago the last heartbeat was recorded
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_heartbeat
    }
}

/// Priority class of a message
///
/// Ordinal order is `LOW < NORMAL < HIGH < CRITICAL`. Serialized as the
/// upper-case names used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    /// Single attempt, no backoff
    Low,
    /// A few attempts with linear backoff
    Normal,
    /// Many attempts with capped linear backoff
    High,
    /// Unbounded attempts, exponential backoff, durable fallback
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl Priority {
    /// All priorities in ordinal order
    pub const ALL: [Priority; 4] = [
        Priority::Low,
        Priority::Normal,
        Priority::High,
        Priority::Critical,
    ];

    /// Returns the wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "LOW",
            Priority::Normal => "NORMAL",
            Priority::High => "HIGH",
            Priority::Critical => "CRITICAL",
        }
    }

    /// Only CRITICAL messages may be written to the durable store
    pub fn is_durable(&self) -> bool {
        matches!(self, Priority::Critical)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LOW" => Ok(Priority::Low),
            "NORMAL" => Ok(Priority::Normal),
            "HIGH" => Ok(Priority::High),
            "CRITICAL" => Ok(Priority::Critical),
            other => Err(format!("Unknown priority: {}", other)),
        }
    }
}

/// Per-call options accepted by publish, broadcast and directed sends
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageOptions {
    /// Priority class (defaults to NORMAL)
    pub priority: Priority,
    /// Overrides the sending service name
    pub source: Option<String>,
    /// Correlation id for request/reply exchanges
    pub request_id: Option<String>,
    /// Correlation id of the request this message answers
    pub reply_to: Option<String>,
}

impl MessageOptions {
    /// Options with the given priority
    pub fn priority(priority: Priority) -> Self {
        Self {
            priority,
            ..Default::default()
        }
    }

    /// Sets the sending service name
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Sets the request correlation id
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Sets the reply correlation id
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }
}

/// Message envelope
///
/// Serialized as camelCase JSON:
///
/// ```json
/// {
///   "id": "5f0c...",
///   "event": "document.created",
///   "source": "gateway",
///   "destination": "document-service",
///   "priority": "NORMAL",
///   "payload": {"id": 42},
///   "requestId": null,
///   "replyTo": null,
///   "attempt": 0,
///   "createdAt": "2026-10-19T08:00:00Z"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique identifier generated at send time
    pub id: String,
    /// Dot-namespaced event name
    pub event: String,
    /// Sending service name or [`BROADCAST_SOURCE`]
    pub source: String,
    /// Destination service, absent for broadcasts
    pub destination: Option<String>,
    /// Priority class
    #[serde(default)]
    pub priority: Priority,
    /// Opaque payload; the bus never inspects it
    #[serde(default)]
    pub payload: Value,
    /// Correlation id set on requests
    #[serde(default)]
    pub request_id: Option<String>,
    /// Correlation id of the request being answered
    #[serde(default)]
    pub reply_to: Option<String>,
    /// Number of delivery attempts made so far
    #[serde(default)]
    pub attempt: u32,
    /// Send timestamp
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Creates a new message with a fresh id and NORMAL priority
    ///
    /// # Examples
    ///
    /// ```rust
    /// use meridian_shared::service_bus::{Message, Priority};
    /// use serde_json::json;
    ///
    /// let message = Message::new("service.ready", "scraper-service", json!({"name": "scraper-service"}))
    ///     .with_priority(Priority::High);
    /// assert_eq!(message.attempt, 0);
    /// assert!(message.destination.is_none());
    /// ```
    pub fn new(event: impl Into<String>, source: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event: event.into(),
            source: source.into(),
            destination: None,
            priority: Priority::default(),
            payload,
            request_id: None,
            reply_to: None,
            attempt: 0,
            created_at: Utc::now(),
        }
    }

    /// Builds a message from per-call options, falling back to `default_source`
    pub fn from_options(
        event: impl Into<String>,
        payload: Value,
        options: &MessageOptions,
        default_source: &str,
    ) -> Self {
        let source = options
            .source
            .clone()
            .unwrap_or_else(|| default_source.to_string());
        let mut message = Self::new(event, source, payload).with_priority(options.priority);
        message.request_id = options.request_id.clone();
        message.reply_to = options.reply_to.clone();
        message
    }

    /// Sets the destination service
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Sets the priority class
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the request correlation id
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Sets the reply correlation id
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Destination name or `"*"` for broadcasts, for logging
    pub fn destination_label(&self) -> &str {
        self.destination.as_deref().unwrap_or("*")
    }
}

/// Lifecycle of an outbound message
///
/// ```text
/// CREATED → QUEUED → DELIVERING → DELIVERED
///                        │  ▲
///                        ▼  │
///                  RETRY_SCHEDULED
///                        │
///                        ▼
///                      FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryState {
    Created,
    Queued,
    Delivering,
    Delivered,
    RetryScheduled,
    Failed,
}

impl DeliveryState {
    /// Returns whether the transition `self → next` is allowed
    ///
    /// `DELIVERING → FAILED` covers both exhausted ceilings and LOW
    /// messages after their single attempt.
    pub fn can_transition_to(self, next: DeliveryState) -> bool {
        use DeliveryState::*;
        matches!(
            (self, next),
            (Created, Queued)
                | (Queued, Delivering)
                | (Delivering, Delivered)
                | (Delivering, RetryScheduled)
                | (Delivering, Failed)
                | (RetryScheduled, Delivering)
                | (RetryScheduled, Failed)
        )
    }

    /// Terminal states never transition again
    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryState::Delivered | DeliveryState::Failed)
    }
}
