//! Service registry
//!
//! Owns the set of known services. Every mutation that changes membership or
//! liveness is announced on an internal broadcast channel so the message bus
//! can forward it to local subscribers as an ordinary event.
//!
//! ## Key Features
//!
//! - **Idempotent Registration**: registering an existing name replaces the record
//! - **Copy-on-Read Listing**: `list()` returns an owned snapshot
//! - **Eviction Sweep**: records whose last heartbeat is older than the
//!   eviction window are removed and announced once
//!
//! ## Performance Characteristics
//!
//! - Lookup: O(1) under a shared read lock
//! - Listing: O(n) clone of the records
//! - No lock is held while events are sent

use super::errors::{BusError, BusResult};
use super::events::CoreEvent;
use super::types::{Route, ServiceRecord, ServiceStatus};
use super::validation::validate_service_record;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, instrument, warn};

/// Default capacity of the registry event channel
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Membership or liveness change announced by the registry
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryEvent {
    /// Which core event this change maps onto
    pub kind: CoreEvent,
    /// Record as it was at the time of the change
    pub record: ServiceRecord,
    /// Status before the change, for `service.health.status`
    pub previous_status: Option<ServiceStatus>,
}

impl RegistryEvent {
    fn new(kind: CoreEvent, record: ServiceRecord) -> Self {
        Self {
            kind,
            record,
            previous_status: None,
        }
    }

    /// JSON payload carried by the forwarded bus message
    ///
    /// The record fields are flattened into the payload; health status
    /// changes additionally carry `previousStatus`.
    pub fn payload(&self) -> Value {
        let mut payload = serde_json::to_value(&self.record).unwrap_or_else(|_| {
            json!({ "name": self.record.name, "status": self.record.status })
        });
        if let (Some(previous), Some(object)) = (self.previous_status, payload.as_object_mut()) {
            object.insert("previousStatus".to_string(), json!(previous));
        }
        payload
    }
}

/// Registry of known services
///
/// Cloning is cheap; clones share the same records and event channel.
///
/// # Examples
///
/// ```rust
/// use meridian_shared::service_bus::{ServiceRegistry, ServiceRegistration, ServiceStatus};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let registry = ServiceRegistry::new();
/// let record = ServiceRegistration::new("user-service", "localhost", 3001).into_record(false);
///
/// registry.register(record).await?;
/// let found = registry.lookup("user-service").await?;
/// assert_eq!(found.status, ServiceStatus::Starting);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ServiceRegistry {
    records: Arc<RwLock<HashMap<String, ServiceRecord>>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl ServiceRegistry {
    /// Creates an empty registry with the default event capacity
    pub fn new() -> Self {
        Self::with_event_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Creates an empty registry whose event channel holds `capacity` events
    pub fn with_event_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    /// Returns a receiver for membership and liveness events
    ///
    /// Only events sent after this call are observed.
    pub fn subscribe_events(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: RegistryEvent) {
        // No receivers is not an error: nobody is forwarding yet.
        let _ = self.events.send(event);
    }

    /// Inserts or replaces a record by name
    ///
    /// The stored record starts in `starting` with a fresh heartbeat and
    /// registration time. Emits `service.registered`.
    ///
    /// # Returns
    ///
    /// The stored record, or `InvalidServiceRecord` when validation fails.
    #[instrument(skip(self, record), fields(service = %record.name, address = %record.address))]
    pub async fn register(&self, mut record: ServiceRecord) -> BusResult<ServiceRecord> {
        validate_service_record(&record)?;

        let now = Utc::now();
        record.status = ServiceStatus::Starting;
        record.last_heartbeat = now;
        record.registered_at = now;

        let replaced = {
            let mut records = self.records.write().await;
            records.insert(record.name.clone(), record.clone()).is_some()
        };

        if replaced {
            debug!("Replaced existing service record");
        } else {
            info!(local = record.local, routes = record.routes.len(), "Service registered");
        }

        self.emit(RegistryEvent::new(CoreEvent::ServiceRegistered, record.clone()));
        Ok(record)
    }

    /// Removes a record; no-op if the name is unknown
    ///
    /// Emits `service.deregistered` when a record was removed. Deliveries
    /// already queued for the service are not cancelled.
    #[instrument(skip(self))]
    pub async fn deregister(&self, name: &str) -> Option<ServiceRecord> {
        let removed = self.records.write().await.remove(name);

        match &removed {
            Some(record) => {
                info!("Service deregistered");
                self.emit(RegistryEvent::new(
                    CoreEvent::ServiceDeregistered,
                    record.clone(),
                ));
            }
            None => debug!("Deregister ignored for unknown service"),
        }

        removed
    }

    /// Updates the status of a service; no-op if the name is unknown
    ///
    /// A `healthy` status also refreshes `last_heartbeat`. Emits
    /// `service.health.status` when the status value changes.
    ///
    /// # Returns
    ///
    /// The previous status, or `None` for an unknown name.
    pub async fn update_status(&self, name: &str, status: ServiceStatus) -> Option<ServiceStatus> {
        let (previous, snapshot) = {
            let mut records = self.records.write().await;
            let record = records.get_mut(name)?;
            let previous = record.status;
            record.status = status;
            if status.is_heartbeat() {
                record.last_heartbeat = Utc::now();
            }
            (previous, record.clone())
        };

        if previous != status {
            info!(
                service = %name,
                previous = %previous,
                status = %status,
                "Service status changed"
            );
            self.emit(RegistryEvent {
                kind: CoreEvent::ServiceHealthStatus,
                record: snapshot,
                previous_status: Some(previous),
            });
        }

        Some(previous)
    }

    /// Replaces the declared routes of a registered service
    ///
    /// Status, heartbeat and registration time are kept and no event is
    /// emitted.
    ///
    /// # Returns
    ///
    /// The updated record, `None` if the name is unknown, or
    /// `InvalidServiceRecord` when the new routes fail validation.
    #[instrument(skip(self, routes), fields(routes = routes.len()))]
    pub async fn update_routes(
        &self,
        name: &str,
        routes: Vec<Route>,
    ) -> BusResult<Option<ServiceRecord>> {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(name) else {
            return Ok(None);
        };

        let mut updated = record.clone();
        updated.routes = routes;
        validate_service_record(&updated)?;
        *record = updated.clone();

        debug!(service = %name, "Service routes updated");
        Ok(Some(updated))
    }

    /// Refreshes `last_heartbeat` without touching the status
    ///
    /// # Returns
    ///
    /// `false` if the name is unknown.
    pub async fn heartbeat(&self, name: &str) -> bool {
        let mut records = self.records.write().await;
        match records.get_mut(name) {
            Some(record) => {
                record.last_heartbeat = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Returns the record for `name`
    ///
    /// # Returns
    ///
    /// `DestinationUnknown` when no service is registered under that name.
    pub async fn lookup(&self, name: &str) -> BusResult<ServiceRecord> {
        self.records
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| BusError::DestinationUnknown(name.to_string()))
    }

    /// Returns whether a service is registered under `name`
    pub async fn contains(&self, name: &str) -> bool {
        self.records.read().await.contains_key(name)
    }

    /// Returns a snapshot of all records ordered by name
    ///
    /// Mutations after the call are not reflected in the snapshot; call
    /// again for a fresh view.
    pub async fn list(&self) -> Vec<ServiceRecord> {
        let mut records: Vec<ServiceRecord> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    /// Returns the number of registered services
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Returns whether no service is registered
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Removes records whose last heartbeat is older than `eviction_window`
    ///
    /// Emits exactly one `service.evicted` per removed record.
    pub async fn sweep_expired(&self, eviction_window: Duration) -> Vec<ServiceRecord> {
        self.sweep_expired_at(Utc::now(), eviction_window).await
    }

    /// Same as [`sweep_expired`](Self::sweep_expired) with an explicit clock reading
    #[instrument(skip(self), fields(window_secs = eviction_window.as_secs()))]
    pub async fn sweep_expired_at(
        &self,
        now: DateTime<Utc>,
        eviction_window: Duration,
    ) -> Vec<ServiceRecord> {
        let evicted: Vec<ServiceRecord> = {
            let mut records = self.records.write().await;
            let expired: Vec<String> = records
                .values()
                .filter(|record| match record.heartbeat_age(now).to_std() {
                    Ok(age) => age > eviction_window,
                    Err(_) => false,
                })
                .map(|record| record.name.clone())
                .collect();

            expired
                .iter()
                .filter_map(|name| records.remove(name))
                .collect()
        };

        for record in &evicted {
            warn!(
                service = %record.name,
                status = %record.status,
                last_heartbeat = %record.last_heartbeat,
                "Evicting service with expired heartbeat"
            );
            self.emit(RegistryEvent::new(CoreEvent::ServiceEvicted, record.clone()));
        }

        evicted
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
