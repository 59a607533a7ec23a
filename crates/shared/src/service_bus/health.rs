//! Health monitoring for registered services
//!
//! The monitor polls every registered service's health endpoint on a fixed
//! interval and maps the outcome onto a [`ServiceStatus`]. On a slower
//! cadence it sweeps the registry for records whose heartbeat expired.
//!
//! ## Key Features
//!
//! - **Concurrent Fan-out**: one probe future per service per tick
//! - **Bounded Probes**: every probe is wrapped in the configured timeout
//! - **Pluggable Probes**: [`HealthProbe`] trait with an HTTP default
//! - **Non-fatal Failures**: probe errors only ever change a status
//!
//! ## Status Mapping
//!
//! | Probe outcome | Status |
//! |---|---|
//! | `2xx` within the timeout | `healthy` |
//! | `2xx` whose body reports `status != "healthy"` | `degraded` |
//! | non-success HTTP status | `degraded` |
//! | timeout or connection failure | `unhealthy` |

use super::config::BusConfig;
use super::registry::ServiceRegistry;
use super::types::{ServiceRecord, ServiceStatus};
use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

/// Result of a single health probe
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    /// Service answered successfully
    Healthy,
    /// Service answered, but not successfully
    Degraded(String),
    /// Service did not answer in time or refused the connection
    Unhealthy(String),
}

impl ProbeOutcome {
    /// Returns the registry status this outcome maps onto
    ///
    /// # Examples
    ///
    /// ```rust
    /// use meridian_shared::service_bus::{ProbeOutcome, ServiceStatus};
    ///
    /// assert_eq!(ProbeOutcome::Healthy.status(), ServiceStatus::Healthy);
    /// assert_eq!(ProbeOutcome::Degraded("HTTP 503".into()).status(), ServiceStatus::Degraded);
    /// assert_eq!(ProbeOutcome::Unhealthy("timeout".into()).status(), ServiceStatus::Unhealthy);
    /// ```
    pub fn status(&self) -> ServiceStatus {
        match self {
            ProbeOutcome::Healthy => ServiceStatus::Healthy,
            ProbeOutcome::Degraded(_) => ServiceStatus::Degraded,
            ProbeOutcome::Unhealthy(_) => ServiceStatus::Unhealthy,
        }
    }

    /// Returns the failure reason, if any
    pub fn reason(&self) -> Option<&str> {
        match self {
            ProbeOutcome::Healthy => None,
            ProbeOutcome::Degraded(reason) | ProbeOutcome::Unhealthy(reason) => Some(reason),
        }
    }
}

/// Trait for health probe implementations
///
/// Implementations decide how a service is reached; the monitor bounds
/// every call with its own timeout, so a probe never needs to.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probes the service described by `record`
    async fn probe(&self, record: &ServiceRecord) -> ProbeOutcome;

    /// Returns the name of this probe implementation
    fn name(&self) -> &'static str;
}

/// Body of the health contract: `{status: "healthy", uptime, timestamp}`
#[derive(Debug, Deserialize)]
struct HealthBody {
    status: Option<String>,
}

/// HTTP health probe
///
/// Issues `GET <base_url><health_endpoint>` and inspects the status code and
/// the optional JSON body.
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: Client,
}

impl HttpHealthProbe {
    /// Creates a probe whose HTTP client gives up after `timeout`
    ///
    /// # Examples
    ///
    /// ```rust
    /// use meridian_shared::service_bus::{HttpHealthProbe, HealthProbe};
    /// use std::time::Duration;
    ///
    /// let probe = HttpHealthProbe::new(Duration::from_secs(5));
    /// assert_eq!(probe.name(), "http");
    /// ```
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Falling back to default HTTP client for health probes");
                Client::new()
            });
        Self { client }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, record: &ServiceRecord) -> ProbeOutcome {
        let url = record.health_url();
        debug!(service = %record.name, url = %url, "Probing health endpoint");

        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => return ProbeOutcome::Unhealthy("Request timeout".to_string()),
            Err(e) => return ProbeOutcome::Unhealthy(format!("Request failed: {}", e)),
        };

        let status = response.status();
        if !status.is_success() {
            return ProbeOutcome::Degraded(format!("HTTP {}", status));
        }

        match response.json::<HealthBody>().await {
            Ok(HealthBody {
                status: Some(reported),
            }) if reported != "healthy" => {
                ProbeOutcome::Degraded(format!("Service reported status '{}'", reported))
            }
            Ok(_) => ProbeOutcome::Healthy,
            Err(e) if e.is_timeout() => ProbeOutcome::Unhealthy("Request timeout".to_string()),
            Err(e) => {
                debug!(service = %record.name, error = %e, "Health body not parseable, HTTP outcome wins");
                ProbeOutcome::Healthy
            }
        }
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Background health monitor
///
/// Local (in-process) services are not probed over HTTP: while the process
/// runs they are reported healthy on every tick.
///
/// # Examples
///
/// ```rust
/// use meridian_shared::service_bus::{BusConfig, HealthMonitor, ServiceRegistry};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let registry = ServiceRegistry::new();
/// let monitor = HealthMonitor::new(registry.clone(), &BusConfig::default());
///
/// monitor.start().await;
/// // ... later, during shutdown
/// monitor.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct HealthMonitor {
    registry: ServiceRegistry,
    probe: Arc<dyn HealthProbe>,
    poll_interval: Duration,
    probe_timeout: Duration,
    cleanup_interval: Duration,
    eviction_window: Duration,
    task: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl HealthMonitor {
    /// Creates a monitor using [`HttpHealthProbe`]
    pub fn new(registry: ServiceRegistry, config: &BusConfig) -> Self {
        let probe = Arc::new(HttpHealthProbe::new(config.health_probe_timeout));
        Self::with_probe(registry, config, probe)
    }

    /// Creates a monitor with a custom probe
    pub fn with_probe(
        registry: ServiceRegistry,
        config: &BusConfig,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        Self {
            registry,
            probe,
            poll_interval: config.health_poll_interval,
            probe_timeout: config.health_probe_timeout,
            cleanup_interval: config.registry_cleanup_interval,
            eviction_window: config.eviction_window,
            task: Arc::new(RwLock::new(None)),
        }
    }

    /// Probes every registered service once, concurrently
    ///
    /// # Returns
    ///
    /// The `(service, status)` pairs applied to the registry, ordered by
    /// service name.
    #[instrument(skip(self))]
    pub async fn poll_once(&self) -> Vec<(String, ServiceStatus)> {
        poll_services(&self.registry, self.probe.as_ref(), self.probe_timeout).await
    }

    /// Runs one eviction sweep over the registry
    ///
    /// # Returns
    ///
    /// The evicted records.
    pub async fn sweep_once(&self) -> Vec<ServiceRecord> {
        self.registry.sweep_expired(self.eviction_window).await
    }

    /// Starts the background poll and sweep loop; no-op if already running
    #[instrument(skip(self))]
    pub async fn start(&self) {
        let mut task = self.task.write().await;
        if task.is_some() {
            info!("Health monitor already running, skipping start");
            return;
        }

        info!(
            interval_secs = self.poll_interval.as_secs(),
            timeout_ms = self.probe_timeout.as_millis() as u64,
            cleanup_secs = self.cleanup_interval.as_secs(),
            probe = self.probe.name(),
            "Starting health monitor"
        );

        let registry = self.registry.clone();
        let probe = self.probe.clone();
        let probe_timeout = self.probe_timeout;
        let eviction_window = self.eviction_window;
        let mut poll_ticker = interval(self.poll_interval);
        poll_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sweep_ticker = interval_at(
            Instant::now() + self.cleanup_interval,
            self.cleanup_interval,
        );
        sweep_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        *task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = poll_ticker.tick() => {
                        poll_services(&registry, probe.as_ref(), probe_timeout).await;
                    }
                    _ = sweep_ticker.tick() => {
                        let evicted = registry.sweep_expired(eviction_window).await;
                        if !evicted.is_empty() {
                            info!(evicted = evicted.len(), "Registry sweep completed");
                        }
                    }
                }
            }
        }));
    }

    /// Stops the background loop; idempotent
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        let handle = self.task.write().await.take();

        match handle {
            Some(handle) => {
                handle.abort();
                let _ = handle.await;
                info!("Health monitor stopped");
            }
            None => debug!("Health monitor was not running"),
        }
    }

    /// Returns whether the background loop is active
    pub async fn is_running(&self) -> bool {
        self.task.read().await.is_some()
    }
}

async fn poll_services(
    registry: &ServiceRegistry,
    probe: &dyn HealthProbe,
    probe_timeout: Duration,
) -> Vec<(String, ServiceStatus)> {
    let records = registry.list().await;
    if records.is_empty() {
        debug!("No services to probe, skipping cycle");
        return Vec::new();
    }

    debug!(service_count = records.len(), "Starting health poll cycle");

    let checks = records.into_iter().map(|record| async move {
        let outcome = if record.local {
            ProbeOutcome::Healthy
        } else {
            match tokio::time::timeout(probe_timeout, probe.probe(&record)).await {
                Ok(outcome) => outcome,
                Err(_) => ProbeOutcome::Unhealthy(format!(
                    "Probe exceeded {}ms",
                    probe_timeout.as_millis()
                )),
            }
        };

        if let Some(reason) = outcome.reason() {
            warn!(
                service = %record.name,
                address = %record.address,
                status = %outcome.status(),
                reason = reason,
                "Health probe failed"
            );
        }

        let status = outcome.status();
        registry.update_status(&record.name, status).await;
        (record.name, status)
    });

    join_all(checks).await
}
