//! Configuration structures for the service bus
//!
//! This module contains the configuration for the registry sweep, the health
//! monitor, the per-priority retry policies and the durable queue, together
//! with the validation applied at startup.

use super::errors::{BusError, BusResult};
use super::retry::{BackoffStrategy, RetryPolicies};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Service bus configuration
///
/// Numeric defaults are baselines; every value can be overridden from the
/// command line or the `MERIDIAN_*` environment variables (see
/// [`crate::cli::BusOptions`]).
///
/// # Examples
///
/// ```rust
/// use meridian_shared::service_bus::BusConfig;
/// use std::time::Duration;
///
/// let config = BusConfig::default();
/// assert_eq!(config.health_poll_interval, Duration::from_secs(30));
/// assert_eq!(config.eviction_window, Duration::from_secs(300));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Name used as `source` for messages the bus itself originates
    pub service_name: String,

    /// Interval between health poll cycles
    pub health_poll_interval: Duration,

    /// Timeout for an individual health probe
    pub health_probe_timeout: Duration,

    /// Interval between registry eviction sweeps
    pub registry_cleanup_interval: Duration,

    /// Age of the last heartbeat after which a record is evicted
    pub eviction_window: Duration,

    /// Retry policy per priority class
    pub retry: RetryPolicies,

    /// Directory of the file-backed durable queue
    ///
    /// `None` keeps CRITICAL messages in memory only.
    pub durable_queue_dir: Option<PathBuf>,

    /// Default timeout for request/reply exchanges
    pub request_timeout: Duration,

    /// Timeout for a single remote delivery attempt
    pub delivery_timeout: Duration,

    /// Capacity of the registry event channel
    pub event_channel_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            service_name: "gateway".to_string(),
            health_poll_interval: Duration::from_secs(30),
            health_probe_timeout: Duration::from_secs(5),
            registry_cleanup_interval: Duration::from_secs(300),
            eviction_window: Duration::from_secs(300),
            retry: RetryPolicies::default(),
            durable_queue_dir: None,
            request_timeout: Duration::from_secs(30),
            delivery_timeout: Duration::from_secs(10),
            event_channel_capacity: 1024,
        }
    }
}

impl BusConfig {
    /// Sets the durable queue directory
    pub fn with_durable_queue_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.durable_queue_dir = Some(dir.into());
        self
    }

    /// Validates the configuration for consistency
    ///
    /// # Validation Rules
    ///
    /// - Poll interval, probe timeout, cleanup interval and eviction window
    ///   must be non-zero
    /// - The probe timeout must be shorter than the poll interval
    /// - LOW allows exactly one attempt, NORMAL and HIGH are bounded,
    ///   CRITICAL is unbounded
    /// - Capped strategies need `max_delay >= base_delay`
    /// - Jitter factors lie in `[0.0, 1.0]`
    pub fn validate(&self) -> BusResult<()> {
        if self.service_name.trim().is_empty() {
            return Err(BusError::ConfigValidationFailed(
                "Service name cannot be empty".to_string(),
            ));
        }

        if self.health_poll_interval.is_zero() {
            return Err(BusError::ConfigValidationFailed(
                "Health poll interval must be greater than zero".to_string(),
            ));
        }

        if self.health_probe_timeout.is_zero() {
            return Err(BusError::ConfigValidationFailed(
                "Health probe timeout must be greater than zero".to_string(),
            ));
        }

        if self.health_probe_timeout >= self.health_poll_interval {
            return Err(BusError::ConfigValidationFailed(
                "Health probe timeout must be less than health poll interval".to_string(),
            ));
        }

        if self.registry_cleanup_interval.is_zero() || self.eviction_window.is_zero() {
            return Err(BusError::ConfigValidationFailed(
                "Registry cleanup interval and eviction window must be greater than zero"
                    .to_string(),
            ));
        }

        if self.request_timeout.is_zero() || self.delivery_timeout.is_zero() {
            return Err(BusError::ConfigValidationFailed(
                "Request and delivery timeouts must be greater than zero".to_string(),
            ));
        }

        if self.event_channel_capacity == 0 {
            return Err(BusError::ConfigValidationFailed(
                "Event channel capacity must be greater than zero".to_string(),
            ));
        }

        if self.retry.low.max_attempts != Some(1) {
            return Err(BusError::ConfigValidationFailed(
                "LOW priority allows exactly one attempt".to_string(),
            ));
        }

        for (label, policy) in [("NORMAL", &self.retry.normal), ("HIGH", &self.retry.high)] {
            match policy.max_attempts {
                Some(0) | None => {
                    return Err(BusError::ConfigValidationFailed(format!(
                        "{} priority needs a positive, bounded attempt ceiling",
                        label
                    )));
                }
                Some(_) => {}
            }
        }

        if self.retry.critical.max_attempts.is_some() {
            return Err(BusError::ConfigValidationFailed(
                "CRITICAL priority retries until success".to_string(),
            ));
        }

        for (label, policy) in [
            ("LOW", &self.retry.low),
            ("NORMAL", &self.retry.normal),
            ("HIGH", &self.retry.high),
            ("CRITICAL", &self.retry.critical),
        ] {
            if !(0.0..=1.0).contains(&policy.jitter_factor) {
                return Err(BusError::ConfigValidationFailed(format!(
                    "{} jitter factor must be between 0.0 and 1.0",
                    label
                )));
            }

            let capped = matches!(
                policy.strategy,
                BackoffStrategy::LinearCapped | BackoffStrategy::Exponential { .. }
            );
            if capped && policy.max_delay < policy.base_delay {
                return Err(BusError::ConfigValidationFailed(format!(
                    "{} max delay must be at least the base delay",
                    label
                )));
            }
        }

        Ok(())
    }
}
