//! Shared CLI functionality for Meridian components
//!
//! Option groups flattened into each binary's clap parser. Every flag can
//! also be set through its `MERIDIAN_*` environment variable.

use crate::error::{MeridianError, Result};
use crate::paths::{default_durable_queue_dir, expand_home_dir};
use crate::service_bus::BusConfig;
use clap::Args;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Common logging options shared across all components
#[derive(Args, Debug, Clone)]
pub struct LoggingOptions {
    /// Logging level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", env = "MERIDIAN_LOG_LEVEL")]
    pub log_level: String,
}

impl LoggingOptions {
    /// Initialize logging with the configured level
    ///
    /// `RUST_LOG` directives take precedence over `--log-level` when set.
    pub fn init_logging(&self) -> Result<()> {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.parse_log_level().as_str().to_lowercase()));

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .try_init()
            .map_err(|e| MeridianError::configuration("Failed to set logging subscriber", Some(e)))
    }

    /// Parse the log level string into a tracing Level
    pub fn parse_log_level(&self) -> Level {
        match self.log_level.to_lowercase().as_str() {
            "error" => Level::ERROR,
            "warn" => Level::WARN,
            "info" => Level::INFO,
            "debug" => Level::DEBUG,
            "trace" => Level::TRACE,
            _ => Level::INFO,
        }
    }
}

/// Service bus options
///
/// Defaults match [`BusConfig::default`]; use [`BusOptions::to_config`] to
/// build the configuration.
#[derive(Args, Debug, Clone)]
pub struct BusOptions {
    /// Name used as source for messages the bus originates
    #[arg(long, default_value = "gateway", env = "MERIDIAN_SERVICE_NAME")]
    pub service_name: String,

    /// Seconds between health poll cycles
    #[arg(long, default_value_t = 30, env = "MERIDIAN_HEALTH_POLL_INTERVAL_SECS")]
    pub health_poll_interval_secs: u64,

    /// Seconds before a health probe is abandoned
    #[arg(long, default_value_t = 5, env = "MERIDIAN_HEALTH_PROBE_TIMEOUT_SECS")]
    pub health_probe_timeout_secs: u64,

    /// Seconds between registry eviction sweeps
    #[arg(long, default_value_t = 300, env = "MERIDIAN_REGISTRY_CLEANUP_INTERVAL_SECS")]
    pub registry_cleanup_interval_secs: u64,

    /// Heartbeat age in seconds after which a service is evicted
    #[arg(long, default_value_t = 300, env = "MERIDIAN_EVICTION_WINDOW_SECS")]
    pub eviction_window_secs: u64,

    /// Attempt ceiling for NORMAL priority
    #[arg(long, default_value_t = 3, env = "MERIDIAN_NORMAL_MAX_ATTEMPTS")]
    pub normal_max_attempts: u32,

    /// Base backoff for NORMAL priority in milliseconds
    #[arg(long, default_value_t = 1000, env = "MERIDIAN_NORMAL_BASE_DELAY_MS")]
    pub normal_base_delay_ms: u64,

    /// Backoff cap for NORMAL priority in milliseconds
    #[arg(long, default_value_t = 3000, env = "MERIDIAN_NORMAL_MAX_DELAY_MS")]
    pub normal_max_delay_ms: u64,

    /// Attempt ceiling for HIGH priority
    #[arg(long, default_value_t = 10, env = "MERIDIAN_HIGH_MAX_ATTEMPTS")]
    pub high_max_attempts: u32,

    /// Base backoff for HIGH priority in milliseconds
    #[arg(long, default_value_t = 1000, env = "MERIDIAN_HIGH_BASE_DELAY_MS")]
    pub high_base_delay_ms: u64,

    /// Backoff cap for HIGH priority in milliseconds
    #[arg(long, default_value_t = 30_000, env = "MERIDIAN_HIGH_MAX_DELAY_MS")]
    pub high_max_delay_ms: u64,

    /// Base backoff for CRITICAL priority in milliseconds
    #[arg(long, default_value_t = 1000, env = "MERIDIAN_CRITICAL_BASE_DELAY_MS")]
    pub critical_base_delay_ms: u64,

    /// Backoff cap for CRITICAL priority in milliseconds
    #[arg(long, default_value_t = 300_000, env = "MERIDIAN_CRITICAL_MAX_DELAY_MS")]
    pub critical_max_delay_ms: u64,

    /// Directory of the durable queue (defaults to ~/.cache/meridian/critical-queue)
    #[arg(long, env = "MERIDIAN_DURABLE_QUEUE_DIR")]
    pub durable_queue_dir: Option<PathBuf>,

    /// Keep CRITICAL messages in memory only
    #[arg(long, default_value_t = false, env = "MERIDIAN_NO_DURABLE_QUEUE")]
    pub no_durable_queue: bool,

    /// Default request/reply timeout in seconds
    #[arg(long, default_value_t = 30, env = "MERIDIAN_REQUEST_TIMEOUT_SECS")]
    pub request_timeout_secs: u64,

    /// Timeout of a single remote delivery attempt in milliseconds
    #[arg(long, default_value_t = 10_000, env = "MERIDIAN_DELIVERY_TIMEOUT_MS")]
    pub delivery_timeout_ms: u64,
}

impl BusOptions {
    /// Durable queue directory after `~` expansion, or `None` when disabled
    pub fn resolved_durable_queue_dir(&self) -> Option<PathBuf> {
        if self.no_durable_queue {
            return None;
        }
        Some(
            self.durable_queue_dir
                .as_ref()
                .map(expand_home_dir)
                .unwrap_or_else(default_durable_queue_dir),
        )
    }

    /// Builds the bus configuration and validates it
    pub fn to_config(&self) -> Result<BusConfig> {
        let mut config = BusConfig {
            service_name: self.service_name.clone(),
            health_poll_interval: Duration::from_secs(self.health_poll_interval_secs),
            health_probe_timeout: Duration::from_secs(self.health_probe_timeout_secs),
            registry_cleanup_interval: Duration::from_secs(self.registry_cleanup_interval_secs),
            eviction_window: Duration::from_secs(self.eviction_window_secs),
            durable_queue_dir: self.resolved_durable_queue_dir(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            delivery_timeout: Duration::from_millis(self.delivery_timeout_ms),
            ..BusConfig::default()
        };

        config.retry.normal.max_attempts = Some(self.normal_max_attempts);
        config.retry.normal.base_delay = Duration::from_millis(self.normal_base_delay_ms);
        config.retry.normal.max_delay = Duration::from_millis(self.normal_max_delay_ms);
        config.retry.high.max_attempts = Some(self.high_max_attempts);
        config.retry.high.base_delay = Duration::from_millis(self.high_base_delay_ms);
        config.retry.high.max_delay = Duration::from_millis(self.high_max_delay_ms);
        config.retry.critical.base_delay = Duration::from_millis(self.critical_base_delay_ms);
        config.retry.critical.max_delay = Duration::from_millis(self.critical_max_delay_ms);

        config.validate()?;
        Ok(config)
    }
}
