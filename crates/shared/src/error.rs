//! # Shared Error Handling Module
//!
//! Process-level error handling for Meridian services with error
//! classification and context preservation.
//!
//! ## Error Categories
//!
//! - **Configuration Errors**: Invalid bus, registry or gateway configuration
//! - **Network Errors**: Connection failures, bind failures, refused probes
//! - **Timeout Errors**: Operations that exceeded their configured budget
//! - **Storage Errors**: Durable queue I/O and serialization failures
//! - **Internal Errors**: Unexpected failures that indicate a bug
//!
//! Bus-level delivery failures have their own taxonomy in
//! [`crate::service_bus::BusError`] and convert into [`MeridianError`] when
//! they cross a process boundary (startup, CLI, HTTP server).

use std::net::AddrParseError;
use thiserror::Error;
use tracing::warn;

/// Result type alias for Meridian operations
///
/// This is the standard Result type used for process-level operations
/// (startup, configuration loading, server lifecycle).
pub type Result<T> = std::result::Result<T, MeridianError>;

/// Process-level error types for Meridian services
///
/// Each variant carries enough context to produce an actionable log line
/// and maps onto an HTTP status for the bus server.
#[derive(Error, Debug)]
pub enum MeridianError {
    /// Configuration validation errors
    ///
    /// Raised at startup when validating bus, health or gateway settings.
    ///
    /// **Recovery Strategy**: Fix configuration and restart
    #[error("Configuration error: {message}")]
    Configuration {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// Optional source error for additional context
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Network-level connectivity errors
    ///
    /// **HTTP Status Mapping**: 502 Bad Gateway
    ///
    /// **Recovery Strategy**: Retry with backoff
    #[error("Network error connecting to {target}: {message}")]
    Network {
        /// Target address that failed to connect
        target: String,
        /// Descriptive error message
        message: String,
        /// Underlying network error for debugging
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Operation timeout errors
    ///
    /// **HTTP Status Mapping**: 504 Gateway Timeout
    #[error("Operation timed out after {timeout_ms}ms: {operation}")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
        /// Description of the operation that timed out
        operation: String,
    },

    /// Durable storage errors
    ///
    /// Raised when the durable queue directory cannot be created, read
    /// or written.
    ///
    /// **HTTP Status Mapping**: 500 Internal Server Error
    #[error("Storage error at {path}: {message}")]
    Storage {
        /// Path involved in the failed operation
        path: String,
        /// Descriptive error message
        message: String,
        /// Underlying I/O error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Request validation errors
    ///
    /// **HTTP Status Mapping**: 400 Bad Request
    #[error("Request validation failed: {reason}")]
    RequestValidation {
        /// Reason for validation failure
        reason: String,
        /// Optional request context for debugging
        context: Option<String>,
    },

    /// Internal system errors
    ///
    /// **HTTP Status Mapping**: 500 Internal Server Error
    #[error("Internal error: {message}")]
    Internal {
        /// Error message describing the internal failure
        message: String,
        /// Source error for debugging
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Service unavailable errors
    ///
    /// Raised when the bus is stopped or a destination is not currently
    /// reachable.
    ///
    /// **HTTP Status Mapping**: 503 Service Unavailable
    #[error("Service unavailable: {reason}")]
    ServiceUnavailable {
        /// Reason service is unavailable
        reason: String,
        /// Optional estimated retry time in seconds
        retry_after: Option<u32>,
    },
}

impl MeridianError {
    /// Creates a configuration error with context
    ///
    /// # Examples
    ///
    /// ```rust
    /// use meridian_shared::error::MeridianError;
    ///
    /// let error = MeridianError::configuration("Health probe timeout must be non-zero", None);
    /// ```
    pub fn configuration(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Configuration {
            message: message.into(),
            source,
        }
    }

    /// Creates a network error with target and context
    ///
    /// # Examples
    ///
    /// ```rust
    /// use meridian_shared::error::MeridianError;
    ///
    /// let error = MeridianError::network("localhost:3001", "Connection refused", None);
    /// ```
    pub fn network(
        target: impl Into<String>,
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Network {
            target: target.into(),
            message: message.into(),
            source,
        }
    }

    /// Creates a timeout error with operation context
    ///
    /// # Examples
    ///
    /// ```rust
    /// use meridian_shared::error::MeridianError;
    /// use std::time::Duration;
    ///
    /// let error = MeridianError::timeout(Duration::from_secs(5), "health probe");
    /// ```
    pub fn timeout(timeout: std::time::Duration, operation: impl Into<String>) -> Self {
        Self::Timeout {
            timeout_ms: timeout.as_millis() as u64,
            operation: operation.into(),
        }
    }

    /// Creates a storage error for the given path
    pub fn storage(
        path: impl Into<String>,
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source,
        }
    }

    /// Creates a request validation error
    ///
    /// # Examples
    ///
    /// ```rust
    /// use meridian_shared::error::MeridianError;
    ///
    /// let error = MeridianError::request_validation(
    ///     "Envelope is missing the event field",
    ///     Some("POST /bus/messages".to_string()),
    /// );
    /// ```
    pub fn request_validation(reason: impl Into<String>, context: Option<String>) -> Self {
        Self::RequestValidation {
            reason: reason.into(),
            context,
        }
    }

    /// Creates an internal error with source context
    pub fn internal(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Internal {
            message: message.into(),
            source,
        }
    }

    /// Creates a service unavailable error
    pub fn service_unavailable(reason: impl Into<String>, retry_after: Option<u32>) -> Self {
        Self::ServiceUnavailable {
            reason: reason.into(),
            retry_after,
        }
    }

    /// Maps this error to an HTTP status code for the bus server
    ///
    /// # Status Code Mapping
    ///
    /// - Configuration errors: 500 (should not reach the HTTP layer)
    /// - Network errors: 502 Bad Gateway
    /// - Timeout errors: 504 Gateway Timeout
    /// - Storage errors: 500 Internal Server Error
    /// - Request validation: 400 Bad Request
    /// - Internal errors: 500 Internal Server Error
    /// - Service unavailable: 503 Service Unavailable
    pub fn to_http_status(&self) -> u16 {
        match self {
            MeridianError::Configuration { .. } => {
                warn!("Configuration error reached HTTP status mapping");
                500
            }
            MeridianError::Network { .. } => 502,
            MeridianError::Timeout { .. } => 504,
            MeridianError::Storage { .. } => 500,
            MeridianError::RequestValidation { .. } => 400,
            MeridianError::Internal { .. } => 500,
            MeridianError::ServiceUnavailable { .. } => 503,
        }
    }

    /// Checks if this error represents a temporary condition
    ///
    /// **Temporary (retriable):** network failures, timeouts, unavailable
    /// services.
    ///
    /// **Permanent (not retriable):** configuration, validation, storage
    /// and internal errors.
    pub fn is_temporary(&self) -> bool {
        match self {
            MeridianError::Configuration { .. } => false,
            MeridianError::Network { .. } => true,
            MeridianError::Timeout { .. } => true,
            MeridianError::Storage { .. } => false,
            MeridianError::RequestValidation { .. } => false,
            MeridianError::Internal { .. } => false,
            MeridianError::ServiceUnavailable { .. } => true,
        }
    }
}

/// Conversion from address parsing errors
impl From<AddrParseError> for MeridianError {
    fn from(err: AddrParseError) -> Self {
        MeridianError::configuration(
            format!("Invalid network address: {}", err),
            Some(Box::new(err)),
        )
    }
}

/// Conversion from I/O errors
///
/// Maps common I/O error kinds onto the matching Meridian variant.
impl From<std::io::Error> for MeridianError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => {
                MeridianError::timeout(std::time::Duration::from_secs(30), "I/O operation")
            }
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset => {
                MeridianError::network("unknown", "Connection failed", Some(Box::new(err)))
            }
            _ => MeridianError::internal("I/O error", Some(Box::new(err))),
        }
    }
}

/// Conversion from JSON errors
impl From<serde_json::Error> for MeridianError {
    fn from(err: serde_json::Error) -> Self {
        MeridianError::request_validation(format!("Invalid JSON: {}", err), None)
    }
}
