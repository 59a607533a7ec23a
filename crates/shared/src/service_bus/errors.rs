//! Error types for service bus operations
//!
//! This module defines the bus-level error taxonomy. These errors never
//! propagate synchronously to publishers; delivery failures surface as
//! `<event>.error` messages and handler failures are isolated and logged.

use crate::error::MeridianError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Errors that can occur during service bus operations
///
/// # Examples
///
/// ```rust
/// use meridian_shared::service_bus::BusError;
///
/// let error = BusError::DestinationUnknown("document-service".to_string());
/// assert_eq!(error.kind(), "DestinationUnknown");
/// assert!(!error.is_retryable());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BusError {
    /// Registry lookup miss
    ///
    /// Terminal: retrying cannot produce an address that was never known.
    DestinationUnknown(String),

    /// Transport failure while delivering to a known destination
    ///
    /// This error occurs when:
    /// - The destination's HTTP endpoint refuses or drops the connection
    /// - The destination answers with a non-success status
    /// - The destination was deregistered while a retry was pending
    DestinationUnreachable { destination: String, reason: String },

    /// A local subscriber returned an error or panicked
    ///
    /// Logged and isolated; never fails the publish.
    HandlerError { handler: String, reason: String },

    /// The priority's attempt ceiling was reached
    RetryExhausted {
        event: String,
        destination: String,
        attempts: u32,
        reason: String,
    },

    /// A CRITICAL message could not be written to the durable store
    ///
    /// The send still proceeds in memory, but recovery after a restart
    /// cannot be guaranteed for that message.
    DurablePersistenceFailure { message_id: String, reason: String },

    /// Registration data failed validation
    InvalidServiceRecord { reason: String },

    /// Configuration validation failed
    ConfigValidationFailed(String),

    /// Envelope or payload could not be encoded or decoded
    SerializationError(String),

    /// A request/reply exchange did not receive its reply in time
    Timeout { operation: String, timeout_ms: u64 },

    /// The bus has been stopped and no longer accepts work
    BusStopped,
}

impl BusError {
    /// Creates a destination unreachable error
    ///
    /// # Examples
    ///
    /// ```rust
    /// use meridian_shared::service_bus::BusError;
    ///
    /// let error = BusError::unreachable("user-service", "connection refused");
    /// assert!(error.is_retryable());
    /// ```
    pub fn unreachable(destination: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DestinationUnreachable {
            destination: destination.into(),
            reason: reason.into(),
        }
    }

    /// Creates a handler error
    pub fn handler(handler: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::HandlerError {
            handler: handler.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid service record error
    pub fn invalid_record(reason: impl Into<String>) -> Self {
        Self::InvalidServiceRecord {
            reason: reason.into(),
        }
    }

    /// Creates a durable persistence failure
    pub fn persistence(message_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DurablePersistenceFailure {
            message_id: message_id.into(),
            reason: reason.into(),
        }
    }

    /// Returns whether the delivery that produced this error may be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::DestinationUnknown(_) => false,
            Self::DestinationUnreachable { .. } => true,
            Self::HandlerError { .. } => false,
            Self::RetryExhausted { .. } => false,
            Self::DurablePersistenceFailure { .. } => false,
            Self::InvalidServiceRecord { .. } => false,
            Self::ConfigValidationFailed(_) => false,
            Self::SerializationError(_) => false,
            Self::Timeout { .. } => true,
            Self::BusStopped => false,
        }
    }

    /// Returns the taxonomy name carried in `<event>.error` payloads
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DestinationUnknown(_) => "DestinationUnknown",
            Self::DestinationUnreachable { .. } => "DestinationUnreachable",
            Self::HandlerError { .. } => "HandlerError",
            Self::RetryExhausted { .. } => "RetryExhausted",
            Self::DurablePersistenceFailure { .. } => "DurablePersistenceFailure",
            Self::InvalidServiceRecord { .. } => "InvalidServiceRecord",
            Self::ConfigValidationFailed(_) => "ConfigValidationFailed",
            Self::SerializationError(_) => "SerializationError",
            Self::Timeout { .. } => "Timeout",
            Self::BusStopped => "BusStopped",
        }
    }

    /// Returns the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::DestinationUnknown(_) => "registry_lookup",
            Self::DestinationUnreachable { .. } => "transport",
            Self::HandlerError { .. } => "handler",
            Self::RetryExhausted { .. } => "delivery",
            Self::DurablePersistenceFailure { .. } => "persistence",
            Self::InvalidServiceRecord { .. } => "validation",
            Self::ConfigValidationFailed(_) => "configuration",
            Self::SerializationError(_) => "serialization",
            Self::Timeout { .. } => "timeout",
            Self::BusStopped => "lifecycle",
        }
    }
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DestinationUnknown(name) => {
                write!(f, "Destination not registered: {}", name)
            }
            Self::DestinationUnreachable {
                destination,
                reason,
            } => {
                write!(f, "Destination {} unreachable: {}", destination, reason)
            }
            Self::HandlerError { handler, reason } => {
                write!(f, "Handler {} failed: {}", handler, reason)
            }
            Self::RetryExhausted {
                event,
                destination,
                attempts,
                reason,
            } => {
                write!(
                    f,
                    "Delivery of {} to {} failed after {} attempts: {}",
                    event, destination, attempts, reason
                )
            }
            Self::DurablePersistenceFailure { message_id, reason } => {
                write!(
                    f,
                    "Failed to persist critical message {}: {}",
                    message_id, reason
                )
            }
            Self::InvalidServiceRecord { reason } => {
                write!(f, "Invalid service record: {}", reason)
            }
            Self::ConfigValidationFailed(reason) => {
                write!(f, "Configuration validation failed: {}", reason)
            }
            Self::SerializationError(reason) => {
                write!(f, "Serialization error: {}", reason)
            }
            Self::Timeout {
                operation,
                timeout_ms,
            } => {
                write!(f, "{} timed out after {}ms", operation, timeout_ms)
            }
            Self::BusStopped => write!(f, "Message bus is stopped"),
        }
    }
}

impl std::error::Error for BusError {}

impl From<serde_json::Error> for BusError {
    fn from(error: serde_json::Error) -> Self {
        Self::SerializationError(error.to_string())
    }
}

/// Converts a BusError into a MeridianError at process boundaries
impl From<BusError> for MeridianError {
    fn from(error: BusError) -> Self {
        match error {
            BusError::ConfigValidationFailed(msg) => MeridianError::configuration(
                format!("Service bus configuration error: {}", msg),
                None,
            ),
            BusError::DestinationUnreachable {
                destination,
                reason,
            } => MeridianError::network(destination, reason, None),
            BusError::InvalidServiceRecord { reason } => {
                MeridianError::request_validation(reason, None)
            }
            BusError::SerializationError(reason) => {
                MeridianError::request_validation(reason, None)
            }
            BusError::Timeout {
                operation,
                timeout_ms,
            } => MeridianError::timeout(std::time::Duration::from_millis(timeout_ms), operation),
            BusError::BusStopped => {
                MeridianError::service_unavailable("Message bus is stopped", None)
            }
            other => MeridianError::internal(format!("Service bus error: {}", other), None),
        }
    }
}

/// Result type alias for service bus operations
pub type BusResult<T> = std::result::Result<T, BusError>;
