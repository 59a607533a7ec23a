//! Event names used by the bus itself
//!
//! Collaborators may publish any dot-namespaced event string; the bus only
//! originates the closed set in [`CoreEvent`] and derives reply names with
//! [`reply_event`].

use std::fmt;

/// Suffix of request events that have a dedicated reply namespace
pub const REQUEST_SUFFIX: &str = ".request";
/// Suffix of success replies and delivery confirmations
pub const COMPLETED_SUFFIX: &str = ".completed";
/// Suffix of failure replies and delivery failures
pub const ERROR_SUFFIX: &str = ".error";

/// Events originated by the registry, the health monitor and the facade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoreEvent {
    ServiceRegistered,
    ServiceDeregistered,
    ServiceEvicted,
    ServiceHealthStatus,
    ServiceReady,
    ServiceShutdown,
}

impl CoreEvent {
    /// Returns the wire name of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            CoreEvent::ServiceRegistered => "service.registered",
            CoreEvent::ServiceDeregistered => "service.deregistered",
            CoreEvent::ServiceEvicted => "service.evicted",
            CoreEvent::ServiceHealthStatus => "service.health.status",
            CoreEvent::ServiceReady => "service.ready",
            CoreEvent::ServiceShutdown => "service.shutdown",
        }
    }

    /// Parses a wire name into a core event
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "service.registered" => Some(CoreEvent::ServiceRegistered),
            "service.deregistered" => Some(CoreEvent::ServiceDeregistered),
            "service.evicted" => Some(CoreEvent::ServiceEvicted),
            "service.health.status" => Some(CoreEvent::ServiceHealthStatus),
            "service.ready" => Some(CoreEvent::ServiceReady),
            "service.shutdown" => Some(CoreEvent::ServiceShutdown),
            _ => None,
        }
    }
}

impl fmt::Display for CoreEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derives the reply event name for `event`
///
/// `<domain>.request` replies on `<domain>.completed` / `<domain>.error`;
/// any other event `E` replies on `E.completed` / `E.error`, the same names
/// the delivery manager uses for outcome events. Replies to requests carry
/// `reply_to`; outcome events never do.
///
/// # Examples
///
/// ```rust
/// use meridian_shared::service_bus::reply_event;
///
/// assert_eq!(reply_event("research.request", false), "research.completed");
/// assert_eq!(reply_event("research.request", true), "research.error");
/// assert_eq!(reply_event("document.created", false), "document.created.completed");
/// ```
pub fn reply_event(event: &str, is_error: bool) -> String {
    let suffix = if is_error { ERROR_SUFFIX } else { COMPLETED_SUFFIX };
    match event.strip_suffix(REQUEST_SUFFIX) {
        Some(domain) if !domain.is_empty() => format!("{}{}", domain, suffix),
        _ => format!("{}{}", event, suffix),
    }
}

/// Event carrying a delivery confirmation for `event`
pub fn completed_event(event: &str) -> String {
    format!("{}{}", event, COMPLETED_SUFFIX)
}

/// Event carrying a delivery failure for `event`
pub fn error_event(event: &str) -> String {
    format!("{}{}", event, ERROR_SUFFIX)
}

/// Returns whether `event` is a syntactically valid event name
///
/// Names are non-empty, dot-separated segments of ASCII alphanumerics,
/// `-` and `_`.
pub fn is_valid_event_name(event: &str) -> bool {
    !event.is_empty()
        && event.len() <= 256
        && event.split('.').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        })
}
