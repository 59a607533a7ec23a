//! Input validation for service records
//!
//! Registration data arrives from other processes over HTTP, so names and
//! addresses are checked before they reach the registry.

use super::errors::{BusError, BusResult};
use super::types::ServiceRecord;
use std::net::IpAddr;
use std::str::FromStr;

/// Maximum length for service names
pub const MAX_SERVICE_NAME_LENGTH: usize = 128;

/// Maximum length for addresses
pub const MAX_ADDRESS_LENGTH: usize = 256;

/// Maximum number of declared routes per service
pub const MAX_ROUTES: usize = 256;

/// Validates a service name
///
/// # Validation Rules
///
/// - Non-empty, at most 128 characters
/// - ASCII alphanumerics, `-`, `_` and `.` only
///
/// # Examples
///
/// ```rust
/// use meridian_shared::service_bus::validation::validate_service_name;
///
/// assert!(validate_service_name("ai-research-service").is_ok());
/// assert!(validate_service_name("scraper.v2").is_ok());
/// assert!(validate_service_name("").is_err());
/// assert!(validate_service_name("user service").is_err());
/// ```
pub fn validate_service_name(name: &str) -> BusResult<()> {
    if name.is_empty() {
        return Err(BusError::invalid_record("Service name cannot be empty"));
    }

    if name.len() > MAX_SERVICE_NAME_LENGTH {
        return Err(BusError::invalid_record(format!(
            "Service name exceeds {} characters",
            MAX_SERVICE_NAME_LENGTH
        )));
    }

    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(BusError::invalid_record(format!(
            "Invalid character '{}' in service name '{}'",
            bad, name
        )));
    }

    Ok(())
}

/// Validates a service address
///
/// Accepts `host:port` (hostname, IPv4 or bracketed IPv6) with a non-zero
/// port, or an `http://` / `https://` base URL.
///
/// # Examples
///
/// ```rust
/// use meridian_shared::service_bus::validation::validate_address;
///
/// assert!(validate_address("localhost:3001").is_ok());
/// assert!(validate_address("10.0.0.5:8080").is_ok());
/// assert!(validate_address("[::1]:8080").is_ok());
/// assert!(validate_address("https://ai.internal").is_ok());
///
/// assert!(validate_address("localhost").is_err());
/// assert!(validate_address("localhost:0").is_err());
/// assert!(validate_address("").is_err());
/// ```
pub fn validate_address(address: &str) -> BusResult<()> {
    let trimmed = address.trim();

    if trimmed.is_empty() {
        return Err(BusError::invalid_record("Address cannot be empty"));
    }

    if trimmed.len() > MAX_ADDRESS_LENGTH {
        return Err(BusError::invalid_record(format!(
            "Address exceeds {} characters",
            MAX_ADDRESS_LENGTH
        )));
    }

    for scheme in ["http://", "https://"] {
        if let Some(rest) = trimmed.strip_prefix(scheme) {
            let authority = rest.split('/').next().unwrap_or_default();
            if authority.is_empty() {
                return Err(BusError::invalid_record(format!(
                    "URL '{}' has no host",
                    trimmed
                )));
            }
            return Ok(());
        }
    }

    let (host, port) = match trimmed.rsplit_once(':') {
        Some(parts) => parts,
        None => {
            return Err(BusError::invalid_record(format!(
                "Address '{}' must be in format 'host:port'",
                trimmed
            )))
        }
    };

    match port.parse::<u16>() {
        Ok(0) | Err(_) => {
            return Err(BusError::invalid_record(format!(
                "Invalid port '{}' in address '{}'",
                port, trimmed
            )))
        }
        Ok(_) => {}
    }

    if host.is_empty() {
        return Err(BusError::invalid_record("Host cannot be empty"));
    }

    let unbracketed = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if IpAddr::from_str(unbracketed).is_ok() {
        return Ok(());
    }

    validate_hostname(host, trimmed)
}

fn validate_hostname(hostname: &str, original: &str) -> BusResult<()> {
    if hostname.len() > 253 {
        return Err(BusError::invalid_record(format!(
            "Hostname in '{}' exceeds 253 characters",
            original
        )));
    }

    for label in hostname.split('.') {
        let valid = !label.is_empty()
            && label.len() <= 63
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            && !label.starts_with('-')
            && !label.ends_with('-');
        if !valid {
            return Err(BusError::invalid_record(format!(
                "Invalid hostname label '{}' in '{}'",
                label, original
            )));
        }
    }

    Ok(())
}

/// Validates a full record before it is stored
pub fn validate_service_record(record: &ServiceRecord) -> BusResult<()> {
    validate_service_name(&record.name)?;
    validate_address(&record.address)?;

    if !record.health_endpoint.starts_with('/') {
        return Err(BusError::invalid_record(format!(
            "Health endpoint '{}' must start with '/'",
            record.health_endpoint
        )));
    }

    if record.routes.len() > MAX_ROUTES {
        return Err(BusError::invalid_record(format!(
            "Service '{}' declares more than {} routes",
            record.name, MAX_ROUTES
        )));
    }

    if let Some(route) = record.routes.iter().find(|r| !r.path.starts_with('/')) {
        return Err(BusError::invalid_record(format!(
            "Route path '{}' must start with '/'",
            route.path
        )));
    }

    Ok(())
}
