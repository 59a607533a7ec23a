//! Transport boundary between the bus and its destinations
//!
//! In the single-process topology local delivery and broadcast are plain
//! dispatches into the subscription table, and directed sends to remote
//! services are HTTP posts of the JSON envelope. A broker-backed transport
//! can replace any of the three without touching the bus.

use super::errors::{BusError, BusResult};
use super::protocol::MESSAGES_PATH;
use super::subscription::{DispatchReport, SubscriptionTable};
use super::types::{Message, ServiceRecord};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Trait for message transports
#[async_trait]
pub trait Transport: Send + Sync {
    /// Delivers a message to handlers in this process
    async fn deliver_local(
        &self,
        subscriptions: &SubscriptionTable,
        message: &Message,
    ) -> BusResult<DispatchReport> {
        Ok(subscriptions.dispatch(message).await)
    }

    /// Delivers a directed message to a service in another process
    ///
    /// Any failure is reported as `DestinationUnreachable` so the delivery
    /// manager can apply the priority's retry policy.
    async fn deliver_remote(&self, record: &ServiceRecord, message: &Message) -> BusResult<()>;

    /// Fans a message out to every subscriber
    ///
    /// Collapses to a local dispatch when there is no broker.
    async fn broadcast(
        &self,
        subscriptions: &SubscriptionTable,
        message: &Message,
    ) -> BusResult<DispatchReport> {
        Ok(subscriptions.dispatch(message).await)
    }

    /// Name of this transport implementation
    fn name(&self) -> &'static str;
}

/// HTTP transport
///
/// Posts the envelope to `<base_url>/bus/messages` and treats any `2xx`
/// answer as delivered.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Creates a transport whose requests give up after `timeout`
    ///
    /// # Examples
    ///
    /// ```rust
    /// use meridian_shared::service_bus::{HttpTransport, Transport};
    /// use std::time::Duration;
    ///
    /// let transport = HttpTransport::new(Duration::from_secs(10));
    /// assert_eq!(transport.name(), "http");
    /// ```
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Falling back to default HTTP client for delivery");
                Client::new()
            });
        Self { client }
    }

    /// Returns the delivery URL for `record`
    pub fn delivery_url(record: &ServiceRecord) -> String {
        format!("{}{}", record.base_url(), MESSAGES_PATH)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(skip(self, record, message), fields(destination = %record.name, message_id = %message.id, attempt = message.attempt))]
    async fn deliver_remote(&self, record: &ServiceRecord, message: &Message) -> BusResult<()> {
        let url = Self::delivery_url(record);

        let response = self
            .client
            .post(&url)
            .json(message)
            .send()
            .await
            .map_err(|e| {
                let reason = if e.is_timeout() {
                    "Request timeout".to_string()
                } else {
                    format!("Request failed: {}", e)
                };
                BusError::unreachable(&record.name, reason)
            })?;

        let status = response.status();
        if status.is_success() {
            debug!(url = %url, status = %status, "Remote delivery accepted");
            Ok(())
        } else {
            Err(BusError::unreachable(
                &record.name,
                format!("HTTP {}", status),
            ))
        }
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service_bus::types::ServiceRegistration;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn record_for(server: &MockServer) -> ServiceRecord {
        let addr = server.address();
        ServiceRegistration::new("document-service", addr.ip().to_string(), addr.port())
            .into_record(false)
    }

    #[tokio::test]
    async fn test_remote_delivery_posts_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bus/messages"))
            .and(body_partial_json(json!({"event": "document.created", "destination": "document-service"})))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let transport = HttpTransport::new(Duration::from_secs(2));
        let message = Message::new("document.created", "gateway", json!({"id": 7}))
            .with_destination("document-service");

        transport
            .deliver_remote(&record_for(&server), &message)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_remote_error_status_is_unreachable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bus/messages"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(Duration::from_secs(2));
        let message = Message::new("document.created", "gateway", json!({}));

        let err = transport
            .deliver_remote(&record_for(&server), &message)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "DestinationUnreachable");
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn test_connection_refused_is_unreachable() {
        let record = ServiceRegistration::new("ghost-service", "127.0.0.1", 1).into_record(false);
        let transport = HttpTransport::new(Duration::from_secs(2));

        let err = transport
            .deliver_remote(&record, &Message::new("x.y", "gateway", json!({})))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
