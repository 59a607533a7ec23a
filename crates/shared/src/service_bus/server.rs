//! HTTP surface of the message bus
//!
//! Exposes the health contract and the endpoints remote services use to
//! register themselves and to push envelopes into this process.
//!
//! ## Endpoints
//!
//! | Method | Path | Success |
//! |---|---|---|
//! | `GET` | `/health` | `200 {status, uptime, timestamp}` |
//! | `POST` | `/bus/messages` | `202`, envelope published locally |
//! | `POST` | `/bus/register` | `201`, stored record |
//! | `DELETE` | `/bus/services/<name>` | `204` |
//! | `GET` | `/bus/services` | `200`, array of records |
//!
//! Request bodies larger than 256 KiB are rejected with `413`.

use super::bus::MessageBus;
use super::dispatch::BusPhase;
use super::errors::BusError;
use super::events::is_valid_event_name;
use super::types::{Message, ServiceRegistration};
use crate::error::{MeridianError, Result};
use super::protocol::{HEALTH_PATH, MAX_BODY_BYTES, MESSAGES_PATH, REGISTER_PATH, SERVICES_PATH};
use chrono::Utc;
use hyper::body::{Bytes, HttpBody};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::Serialize;
use serde_json::json;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// HTTP server for the bus endpoints
pub struct BusServer {
    bus: Arc<MessageBus>,
    bind_addr: SocketAddr,
}

/// A bound server running in the background
pub struct RunningBusServer {
    local_addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl RunningBusServer {
    /// Address the server actually listens on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections and waits for in-flight requests
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.task
            .await
            .map_err(|e| MeridianError::internal("Bus server task failed", Some(Box::new(e))))?
    }
}

impl BusServer {
    /// Creates a server for `bus` bound to `bind_addr` once started
    pub fn new(bus: Arc<MessageBus>, bind_addr: SocketAddr) -> Self {
        Self { bus, bind_addr }
    }

    /// Configured bind address
    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    /// Serves until `shutdown` resolves, then drains in-flight requests
    #[instrument(skip(self, shutdown), fields(bind_addr = %self.bind_addr))]
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let running = self.spawn().await?;
        shutdown.await;
        running.shutdown().await?;
        info!("Bus server shut down");
        Ok(())
    }

    /// Binds the server and runs it on a background task
    ///
    /// Binding to port `0` picks a free port; see
    /// [`RunningBusServer::local_addr`].
    pub async fn spawn(self) -> Result<RunningBusServer> {
        let listener = std::net::TcpListener::bind(self.bind_addr).map_err(|e| {
            error!(bind_addr = %self.bind_addr, error = %e, "Failed to bind bus server");
            MeridianError::network(
                self.bind_addr.to_string(),
                "Failed to bind to address",
                Some(Box::new(e)),
            )
        })?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let bus = self.bus.clone();
        let started_at = Instant::now();
        let make_svc = make_service_fn(move |_conn| {
            let bus = bus.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    handle_request(req, bus.clone(), started_at)
                }))
            }
        });

        let builder = Server::from_tcp(listener).map_err(|e| {
            MeridianError::network(local_addr.to_string(), "Failed to serve listener", Some(Box::new(e)))
        })?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            info!(local_addr = %local_addr, "Bus server listening");
            builder
                .serve(make_svc)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .map_err(|e| {
                    MeridianError::network(local_addr.to_string(), "HTTP server error", Some(Box::new(e)))
                })
        });

        Ok(RunningBusServer {
            local_addr,
            shutdown_tx: Some(shutdown_tx),
            task,
        })
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    match serde_json::to_vec(body) {
        Ok(bytes) => Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(Body::from(bytes))
            .unwrap_or_else(|_| Response::new(Body::empty())),
        Err(e) => {
            error!(error = %e, "Failed to serialize response body");
            empty_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn empty_response(status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::empty())
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn error_response(error: &MeridianError) -> Response<Body> {
    let status =
        StatusCode::from_u16(error.to_http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    json_response(status, &json!({ "error": error.to_string() }))
}

#[instrument(skip_all, fields(method = ?req.method(), path = req.uri().path()))]
async fn handle_request(
    req: Request<Body>,
    bus: Arc<MessageBus>,
    started_at: Instant,
) -> std::result::Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = match (&method, path.as_str()) {
        (&Method::GET, HEALTH_PATH) => handle_health(started_at),
        (&Method::POST, MESSAGES_PATH) => handle_message(req, &bus).await,
        (&Method::POST, REGISTER_PATH) => handle_register(req, &bus).await,
        (&Method::GET, SERVICES_PATH) => {
            json_response(StatusCode::OK, &bus.registry().list().await)
        }
        (&Method::DELETE, p) if p.starts_with(SERVICES_PATH) => {
            handle_deregister(&path[SERVICES_PATH.len()..], &bus).await
        }
        (_, HEALTH_PATH | MESSAGES_PATH | REGISTER_PATH | SERVICES_PATH) => {
            empty_response(StatusCode::METHOD_NOT_ALLOWED)
        }
        _ => {
            warn!(method = %method, path = %path, "Request to unknown endpoint");
            json_response(StatusCode::NOT_FOUND, &json!({ "error": "Not found" }))
        }
    };

    debug!(status = %response.status(), "Request completed");
    Ok(response)
}

fn handle_health(started_at: Instant) -> Response<Body> {
    json_response(
        StatusCode::OK,
        &json!({
            "status": "healthy",
            "uptime": started_at.elapsed().as_secs(),
            "timestamp": Utc::now().to_rfc3339(),
        }),
    )
}

enum BodyError {
    TooLarge(usize),
    Read(hyper::Error),
}

async fn read_body(req: Request<Body>) -> std::result::Result<Bytes, BodyError> {
    let declared = req
        .headers()
        .get(hyper::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if let Some(length) = declared {
        if length > MAX_BODY_BYTES {
            return Err(BodyError::TooLarge(length));
        }
    }

    let mut body = req.into_body();
    let mut collected = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(BodyError::Read)?;
        if collected.len() + chunk.len() > MAX_BODY_BYTES {
            return Err(BodyError::TooLarge(collected.len() + chunk.len()));
        }
        collected.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(collected))
}

async fn read_json<T: serde::de::DeserializeOwned>(
    req: Request<Body>,
) -> std::result::Result<T, Response<Body>> {
    let bytes = match read_body(req).await {
        Ok(bytes) => bytes,
        Err(BodyError::TooLarge(size)) => {
            warn!(size, max_allowed = MAX_BODY_BYTES, "Request body too large");
            return Err(json_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                &json!({ "error": "Payload too large", "maxSizeBytes": MAX_BODY_BYTES }),
            ));
        }
        Err(BodyError::Read(e)) => {
            warn!(error = %e, "Failed to read request body");
            return Err(error_response(&MeridianError::request_validation(
                "Failed to read request body",
                None,
            )));
        }
    };

    serde_json::from_slice(&bytes).map_err(|e| error_response(&MeridianError::from(e)))
}

async fn handle_message(req: Request<Body>, bus: &MessageBus) -> Response<Body> {
    let message: Message = match read_json(req).await {
        Ok(message) => message,
        Err(response) => return response,
    };

    if !is_valid_event_name(&message.event) {
        return error_response(&MeridianError::request_validation(
            format!("Invalid event name '{}'", message.event),
            Some(format!("POST {}", MESSAGES_PATH)),
        ));
    }

    if bus.phase() == BusPhase::Stopped {
        return error_response(&BusError::BusStopped.into());
    }

    debug!(
        message_id = %message.id,
        event = %message.event,
        source = %message.source,
        "Accepted remote envelope"
    );
    let handle = bus.publish_message(message);
    json_response(
        StatusCode::ACCEPTED,
        &json!({ "accepted": true, "messageId": handle.message_id() }),
    )
}

async fn handle_register(req: Request<Body>, bus: &MessageBus) -> Response<Body> {
    let registration: ServiceRegistration = match read_json(req).await {
        Ok(registration) => registration,
        Err(response) => return response,
    };

    match bus.registry().register(registration.into_record(false)).await {
        Ok(record) => json_response(StatusCode::CREATED, &record),
        Err(e) => {
            warn!(error = %e, "Rejected service registration");
            error_response(&e.into())
        }
    }
}

async fn handle_deregister(suffix: &str, bus: &MessageBus) -> Response<Body> {
    let name = suffix.strip_prefix('/').unwrap_or_default();
    if name.is_empty() || name.contains('/') {
        return json_response(StatusCode::NOT_FOUND, &json!({ "error": "Not found" }));
    }

    bus.registry().deregister(name).await;
    empty_response(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service_bus::{HandlerFn, ServiceRegistry};
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn started_bus() -> Arc<MessageBus> {
        let bus = Arc::new(MessageBus::builder(ServiceRegistry::new()).build().unwrap());
        bus.start().await.unwrap();
        bus
    }

    async fn body_json(response: Response<Body>) -> Value {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn request(method: Method, uri: &str, body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(body.into())
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_contract() {
        let bus = started_bus().await;
        let response = handle_request(request(Method::GET, "/health", Body::empty()), bus, Instant::now())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert!(body["uptime"].is_u64());
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_register_list_and_deregister() {
        let bus = started_bus().await;
        let registration = json!({"name": "user-service", "host": "localhost", "port": 3001});

        let response = handle_request(
            request(Method::POST, "/bus/register", registration.to_string()),
            bus.clone(),
            Instant::now(),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = handle_request(request(Method::GET, "/bus/services", Body::empty()), bus.clone(), Instant::now())
            .await
            .unwrap();
        let listed = body_json(response).await;
        assert_eq!(listed[0]["name"], "user-service");
        assert_eq!(listed[0]["healthEndpoint"], "/health");

        let response = handle_request(
            request(Method::DELETE, "/bus/services/user-service", Body::empty()),
            bus.clone(),
            Instant::now(),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(bus.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_invalid_registration_is_bad_request() {
        let bus = started_bus().await;
        let registration = json!({"name": "", "host": "localhost", "port": 3001});

        let response = handle_request(
            request(Method::POST, "/bus/register", registration.to_string()),
            bus,
            Instant::now(),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_posted_envelope_reaches_local_handlers() {
        let bus = started_bus().await;
        let received = Arc::new(AtomicUsize::new(0));
        let counter = received.clone();
        bus.subscribe(
            "document.created",
            HandlerFn::arc("counter", move |_message: Message| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .await;

        let envelope = Message::new("document.created", "document-service", json!({"id": 1}));
        let response = handle_request(
            request(Method::POST, "/bus/messages", serde_json::to_string(&envelope).unwrap()),
            bus.clone(),
            Instant::now(),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        for _ in 0..100 {
            if received.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(received.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let bus = started_bus().await;
        let body = vec![b' '; MAX_BODY_BYTES + 1];

        let response = handle_request(request(Method::POST, "/bus/messages", body), bus, Instant::now())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_unknown_path_and_wrong_method() {
        let bus = started_bus().await;

        let response = handle_request(request(Method::GET, "/nope", Body::empty()), bus.clone(), Instant::now())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = handle_request(request(Method::PUT, "/bus/messages", Body::empty()), bus, Instant::now())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
