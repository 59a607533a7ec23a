/// End-to-end tests for delivery to remote services over HTTP
///
/// Remote services are played by wiremock servers or by a second bus
/// serving the bus endpoints on an ephemeral port.
use meridian_gateway::ServiceManifest;
use meridian_shared::service_bus::{
    BusConfig, BusServer, HandlerFn, Message, MessageBus, MessageHandler, MessageOptions,
    Priority, ServiceRecord, ServiceRegistry,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn collect(log: Arc<Mutex<Vec<Message>>>) -> Arc<dyn MessageHandler> {
    HandlerFn::arc("collector", move |message: Message| {
        let log = log.clone();
        async move {
            log.lock().unwrap().push(message);
            Ok(())
        }
    })
}

async fn wait_for(log: &Arc<Mutex<Vec<Message>>>, count: usize) -> Vec<Message> {
    for _ in 0..300 {
        if log.lock().unwrap().len() >= count {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    log.lock().unwrap().clone()
}

/// Short backoff so retry tests finish quickly
fn quick_retry_config() -> BusConfig {
    let mut config = BusConfig::default();
    for policy in [&mut config.retry.normal, &mut config.retry.high] {
        policy.base_delay = Duration::from_millis(20);
        policy.max_delay = Duration::from_millis(100);
    }
    config.retry.critical.base_delay = Duration::from_millis(20);
    config.retry.critical.max_delay = Duration::from_millis(200);
    config
}

/// E2E test: a directed send is posted to the remote bus endpoint
#[tokio::test]
async fn test_directed_send_posts_envelope() {
    let remote = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/bus/messages"))
        .and(body_partial_json(json!({
            "event": "document.created",
            "source": "gateway",
            "destination": "document-service",
            "priority": "HIGH",
            "attempt": 1
        })))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&remote)
        .await;

    let registry = ServiceRegistry::new();
    registry
        .register(ServiceRecord::new("document-service", remote.uri(), "/health", vec![], false))
        .await
        .unwrap();
    let bus = MessageBus::builder(registry).build().unwrap();
    let completed = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe("document.created.completed", collect(completed.clone()))
        .await;
    bus.start().await.unwrap();

    let id = bus
        .send_to_service(
            "document-service",
            "document.created",
            json!({"id": 5}),
            MessageOptions::priority(Priority::High),
        )
        .await
        .unwrap();

    let completed = wait_for(&completed, 1).await;
    assert_eq!(completed[0].payload["messageId"], id.as_str());
    assert_eq!(completed[0].payload["attempt"], 1);
}

/// E2E test: transient remote failures are retried until success
#[tokio::test]
async fn test_remote_failures_are_retried() {
    let remote = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/bus/messages"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&remote)
        .await;
    Mock::given(method("POST"))
        .and(path("/bus/messages"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&remote)
        .await;

    let manifest = ServiceManifest::from_json(&format!(
        r#"{{"services": [{{"name": "freezone-service", "host": "127.0.0.1", "port": {}}}]}}"#,
        remote.address().port()
    ))
    .unwrap();
    let registry = ServiceRegistry::new();
    manifest.register_all(&registry).await.unwrap();

    let bus = MessageBus::builder(registry)
        .config(quick_retry_config())
        .build()
        .unwrap();
    let completed = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe("freezone.synced.completed", collect(completed.clone()))
        .await;
    bus.start().await.unwrap();

    bus.send_to_service(
        "freezone-service",
        "freezone.synced",
        json!({"count": 48}),
        MessageOptions::priority(Priority::Normal),
    )
    .await
    .unwrap();

    let completed = wait_for(&completed, 1).await;
    assert_eq!(completed[0].payload["attempt"], 3);
    assert_eq!(bus.delivery_metrics().await.retries_scheduled, 2);
}

/// E2E test: NORMAL priority gives up after three refused attempts
#[tokio::test]
async fn test_unreachable_service_exhausts_retries() {
    let registry = ServiceRegistry::new();
    registry
        .register(ServiceRecord::new("ai-service", "127.0.0.1:1", "/health", vec![], false))
        .await
        .unwrap();
    let bus = MessageBus::builder(registry)
        .config(quick_retry_config())
        .build()
        .unwrap();
    let errors = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe("research.enrich.error", collect(errors.clone()))
        .await;
    bus.start().await.unwrap();

    bus.send_to_service(
        "ai-service",
        "research.enrich",
        json!({}),
        MessageOptions::default(),
    )
    .await
    .unwrap();

    let errors = wait_for(&errors, 1).await;
    assert_eq!(errors[0].payload["kind"], "RetryExhausted");
    assert_eq!(errors[0].payload["attempt"], 3);
    assert_eq!(bus.delivery_metrics().await.attempts, 3);
}

/// E2E test: two buses connected through the bus HTTP endpoints
///
/// The remote bus serves `/bus/messages`; envelopes posted there reach its
/// local subscribers unchanged.
#[tokio::test]
async fn test_bus_to_bus_delivery() {
    let remote_bus = Arc::new(MessageBus::builder(ServiceRegistry::new()).build().unwrap());
    let received = Arc::new(Mutex::new(Vec::new()));
    remote_bus
        .subscribe("scrape.completed", collect(received.clone()))
        .await;
    remote_bus.start().await.unwrap();
    let server = BusServer::new(remote_bus.clone(), "127.0.0.1:0".parse().unwrap())
        .spawn()
        .await
        .unwrap();

    let registry = ServiceRegistry::new();
    registry
        .register(ServiceRecord::new(
            "analytics-service",
            format!("http://{}", server.local_addr()),
            "/health",
            vec![],
            false,
        ))
        .await
        .unwrap();
    let bus = MessageBus::builder(registry).build().unwrap();
    bus.start().await.unwrap();

    let id = bus
        .send_to_service(
            "analytics-service",
            "scrape.completed",
            json!({"pages": 120}),
            MessageOptions::default().with_source("scraper-service"),
        )
        .await
        .unwrap();

    let received = wait_for(&received, 1).await;
    assert_eq!(received[0].id, id);
    assert_eq!(received[0].source, "scraper-service");
    assert_eq!(received[0].payload["pages"], 120);

    bus.stop().await;
    remote_bus.stop().await;
    server.shutdown().await.unwrap();
}

/// E2E test: remote registration over HTTP
#[tokio::test]
async fn test_http_registration_lifecycle() {
    let bus = Arc::new(MessageBus::builder(ServiceRegistry::new()).build().unwrap());
    bus.start().await.unwrap();
    let server = BusServer::new(bus.clone(), "127.0.0.1:0".parse().unwrap())
        .spawn()
        .await
        .unwrap();
    let base = format!("http://{}", server.local_addr());
    let client = reqwest::Client::new();

    let health: serde_json::Value = client
        .get(format!("{}/health", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "healthy");

    let response = client
        .post(format!("{}/bus/register", base))
        .json(&json!({
            "name": "user-service",
            "host": "localhost",
            "port": 3001,
            "routes": [{"path": "/api/users", "methods": ["GET"]}]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    assert!(bus.registry().contains("user-service").await);

    let services: serde_json::Value = client
        .get(format!("{}/bus/services", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(services[0]["name"], "user-service");
    assert_eq!(services[0]["status"], "starting");

    let response = client
        .delete(format!("{}/bus/services/user-service", base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);
    assert!(bus.registry().is_empty().await);

    let response = client
        .put(format!("{}/bus/messages", base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 405);

    server.shutdown().await.unwrap();
}
