/// Integration tests for health monitoring
///
/// These tests drive the HealthMonitor against wiremock health endpoints and
/// observe the resulting registry events through the message bus.
use async_trait::async_trait;
use meridian_shared::service_bus::{
    BusConfig, HandlerFn, HealthMonitor, HealthProbe, Message, MessageBus, MessageHandler,
    ProbeOutcome, ServiceRecord, ServiceRegistry, ServiceStatus,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn remote(name: &str, address: &str) -> ServiceRecord {
    ServiceRecord::new(name, address, "/health", vec![], false)
}

fn fast_config() -> BusConfig {
    BusConfig {
        health_poll_interval: Duration::from_secs(60),
        health_probe_timeout: Duration::from_millis(500),
        registry_cleanup_interval: Duration::from_millis(500),
        eviction_window: Duration::from_secs(1),
        ..BusConfig::default()
    }
}

async fn health_server(status: u16, body: serde_json::Value) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(status).set_body_json(body))
        .mount(&server)
        .await;
    server
}

fn collect(log: Arc<Mutex<Vec<Message>>>) -> Arc<dyn MessageHandler> {
    HandlerFn::arc("collector", move |message: Message| {
        let log = log.clone();
        async move {
            log.lock().unwrap().push(message);
            Ok(())
        }
    })
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(25)).await;
    }
}

/// Integration test: probe outcomes map onto service status
///
/// A healthy body, an explicit non-healthy body, an error status and a
/// refused connection each land on the expected status.
#[tokio::test]
async fn test_probe_outcomes_map_to_status() {
    let healthy = health_server(200, json!({"status": "healthy", "uptime": 12})).await;
    let reporting_degraded = health_server(200, json!({"status": "degraded"})).await;
    let failing = health_server(503, json!({"error": "maintenance"})).await;

    let registry = ServiceRegistry::new();
    registry.register(remote("user-service", &healthy.uri())).await.unwrap();
    registry
        .register(remote("document-service", &reporting_degraded.uri()))
        .await
        .unwrap();
    registry
        .register(remote("freezone-service", &failing.uri()))
        .await
        .unwrap();
    registry
        .register(remote("scraper-service", "127.0.0.1:1"))
        .await
        .unwrap();

    let monitor = HealthMonitor::new(registry.clone(), &fast_config());
    let results = monitor.poll_once().await;

    assert_eq!(
        results,
        vec![
            ("document-service".to_string(), ServiceStatus::Degraded),
            ("freezone-service".to_string(), ServiceStatus::Degraded),
            ("scraper-service".to_string(), ServiceStatus::Unhealthy),
            ("user-service".to_string(), ServiceStatus::Healthy),
        ]
    );
    assert_eq!(
        registry.lookup("user-service").await.unwrap().status,
        ServiceStatus::Healthy
    );
}

/// Integration test: a successful probe refreshes the heartbeat
#[tokio::test]
async fn test_healthy_probe_refreshes_heartbeat() {
    let healthy = health_server(200, json!({"status": "healthy"})).await;
    let registry = ServiceRegistry::new();
    let registered = registry.register(remote("user-service", &healthy.uri())).await.unwrap();

    sleep(Duration::from_millis(20)).await;
    HealthMonitor::new(registry.clone(), &fast_config())
        .poll_once()
        .await;

    let record = registry.lookup("user-service").await.unwrap();
    assert!(record.last_heartbeat > registered.last_heartbeat);
}

/// Integration test: status changes are published as service.health.status
#[tokio::test]
async fn test_status_change_reaches_subscribers() {
    let healthy = health_server(200, json!({"status": "healthy"})).await;
    let registry = ServiceRegistry::new();
    let bus = MessageBus::builder(registry.clone()).build().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe("service.health.status", collect(seen.clone()))
        .await;
    bus.start().await.unwrap();

    registry.register(remote("ai-service", &healthy.uri())).await.unwrap();
    let monitor = HealthMonitor::new(registry.clone(), &fast_config());
    monitor.poll_once().await;
    monitor.poll_once().await;

    wait_until(|| !seen.lock().unwrap().is_empty()).await;
    sleep(Duration::from_millis(50)).await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1, "unchanged status must not be re-announced");
    assert_eq!(seen[0].source, "registry");
    assert_eq!(seen[0].payload["name"], "ai-service");
    assert_eq!(seen[0].payload["status"], "healthy");
    assert_eq!(seen[0].payload["previousStatus"], "starting");
}

/// Integration test: an unreachable service is evicted exactly once
///
/// The monitor marks the service unhealthy on its first tick; the sweep
/// removes it once the heartbeat is older than the eviction window.
#[tokio::test]
async fn test_unreachable_service_is_evicted() {
    let registry = ServiceRegistry::new();
    let bus = MessageBus::builder(registry.clone()).build().unwrap();
    let evicted = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe("service.evicted", collect(evicted.clone()))
        .await;
    bus.start().await.unwrap();

    registry
        .register(remote("scraper-service", "127.0.0.1:1"))
        .await
        .unwrap();

    let monitor = HealthMonitor::new(registry.clone(), &fast_config());
    monitor.start().await;

    wait_until(|| !evicted.lock().unwrap().is_empty()).await;
    sleep(Duration::from_millis(600)).await;
    monitor.stop().await;

    assert!(!registry.contains("scraper-service").await);
    let evicted = evicted.lock().unwrap();
    assert_eq!(evicted.len(), 1);
    assert_eq!(evicted[0].payload["name"], "scraper-service");
    assert_eq!(evicted[0].payload["status"], "unhealthy");
}

struct FixedProbe(ProbeOutcome);

#[async_trait]
impl HealthProbe for FixedProbe {
    async fn probe(&self, _record: &ServiceRecord) -> ProbeOutcome {
        self.0.clone()
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}

/// Integration test: services reporting healthy survive the sweep
#[tokio::test]
async fn test_heartbeating_service_is_kept() {
    let registry = ServiceRegistry::new();
    registry
        .register(remote("user-service", "localhost:3001"))
        .await
        .unwrap();

    let config = BusConfig {
        health_poll_interval: Duration::from_millis(200),
        health_probe_timeout: Duration::from_millis(100),
        ..fast_config()
    };
    let monitor =
        HealthMonitor::with_probe(registry.clone(), &config, Arc::new(FixedProbe(ProbeOutcome::Healthy)));
    monitor.start().await;
    assert!(monitor.is_running().await);

    sleep(Duration::from_millis(1800)).await;
    monitor.stop().await;
    assert!(!monitor.is_running().await);

    let record = registry.lookup("user-service").await.unwrap();
    assert_eq!(record.status, ServiceStatus::Healthy);
}
