/// End-to-end tests for CRITICAL message recovery across bus restarts
///
/// A first bus fails to reach its destination and is stopped while the
/// message sits in the durable queue. A second bus over the same queue
/// delivers it during startup.
use meridian_shared::service_bus::{
    BusConfig, DurableStore, FileDurableQueue, MemoryDurableQueue, MessageBus, MessageOptions,
    Priority, ServiceRecord, ServiceRegistry,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SERVICE: &str = "billing-service";

fn quick_config() -> BusConfig {
    let mut config = BusConfig::default();
    config.retry.critical.base_delay = Duration::from_millis(50);
    config.retry.critical.max_delay = Duration::from_millis(200);
    config
}

async fn registry_pointing_at(address: &str) -> ServiceRegistry {
    let registry = ServiceRegistry::new();
    registry
        .register(ServiceRecord::new(SERVICE, address, "/health", vec![], false))
        .await
        .unwrap();
    registry
}

async fn accepting_service() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/bus/messages"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;
    server
}

async fn wait_for_entries(store: &dyn DurableStore, count: usize) {
    for _ in 0..200 {
        if store.len().await.unwrap() >= count {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
}

async fn delivered_ids(server: &MockServer) -> Vec<String> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .map(|request| {
            let body: Value = request.body_json().unwrap();
            body["id"].as_str().unwrap().to_string()
        })
        .collect()
}

/// Sends one CRITICAL message to an unreachable service and stops the bus
/// once the message has been persisted
async fn crash_with_pending(bus: MessageBus, store: &dyn DurableStore) -> String {
    bus.start().await.unwrap();
    let id = bus
        .send_to_service(
            SERVICE,
            "invoice.issued",
            json!({"invoice": "INV-2041", "amount": 15750}),
            MessageOptions::priority(Priority::Critical),
        )
        .await
        .unwrap();

    wait_for_entries(store, 1).await;
    bus.stop().await;
    // let an attempt already in flight settle before another bus takes over
    sleep(Duration::from_millis(100)).await;
    id
}

/// E2E test: a CRITICAL message survives a restart with the memory queue
#[tokio::test]
async fn test_critical_message_recovered_after_restart() {
    let queue = MemoryDurableQueue::new();

    let crashed = MessageBus::builder(registry_pointing_at("127.0.0.1:1").await)
        .config(quick_config())
        .durable_store(Arc::new(queue.clone()))
        .build()
        .unwrap();
    let id = crash_with_pending(crashed, &queue).await;
    assert!(queue.contains(&id).await);

    let service = accepting_service().await;
    let restarted = MessageBus::builder(registry_pointing_at(&service.uri()).await)
        .config(quick_config())
        .durable_store(Arc::new(queue.clone()))
        .build()
        .unwrap();
    let report = restarted.start().await.unwrap();

    assert_eq!(report.loaded, 1);
    assert_eq!(report.delivered, 1);
    assert_eq!(report.rescheduled, 0);
    assert!(!queue.contains(&id).await);
    assert_eq!(delivered_ids(&service).await, vec![id]);
    assert_eq!(restarted.delivery_metrics().await.recovered, 1);
}

/// E2E test: the file-backed queue survives a restart
///
/// Both buses are built from configuration pointing at the same directory.
#[tokio::test]
async fn test_file_queue_recovered_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = quick_config().with_durable_queue_dir(dir.path());

    let crashed = MessageBus::from_config(registry_pointing_at("127.0.0.1:1").await, config.clone())
        .await
        .unwrap();
    let observer = FileDurableQueue::open(dir.path()).await.unwrap();
    let id = crash_with_pending(crashed, &observer).await;
    assert_eq!(observer.len().await.unwrap(), 1);

    let service = accepting_service().await;
    let restarted = MessageBus::from_config(registry_pointing_at(&service.uri()).await, config)
        .await
        .unwrap();
    let report = restarted.start().await.unwrap();

    assert_eq!(report.delivered, 1);
    assert_eq!(observer.len().await.unwrap(), 0);

    let delivered = service.received_requests().await.unwrap_or_default();
    assert_eq!(delivered.len(), 1);
    let body: Value = delivered[0].body_json().unwrap();
    assert_eq!(body["id"], id.as_str());
    assert_eq!(body["priority"], "CRITICAL");
    assert_eq!(body["payload"]["invoice"], "INV-2041");
}

/// E2E test: recovered messages go out before traffic sent during startup
#[tokio::test]
async fn test_recovery_precedes_new_traffic() {
    let queue = MemoryDurableQueue::new();

    let crashed = MessageBus::builder(registry_pointing_at("127.0.0.1:1").await)
        .config(quick_config())
        .durable_store(Arc::new(queue.clone()))
        .build()
        .unwrap();
    let recovered_id = crash_with_pending(crashed, &queue).await;

    let service = accepting_service().await;
    let restarted = MessageBus::builder(registry_pointing_at(&service.uri()).await)
        .config(quick_config())
        .durable_store(Arc::new(queue.clone()))
        .build()
        .unwrap();

    let fresh_id = restarted
        .send_to_service(
            SERVICE,
            "invoice.viewed",
            json!({"invoice": "INV-2041"}),
            MessageOptions::default(),
        )
        .await
        .unwrap();
    restarted.start().await.unwrap();

    for _ in 0..200 {
        if service.received_requests().await.unwrap_or_default().len() >= 2 {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(delivered_ids(&service).await, vec![recovered_id, fresh_id]);
}

/// E2E test: a message that still cannot be delivered stays queued
#[tokio::test]
async fn test_undeliverable_recovery_stays_queued() {
    let queue = MemoryDurableQueue::new();

    let crashed = MessageBus::builder(registry_pointing_at("127.0.0.1:1").await)
        .config(quick_config())
        .durable_store(Arc::new(queue.clone()))
        .build()
        .unwrap();
    let id = crash_with_pending(crashed, &queue).await;

    let restarted = MessageBus::builder(registry_pointing_at("127.0.0.1:1").await)
        .config(quick_config())
        .durable_store(Arc::new(queue.clone()))
        .build()
        .unwrap();
    let report = restarted.start().await.unwrap();

    assert_eq!(report.loaded, 1);
    assert_eq!(report.rescheduled, 1);
    assert!(queue.contains(&id).await);
    restarted.stop().await;
}
