/// Integration tests for the message bus and the gateway facade
///
/// In-process services attach through the GatewayFacade and talk to each
/// other with publish, directed sends and request/reply.
use async_trait::async_trait;
use meridian_shared::service_bus::{
    GatewayFacade, HandlerFn, HandlerResult, Message, MessageBus, MessageHandler,
    MessageOptions, Priority, Route, ServiceHandle, ServiceRegistration, ServiceRegistry,
};
use serde_json::json;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::time::sleep;

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
    for _ in 0..200 {
        if log.lock().unwrap().len() >= count {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    log.lock().unwrap().clone()
}

async fn platform() -> (Arc<MessageBus>, GatewayFacade) {
    let bus = Arc::new(MessageBus::builder(ServiceRegistry::new()).build().unwrap());
    bus.start().await.unwrap();
    let gateway = GatewayFacade::new(bus.clone());
    (bus, gateway)
}

/// Answers `document.request` with the stored document id
fn document_store(handle: Weak<ServiceHandle>) -> Arc<dyn MessageHandler> {
    HandlerFn::arc("document-store", move |message: Message| {
        let handle = handle.clone();
        async move {
            let result: HandlerResult = match handle.upgrade() {
                Some(service) => service
                    .respond(&message, json!({"documentId": "doc-17"}), None)
                    .await
                    .map(|_| ())
                    .map_err(Into::into),
                None => Ok(()),
            };
            result
        }
    })
}

/// Integration test: request/reply between two attached services
///
/// The reply travels back as a directed send because the requester is a
/// registered service.
#[tokio::test]
async fn test_request_reply_between_services() {
    let (_bus, gateway) = platform().await;
    let users = gateway
        .attach(ServiceRegistration::new("user-service", "localhost", 3001))
        .await
        .unwrap();
    let documents = Arc::new(
        gateway
            .attach(ServiceRegistration::new("document-service", "localhost", 3002))
            .await
            .unwrap(),
    );
    documents
        .subscribe("document.request", document_store(Arc::downgrade(&documents)))
        .await;

    let reply = users
        .request(
            "document-service",
            "document.request",
            json!({"title": "Trade licence"}),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

    assert_eq!(reply.event, "document.completed");
    assert_eq!(reply.source, "document-service");
    assert_eq!(reply.destination.as_deref(), Some("user-service"));
    assert_eq!(reply.payload["documentId"], "doc-17");
}

/// Integration test: lifecycle announcements of an attached service
#[tokio::test]
async fn test_service_lifecycle_events() {
    let (bus, gateway) = platform().await;
    let lifecycle = Arc::new(Mutex::new(Vec::new()));
    for event in [
        "service.registered",
        "service.ready",
        "service.shutdown",
        "service.deregistered",
    ] {
        bus.subscribe(event, collect(lifecycle.clone())).await;
    }

    let scraper = gateway
        .attach(
            ServiceRegistration::new("scraper-service", "localhost", 3005)
                .with_route(Route::new("/api/scrape", &["POST"])),
        )
        .await
        .unwrap();
    wait_for(&lifecycle, 2).await;
    scraper.shutdown().await.unwrap();

    let events = wait_for(&lifecycle, 4).await;
    let mut names: Vec<&str> = events.iter().map(|m| m.event.as_str()).collect();
    names.sort_unstable();
    assert_eq!(
        names,
        vec![
            "service.deregistered",
            "service.ready",
            "service.registered",
            "service.shutdown",
        ]
    );

    let ready = events.iter().find(|m| m.event == "service.ready").unwrap();
    assert_eq!(ready.source, "scraper-service");
    assert_eq!(ready.payload["routes"][0]["path"], "/api/scrape");
    assert!(bus.registry().is_empty().await);
}

/// Integration test: a directed send reports its outcome to the sender's bus
#[tokio::test]
async fn test_directed_send_between_services() {
    let (bus, gateway) = platform().await;
    let freezones = gateway
        .attach(ServiceRegistration::new("freezone-service", "localhost", 3003))
        .await
        .unwrap();
    let ai = gateway
        .attach(ServiceRegistration::new("ai-service", "localhost", 3004))
        .await
        .unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let completed = Arc::new(Mutex::new(Vec::new()));
    ai.subscribe("freezone.enrich", collect(received.clone()))
        .await;
    bus.subscribe("freezone.enrich.completed", collect(completed.clone()))
        .await;

    let id = freezones
        .send(
            "ai-service",
            "freezone.enrich",
            json!({"zone": "JAFZA"}),
            MessageOptions::priority(Priority::High),
        )
        .await
        .unwrap();

    let received = wait_for(&received, 1).await;
    assert_eq!(received[0].id, id);
    assert_eq!(received[0].source, "freezone-service");
    assert_eq!(received[0].priority, Priority::High);

    let completed = wait_for(&completed, 1).await;
    assert_eq!(completed[0].payload["messageId"], id.as_str());
    assert_eq!(completed[0].payload["destination"], "ai-service");
}

/// Integration test: a directed send reaches only the addressed service
///
/// Both services subscribe to the same event; the send addressed to one of
/// them must not trigger the other's handler. A later publish reaches both.
#[tokio::test]
async fn test_directed_send_skips_other_services() {
    let (_bus, gateway) = platform().await;
    let documents = gateway
        .attach(ServiceRegistration::new("document-service", "localhost", 3002))
        .await
        .unwrap();
    let users = gateway
        .attach(ServiceRegistration::new("user-service", "localhost", 3001))
        .await
        .unwrap();

    let document_audits = Arc::new(Mutex::new(Vec::new()));
    let user_audits = Arc::new(Mutex::new(Vec::new()));
    documents
        .subscribe("audit.record", collect(document_audits.clone()))
        .await;
    users
        .subscribe("audit.record", collect(user_audits.clone()))
        .await;

    let id = documents
        .send(
            "document-service",
            "audit.record",
            json!({"action": "archive"}),
            MessageOptions::default(),
        )
        .await
        .unwrap();

    let received = wait_for(&document_audits, 1).await;
    assert_eq!(received[0].id, id);
    sleep(Duration::from_millis(50)).await;
    assert!(user_audits.lock().unwrap().is_empty());

    users.publish(
        "audit.record",
        json!({"action": "login"}),
        MessageOptions::default(),
    );
    assert_eq!(wait_for(&document_audits, 2).await.len(), 2);
    assert_eq!(wait_for(&user_audits, 1).await.len(), 1);
}

struct OfflineMailer;

#[async_trait]
impl MessageHandler for OfflineMailer {
    async fn handle(&self, _message: &Message) -> HandlerResult {
        Err("mailer offline".into())
    }
}

/// Integration test: handler order and isolation across a publish
#[tokio::test]
async fn test_publish_fan_out() {
    let (bus, gateway) = platform().await;
    let users = gateway
        .attach(ServiceRegistration::new("user-service", "localhost", 3001))
        .await
        .unwrap();

    let first = Arc::new(Mutex::new(Vec::new()));
    let second = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe("user.signed_up", collect(first.clone())).await;
    bus.subscribe("user.signed_up", Arc::new(OfflineMailer)).await;
    bus.subscribe("user.signed_up", collect(second.clone()))
        .await;

    users.publish(
        "user.signed_up",
        json!({"email": "founder@example.com"}),
        MessageOptions::default(),
    );

    let first = wait_for(&first, 1).await;
    let second = wait_for(&second, 1).await;
    assert_eq!(first[0].id, second[0].id);
    assert_eq!(first[0].source, "user-service");
}
