//! Tests for the service bus
//!
//! Cross-module tests for publish/subscribe, request/reply, retry ceilings
//! and crash recovery. Remote delivery goes through [`ScriptedTransport`]
//! so no sockets are opened.


use crate::service_bus::{
    BusError, BusResult, HandlerFn, Message, MessageHandler, ServiceRecord, Transport,
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Transport whose remote deliveries fail a scripted number of times
pub struct ScriptedTransport {
    failures_remaining: Mutex<Option<u32>>,
    calls: Mutex<Vec<Message>>,
}

impl ScriptedTransport {
    pub fn always_failing() -> Arc<Self> {
        Arc::new(Self {
            failures_remaining: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn failing_first(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures_remaining: Mutex::new(Some(failures)),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn succeeding() -> Arc<Self> {
        Self::failing_first(0)
    }

    /// Envelopes handed to `deliver_remote`, in call order
    pub fn calls(&self) -> Vec<Message> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn deliver_remote(&self, record: &ServiceRecord, message: &Message) -> BusResult<()> {
        self.calls.lock().unwrap().push(message.clone());

        let mut remaining = self.failures_remaining.lock().unwrap();
        match remaining.as_mut() {
            None => Err(BusError::unreachable(&record.name, "HTTP 503")),
            Some(0) => Ok(()),
            Some(n) => {
                *n -= 1;
                Err(BusError::unreachable(&record.name, "HTTP 503"))
            }
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// Collects every message dispatched to its handler
#[derive(Clone, Default)]
pub struct EventLog {
    messages: Arc<Mutex<Vec<Message>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler(&self) -> Arc<dyn MessageHandler> {
        let messages = self.messages.clone();
        HandlerFn::arc("event-log", move |message: Message| {
            let messages = messages.clone();
            async move {
                messages.lock().unwrap().push(message);
                Ok(())
            }
        })
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().unwrap().clone()
    }

    /// Waits until at least `count` messages were recorded
    pub async fn wait_for(&self, count: usize) -> Vec<Message> {
        for _ in 0..2000 {
            if self.messages.lock().unwrap().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.messages()
    }
}

pub fn remote_record(name: &str, port: u16) -> ServiceRecord {
    ServiceRecord::new(name, format!("localhost:{}", port), "/health", vec![], false)
}

pub fn local_record(name: &str) -> ServiceRecord {
    ServiceRecord::new(name, "localhost:7000", "/health", vec![], true)
}
