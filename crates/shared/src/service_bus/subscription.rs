//! Subscription table and local dispatch
//!
//! Maps event names to ordered handler lists. Dispatch snapshots the list
//! under a read lock, releases it, then invokes handlers one after another in
//! subscription order. Every invocation is isolated: an error or a panic in
//! one handler is recorded and the next handler still runs.
//!
//! **Warning**: panics are caught with `AssertUnwindSafe`; a handler that
//! panics while holding its own lock may leave that state poisoned.

use super::errors::BusError;
use super::types::Message;
use async_trait::async_trait;
use futures::FutureExt;
use std::borrow::Cow;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

/// Result returned by message handlers
pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Trait for local message handlers
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use meridian_shared::service_bus::{HandlerResult, Message, MessageHandler};
///
/// struct AuditLog;
///
/// #[async_trait]
/// impl MessageHandler for AuditLog {
///     async fn handle(&self, message: &Message) -> HandlerResult {
///         println!("{} from {}", message.event, message.source);
///         Ok(())
///     }
///
///     fn name(&self) -> &str {
///         "audit-log"
///     }
/// }
/// ```
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handles one message
    async fn handle(&self, message: &Message) -> HandlerResult;

    /// Name used in logs and dispatch reports
    fn name(&self) -> &str {
        "handler"
    }
}

/// Closure-backed handler
///
/// Wraps `F: Fn(Message) -> Fut`, producing a fresh future per message.
/// Shared state must be captured explicitly (e.g. through an `Arc`).
///
/// # Example
///
/// ```rust
/// use meridian_shared::service_bus::{HandlerFn, Message, MessageHandler};
///
/// let handler = HandlerFn::arc("print", |message: Message| async move {
///     println!("{}", message.event);
///     Ok(())
/// });
/// assert_eq!(handler.name(), "print");
/// ```
pub struct HandlerFn<F> {
    name: Cow<'static, str>,
    f: F,
}

impl<F, Fut> HandlerFn<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    /// Creates a closure-backed handler
    pub fn new(name: impl Into<Cow<'static, str>>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }

    /// Creates the handler behind an `Arc`, ready for `subscribe`
    pub fn arc(name: impl Into<Cow<'static, str>>, f: F) -> Arc<Self> {
        Arc::new(Self::new(name, f))
    }
}

#[async_trait]
impl<F, Fut> MessageHandler for HandlerFn<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, message: &Message) -> HandlerResult {
        (self.f)(message.clone()).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    event: String,
}

impl SubscriptionHandle {
    /// Event the subscription listens on
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Unique subscription id
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Outcome of dispatching one message to local subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchReport {
    /// Dispatched message id
    pub message_id: String,
    /// Dispatched event name
    pub event: String,
    /// Number of handlers invoked
    pub handlers_invoked: usize,
    /// One `HandlerError` per failed handler, in invocation order
    pub failures: Vec<BusError>,
}

impl DispatchReport {
    fn empty(message: &Message) -> Self {
        Self {
            message_id: message.id.clone(),
            event: message.event.clone(),
            handlers_invoked: 0,
            failures: Vec::new(),
        }
    }

    /// Returns whether every handler succeeded
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

struct Subscriber {
    id: u64,
    owner: Option<String>,
    handler: Arc<dyn MessageHandler>,
}

impl Subscriber {
    /// Unowned handlers receive everything; owned handlers only receive
    /// undirected messages and messages addressed to their owner
    fn accepts(&self, destination: Option<&str>) -> bool {
        match (self.owner.as_deref(), destination) {
            (Some(owner), Some(destination)) => owner == destination,
            _ => true,
        }
    }
}

/// Event name → ordered subscriber list
#[derive(Default)]
pub struct SubscriptionTable {
    entries: RwLock<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl SubscriptionTable {
    /// Creates an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a handler to the list for `event`
    pub async fn subscribe(
        &self,
        event: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> SubscriptionHandle {
        self.subscribe_for(None, event, handler).await
    }

    /// Appends a handler owned by `owner` to the list for `event`
    ///
    /// An owned handler is skipped for messages addressed to another
    /// service. Publishes and broadcasts carry no destination and reach it
    /// as usual.
    pub async fn subscribe_for(
        &self,
        owner: Option<String>,
        event: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> SubscriptionHandle {
        let event = event.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        debug!(event = %event, subscription_id = id, owner = ?owner, "Subscribed handler");
        self.entries
            .write()
            .await
            .entry(event.clone())
            .or_default()
            .push(Subscriber { id, owner, handler });

        SubscriptionHandle { id, event }
    }

    /// Removes a subscription
    ///
    /// Invocations already in flight are not cancelled.
    ///
    /// # Returns
    ///
    /// `false` if the subscription was already removed.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let mut entries = self.entries.write().await;
        let Some(subscribers) = entries.get_mut(&handle.event) else {
            return false;
        };

        let before = subscribers.len();
        subscribers.retain(|s| s.id != handle.id);
        let removed = subscribers.len() != before;
        if subscribers.is_empty() {
            entries.remove(&handle.event);
        }
        removed
    }

    /// Number of handlers subscribed to `event`
    pub async fn subscriber_count(&self, event: &str) -> usize {
        self.entries
            .read()
            .await
            .get(event)
            .map_or(0, |subscribers| subscribers.len())
    }

    async fn snapshot(&self, message: &Message) -> Vec<Arc<dyn MessageHandler>> {
        let destination = message.destination.as_deref();
        self.entries
            .read()
            .await
            .get(&message.event)
            .map(|subscribers| {
                subscribers
                    .iter()
                    .filter(|s| s.accepts(destination))
                    .map(|s| s.handler.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Invokes the handlers of `message.event` in subscription order
    ///
    /// A message with a destination skips handlers owned by other services.
    pub async fn dispatch(&self, message: &Message) -> DispatchReport {
        let handlers = self.snapshot(message).await;
        let mut report = DispatchReport::empty(message);

        if handlers.is_empty() {
            debug!(event = %message.event, message_id = %message.id, "No local subscribers");
            return report;
        }

        for handler in handlers {
            report.handlers_invoked += 1;
            let name = handler.name().to_string();
            let fut = handler.handle(message);

            let failure = match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => {
                    warn!(
                        handler = %name,
                        event = %message.event,
                        message_id = %message.id,
                        error = %e,
                        "Handler returned an error"
                    );
                    Some(e.to_string())
                }
                Err(panic_err) => {
                    let info = if let Some(msg) = panic_err.downcast_ref::<&str>() {
                        msg.to_string()
                    } else if let Some(msg) = panic_err.downcast_ref::<String>() {
                        msg.clone()
                    } else {
                        "unknown panic".to_string()
                    };
                    error!(
                        handler = %name,
                        event = %message.event,
                        message_id = %message.id,
                        panic = %info,
                        "Handler panicked"
                    );
                    Some(format!("panicked: {}", info))
                }
            };

            if let Some(reason) = failure {
                report.failures.push(BusError::handler(name, reason));
            }
        }

        report
    }
}
