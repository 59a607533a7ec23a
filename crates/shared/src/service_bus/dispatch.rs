//! Local dispatch shared by the bus and the delivery manager
//!
//! Holds the subscription table, the transport, the waiters of pending
//! request/reply exchanges and the lifecycle gate that holds traffic until
//! recovery has finished.

use super::errors::{BusError, BusResult};
use super::subscription::{DispatchReport, SubscriptionTable};
use super::transport::Transport;
use super::types::Message;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, trace};

/// Lifecycle phase of a bus instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusPhase {
    /// Constructed; sends are accepted and held
    Created,
    /// Durable messages are being re-attempted; new sends are held
    Recovering,
    /// Traffic flows
    Running,
    /// Retry timers cancelled; no new work is accepted
    Stopped,
}

type ReplyWaiter = oneshot::Sender<BusResult<Message>>;

pub(crate) struct Dispatcher {
    subscriptions: Arc<SubscriptionTable>,
    transport: Arc<dyn Transport>,
    pending: Mutex<HashMap<String, ReplyWaiter>>,
    phase: watch::Sender<BusPhase>,
}

impl Dispatcher {
    pub(crate) fn new(subscriptions: Arc<SubscriptionTable>, transport: Arc<dyn Transport>) -> Self {
        let (phase, _) = watch::channel(BusPhase::Created);
        Self {
            subscriptions,
            transport,
            pending: Mutex::new(HashMap::new()),
            phase,
        }
    }

    pub(crate) fn subscriptions(&self) -> &SubscriptionTable {
        &self.subscriptions
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub(crate) fn phase(&self) -> BusPhase {
        *self.phase.borrow()
    }

    pub(crate) fn set_phase(&self, phase: BusPhase) {
        debug!(?phase, "Bus phase changed");
        self.phase.send_replace(phase);
    }

    /// Resolves once the bus is running, or fails if it stopped first
    pub(crate) async fn wait_until_running(&self) -> BusResult<()> {
        let mut rx = self.phase.subscribe();
        loop {
            let phase = *rx.borrow_and_update();
            match phase {
                BusPhase::Running => return Ok(()),
                BusPhase::Stopped => return Err(BusError::BusStopped),
                BusPhase::Created | BusPhase::Recovering => {}
            }
            if rx.changed().await.is_err() {
                return Err(BusError::BusStopped);
            }
        }
    }

    /// Resolves once the bus has stopped
    pub(crate) async fn stopped(&self) {
        let mut rx = self.phase.subscribe();
        loop {
            if *rx.borrow_and_update() == BusPhase::Stopped {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Completes the waiter of a request/reply exchange, if any
    async fn route_reply(&self, message: &Message) {
        let Some(reply_to) = message.reply_to.as_deref() else {
            return;
        };
        if let Some(waiter) = self.pending.lock().await.remove(reply_to) {
            trace!(request_id = %reply_to, event = %message.event, "Reply matched pending request");
            let _ = waiter.send(Ok(message.clone()));
        }
    }

    /// Delivers a message to handlers in this process
    pub(crate) async fn deliver_local(&self, message: &Message) -> BusResult<DispatchReport> {
        self.route_reply(message).await;
        self.transport.deliver_local(&self.subscriptions, message).await
    }

    /// Fans a message out through the transport's broadcast path
    pub(crate) async fn broadcast(&self, message: &Message) -> BusResult<DispatchReport> {
        self.route_reply(message).await;
        self.transport.broadcast(&self.subscriptions, message).await
    }

    pub(crate) async fn await_reply(&self, request_id: &str) -> oneshot::Receiver<BusResult<Message>> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.to_string(), tx);
        rx
    }

    pub(crate) async fn cancel_reply(&self, request_id: &str) {
        self.pending.lock().await.remove(request_id);
    }

    /// Fails a pending exchange whose request could not be delivered
    pub(crate) async fn fail_reply(&self, request_id: &str, error: BusError) {
        if let Some(waiter) = self.pending.lock().await.remove(request_id) {
            let _ = waiter.send(Err(error));
        }
    }

    /// Fails every pending exchange with `BusStopped`
    pub(crate) async fn fail_all_replies(&self) {
        let waiters: Vec<ReplyWaiter> = self.pending.lock().await.drain().map(|(_, w)| w).collect();
        for waiter in waiters {
            let _ = waiter.send(Err(BusError::BusStopped));
        }
    }
}
