//! Mailbox routing.
//!
//! Envelopes are stamped with the sender's tick. [`Mailbox::drain_before`]
//! only releases envelopes sent before the given tick, holding back the
//! rest, so an agent working on tick `t` sees exactly what its peers
//! produced up to `t - 1` no matter how the runtime interleaves tasks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;

use fab_protocol::{AgentId, Envelope, Tick};

use crate::NetworkError;

/// Delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub delivered: u64,
    /// Unknown recipient, or its mailbox was already closed.
    pub dropped: u64,
}

/// Routing table from agent address to that agent's inbox.
#[derive(Default)]
pub struct MessageBus {
    routes: RwLock<HashMap<AgentId, mpsc::UnboundedSender<Envelope>>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl MessageBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register an agent and hand back its mailbox.
    pub fn register(self: &Arc<Self>, id: AgentId) -> Result<Mailbox, NetworkError> {
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        if routes.contains_key(&id) {
            return Err(NetworkError::DuplicateAgent(id.to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        routes.insert(id.clone(), tx);

        tracing::debug!(agent = %id, "Mailbox registered");

        Ok(Mailbox {
            id,
            rx,
            held: Vec::new(),
            bus: Arc::clone(self),
        })
    }

    /// Fire-and-forget delivery.
    pub fn send(&self, envelope: Envelope) {
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = routes.get(&envelope.to) else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                from = %envelope.from,
                to = %envelope.to,
                performative = %envelope.performative(),
                "Dropping envelope for unknown agent"
            );
            return;
        };

        if tracing::enabled!(tracing::Level::TRACE) {
            tracing::trace!(
                envelope = %serde_json::to_string(&envelope).unwrap_or_default(),
                "send"
            );
        }

        if tx.send(envelope).is_err() {
            // Receiver side is gone; the agent has stopped.
            self.dropped.fetch_add(1, Ordering::Relaxed);
        } else {
            self.delivered.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// An agent's inbox plus a handle for sending.
pub struct Mailbox {
    id: AgentId,
    rx: mpsc::UnboundedReceiver<Envelope>,
    held: Vec<Envelope>,
    bus: Arc<MessageBus>,
}

impl Mailbox {
    pub fn id(&self) -> &AgentId {
        &self.id
    }

    pub fn send(&self, envelope: Envelope) {
        self.bus.send(envelope);
    }

    /// Wait up to `timeout` for the next envelope. Returns `None` on expiry.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Envelope> {
        if !self.held.is_empty() {
            return Some(self.held.remove(0));
        }
        tokio::time::timeout(timeout, self.rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Everything sent before `tick`, ordered by `(sent_at, from)`. Envelopes
    /// stamped `tick` or later stay queued for a later call.
    pub fn drain_before(&mut self, tick: Tick) -> Vec<Envelope> {
        while let Ok(envelope) = self.rx.try_recv() {
            self.held.push(envelope);
        }

        let (mut ready, later): (Vec<_>, Vec<_>) = std::mem::take(&mut self.held)
            .into_iter()
            .partition(|e| e.sent_at < tick);
        self.held = later;

        // Stable sort keeps each sender's FIFO order.
        ready.sort_by(|a, b| (a.sent_at, &a.from).cmp(&(b.sent_at, &b.from)));
        ready
    }
}
