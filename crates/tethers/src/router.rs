use crate::error::RouteError;
use crate::metrics::counters;
use crate::registry::{ConnHandle, DeliverError, Registry};
use std::sync::Arc;
use tether_common::{ClientId, Envelope};

/// Outcome of a fan-out to every connected client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Number of clients the envelope was queued for.
    pub delivered: usize,
    /// Clients whose queue refused the envelope; each was evicted.
    pub failed: Vec<ClientId>,
}

/// What [`Router::route`] did with an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    /// Queued for the single named receiver.
    Delivered,
    /// Fanned out to every client except the sender.
    Broadcast(BroadcastReport),
}

/// Relays envelopes between registered connections.
#[derive(Debug)]
pub struct Router {
    registry: Arc<Registry>,
}

impl Router {
    /// Create a router over `registry`.
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// The registry this router delivers through.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Deliver `envelope` to its receiver, or to everyone if it is addressed
    /// to the broadcast identity.
    pub fn route(&self, envelope: &Envelope) -> Result<Routed, RouteError> {
        if envelope.is_broadcast() {
            return self.broadcast(envelope).map(Routed::Broadcast);
        }
        self.relay(envelope).map(|()| Routed::Delivered)
    }

    /// Deliver `envelope` to exactly the client named as its receiver.
    ///
    /// The envelope is forwarded unmodified. A receiver whose queue refuses
    /// the frame is deregistered and closed.
    pub fn relay(&self, envelope: &Envelope) -> Result<(), RouteError> {
        let Some(handle) = self.registry.lookup(envelope.receiver()) else {
            counters::messages_dropped_total("receiver_not_found");
            tracing::debug!(
                sender = %envelope.sender(),
                receiver = %envelope.receiver(),
                "receiver not registered, dropping envelope"
            );
            return Err(RouteError::ReceiverNotFound(envelope.receiver().clone()));
        };
        let frame = envelope.encode()?;
        self.deliver(&handle, frame)
    }

    /// Deliver a copy of `envelope` to every registered client except its
    /// sender, each copy addressed to its recipient.
    pub fn broadcast(&self, envelope: &Envelope) -> Result<BroadcastReport, RouteError> {
        let mut report = BroadcastReport::default();
        for handle in self.registry.handles() {
            if handle.client() == envelope.sender() {
                continue;
            }
            let copy = envelope.clone().with_receiver(handle.client().clone());
            match self.deliver(&handle, copy.encode()?) {
                Ok(()) => report.delivered += 1,
                Err(_) => report.failed.push(handle.client().clone()),
            }
        }
        tracing::debug!(
            sender = %envelope.sender(),
            delivered = report.delivered,
            failed = report.failed.len(),
            "broadcast complete"
        );
        Ok(report)
    }

    fn deliver(&self, handle: &ConnHandle, frame: String) -> Result<(), RouteError> {
        match handle.try_deliver(frame) {
            Ok(()) => {
                counters::messages_relayed_total();
                Ok(())
            }
            Err(reason) => {
                let label = match reason {
                    DeliverError::Full => "queue_full",
                    DeliverError::Closed => "closed",
                };
                counters::messages_dropped_total(label);
                tracing::warn!(
                    client = %handle.client(),
                    conn = handle.id().get(),
                    reason = label,
                    "send failed, evicting receiver"
                );
                self.registry.evict(handle);
                Err(RouteError::SendFailed(handle.client().clone()))
            }
        }
    }
}
