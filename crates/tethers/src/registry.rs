use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tether_common::ClientId;
use tokio::sync::{mpsc, watch};

/// Process-unique identifier of one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    /// Allocate the next connection id.
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value, for log fields.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Why a connection was closed from outside its own task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    /// A newer connection registered under the same identity.
    Superseded,
    /// A relayed send to this connection failed.
    Evicted,
    /// The server is shutting down.
    Shutdown,
}

/// Why [`ConnHandle::try_deliver`] refused a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverError {
    /// The outbound queue is full; the receiver is not keeping up.
    Full,
    /// The connection task has gone away.
    Closed,
}

/// Handle held in the registry, used to send frames to a connection and to
/// close it.
///
/// Clones refer to the same connection. The connection task owns the socket
/// and is its only writer; the handle only feeds its bounded queue.
#[derive(Clone, Debug)]
pub struct ConnHandle {
    id: ConnId,
    client: ClientId,
    tx: mpsc::Sender<String>,
    close: Arc<watch::Sender<Option<CloseCause>>>,
}

/// The connection task's side of a [`ConnHandle`].
#[derive(Debug)]
pub struct Mailbox {
    /// Encoded envelopes waiting to be written to the socket.
    pub outbound: mpsc::Receiver<String>,
    /// Set once when the handle is closed from outside.
    pub close: watch::Receiver<Option<CloseCause>>,
}

impl ConnHandle {
    /// Create a handle for `client` with an outbound queue of `capacity`
    /// frames, returning the receiving half for the connection task.
    #[must_use]
    pub fn new(client: ClientId, capacity: usize) -> (Self, Mailbox) {
        let (tx, outbound) = mpsc::channel(capacity.max(1));
        let (close_tx, close) = watch::channel(None);
        let handle = Self {
            id: ConnId::next(),
            client,
            tx,
            close: Arc::new(close_tx),
        };
        (handle, Mailbox { outbound, close })
    }

    /// Identifier of the underlying connection.
    #[must_use]
    pub const fn id(&self) -> ConnId {
        self.id
    }

    /// Identity the connection registered under.
    #[must_use]
    pub const fn client(&self) -> &ClientId {
        &self.client
    }

    /// Queue an encoded envelope without waiting.
    pub fn try_deliver(&self, frame: String) -> Result<(), DeliverError> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliverError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliverError::Closed,
        })
    }

    /// Ask the connection task to shut down. Only the first cause is kept;
    /// returns `false` if the handle was already closed.
    pub fn close(&self, cause: CloseCause) -> bool {
        self.close.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(cause);
            true
        })
    }

    /// Returns the close cause, if the handle has been closed.
    #[must_use]
    pub fn close_cause(&self) -> Option<CloseCause> {
        *self.close.borrow()
    }
}

/// Registry membership as seen by observers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Occupancy {
    /// Number of registered identities.
    pub live: usize,
    /// Total registrations so far, replacements included.
    pub arrivals: u64,
    /// Total deregistrations so far.
    pub departures: u64,
    /// Accepted connections still working through their upgrade.
    pub pending: usize,
}

/// Keeps one accepted connection counted as pending until dropped.
#[derive(Debug)]
pub struct Admission {
    registry: Arc<Registry>,
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.registry
            .occupancy
            .send_modify(|o| o.pending = o.pending.saturating_sub(1));
    }
}

/// Concurrent identity → connection registry.
///
/// Writers are mutually exclusive, readers share the lock, and the lock is
/// never held across I/O: lookups hand out clones and all sends happen after
/// the guard is released.
#[derive(Debug)]
pub struct Registry {
    routes: RwLock<HashMap<ClientId, ConnHandle>>,
    occupancy: watch::Sender<Occupancy>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            occupancy: watch::Sender::new(Occupancy::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ClientId, ConnHandle>> {
        self.routes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ClientId, ConnHandle>> {
        self.routes.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a handle under its client identity.
    ///
    /// A handle already registered under the same identity is replaced,
    /// closed with [`CloseCause::Superseded`], and returned.
    pub fn register(&self, handle: ConnHandle) -> Option<ConnHandle> {
        let new_id = handle.id();
        let previous = {
            let mut routes = self.write();
            let previous = routes.insert(handle.client().clone(), handle);
            let live = routes.len();
            self.occupancy.send_modify(|o| {
                o.live = live;
                o.arrivals += 1;
            });
            previous
        };
        if let Some(old) = &previous {
            if old.id() != new_id {
                old.close(CloseCause::Superseded);
            }
        }
        previous
    }

    /// Remove the entry for `client` only if it still belongs to connection
    /// `id`. Returns `true` if an entry was removed.
    pub fn remove_if(&self, client: &ClientId, id: ConnId) -> bool {
        let mut routes = self.write();
        let matches = routes.get(client).is_some_and(|h| h.id() == id);
        if matches {
            routes.remove(client);
            let live = routes.len();
            self.occupancy.send_modify(|o| {
                o.live = live;
                o.departures += 1;
            });
        }
        matches
    }

    /// Deregister `handle` and close it with [`CloseCause::Evicted`].
    pub fn evict(&self, handle: &ConnHandle) -> bool {
        let removed = self.remove_if(handle.client(), handle.id());
        handle.close(CloseCause::Evicted);
        removed
    }

    /// Count a freshly accepted connection as pending. Drop the guard once
    /// the connection has registered or failed its upgrade.
    #[must_use]
    pub fn admit(self: &Arc<Self>) -> Admission {
        self.occupancy.send_modify(|o| o.pending += 1);
        Admission {
            registry: Arc::clone(self),
        }
    }

    /// Look up the connection registered under `client`.
    #[must_use]
    pub fn lookup(&self, client: &ClientId) -> Option<ConnHandle> {
        self.read().get(client).cloned()
    }

    /// Point-in-time list of registered identities.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ClientId> {
        self.read().keys().cloned().collect()
    }

    /// Point-in-time clones of every registered handle.
    #[must_use]
    pub fn handles(&self) -> Vec<ConnHandle> {
        self.read().values().cloned().collect()
    }

    /// Close every registered handle with `cause`, outside the lock.
    ///
    /// Entries are left for each connection task to deregister itself.
    pub fn close_all(&self, cause: CloseCause) -> usize {
        self.handles()
            .iter()
            .filter(|handle| handle.close(cause))
            .count()
    }

    /// Number of registered identities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Returns `true` if no identity is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Subscribe to occupancy changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Occupancy> {
        self.occupancy.subscribe()
    }

    /// Current occupancy.
    #[must_use]
    pub fn occupancy(&self) -> Occupancy {
        *self.occupancy.borrow()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
