//! Thread-safe registry of live connections.
//!
//! The registry is the only structure several workers mutate concurrently.
//! Every operation takes one registry-wide lock, and only for bookkeeping:
//! no socket is read or written while it is held. Workers call
//! [`ConnectionRegistry::snapshot`] and iterate the copy.
//!
//! The busy flag is a cooperative claim. A worker that wins
//! [`ConnectionRegistry::try_claim`] is the only one allowed to read the
//! connection until it calls [`ConnectionRegistry::release`].

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace};

use super::{ConnectionHandle, ConnectionId};
use crate::error::{ProtocolError, Result};

struct Entry {
    handle: Arc<ConnectionHandle>,
    busy: bool,
}

/// Point-in-time view of one registered connection.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub handle: Arc<ConnectionHandle>,
    pub is_alive: bool,
    pub is_busy: bool,
}

/// Registry of live connections keyed by id.
#[derive(Default)]
pub struct ConnectionRegistry {
    entries: Mutex<BTreeMap<ConnectionId, Entry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<ConnectionId, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a connection. Ids must be unique among live connections.
    pub fn add(&self, handle: Arc<ConnectionHandle>) -> Result<()> {
        let id = handle.id();
        let mut entries = self.lock();
        if entries.contains_key(&id) {
            return Err(ProtocolError::InvalidState(format!(
                "Connection {id} already registered"
            )));
        }
        entries.insert(
            id,
            Entry {
                handle,
                busy: false,
            },
        );
        debug!(connection = %id, total = entries.len(), "Connection registered");
        Ok(())
    }

    /// Remove a connection, returning its handle if it was registered.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        let removed = self.lock().remove(&id).map(|entry| entry.handle);
        if removed.is_some() {
            debug!(connection = %id, "Connection unregistered");
        }
        removed
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.lock().get(&id).map(|entry| Arc::clone(&entry.handle))
    }

    /// Consistent copy of every entry, ordered by connection id.
    pub fn snapshot(&self) -> Vec<RegistryEntry> {
        self.lock()
            .values()
            .map(|entry| RegistryEntry {
                handle: Arc::clone(&entry.handle),
                is_alive: entry.handle.is_alive(),
                is_busy: entry.busy,
            })
            .collect()
    }

    /// Atomically mark the connection busy, iff it is alive and not already busy.
    pub fn try_claim(&self, id: ConnectionId) -> bool {
        let mut entries = self.lock();
        match entries.get_mut(&id) {
            Some(entry) if !entry.busy && entry.handle.is_alive() => {
                entry.busy = true;
                trace!(connection = %id, "Connection claimed");
                true
            }
            _ => false,
        }
    }

    /// Claim a connection so it can be torn down. Unlike [`try_claim`] this
    /// ignores liveness; it only fails while another worker holds the claim.
    ///
    /// [`try_claim`]: ConnectionRegistry::try_claim
    pub fn try_claim_for_teardown(&self, id: ConnectionId) -> bool {
        let mut entries = self.lock();
        match entries.get_mut(&id) {
            Some(entry) if !entry.busy => {
                entry.busy = true;
                trace!(connection = %id, "Connection claimed for teardown");
                true
            }
            _ => false,
        }
    }

    /// Clear the busy flag. Releasing a removed connection is a no-op.
    pub fn release(&self, id: ConnectionId) {
        if let Some(entry) = self.lock().get_mut(&id) {
            entry.busy = false;
            trace!(connection = %id, "Connection released");
        }
    }

    /// Whether the connection is currently claimed by a worker.
    pub fn is_busy(&self, id: ConnectionId) -> bool {
        self.lock().get(&id).is_some_and(|entry| entry.busy)
    }

    /// Remove and return every registered connection.
    pub fn drain(&self) -> Vec<Arc<ConnectionHandle>> {
        std::mem::take(&mut *self.lock())
            .into_values()
            .map(|entry| entry.handle)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.len())
            .finish()
    }
}
