//! The server's table of live connections.
use std::sync::Arc;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::outbound::{Sent, Targets, WriteQueue};
use crate::peer::{Connection, ConnectionId};

/// Live connections keyed by id. Clones share the same table.
///
/// Every operation is safe to call from any number of read loops at once, including while a
/// broadcast is walking the table.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    inner: Arc<DashMap<ConnectionId, Arc<Connection>>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Add `conn` under `id`. Returns `false` and leaves the table alone if `id` is taken.
    pub fn register(&self, id: ConnectionId, conn: Arc<Connection>) -> bool {
        match self.inner.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(conn);
                true
            }
        }
    }

    /// Remove `id`. Returns whether it was present.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        self.inner.remove(&id).is_some()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.inner.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Point-in-time copy of every connection other than `exclude`.
    ///
    /// No shard lock is held once this returns, so the caller may take as long as it likes with
    /// the result; entries added or removed meanwhile are simply not reflected.
    pub fn snapshot(&self, exclude: Option<ConnectionId>) -> Vec<Arc<Connection>> {
        self.inner
            .iter()
            .filter(|entry| Some(*entry.key()) != exclude)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Queue `payload` for every connection except `exclude`. The set of recipients is taken when
    /// the queue gets to the job, not now.
    pub fn broadcast(&self, queue: &WriteQueue, payload: Bytes, exclude: Option<ConnectionId>) -> Sent {
        queue.send(
            payload,
            Targets::AllExcept {
                registry: self.clone(),
                exclude,
            },
        )
    }

    /// Close every tracked socket. Entries stay until each read loop sees its socket close and
    /// unregisters itself.
    pub fn disconnect_all(&self) -> usize {
        self.snapshot(None)
            .iter()
            .filter(|conn| conn.close())
            .count()
    }
}
