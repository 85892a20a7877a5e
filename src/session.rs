//! Registry of live connection handles.
//!
//! `ConnectionRegistry` stores non-owning weak references to
//! [`ConnectionHandle`]s so a server can reach every live connection, for
//! example to broadcast shutdown, without keeping finished connections
//! alive. Dead entries can be pruned opportunistically or lazily at lookup
//! time.
use std::sync::Weak;

use dashmap::DashMap;

use crate::connection::{ConnectionHandle, HandleInner};

/// Identifier assigned to a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl From<u64> for ConnectionId {
    fn from(value: u64) -> Self { Self(value) }
}

impl ConnectionId {
    /// Create a new [`ConnectionId`] with the provided value.
    #[must_use]
    pub fn new(id: u64) -> Self { Self(id) }

    /// Return the inner `u64` representation.
    #[must_use]
    pub fn as_u64(&self) -> u64 { self.0 }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConnectionId({})", self.0)
    }
}

/// Concurrent registry of connection handles keyed by [`ConnectionId`].
#[derive(Debug, Default)]
pub struct ConnectionRegistry(DashMap<ConnectionId, Weak<HandleInner>>);

impl ConnectionRegistry {
    /// Retrieve the handle for `id` if the connection is still alive.
    pub fn get(&self, id: &ConnectionId) -> Option<ConnectionHandle> {
        let guard = self.0.get(id);
        let handle = guard.as_ref().and_then(|weak| weak.upgrade());
        drop(guard);
        if handle.is_none() {
            self.0.remove_if(id, |_, weak| weak.strong_count() == 0);
        }
        handle.map(ConnectionHandle::from_arc)
    }

    /// Insert a handle for a newly established connection.
    pub fn insert(&self, id: ConnectionId, handle: &ConnectionHandle) {
        self.0.insert(id, handle.downgrade());
    }

    /// Remove a handle, typically on connection teardown.
    pub fn remove(&self, id: &ConnectionId) { self.0.remove(id); }

    /// Remove all stale weak references without returning any handles.
    pub fn prune(&self) { self.0.retain(|_, weak| weak.strong_count() > 0); }

    /// Prune stale weak references, then collect the remaining live handles.
    #[must_use]
    pub fn active_handles(&self) -> Vec<(ConnectionId, ConnectionHandle)> {
        let mut handles = Vec::with_capacity(self.0.len());
        self.0.retain(|id, weak| {
            if let Some(inner) = weak.upgrade() {
                handles.push((*id, ConnectionHandle::from_arc(inner)));
                true
            } else {
                false
            }
        });
        handles
    }

    /// Prune stale weak references, then return the IDs of the live connections.
    #[must_use]
    pub fn active_ids(&self) -> Vec<ConnectionId> {
        let mut ids = Vec::with_capacity(self.0.len());
        self.0.retain(|id, weak| {
            if weak.strong_count() > 0 {
                ids.push(*id);
                true
            } else {
                false
            }
        });
        ids
    }

    /// Ask every live connection to drain. Returns how many were asked.
    pub fn shutdown_all(&self) -> usize {
        let handles = self.active_handles();
        for (_, handle) in &handles {
            handle.request_shutdown();
        }
        handles.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use rstest::{fixture, rstest};
    use tokio::io::duplex;

    use super::*;
    use crate::{
        config::ConnectionConfig,
        connection::{Connection, ConnectionState},
        handler::{Request, ResponseWriter, handler_fn},
    };

    #[fixture]
    fn registry() -> ConnectionRegistry { ConnectionRegistry::default() }

    fn handle() -> ConnectionHandle {
        let (_client, server) = duplex(64);
        let handler = handler_fn(|_req: Request, mut res: ResponseWriter| async move {
            res.send_headers(Bytes::new(), true)?;
            Ok(())
        });
        Connection::new(server, Arc::new(handler), ConnectionConfig::default())
            .expect("valid config")
            .handle()
    }

    #[rstest]
    fn dropped_connections_are_pruned(registry: ConnectionRegistry) {
        let live = handle();
        registry.insert(ConnectionId::new(1), &live);
        {
            let dead = handle();
            registry.insert(ConnectionId::new(2), &dead);
        }
        assert_eq!(registry.active_ids(), vec![ConnectionId::new(1)]);
        assert!(registry.get(&ConnectionId::new(2)).is_none());
        assert!(registry.get(&ConnectionId::new(1)).is_some());
    }

    #[rstest]
    fn shutdown_all_counts_live_handles(registry: ConnectionRegistry) {
        let first = handle();
        let second = handle();
        registry.insert(ConnectionId::new(1), &first);
        registry.insert(ConnectionId::new(2), &second);
        assert_eq!(registry.shutdown_all(), 2);
        drop(second);
        assert_eq!(registry.shutdown_all(), 1);
        assert!(matches!(first.state(), ConnectionState::Closed(_)));
    }
}
