//! Tracking of live throttled connections for limit propagation.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use tracing::{debug, trace};

use crate::{bucket::TokenBucket, limits::RateLimit};

/// Identity of one registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

/// A concurrency-safe map from connection identity to that connection's
/// private bucket.
///
/// Membership mirrors the set of open throttled connections: an entry is
/// inserted when a connection is accepted and removed when it is closed (or
/// dropped). Limit broadcasts walk the map under its one exclusive lock,
/// which serializes them against concurrent registration and deregistration.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ConnId, Arc<TokenBucket>>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert a connection's private bucket, returning its identity.
    pub fn register(&self, bucket: Arc<TokenBucket>) -> ConnId {
        let id = ConnId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().insert(id, bucket);
        trace!(id = id.0, "connection registered");
        id
    }

    /// Remove a connection. A no-op when the id is not present, so closing a
    /// connection twice never double-removes.
    pub fn unregister(&self, id: ConnId) {
        if self.lock().remove(&id).is_some() {
            trace!(id = id.0, "connection deregistered");
        }
    }

    /// Apply `limit` to every registered connection's private bucket.
    pub fn broadcast(&self, limit: RateLimit) {
        let connections = self.lock();
        for bucket in connections.values() {
            bucket.reconfigure(limit);
        }
        debug!(
            connections = connections.len(),
            rate = limit.bytes_per_sec,
            burst = limit.burst,
            "per-connection limit broadcast"
        );
    }

    /// Number of currently registered connections.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no connections are registered.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnId, Arc<TokenBucket>>> {
        self.connections
            .lock()
            .expect("lock should not be poisoned")
    }
}

/// Registry membership held on behalf of one connection.
///
/// Deregisters on drop, so a connection that is closed or simply dropped
/// always leaves the registry exactly once.
#[derive(Debug)]
pub(crate) struct Registration {
    id: ConnId,
    registry: Arc<ConnectionRegistry>,
}

impl Registration {
    pub(crate) fn new(registry: Arc<ConnectionRegistry>, bucket: Arc<TokenBucket>) -> Self {
        let id = registry.register(bucket);
        Self { id, registry }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}
