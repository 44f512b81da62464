//! Connection pools which never retain anything, for testing how the client
//! behaves around pool decisions.

use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::trace;

use super::{ConnectionId, ConnectionKey, ConnectionPool, PooledConnection};

/// A pool which refuses to cache anything.
///
/// [`ConnectionPool::can_cache_connection`] is always `false`, and any offered
/// connection is handed back to the caller.
#[derive(Debug, Default)]
pub struct RejectingPool {
    offered: AtomicUsize,
    destroyed: AtomicUsize,
}

impl RejectingPool {
    /// Create a new rejecting pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of connections offered to the pool.
    pub fn offered(&self) -> usize {
        self.offered.load(Ordering::SeqCst)
    }

    /// Number of times [`ConnectionPool::destroy`] was called.
    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl ConnectionPool for RejectingPool {
    fn add_connection(
        &self,
        key: &ConnectionKey,
        connection: PooledConnection,
    ) -> Result<(), PooledConnection> {
        self.offered.fetch_add(1, Ordering::SeqCst);
        trace!(%key, "rejecting pool declined connection");
        Err(connection)
    }

    fn get_connection(&self, _key: &ConnectionKey) -> Option<PooledConnection> {
        None
    }

    fn remove_connection(&self, _id: ConnectionId) -> Option<PooledConnection> {
        None
    }

    fn remove_all_connections(&self, _key: &ConnectionKey) -> bool {
        false
    }

    fn can_cache_connection(&self) -> bool {
        false
    }

    fn destroy(&self) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

/// A pool which accepts every connection, and never hands one out.
///
/// Accepted connections are dropped immediately, which destroys them and
/// releases their permits.
#[derive(Debug, Default)]
pub struct AcceptingPool {
    accepted: AtomicUsize,
    destroyed: AtomicUsize,
}

impl AcceptingPool {
    /// Create a new accepting pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of connections accepted by the pool.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Number of times [`ConnectionPool::destroy`] was called.
    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl ConnectionPool for AcceptingPool {
    fn add_connection(
        &self,
        key: &ConnectionKey,
        connection: PooledConnection,
    ) -> Result<(), PooledConnection> {
        self.accepted.fetch_add(1, Ordering::SeqCst);
        trace!(%key, id = %connection.id(), "accepting pool took connection");
        drop(connection);
        Ok(())
    }

    fn get_connection(&self, _key: &ConnectionKey) -> Option<PooledConnection> {
        None
    }

    fn remove_connection(&self, _id: ConnectionId) -> Option<PooledConnection> {
        None
    }

    fn remove_all_connections(&self, _key: &ConnectionKey) -> bool {
        false
    }

    fn can_cache_connection(&self) -> bool {
        true
    }

    fn destroy(&self) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}
