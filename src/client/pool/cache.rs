use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::idle::IdleConnections;
use super::{ConnectionId, ConnectionKey, ConnectionPool, PooledConnection};

/// Configuration for the default connection pool.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Config {
    /// The maximum idle duration of a connection.
    pub idle_timeout: Option<Duration>,

    /// The maximum number of idle connections per host.
    pub max_idle_per_host: usize,

    /// The maximum number of idle connections across all hosts. Once reached,
    /// the pool stops caching connections until some are claimed or evicted.
    pub max_idle_total: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            idle_timeout: Some(Duration::from_secs(60)),
            max_idle_per_host: 32,
            max_idle_total: None,
        }
    }
}

#[derive(Debug)]
struct PoolInner {
    config: Config,
    idle: HashMap<ConnectionKey, IdleConnections>,
    destroyed: bool,
}

impl PoolInner {
    fn idle_total(&self) -> usize {
        self.idle.values().map(IdleConnections::len).sum()
    }

    fn evict_expired(&mut self, evicted: &mut Vec<PooledConnection>) {
        let timeout = self.config.idle_timeout;
        self.idle.retain(|_, idle| {
            idle.evict(timeout, evicted);
            !idle.is_empty()
        });
    }
}

/// The default connection pool.
///
/// Idle connections are kept per [`ConnectionKey`] and reused most recently
/// returned first. Connections which have been idle for longer than
/// [`Config::idle_timeout`], or whose channel has closed, are evicted lazily
/// whenever the pool is used. Evicted connections are dropped outside of the
/// pool lock, which releases their admission permits.
pub struct IdlePool {
    inner: Mutex<PoolInner>,
}

impl IdlePool {
    /// Create a new pool with the given configuration.
    pub fn new(config: Config) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                config,
                idle: HashMap::new(),
                destroyed: false,
            }),
        }
    }

    /// Number of idle connections currently held by the pool.
    pub fn idle_connections(&self) -> usize {
        self.inner.lock().idle_total()
    }

    /// Number of idle connections held for `key`.
    pub fn idle_connections_for(&self, key: &ConnectionKey) -> usize {
        self.inner
            .lock()
            .idle
            .get(key)
            .map(IdleConnections::len)
            .unwrap_or(0)
    }

    /// Whether [`ConnectionPool::destroy`] has been called.
    pub fn is_destroyed(&self) -> bool {
        self.inner.lock().destroyed
    }
}

impl Default for IdlePool {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl fmt::Debug for IdlePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("IdlePool")
            .field("config", &inner.config)
            .field("idle", &inner.idle_total())
            .field("destroyed", &inner.destroyed)
            .finish()
    }
}

impl ConnectionPool for IdlePool {
    fn add_connection(
        &self,
        key: &ConnectionKey,
        connection: PooledConnection,
    ) -> Result<(), PooledConnection> {
        let mut evicted = Vec::new();
        let outcome = {
            let mut inner = self.inner.lock();
            inner.evict_expired(&mut evicted);

            if inner.destroyed {
                trace!(%key, "pool destroyed, declining connection");
                Err(connection)
            } else if !connection.is_open() {
                trace!(%key, "declining closed connection");
                Err(connection)
            } else if inner
                .config
                .max_idle_total
                .is_some_and(|max| inner.idle_total() >= max)
            {
                trace!(%key, "idle pool full, declining connection");
                Err(connection)
            } else {
                let max_per_host = inner.config.max_idle_per_host;
                let idle = inner.idle.entry(key.clone()).or_default();
                if idle.len() >= max_per_host {
                    trace!(%key, "idle connections for host at capacity");
                    Err(connection)
                } else {
                    trace!(%key, id = %connection.id(), "connection returned to pool");
                    idle.push(connection);
                    Ok(())
                }
            }
        };

        if !evicted.is_empty() {
            debug!(count = evicted.len(), "evicted idle connections");
        }
        drop(evicted);
        outcome
    }

    fn get_connection(&self, key: &ConnectionKey) -> Option<PooledConnection> {
        let mut evicted = Vec::new();
        let connection = {
            let mut inner = self.inner.lock();
            if inner.destroyed {
                return None;
            }

            let timeout = inner.config.idle_timeout;
            let mut empty = false;
            let connection = inner.idle.get_mut(key).and_then(|idle| {
                let connection = idle.pop(timeout, &mut evicted);
                empty = idle.is_empty();
                connection
            });

            if empty {
                trace!(%key, "removing empty idle list");
                inner.idle.remove(key);
            }

            connection
        };

        if !evicted.is_empty() {
            debug!(%key, count = evicted.len(), "evicted idle connections");
        }
        drop(evicted);
        connection
    }

    fn remove_connection(&self, id: ConnectionId) -> Option<PooledConnection> {
        let mut inner = self.inner.lock();
        let mut found = None;
        inner.idle.retain(|_, idle| {
            if found.is_none() {
                found = idle.remove(id);
            }
            !idle.is_empty()
        });
        found
    }

    fn remove_all_connections(&self, key: &ConnectionKey) -> bool {
        let removed = self.inner.lock().idle.remove(key);
        match removed {
            Some(mut idle) => {
                let count = idle.drain().count();
                debug!(%key, count, "flushed idle connections for host");
                count > 0
            }
            None => false,
        }
    }

    fn can_cache_connection(&self) -> bool {
        let inner = self.inner.lock();
        !inner.destroyed
            && inner
                .config
                .max_idle_total
                .map_or(true, |max| inner.idle_total() < max)
    }

    fn destroy(&self) {
        let idle = {
            let mut inner = self.inner.lock();
            if inner.destroyed {
                return;
            }
            inner.destroyed = true;
            std::mem::take(&mut inner.idle)
        };

        let count: usize = idle.into_values().map(|mut idle| idle.drain().count()).sum();
        debug!(count, "connection pool destroyed");
    }
}
