//! Connection Pooling for Clients
//!
//! The `pool` module defines the [`ConnectionPool`] capability, which stores idle
//! connections keyed by [`ConnectionKey`] so that later requests to the same host
//! can reuse them instead of opening new ones.
//!
//! Pools are pluggable: the client uses [`IdlePool`] unless another implementation
//! is provided in the [`ClientConfig`][crate::client::ClientConfig]. Every
//! implementation must uphold the same contract:
//!
//! - A connection returned by [`ConnectionPool::get_connection`] or
//!   [`ConnectionPool::remove_connection`] is no longer in the pool, so it is handed
//!   to exactly one claimant.
//! - A connection declined by [`ConnectionPool::add_connection`] is handed back to the
//!   caller, which must destroy it.
//! - Dropping a [`PooledConnection`] destroys it, and releases its admission
//!   permit. Pools evict connections simply by dropping them.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::trace;

mod cache;
mod idle;
mod key;
#[cfg(any(test, feature = "mocks"))]
pub mod mock;

pub use self::cache::{Config, IdlePool};
pub use self::key::ConnectionKey;

use super::admission::Permit;
use super::conn::{BoxFuture, Channel, Response};
use crate::BoxError;

/// The URI used for a request cannot be mapped to a [`ConnectionKey`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum UriError {
    /// The connection string could not be parsed.
    #[error("invalid uri: {0}")]
    InvalidUri(#[from] http::uri::InvalidUri),

    /// The URI is missing a scheme.
    #[error("missing scheme in uri: {0}")]
    MissingScheme(http::Uri),

    /// The URI is missing a host.
    #[error("missing host in uri: {0}")]
    MissingHost(http::Uri),

    /// The URI scheme is not `http` or `https`.
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),
}

/// A pool of idle connections, keyed by [`ConnectionKey`].
///
/// Implementations must be internally synchronized: the client calls these
/// methods concurrently from many requests.
pub trait ConnectionPool: fmt::Debug + Send + Sync + 'static {
    /// Offer a connection for future reuse.
    ///
    /// Returns the connection back as `Err` when the pool declines it. The caller
    /// is then responsible for destroying it.
    fn add_connection(
        &self,
        key: &ConnectionKey,
        connection: PooledConnection,
    ) -> Result<(), PooledConnection>;

    /// Claim an idle connection for `key`, removing it from the pool.
    ///
    /// A miss is a normal outcome, and means a new connection should be opened.
    fn get_connection(&self, key: &ConnectionKey) -> Option<PooledConnection>;

    /// Evict a specific connection from the pool, returning it if it was present.
    fn remove_connection(&self, id: ConnectionId) -> Option<PooledConnection>;

    /// Evict every pooled connection for the host identified by `key`.
    ///
    /// Returns `true` if any connection was removed.
    fn remove_all_connections(&self, key: &ConnectionKey) -> bool;

    /// Whether the pool will currently consider retaining connections at all.
    ///
    /// When this returns `false`, the client destroys connections after use
    /// without offering them.
    fn can_cache_connection(&self) -> bool;

    /// Release every pooled connection and stop accepting new ones.
    ///
    /// Calling this more than once has no further effect.
    fn destroy(&self);
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a single connection, unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A transport channel together with the admission permit which accounts for it.
///
/// A pooled connection is owned by exactly one party at a time: a request in
/// flight, or the pool. Dropping it closes the channel and releases the permit.
pub struct PooledConnection {
    id: ConnectionId,
    channel: Box<dyn Channel>,
    permit: Permit,
    alive: bool,
    uses: usize,
}

impl PooledConnection {
    /// Wrap a freshly opened channel. The connection takes its key from the permit.
    pub fn new(channel: Box<dyn Channel>, permit: Permit) -> Self {
        let connection = Self {
            id: ConnectionId::next(),
            channel,
            permit,
            alive: true,
            uses: 0,
        };
        trace!(id = %connection.id, key = %connection.key(), "connection created");
        connection
    }

    /// Unique identity of this connection.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The key this connection was opened for.
    pub fn key(&self) -> &ConnectionKey {
        self.permit.key()
    }

    /// Whether the connection can still carry requests.
    pub fn is_open(&self) -> bool {
        self.alive && self.channel.is_open()
    }

    /// Number of requests this connection has been used for.
    pub fn uses(&self) -> usize {
        self.uses
    }

    /// Flag the connection as broken, so it is never reused.
    pub fn mark_broken(&mut self) {
        self.alive = false;
    }

    /// Send a request on the underlying channel and wait for the full response.
    ///
    /// A failed exchange marks the connection broken.
    pub fn send_request(
        &mut self,
        request: http::Request<bytes::Bytes>,
    ) -> BoxFuture<'_, Result<Response, BoxError>> {
        self.uses += 1;
        Box::pin(async move {
            let outcome = self.channel.send_request(request).await;
            if outcome.is_err() {
                self.alive = false;
            }
            outcome
        })
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("key", self.key())
            .field("alive", &self.alive)
            .field("uses", &self.uses)
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        trace!(id = %self.id, key = %self.key(), "connection destroyed");
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::client::admission::AdmissionController;
    use crate::client::conn::mock::MockChannel;

    assert_impl_all!(PooledConnection: Send);
    assert_impl_all!(UriError: std::error::Error, Send, Sync);

    #[test]
    fn connection_ids_are_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("conn-"));
    }

    #[tokio::test]
    async fn pooled_connection_accounting() {
        let _ = tracing_subscriber::fmt::try_init();

        let admission = AdmissionController::default();
        let key = ConnectionKey::new("localhost", 80, false);

        let mut conn = PooledConnection::new(
            Box::new(MockChannel::new()),
            admission.try_acquire(&key).unwrap(),
        );
        assert_eq!(conn.key(), &key);
        assert!(conn.is_open());
        assert_eq!(admission.open_connections(), 1);

        let request = http::Request::get("http://localhost/")
            .body(bytes::Bytes::new())
            .unwrap();
        let response = conn.send_request(request).await.unwrap();
        assert_eq!(response.status(), http::StatusCode::OK);
        assert_eq!(conn.uses(), 1);

        conn.mark_broken();
        assert!(!conn.is_open());

        drop(conn);
        assert_eq!(admission.open_connections(), 0);
    }

    #[tokio::test]
    async fn failed_exchange_marks_broken() {
        let admission = AdmissionController::default();
        let key = ConnectionKey::new("localhost", 80, false);

        let mut conn = PooledConnection::new(
            Box::new(MockChannel::failing()),
            admission.try_acquire(&key).unwrap(),
        );

        let request = http::Request::get("http://localhost/")
            .body(bytes::Bytes::new())
            .unwrap();
        assert!(conn.send_request(request).await.is_err());
        assert!(!conn.is_open());
    }
}
