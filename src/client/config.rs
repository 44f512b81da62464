use std::sync::Arc;
use std::time::Duration;

use http::HeaderValue;

use super::admission::Limits;
use super::pool::{ConnectionPool, IdlePool};

/// Client configuration.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ClientConfig {
    /// How long opening a new connection may take.
    pub connection_timeout: Duration,

    /// How long sending a request and reading its response may take.
    pub request_timeout: Duration,

    /// Whether connections may be reused for later requests. When `false`, every
    /// request also carries `Connection: close`.
    pub keep_alive: bool,

    /// Maximum number of connections open at once, across all hosts.
    pub max_connections_total: Option<usize>,

    /// Maximum number of connections open at once to a single host.
    pub max_connections_per_host: Option<usize>,

    /// `User-Agent` sent with requests which do not set one.
    pub user_agent: Option<HeaderValue>,

    /// Pool used to keep connections for reuse.
    pub pool: Arc<dyn ConnectionPool>,
}

impl ClientConfig {
    pub(crate) fn limits(&self) -> Limits {
        Limits::new(self.max_connections_total, self.max_connections_per_host)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(60),
            keep_alive: true,
            max_connections_total: None,
            max_connections_per_host: None,
            user_agent: Some(HeaderValue::from_static(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION")
            ))),
            pool: Arc::new(IdlePool::default()),
        }
    }
}
