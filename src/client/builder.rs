use std::sync::Arc;
use std::time::Duration;

use http::HeaderValue;
use tokio::runtime::Handle;

use super::config::ClientConfig;
use super::conn::{TcpTransport, TcpTransportConfig, Transport};
use super::pool::{self, ConnectionPool, IdlePool};
use super::Client;

/// A builder for a client.
///
/// Starts from [`ClientConfig::default`] and the [`TcpTransport`].
#[derive(Debug)]
pub struct Builder {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    runtime: Option<Handle>,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    /// Create a builder with the default configuration.
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            transport: Arc::new(TcpTransport::default()),
            runtime: None,
        }
    }

    /// Replace the whole configuration.
    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the timeout for opening new connections.
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    /// Set the timeout for sending a request and reading its response.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Enable or disable connection reuse.
    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.config.keep_alive = keep_alive;
        self
    }

    /// Limit the number of connections open at once, across all hosts.
    pub fn with_max_connections_total(mut self, max: usize) -> Self {
        self.config.max_connections_total = Some(max);
        self
    }

    /// Limit the number of connections open at once to a single host.
    pub fn with_max_connections_per_host(mut self, max: usize) -> Self {
        self.config.max_connections_per_host = Some(max);
        self
    }

    /// Set the default `User-Agent` header.
    pub fn with_user_agent(mut self, user_agent: HeaderValue) -> Self {
        self.config.user_agent = Some(user_agent);
        self
    }

    /// Do not add a `User-Agent` header to requests.
    pub fn without_user_agent(mut self) -> Self {
        self.config.user_agent = None;
        self
    }

    /// Use a custom connection pool.
    pub fn with_pool<P: ConnectionPool>(self, pool: P) -> Self {
        self.with_shared_pool(Arc::new(pool))
    }

    /// Use a connection pool which is also held elsewhere.
    pub fn with_shared_pool(mut self, pool: Arc<dyn ConnectionPool>) -> Self {
        self.config.pool = pool;
        self
    }

    /// Use the default pool, with the given configuration.
    pub fn with_pool_config(self, config: pool::Config) -> Self {
        self.with_pool(IdlePool::new(config))
    }

    /// Use the provided TCP configuration.
    pub fn with_tcp(self, config: TcpTransportConfig) -> Self {
        self.with_transport(TcpTransport::new(config))
    }

    /// Provide a custom transport.
    pub fn with_transport<T: Transport>(mut self, transport: T) -> Self {
        self.transport = Arc::new(transport);
        self
    }

    /// Run requests on the given runtime, instead of the current one.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Build the client.
    ///
    /// # Panics
    ///
    /// Panics if no runtime was provided with [`Builder::with_runtime`] and this
    /// is not called from within a tokio runtime.
    pub fn build(self) -> Client {
        let runtime = self.runtime.unwrap_or_else(Handle::current);
        Client::from_parts(self.config, self.transport, runtime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn build_client() {
        let client = Builder::new()
            .with_connection_timeout(Duration::from_secs(1))
            .with_request_timeout(Duration::from_secs(2))
            .with_keep_alive(false)
            .with_max_connections_total(4)
            .with_max_connections_per_host(2)
            .without_user_agent()
            .build();

        let config = client.config();
        assert_eq!(config.connection_timeout, Duration::from_secs(1));
        assert_eq!(config.request_timeout, Duration::from_secs(2));
        assert!(!config.keep_alive);
        assert_eq!(config.max_connections_total, Some(4));
        assert_eq!(config.max_connections_per_host, Some(2));
        assert!(config.user_agent.is_none());
    }

    #[test]
    fn build_with_runtime() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let client = Builder::new()
            .with_pool_config(pool::Config::default())
            .with_runtime(runtime.handle().clone())
            .build();
        assert_eq!(client.open_connections(), 0);
    }
}
