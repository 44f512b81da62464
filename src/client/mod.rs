//! Asynchronous HTTP client with pooled, admission-controlled connections.
//!
//! The [`Client`] accepts requests without blocking, and hands back a
//! [`ResponseFuture`] for each one. Requests run on a tokio runtime, where they:
//!
//! 1. Claim an idle connection from the [pool][self::pool], or get a permit for a
//!    new one from the [admission controller][self::admission]. Both happen
//!    before [`Client::execute`] returns, so an admission failure is visible on
//!    the future immediately.
//! 2. Open a new connection with the [transport][self::conn] if needed.
//! 3. Exchange the request and response.
//! 4. Offer the connection back to the pool, or destroy it.
//! 5. Call the [completion handler][CompletionHandler] and resolve the future.
//!
//! Connections are bounded in total and per host. A connection holds its
//! admission permit for as long as it exists, including while it sits idle in
//! the pool.
//!
//! # Example
//! ```no_run
//! # use hyperpool::client::Client;
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::builder().with_max_connections_total(8).build();
//! let response = client.get("http://example.com".parse()?).await?;
//! println!("Response: {:?}", response);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument as _};

pub mod admission;
mod builder;
mod config;
pub mod conn;
mod engine;
mod error;
mod future;
mod handler;
pub mod pool;
mod request;

pub use self::admission::{AdmissionController, AdmissionError, Limits};
pub use self::builder::Builder;
pub use self::config::ClientConfig;
pub use self::conn::Response;
pub use self::error::{Error, SharedError, TimeoutKind};
pub use self::future::{ResponseFuture, Status};
pub use self::handler::{handler_fn, CompletionHandler, HandlerFn, ResponseHandler};
pub use self::pool::{ConnectionKey, ConnectionPool};
pub use self::request::RequestDescriptor;

pub use pool::Config as PoolConfig;

use self::conn::Transport;
use self::engine::{Checkout, ClientContext, Exchange};
use self::future::Completion;

/// Inner type for managing the client.
struct ClientRef {
    context: Arc<ClientContext>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    runtime: Handle,
}

impl ClientRef {
    /// Everything that happens before a request is handed to the runtime.
    fn admit(&self, request: &RequestDescriptor) -> Result<(ConnectionKey, Checkout), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        let key = request.key()?;
        let checkout = self.context.checkout(&key)?;
        Ok((key, checkout))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        debug!("closing client");
        self.shutdown.cancel();
        self.context.config.pool.destroy();
    }
}

impl Drop for ClientRef {
    fn drop(&mut self) {
        self.close();
    }
}

/// A high-level async HTTP client.
///
/// Cloning the client is cheap, and clones share configuration, connection
/// limits and the pool. The client closes when [`Client::close`] is called or
/// the last clone is dropped.
///
/// # Example
/// ```no_run
/// # use hyperpool::client::{Client, RequestDescriptor, ResponseHandler};
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let client = Client::builder().build();
/// let request = RequestDescriptor::get("http://example.com".parse()?);
/// let future = client.execute(request, ResponseHandler);
/// let response = future.await?;
/// println!("Response: {:?}", response);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientRef>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.inner.context.config)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Client {
    /// Create a client with the given configuration, which connects over TCP
    /// and runs requests on the current runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn new(config: ClientConfig) -> Self {
        Self::builder().with_config(config).build()
    }

    /// Create a builder for a client.
    pub fn builder() -> Builder {
        Builder::new()
    }

    pub(crate) fn from_parts(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        runtime: Handle,
    ) -> Self {
        Self {
            inner: Arc::new(ClientRef {
                context: Arc::new(ClientContext::new(config, transport)),
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                runtime,
            }),
        }
    }

    /// Submit a request.
    ///
    /// Returns without waiting for any I/O. If the client is closed, the URI
    /// does not name a host, or no connection can be admitted, the returned
    /// future has already failed. The handler's callbacks always run on the
    /// runtime, never on the calling thread.
    pub fn execute<H>(
        &self,
        request: impl Into<RequestDescriptor>,
        handler: H,
    ) -> ResponseFuture<H::Output>
    where
        H: CompletionHandler,
    {
        let request = request.into();
        let span = tracing::debug_span!(
            "request",
            method = %request.method(),
            key = tracing::field::Empty,
        );

        let (key, checkout) = match span.in_scope(|| self.inner.admit(&request)) {
            Ok(admitted) => admitted,
            Err(error) => {
                span.in_scope(|| debug!(%error, "request rejected"));
                let notice = error.clone();
                let mut handler = handler;
                self.inner.runtime.spawn(
                    async move {
                        handler.on_throwable(&notice);
                    }
                    .instrument(span),
                );
                return ResponseFuture::failed(error);
            }
        };

        span.record("key", tracing::field::display(&key));
        let completion = Completion::new(self.inner.shutdown.child_token());
        let exchange = Exchange::new(
            self.inner.context.clone(),
            key,
            request,
            checkout,
            handler,
            completion.clone(),
        );
        self.inner.runtime.spawn(exchange.run().instrument(span));

        ResponseFuture::new(completion)
    }

    /// Submit a request whose future resolves to the response itself.
    pub fn request(&self, request: impl Into<RequestDescriptor>) -> ResponseFuture<Response> {
        self.execute(request, ResponseHandler)
    }

    /// Make a GET request to the given URI.
    pub async fn get(&self, uri: http::Uri) -> Result<Response, Error> {
        self.request(RequestDescriptor::get(uri)).await
    }

    /// Make a POST request to the given URI.
    pub async fn post(&self, uri: http::Uri, body: impl Into<Bytes>) -> Result<Response, Error> {
        self.request(RequestDescriptor::post(uri, body)).await
    }

    /// Close the client.
    ///
    /// Later requests fail with [`Error::Closed`], requests in flight are
    /// cancelled, and the pool is destroyed. Does not wait for anything, and
    /// calling it again has no effect.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Whether [`Client::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of connections currently open, idle ones included.
    pub fn open_connections(&self) -> usize {
        self.inner.context.admission.open_connections()
    }

    /// The admission controller tracking this client's connections.
    pub fn admission(&self) -> &AdmissionController {
        &self.inner.context.admission
    }

    /// The pool this client keeps idle connections in.
    pub fn pool(&self) -> &Arc<dyn ConnectionPool> {
        &self.inner.context.config.pool
    }

    /// The configuration of this client.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.context.config
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::client::conn::mock::MockTransport;
    use crate::client::pool::mock::RejectingPool;

    assert_impl_all!(Client: Send, Sync, Clone);

    fn client(transport: MockTransport) -> Client {
        Client::builder().with_transport(transport).build()
    }

    #[tokio::test]
    async fn get_request() {
        let _ = tracing_subscriber::fmt::try_init();

        let transport = MockTransport::new();
        let client = client(transport.clone());

        let response = client.get("http://example.com/".parse().unwrap()).await;
        assert_eq!(response.unwrap().status(), http::StatusCode::OK);
        assert_eq!(transport.requests(), 1);
        assert_eq!(client.open_connections(), 1);
    }

    #[tokio::test]
    async fn invalid_uri_fails_immediately() {
        let client = client(MockTransport::new());

        let future = client.request(RequestDescriptor::get("/relative".parse().unwrap()));
        assert_eq!(future.status(), Status::Failed);
        assert!(matches!(future.await, Err(Error::InvalidUri(_))));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let pool = Arc::new(RejectingPool::new());
        let client = Client::builder()
            .with_transport(MockTransport::new())
            .with_shared_pool(pool.clone())
            .build();

        let other = client.clone();
        client.close();
        other.close();
        drop(client);
        drop(other);

        assert_eq!(pool.destroyed(), 1);
    }

    #[tokio::test]
    async fn closed_client_fails_fast() {
        let transport = MockTransport::new();
        let client = client(transport.clone());
        client.close();
        assert!(client.is_closed());

        let future = client.request(RequestDescriptor::get("http://example.com".parse().unwrap()));
        assert!(future.is_done());
        assert!(matches!(future.await, Err(Error::Closed)));
        assert_eq!(transport.connections(), 0);
    }
}
