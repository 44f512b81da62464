//! The request engine.
//!
//! An [`Exchange`] drives one request from admission to completion:
//!
//! 1. Admitting: claim an idle connection from the pool, or a permit for a new
//!    one. This happens synchronously in [`Client::execute`][super::Client::execute].
//! 2. Connecting: open a channel with the transport, bounded by the connection
//!    timeout.
//! 3. Sending: write the request and wait for the full response, bounded by the
//!    request timeout.
//! 4. Completing: return the connection to the pool or destroy it, call the
//!    completion handler, and resolve the future.
//!
//! Cancellation is observed at every suspension point. A cancelled exchange
//! drops whatever connection it holds, which destroys it and releases its
//! permit.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderValue, CONNECTION, USER_AGENT};
use tracing::{debug, trace};

use super::admission::{AdmissionController, AdmissionError, Permit};
use super::conn::{is_persistent, Response, Transport};
use super::config::ClientConfig;
use super::error::{Error, TimeoutKind};
use super::future::{Completion, Resolver};
use super::handler::CompletionHandler;
use super::pool::{ConnectionKey, PooledConnection};
use super::request::RequestDescriptor;

/// Everything a request needs from its client.
#[derive(Debug)]
pub(crate) struct ClientContext {
    pub(crate) config: ClientConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) admission: AdmissionController,
}

impl ClientContext {
    pub(crate) fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let admission = AdmissionController::new(config.limits());
        Self {
            config,
            transport,
            admission,
        }
    }

    /// Claim a connection for `key`: an idle one from the pool, or a permit to
    /// open a new one.
    pub(crate) fn checkout(&self, key: &ConnectionKey) -> Result<Checkout, AdmissionError> {
        if let Some(connection) = self.config.pool.get_connection(key) {
            debug!(id = %connection.id(), "reusing pooled connection");
            return Ok(Checkout::Reused(connection));
        }

        let permit = self.admission.try_acquire(key)?;
        debug!("admitted new connection");
        Ok(Checkout::Admitted(permit))
    }

    /// Set the headers the client adds to every request.
    fn prepare(&self, request: RequestDescriptor) -> http::Request<Bytes> {
        let mut request = request.into_request();
        let headers = request.headers_mut();

        if !self.config.keep_alive {
            headers.insert(CONNECTION, HeaderValue::from_static("close"));
        }

        if let Some(agent) = &self.config.user_agent {
            if !headers.contains_key(USER_AGENT) {
                headers.insert(USER_AGENT, agent.clone());
            }
        }

        request
    }

    /// Offer a connection back to the pool after a complete response, or
    /// destroy it.
    fn recycle(&self, connection: PooledConnection, response: &Response) {
        let pool = &self.config.pool;

        if !self.config.keep_alive {
            debug!(id = %connection.id(), "keep-alive disabled, destroying connection");
            return;
        }

        if !is_persistent(response) || !connection.is_open() {
            debug!(id = %connection.id(), "connection not persistent, destroying");
            return;
        }

        if !pool.can_cache_connection() {
            debug!(id = %connection.id(), "pool not caching, destroying connection");
            return;
        }

        let key = connection.key().clone();
        match pool.add_connection(&key, connection) {
            Ok(()) => trace!("connection returned to pool"),
            Err(connection) => {
                debug!(id = %connection.id(), "pool declined connection, destroying");
            }
        }
    }
}

/// How a request got hold of its connection.
#[derive(Debug)]
pub(crate) enum Checkout {
    /// An idle connection claimed from the pool.
    Reused(PooledConnection),

    /// Permission to open a new connection.
    Admitted(Permit),
}

/// Progress of an exchange, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    Admitted,
    Connecting,
    Sending,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Admitted => f.write_str("admitted"),
            Stage::Connecting => f.write_str("connecting"),
            Stage::Sending => f.write_str("sending"),
        }
    }
}

/// One request, from checkout until its future resolves.
///
/// An exchange dropped before it resolves its future, for example because the
/// runtime shut down, resolves it as cancelled.
pub(crate) struct Exchange<H: CompletionHandler> {
    context: Arc<ClientContext>,
    key: ConnectionKey,
    request: http::Request<Bytes>,
    connection_timeout: Duration,
    request_timeout: Duration,
    checkout: Checkout,
    handler: H,
    completion: Resolver<H::Output>,
}

impl<H: CompletionHandler> fmt::Debug for Exchange<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("key", &self.key)
            .field("checkout", &self.checkout)
            .finish()
    }
}

impl<H: CompletionHandler> Exchange<H> {
    pub(crate) fn new(
        context: Arc<ClientContext>,
        key: ConnectionKey,
        request: RequestDescriptor,
        checkout: Checkout,
        handler: H,
        completion: Arc<Completion<H::Output>>,
    ) -> Self {
        let connection_timeout = request
            .connection_timeout()
            .unwrap_or(context.config.connection_timeout);
        let request_timeout = request
            .request_timeout()
            .unwrap_or(context.config.request_timeout);
        let request = context.prepare(request);

        Self {
            context,
            key,
            request,
            connection_timeout,
            request_timeout,
            checkout,
            handler,
            completion: Resolver::new(completion),
        }
    }

    /// Drive the request to completion, and resolve its future.
    pub(crate) async fn run(self) {
        let Exchange {
            context,
            key,
            request,
            connection_timeout,
            request_timeout,
            checkout,
            mut handler,
            completion,
        } = self;

        let token = completion.token().clone();
        let mut stage = Stage::Admitted;

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            outcome = exchange(
                &context,
                &key,
                request,
                checkout,
                (connection_timeout, request_timeout),
                &mut stage,
            ) => Some(outcome),
        };

        match outcome {
            None => {
                debug!(%stage, "request cancelled");
                completion.cancel();
            }
            Some(Ok((response, connection))) => {
                if !completion.begin() {
                    debug!(id = %connection.id(), "request cancelled, discarding response");
                    return;
                }

                trace!(status = %response.status(), "response received");
                context.recycle(connection, &response);

                let outcome = handler.on_completed(response).map_err(Error::handler);
                if let Err(error) = &outcome {
                    handler.on_throwable(error);
                }
                completion.finish(outcome);
            }
            Some(Err(error)) => {
                debug!(%stage, %error, "request failed");
                handler.on_throwable(&error);
                completion.finish(Err(error));
            }
        }
    }
}

async fn exchange(
    context: &ClientContext,
    key: &ConnectionKey,
    request: http::Request<Bytes>,
    checkout: Checkout,
    (connection_timeout, request_timeout): (Duration, Duration),
    stage: &mut Stage,
) -> Result<(Response, PooledConnection), Error> {
    let (mut connection, reused) = match checkout {
        Checkout::Reused(connection) => (connection, true),
        Checkout::Admitted(permit) => {
            *stage = Stage::Connecting;
            let connecting = context.transport.connect(key);
            let channel = match tokio::time::timeout(connection_timeout, connecting).await {
                Ok(Ok(channel)) => channel,
                Ok(Err(error)) => return Err(Error::transport(error)),
                Err(_) => return Err(Error::Timeout(TimeoutKind::Connect)),
            };

            let connection = PooledConnection::new(channel, permit);
            debug!(id = %connection.id(), "connected");
            (connection, false)
        }
    };

    *stage = Stage::Sending;
    let outcome = tokio::time::timeout(request_timeout, connection.send_request(request)).await;
    match outcome {
        Ok(Ok(response)) => Ok((response, connection)),
        Ok(Err(error)) => {
            if reused && context.config.pool.remove_all_connections(key) {
                debug!("flushed pooled connections after a reused connection failed");
            }
            Err(Error::transport(error))
        }
        Err(_) => Err(Error::Timeout(TimeoutKind::Request)),
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::client::conn::mock::MockTransport;
    use crate::client::future::Status;
    use crate::client::handler::ResponseHandler;
    use crate::client::pool::mock::{AcceptingPool, RejectingPool};
    use crate::client::pool::{ConnectionPool, IdlePool};

    fn context(transport: MockTransport, config: ClientConfig) -> Arc<ClientContext> {
        Arc::new(ClientContext::new(config, Arc::new(transport)))
    }

    fn key() -> ConnectionKey {
        ConnectionKey::new("localhost", 80, false)
    }

    fn request() -> RequestDescriptor {
        RequestDescriptor::get("http://localhost/".parse().unwrap())
    }

    async fn run(
        context: &Arc<ClientContext>,
        request: RequestDescriptor,
    ) -> (Status, Result<Response, Error>) {
        let checkout = context.checkout(&key()).unwrap();
        let completion = Completion::new(CancellationToken::new());
        Exchange::new(
            context.clone(),
            key(),
            request,
            checkout,
            ResponseHandler,
            completion.clone(),
        )
        .run()
        .await;

        let future = crate::client::future::ResponseFuture::new(completion);
        (future.status(), future.await)
    }

    #[tokio::test]
    async fn prepared_headers() {
        let _ = tracing_subscriber::fmt::try_init();

        let mut config = ClientConfig::default();
        config.keep_alive = false;
        let context = context(MockTransport::new(), config);

        let prepared = context.prepare(request());
        assert_eq!(prepared.headers()[CONNECTION], "close");
        assert!(prepared.headers()[USER_AGENT]
            .to_str()
            .unwrap()
            .starts_with("hyperpool/"));

        let mut custom = request();
        custom
            .request_mut()
            .headers_mut()
            .insert(USER_AGENT, HeaderValue::from_static("custom"));
        let prepared = context.prepare(custom);
        assert_eq!(prepared.headers()[USER_AGENT], "custom");
    }

    #[tokio::test]
    async fn connection_returns_to_pool() {
        let pool = Arc::new(IdlePool::default());
        let config = ClientConfig {
            pool: pool.clone(),
            ..Default::default()
        };
        let transport = MockTransport::new();
        let context = context(transport.clone(), config);

        let (status, response) = run(&context, request()).await;
        assert_eq!(status, Status::Completed);
        assert_eq!(response.unwrap().status(), http::StatusCode::OK);
        assert_eq!(pool.idle_connections(), 1);
        assert_eq!(context.admission.open_connections(), 1);

        let (_, response) = run(&context, request()).await;
        assert!(response.is_ok());
        assert_eq!(transport.connections(), 1);
    }

    #[tokio::test]
    async fn rejected_connection_is_destroyed() {
        let pool = Arc::new(RejectingPool::new());
        let config = ClientConfig {
            pool: pool.clone(),
            ..Default::default()
        };
        let context = context(MockTransport::new(), config);

        let (_, response) = run(&context, request()).await;
        assert!(response.is_ok());
        assert_eq!(pool.offered(), 0);
        assert_eq!(context.admission.open_connections(), 0);
    }

    #[tokio::test]
    async fn close_response_is_not_pooled() {
        let pool = Arc::new(AcceptingPool::new());
        let config = ClientConfig {
            pool: pool.clone(),
            ..Default::default()
        };
        let context = context(MockTransport::new().closing(), config);

        let (_, response) = run(&context, request()).await;
        assert_eq!(response.unwrap().headers()[CONNECTION], "close");
        assert_eq!(pool.accepted(), 0);
        assert_eq!(context.admission.open_connections(), 0);
    }

    #[tokio::test]
    async fn connect_timeout() {
        let context = context(MockTransport::hanging(), ClientConfig::default());
        let slow = request().with_connection_timeout(Duration::from_millis(10));

        let (status, response) = run(&context, slow).await;
        assert_eq!(status, Status::Failed);
        assert!(matches!(
            response.unwrap_err(),
            Error::Timeout(TimeoutKind::Connect)
        ));
        assert_eq!(context.admission.open_connections(), 0);
    }

    #[tokio::test]
    async fn request_timeout() {
        let context = context(MockTransport::new().gated(), ClientConfig::default());
        let slow = request().with_request_timeout(Duration::from_millis(10));

        let (_, response) = run(&context, slow).await;
        assert!(matches!(
            response.unwrap_err(),
            Error::Timeout(TimeoutKind::Request)
        ));
        assert_eq!(context.admission.open_connections(), 0);
    }

    #[tokio::test]
    async fn failed_reuse_flushes_host() {
        let pool = Arc::new(IdlePool::default());
        let config = ClientConfig {
            pool: pool.clone(),
            ..Default::default()
        };
        let context = context(MockTransport::new().failing_requests(), config);

        // Seed the pool with two connections whose requests will fail.
        for _ in 0..2 {
            let permit = context.admission.try_acquire(&key()).unwrap();
            let channel = context.transport.connect(&key()).await.unwrap();
            pool.add_connection(&key(), PooledConnection::new(channel, permit))
                .unwrap();
        }
        assert_eq!(context.admission.open_connections(), 2);

        let (_, response) = run(&context, request()).await;
        assert!(matches!(response.unwrap_err(), Error::Transport(_)));
        assert_eq!(pool.idle_connections(), 0);
        assert_eq!(context.admission.open_connections(), 0);
    }

    #[tokio::test]
    async fn cancelled_exchange_releases_permit() {
        let transport = MockTransport::new().gated();
        let context = context(transport.clone(), ClientConfig::default());

        let checkout = context.checkout(&key()).unwrap();
        let completion = Completion::new(CancellationToken::new());
        let exchange = Exchange::new(
            context.clone(),
            key(),
            request(),
            checkout,
            ResponseHandler,
            completion.clone(),
        );
        let task = tokio::spawn(exchange.run());

        while transport.requests() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(context.admission.open_connections(), 1);

        assert_eq!(completion.cancel(), Status::Pending);
        task.await.unwrap();

        assert_eq!(completion.status(), Status::Cancelled);
        assert_eq!(context.admission.open_connections(), 0);
    }

    #[tokio::test]
    async fn unpolled_exchange_resolves_cancelled() {
        let context = context(MockTransport::new(), ClientConfig::default());

        let checkout = context.checkout(&key()).unwrap();
        let completion = Completion::new(CancellationToken::new());
        let exchange = Exchange::new(
            context.clone(),
            key(),
            request(),
            checkout,
            ResponseHandler,
            completion.clone(),
        );
        assert_eq!(context.admission.open_connections(), 1);

        drop(exchange.run());

        assert_eq!(completion.status(), Status::Cancelled);
        assert!(completion.token().is_cancelled());
        assert_eq!(context.admission.open_connections(), 0);
    }

    #[tokio::test]
    async fn aborted_exchange_resolves_cancelled() {
        let transport = MockTransport::new().gated();
        let context = context(transport.clone(), ClientConfig::default());

        let checkout = context.checkout(&key()).unwrap();
        let completion = Completion::new(CancellationToken::new());
        let exchange = Exchange::new(
            context.clone(),
            key(),
            request(),
            checkout,
            ResponseHandler,
            completion.clone(),
        );
        let task = tokio::spawn(exchange.run());

        while transport.requests() == 0 {
            tokio::task::yield_now().await;
        }

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        let future = crate::client::future::ResponseFuture::new(completion);
        assert_eq!(future.status(), Status::Cancelled);
        assert!(matches!(future.await, Err(Error::Cancelled)));
        assert_eq!(context.admission.open_connections(), 0);
    }
}
