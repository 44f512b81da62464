//! A transport full of scripted behavior, suitable for testing the client
//! without a network.
//!
//! Mock channels echo the request body back with a `200 OK`. Responses can be
//! held back behind a gate, which lets tests keep requests in flight for as long
//! as they need.

use std::future::ready;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::header::{HeaderValue, CONNECTION};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::trace;

use super::{BoxFuture, Channel, Response};
use crate::client::pool::ConnectionKey;
use crate::BoxError;

/// An error that can occur when connecting or sending on a mock transport.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("connection error")]
pub struct MockConnectionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportMode {
    Connect,
    Refuse,
    Hang,
}

#[derive(Debug)]
struct MockState {
    mode: TransportMode,
    keep_alive: AtomicBool,
    fail_requests: AtomicBool,
    gated: AtomicBool,
    gate: Semaphore,
    connections: AtomicUsize,
    requests: AtomicUsize,
}

impl MockState {
    fn new(mode: TransportMode) -> Self {
        Self {
            mode,
            keep_alive: AtomicBool::new(true),
            fail_requests: AtomicBool::new(false),
            gated: AtomicBool::new(false),
            gate: Semaphore::new(0),
            connections: AtomicUsize::new(0),
            requests: AtomicUsize::new(0),
        }
    }
}

/// A mock transport that can be used to test connection behavior.
///
/// Clones share all of their state: configuring one clone configures every
/// other clone, and the channels they opened.
#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Arc<MockState>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    fn with_mode(mode: TransportMode) -> Self {
        Self {
            state: Arc::new(MockState::new(mode)),
        }
    }

    /// Transport which connects immediately, and answers with keep-alive responses.
    pub fn new() -> Self {
        Self::with_mode(TransportMode::Connect)
    }

    /// Transport which refuses every connection attempt.
    pub fn refusing() -> Self {
        Self::with_mode(TransportMode::Refuse)
    }

    /// Transport whose connection attempts never complete.
    pub fn hanging() -> Self {
        Self::with_mode(TransportMode::Hang)
    }

    /// Answer every request with `Connection: close`.
    pub fn closing(self) -> Self {
        self.state.keep_alive.store(false, Ordering::SeqCst);
        self
    }

    /// Fail every request after the connection is established.
    pub fn failing_requests(self) -> Self {
        self.state.fail_requests.store(true, Ordering::SeqCst);
        self
    }

    /// Hold every response until [`MockTransport::release`] lets it through.
    pub fn gated(self) -> Self {
        self.state.gated.store(true, Ordering::SeqCst);
        self
    }

    /// Let `n` gated responses through.
    pub fn release(&self, n: usize) {
        self.state.gate.add_permits(n);
    }

    /// Number of connections opened so far.
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Number of requests received so far, including those still held at the gate.
    pub fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }
}

impl tower::Service<ConnectionKey> for MockTransport {
    type Response = MockChannel;

    type Error = MockConnectionError;

    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, key: ConnectionKey) -> Self::Future {
        match self.state.mode {
            TransportMode::Connect => {
                self.state.connections.fetch_add(1, Ordering::SeqCst);
                trace!(%key, "mock connection opened");
                Box::pin(ready(Ok(MockChannel::from_state(self.state.clone()))))
            }
            TransportMode::Refuse => Box::pin(ready(Err(MockConnectionError))),
            TransportMode::Hang => Box::pin(std::future::pending()),
        }
    }
}

/// A channel produced by [`MockTransport`].
#[derive(Debug)]
pub struct MockChannel {
    open: Arc<AtomicBool>,
    state: Arc<MockState>,
}

impl MockChannel {
    fn from_state(state: Arc<MockState>) -> Self {
        Self {
            open: Arc::new(AtomicBool::new(true)),
            state,
        }
    }

    /// A standalone channel which answers every request immediately.
    pub fn new() -> Self {
        Self::from_state(Arc::new(MockState::new(TransportMode::Connect)))
    }

    /// A standalone channel which fails every request.
    pub fn failing() -> Self {
        let state = MockState::new(TransportMode::Connect);
        state.fail_requests.store(true, Ordering::SeqCst);
        Self::from_state(Arc::new(state))
    }

    /// Close the channel, as if the server had hung up.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

impl Default for MockChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Channel for MockChannel {
    fn send_request(
        &mut self,
        request: http::Request<Bytes>,
    ) -> BoxFuture<'_, Result<Response, BoxError>> {
        Box::pin(async move {
            self.state.requests.fetch_add(1, Ordering::SeqCst);

            if self.state.gated.load(Ordering::SeqCst) {
                self.state.gate.acquire().await?.forget();
            }

            if self.state.fail_requests.load(Ordering::SeqCst) {
                self.close();
                return Err(MockConnectionError.into());
            }

            let connection = if self.state.keep_alive.load(Ordering::SeqCst) {
                HeaderValue::from_static("keep-alive")
            } else {
                self.close();
                HeaderValue::from_static("close")
            };

            let response = http::Response::builder()
                .status(http::StatusCode::OK)
                .header(CONNECTION, connection)
                .body(request.into_body())?;
            Ok(response)
        })
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
