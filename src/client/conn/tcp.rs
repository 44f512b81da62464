//! TCP transport implementation for client connections.
//!
//! This module contains the [`TcpTransport`] type, which is a [`tower::Service`] that connects to
//! remote hosts using TCP and speaks HTTP/1.1 over the connection with [`hyper`]. It also contains
//! the [`TcpTransportConfig`] type, which is used to configure TCP connections.
//!
//! Secure keys are refused: this transport does not perform TLS handshakes.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{FuturesUnordered, StreamExt as _};
use http::header::{HeaderValue, HOST};
use http_body_util::{BodyExt as _, Full};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, trace, warn, Instrument};

use super::{BoxFuture, Channel, Response};
use crate::client::pool::ConnectionKey;
use crate::BoxError;

/// Error returned when a TCP connection cannot be established.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TcpConnectionError {
    /// The host name could not be resolved.
    #[error("resolving {0}")]
    Resolve(ConnectionKey, #[source] io::Error),

    /// The host name resolved to no addresses.
    #[error("no addresses found for {0}")]
    NoAddresses(ConnectionKey),

    /// Every resolved address refused the connection.
    #[error("connecting to {0}")]
    Connect(ConnectionKey, #[source] io::Error),

    /// The HTTP/1.1 handshake failed.
    #[error("handshake with {0}")]
    Handshake(ConnectionKey, #[source] hyper::Error),

    /// The key requires TLS, which this transport does not provide.
    #[error("tls is not supported by the tcp transport: {0}")]
    TlsUnsupported(ConnectionKey),
}

/// Configuration for TCP connections.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct TcpTransportConfig {
    /// Set `TCP_NODELAY` on new connections.
    pub nodelay: bool,

    /// Enable TCP keepalive probes after this much idle time.
    pub keep_alive_timeout: Option<Duration>,

    /// How long to wait on a connection attempt before racing the next
    /// resolved address against it. `None` tries one address at a time.
    pub happy_eyeballs_delay: Option<Duration>,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            nodelay: true,
            keep_alive_timeout: Some(Duration::from_secs(90)),
            happy_eyeballs_delay: Some(Duration::from_millis(300)),
        }
    }
}

/// A TCP connector for client connections.
///
/// Resolves the key's host with the system resolver and connects to the
/// resolved addresses in order. An attempt which has not finished after
/// [`TcpTransportConfig::happy_eyeballs_delay`] is raced against the next
/// address. The first connection to succeed gets an HTTP/1.1 handshake.
/// Connection timeouts are applied by the client, not here.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    config: Arc<TcpTransportConfig>,
}

impl TcpTransport {
    /// Create a transport with the given configuration.
    pub fn new(config: TcpTransportConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// The TCP configuration used by this transport.
    pub fn config(&self) -> &TcpTransportConfig {
        &self.config
    }
}

impl tower::Service<ConnectionKey> for TcpTransport {
    type Response = HttpChannel;

    type Error = TcpConnectionError;

    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, key: ConnectionKey) -> Self::Future {
        let config = self.config.clone();
        let span = tracing::debug_span!("tcp", %key);
        Box::pin(
            async move {
                if key.is_secure() {
                    return Err(TcpConnectionError::TlsUnsupported(key));
                }

                let stream = connect(&key, &config).await?;
                let (sender, connection) = http1::handshake(TokioIo::new(stream))
                    .await
                    .map_err(|error| TcpConnectionError::Handshake(key.clone(), error))?;

                tokio::spawn(
                    async move {
                        if let Err(error) = connection.await {
                            debug!(%error, "connection closed with error");
                        } else {
                            trace!("connection closed");
                        }
                    }
                    .in_current_span(),
                );

                Ok(HttpChannel { sender })
            }
            .instrument(span),
        )
    }
}

async fn connect(
    key: &ConnectionKey,
    config: &TcpTransportConfig,
) -> Result<TcpStream, TcpConnectionError> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((key.host(), key.port()))
        .await
        .map_err(|error| TcpConnectionError::Resolve(key.clone(), error))?
        .collect();

    match race(addrs, config.happy_eyeballs_delay).await {
        Ok(stream) => {
            configure(&stream, config);
            Ok(stream)
        }
        Err(Some(error)) => Err(TcpConnectionError::Connect(key.clone(), error)),
        Err(None) => Err(TcpConnectionError::NoAddresses(key.clone())),
    }
}

/// Connect to the first address that accepts, starting a new attempt whenever
/// the running ones have made no progress for `delay`.
///
/// Fails with the last connection error, or `None` if there were no addresses.
async fn race(
    addrs: Vec<SocketAddr>,
    delay: Option<Duration>,
) -> Result<TcpStream, Option<io::Error>> {
    let mut pending = addrs.into_iter();
    let mut attempts = FuturesUnordered::new();
    let mut last_error = None;

    loop {
        if attempts.is_empty() {
            match pending.next() {
                Some(addr) => attempts.push(attempt(addr)),
                None => return Err(last_error),
            }
        }

        let next = match delay {
            Some(delay) if !pending.as_slice().is_empty() => {
                tokio::time::timeout(delay, attempts.next()).await.ok()
            }
            _ => Some(attempts.next().await),
        };

        match next {
            Some(Some(Ok(stream))) => return Ok(stream),
            Some(Some(Err(error))) => last_error = Some(error),
            Some(None) => {}
            None => {
                if let Some(addr) = pending.next() {
                    trace!(remote.addr = %addr, "starting another connection attempt");
                    attempts.push(attempt(addr));
                }
            }
        }
    }
}

async fn attempt(addr: SocketAddr) -> io::Result<TcpStream> {
    match TcpStream::connect(addr).await {
        Ok(stream) => {
            trace!(remote.addr = %addr, "tcp connected");
            Ok(stream)
        }
        Err(error) => {
            trace!(remote.addr = %addr, %error, "tcp connect failed");
            Err(error)
        }
    }
}

fn configure(stream: &TcpStream, config: &TcpTransportConfig) {
    if let Err(e) = stream.set_nodelay(config.nodelay) {
        warn!("tcp set_nodelay error: {}", e);
    }

    if let Some(dur) = config.keep_alive_timeout {
        let keepalive = socket2::TcpKeepalive::new().with_time(dur);
        if let Err(e) = socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive) {
            warn!("tcp set_keepalive error: {}", e);
        }
    }
}

/// An HTTP/1.1 channel over a single TCP connection.
pub struct HttpChannel {
    sender: http1::SendRequest<Full<Bytes>>,
}

impl fmt::Debug for HttpChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpChannel")
            .field("open", &!self.sender.is_closed())
            .finish()
    }
}

/// Rewrite an absolute request target into origin form, moving the authority
/// into the `Host` header.
fn origin_form(mut request: http::Request<Bytes>) -> Result<http::Request<Bytes>, BoxError> {
    let mut parts = request.uri().clone().into_parts();

    if let Some(authority) = parts.authority.take() {
        if !request.headers().contains_key(HOST) {
            let host = HeaderValue::from_str(authority.as_str())?;
            request.headers_mut().insert(HOST, host);
        }
    }

    parts.scheme = None;
    if parts.path_and_query.is_none() {
        parts.path_and_query = Some(http::uri::PathAndQuery::from_static("/"));
    }
    *request.uri_mut() = http::Uri::from_parts(parts)?;

    Ok(request)
}

impl Channel for HttpChannel {
    fn send_request(
        &mut self,
        request: http::Request<Bytes>,
    ) -> BoxFuture<'_, Result<Response, BoxError>> {
        Box::pin(async move {
            self.sender.ready().await?;

            let request = origin_form(request)?.map(Full::new);
            let response = self.sender.send_request(request).await?;

            let (parts, body) = response.into_parts();
            let body = body.collect().await?.to_bytes();
            Ok(http::Response::from_parts(parts, body))
        })
    }

    fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }
}
