//! Transport channels for talking to remote servers.
//!
//! A [`Transport`] opens a new [`Channel`] to the host identified by a
//! [`ConnectionKey`]. A channel carries one request at a time, and produces the
//! fully buffered response. Encoding requests onto the wire, TLS and name
//! resolution are all the business of the transport.
//!
//! Any [`tower::Service`] which accepts a [`ConnectionKey`] and produces a
//! [`Channel`] is a transport.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use http::header::{HeaderValue, CONNECTION};
use tower::ServiceExt as _;

use super::pool::ConnectionKey;
use crate::BoxError;

#[cfg(any(test, feature = "mocks"))]
pub mod mock;
pub mod tcp;

pub use self::tcp::{HttpChannel, TcpTransport, TcpTransportConfig};

/// A boxed, sendable future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A fully buffered HTTP response.
pub type Response = http::Response<Bytes>;

/// An open connection to a remote host.
pub trait Channel: Send + 'static {
    /// Write a request, and resolve once the full response has been read.
    fn send_request(
        &mut self,
        request: http::Request<Bytes>,
    ) -> BoxFuture<'_, Result<Response, BoxError>>;

    /// Whether the channel can still carry requests.
    fn is_open(&self) -> bool;
}

/// Opens new channels.
pub trait Transport: Send + Sync + 'static {
    /// Open a channel to the host identified by `key`.
    fn connect(
        &self,
        key: &ConnectionKey,
    ) -> BoxFuture<'static, Result<Box<dyn Channel>, BoxError>>;
}

impl fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

impl<S> Transport for S
where
    S: tower::Service<ConnectionKey> + Clone + Send + Sync + 'static,
    S::Response: Channel,
    S::Error: Into<BoxError>,
    S::Future: Send + 'static,
{
    fn connect(
        &self,
        key: &ConnectionKey,
    ) -> BoxFuture<'static, Result<Box<dyn Channel>, BoxError>> {
        let service = self.clone();
        let key = key.clone();
        Box::pin(async move {
            let channel = service.oneshot(key).await.map_err(Into::into)?;
            Ok(Box::new(channel) as Box<dyn Channel>)
        })
    }
}

fn has_token(value: &HeaderValue, token: &str) -> bool {
    value
        .to_str()
        .map(|value| {
            value
                .split(',')
                .any(|part| part.trim().eq_ignore_ascii_case(token))
        })
        .unwrap_or(false)
}

/// Whether the server intends to keep the connection open after this response.
///
/// HTTP/1.1 connections persist unless the response says `Connection: close`;
/// HTTP/1.0 connections only persist with an explicit `Connection: keep-alive`.
pub fn is_persistent(response: &Response) -> bool {
    let headers = response.headers().get_all(CONNECTION);
    if headers.iter().any(|value| has_token(value, "close")) {
        return false;
    }

    match response.version() {
        http::Version::HTTP_09 | http::Version::HTTP_10 => {
            headers.iter().any(|value| has_token(value, "keep-alive"))
        }
        _ => true,
    }
}
