//! Requests as submitted to the client.

use std::time::Duration;

use bytes::Bytes;

use super::pool::{ConnectionKey, UriError};

/// A request, together with the timeouts which should apply to it.
///
/// Timeouts left unset fall back to the client configuration. Once handed to
/// [`Client::execute`][super::Client::execute] the descriptor is owned by the
/// request engine and cannot change.
#[derive(Debug)]
pub struct RequestDescriptor {
    request: http::Request<Bytes>,
    connection_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
}

impl RequestDescriptor {
    /// Wrap a fully formed request.
    pub fn new(request: http::Request<Bytes>) -> Self {
        Self {
            request,
            connection_timeout: None,
            request_timeout: None,
        }
    }

    /// A `GET` request with an empty body.
    pub fn get(uri: http::Uri) -> Self {
        Self::with_method(http::Method::GET, uri, Bytes::new())
    }

    /// A `POST` request carrying `body`.
    pub fn post(uri: http::Uri, body: impl Into<Bytes>) -> Self {
        Self::with_method(http::Method::POST, uri, body.into())
    }

    fn with_method(method: http::Method, uri: http::Uri, body: Bytes) -> Self {
        let mut request = http::Request::new(body);
        *request.method_mut() = method;
        *request.uri_mut() = uri;
        Self::new(request)
    }

    /// Override the connection timeout for this request.
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = Some(timeout);
        self
    }

    /// Override the request timeout for this request.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Target of the request.
    pub fn uri(&self) -> &http::Uri {
        self.request.uri()
    }

    /// Method of the request.
    pub fn method(&self) -> &http::Method {
        self.request.method()
    }

    /// The per-request connection timeout, if one was set.
    pub fn connection_timeout(&self) -> Option<Duration> {
        self.connection_timeout
    }

    /// The per-request request timeout, if one was set.
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    pub(crate) fn key(&self) -> Result<ConnectionKey, UriError> {
        ConnectionKey::try_from(self.request.uri())
    }

    /// Mutable access to the request, to add headers before submitting it.
    pub fn request_mut(&mut self) -> &mut http::Request<Bytes> {
        &mut self.request
    }

    pub(crate) fn into_request(self) -> http::Request<Bytes> {
        self.request
    }
}

impl From<http::Request<Bytes>> for RequestDescriptor {
    fn from(request: http::Request<Bytes>) -> Self {
        Self::new(request)
    }
}
