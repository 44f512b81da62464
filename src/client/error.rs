use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error;

use super::admission::AdmissionError;
use super::pool::UriError;
use crate::BoxError;

/// A shared error source, so that [`Error`] can be cloned.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Which deadline expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum TimeoutKind {
    /// Opening a new connection took longer than the connection timeout.
    Connect,

    /// Sending the request and receiving the response took longer than the
    /// request timeout.
    Request,

    /// A caller stopped waiting on a [`ResponseFuture`][super::ResponseFuture]
    /// before it resolved. The request itself is unaffected.
    Wait,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutKind::Connect => f.write_str("connection"),
            TimeoutKind::Request => f.write_str("request"),
            TimeoutKind::Wait => f.write_str("wait"),
        }
    }
}

/// Client error type.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum Error {
    /// No connection could be opened without exceeding the connection limits.
    ///
    /// Displays exactly as `Too many connections`.
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    /// Error occured with the underlying transport, while connecting or
    /// exchanging the request.
    #[error("transport: {0}")]
    Transport(#[source] SharedError),

    /// A deadline expired.
    #[error("{0} timeout")]
    Timeout(TimeoutKind),

    /// The request was cancelled before it completed.
    #[error("request cancelled")]
    Cancelled,

    /// The client has been closed, and accepts no new requests.
    #[error("client closed")]
    Closed,

    /// The request URI does not identify a host this client can connect to.
    #[error("invalid uri: {0}")]
    InvalidUri(#[source] SharedError),

    /// The completion handler rejected the response.
    #[error("handler: {0}")]
    Handler(#[source] SharedError),

    /// The outcome of this request was already taken from its future.
    #[error("response already retrieved")]
    Retrieved,
}

impl Error {
    pub(crate) fn transport(error: impl Into<BoxError>) -> Self {
        Error::Transport(Arc::from(error.into()))
    }

    pub(crate) fn handler(error: impl Into<BoxError>) -> Self {
        Error::Handler(Arc::from(error.into()))
    }

    /// Whether this error was raised because the connection limits were reached.
    pub fn is_admission(&self) -> bool {
        matches!(self, Error::Admission(_))
    }

    /// Whether this error was raised because a deadline expired.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    /// Whether this error was raised because the request was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

impl From<UriError> for Error {
    fn from(error: UriError) -> Self {
        Error::InvalidUri(Arc::new(error))
    }
}

impl From<Error> for io::Error {
    fn from(error: Error) -> Self {
        let kind = match &error {
            Error::Timeout(_) => io::ErrorKind::TimedOut,
            Error::Cancelled => io::ErrorKind::Interrupted,
            Error::Closed => io::ErrorKind::NotConnected,
            Error::InvalidUri(_) => io::ErrorKind::InvalidInput,
            Error::Transport(source) => source
                .downcast_ref::<io::Error>()
                .map(io::Error::kind)
                .unwrap_or(io::ErrorKind::Other),
            _ => io::ErrorKind::Other,
        };

        io::Error::new(kind, error)
    }
}
