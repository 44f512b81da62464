//! Callbacks invoked when a request finishes.
//!
//! Every request carries a [`CompletionHandler`]. The engine calls it from a
//! runtime task, never from the thread which called
//! [`Client::execute`][super::Client::execute]. A cancelled request calls
//! neither method.

use std::fmt;

use super::conn::Response;
use super::error::Error;
use crate::{BoxError, DebugLiteral};

/// Receives the outcome of a request.
pub trait CompletionHandler: Send + 'static {
    /// The value the request's future resolves to on success.
    type Output: Send + 'static;

    /// Called with the full response. An error returned here fails the request
    /// with [`Error::Handler`].
    fn on_completed(&mut self, response: Response) -> Result<Self::Output, BoxError>;

    /// Called when the request fails, including when [`on_completed`] itself
    /// failed.
    ///
    /// [`on_completed`]: CompletionHandler::on_completed
    fn on_throwable(&mut self, error: &Error) {
        let _ = error;
    }
}

/// Handler which passes the response through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct ResponseHandler;

impl CompletionHandler for ResponseHandler {
    type Output = Response;

    fn on_completed(&mut self, response: Response) -> Result<Self::Output, BoxError> {
        Ok(response)
    }
}

/// Handler built from a closure. See [`handler_fn`].
#[derive(Clone)]
pub struct HandlerFn<F> {
    f: F,
}

impl<F> fmt::Debug for HandlerFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HandlerFn")
            .field(&DebugLiteral("<closure>"))
            .finish()
    }
}

/// Build a [`CompletionHandler`] which maps the response with `f`.
pub fn handler_fn<F, T, E>(f: F) -> HandlerFn<F>
where
    F: FnMut(Response) -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Into<BoxError>,
{
    HandlerFn { f }
}

impl<F, T, E> CompletionHandler for HandlerFn<F>
where
    F: FnMut(Response) -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Into<BoxError>,
{
    type Output = T;

    fn on_completed(&mut self, response: Response) -> Result<Self::Output, BoxError> {
        (self.f)(response).map_err(Into::into)
    }
}
