//! Hyperpool
//!
//! An asynchronous HTTP client which reuses connections through a pluggable
//! pool, and enforces hard limits on the number of connections it keeps open.
//!
//! Requests are dispatched with [`Client::execute`], which never blocks the
//! calling thread. The returned [`ResponseFuture`][client::ResponseFuture] can be
//! awaited, or waited on from synchronous code with a timeout, and cancelled.

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

use std::fmt;

pub mod client;
pub use client::Client;

/// Boxed error type used at the transport boundary.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub(crate) struct DebugLiteral<T: fmt::Display>(T);

impl<T: fmt::Display> fmt::Debug for DebugLiteral<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
