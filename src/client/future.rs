//! The caller's handle on a request in flight.
//!
//! A [`ResponseFuture`] can be awaited, waited on from a blocking thread with
//! [`ResponseFuture::get`] or [`ResponseFuture::get_timeout`], and cancelled
//! from anywhere with [`ResponseFuture::cancel`]. It moves from
//! [`Status::Pending`] to a terminal status exactly once.

use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures_util::task::AtomicWaker;
use parking_lot::{Condvar, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::{Error, TimeoutKind};

/// Where a request is in its lifecycle, as seen from its future.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Status {
    /// The request is still running.
    Pending,

    /// A response arrived and is being handed to the completion handler.
    /// Cancellation is no longer possible.
    Completing,

    /// The request succeeded.
    Completed,

    /// The request failed.
    Failed,

    /// The request was cancelled.
    Cancelled,
}

impl Status {
    /// Whether this status is final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::Cancelled)
    }
}

enum State<T> {
    Pending,
    Completing,
    Done(Result<T, Error>),
    Retrieved(Status),
}

impl<T> State<T> {
    fn status(&self) -> Status {
        match self {
            State::Pending => Status::Pending,
            State::Completing => Status::Completing,
            State::Done(Ok(_)) => Status::Completed,
            State::Done(Err(Error::Cancelled)) => Status::Cancelled,
            State::Done(Err(_)) => Status::Failed,
            State::Retrieved(status) => *status,
        }
    }

    /// Take the outcome, if there is one.
    fn take(&mut self) -> Option<Result<T, Error>> {
        let status = self.status();
        match std::mem::replace(self, State::Retrieved(status)) {
            State::Done(outcome) => Some(outcome),
            State::Retrieved(Status::Cancelled) => Some(Err(Error::Cancelled)),
            State::Retrieved(_) => Some(Err(Error::Retrieved)),
            running => {
                *self = running;
                None
            }
        }
    }
}

/// Completion state shared between a [`ResponseFuture`] and the engine
/// driving its request.
pub(crate) struct Completion<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
    waker: AtomicWaker,
    token: CancellationToken,
}

impl<T> Completion<T> {
    pub(crate) fn new(token: CancellationToken) -> Arc<Self> {
        Arc::new(Self::with_state(State::Pending, token))
    }

    fn with_state(state: State<T>, token: CancellationToken) -> Self {
        Self {
            state: Mutex::new(state),
            ready: Condvar::new(),
            waker: AtomicWaker::new(),
            token,
        }
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn status(&self) -> Status {
        self.state.lock().status()
    }

    /// Claim the request for completion. Returns `false` if it was already
    /// cancelled, in which case the response must be discarded.
    pub(crate) fn begin(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            State::Pending => {
                *state = State::Completing;
                true
            }
            _ => false,
        }
    }

    /// Record the outcome. Returns `false` if the future had already reached a
    /// terminal state.
    pub(crate) fn finish(&self, outcome: Result<T, Error>) -> bool {
        {
            let mut state = self.state.lock();
            match *state {
                State::Pending | State::Completing => *state = State::Done(outcome),
                _ => return false,
            }
        }
        self.notify();
        true
    }

    /// Cancel the request if it is still pending, returning the status it had
    /// before this call.
    pub(crate) fn cancel(&self) -> Status {
        let prior = {
            let mut state = self.state.lock();
            let prior = state.status();
            if let State::Pending = *state {
                *state = State::Done(Err(Error::Cancelled));
            }
            prior
        };

        if prior == Status::Pending {
            self.token.cancel();
            self.notify();
        }
        prior
    }

    /// Resolve as cancelled unless the outcome is already recorded.
    fn abandon(&self) -> bool {
        {
            let mut state = self.state.lock();
            match *state {
                State::Pending | State::Completing => {
                    *state = State::Done(Err(Error::Cancelled))
                }
                _ => return false,
            }
        }
        self.token.cancel();
        self.notify();
        true
    }

    fn notify(&self) {
        self.ready.notify_all();
        self.waker.wake();
    }
}

/// The engine's hold on a [`Completion`].
///
/// Dropping the resolver before an outcome was recorded resolves the request as
/// cancelled, so a request whose task never ran to the end still reaches a
/// terminal state.
pub(crate) struct Resolver<T> {
    completion: Arc<Completion<T>>,
}

impl<T> Resolver<T> {
    pub(crate) fn new(completion: Arc<Completion<T>>) -> Self {
        Self { completion }
    }
}

impl<T> Deref for Resolver<T> {
    type Target = Completion<T>;

    fn deref(&self) -> &Self::Target {
        &self.completion
    }
}

impl<T> Drop for Resolver<T> {
    fn drop(&mut self) {
        if self.completion.abandon() {
            debug!("request abandoned before completion");
        }
    }
}

/// A future which resolves to the outcome of a request.
///
/// Dropping the future does not cancel the request: its completion handler
/// still runs. Use [`ResponseFuture::cancel`] to abandon it.
pub struct ResponseFuture<T> {
    completion: Arc<Completion<T>>,
}

impl<T> fmt::Debug for ResponseFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseFuture")
            .field("status", &self.status())
            .finish()
    }
}

impl<T> ResponseFuture<T> {
    pub(crate) fn new(completion: Arc<Completion<T>>) -> Self {
        Self { completion }
    }

    /// A future which has already failed.
    pub(crate) fn failed(error: Error) -> Self {
        Self {
            completion: Arc::new(Completion::with_state(
                State::Done(Err(error)),
                CancellationToken::new(),
            )),
        }
    }

    /// Block the current thread until the request reaches a terminal state.
    ///
    /// This must not be called from within an async context; `.await` the
    /// future there instead.
    pub fn get(self) -> Result<T, Error> {
        self.wait()
    }

    fn wait(&self) -> Result<T, Error> {
        let mut state = self.completion.state.lock();
        loop {
            if let Some(outcome) = state.take() {
                return outcome;
            }
            self.completion.ready.wait(&mut state);
        }
    }

    /// Block for at most `timeout` waiting for the outcome.
    ///
    /// Fails with [`TimeoutKind::Wait`] if the request is still running when the
    /// time is up. The request is not affected, and a later call observes its
    /// eventual outcome.
    pub fn get_timeout(&self, timeout: Duration) -> Result<T, Error> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return self.wait();
        };

        let mut state = self.completion.state.lock();
        loop {
            if let Some(outcome) = state.take() {
                return outcome;
            }
            if self
                .completion
                .ready
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.take().unwrap_or(Err(Error::Timeout(TimeoutKind::Wait)));
            }
        }
    }

    /// Cancel the request.
    ///
    /// Returns the status the future had before this call. Only a
    /// [`Status::Pending`] request is cancelled; cancelling in any other state
    /// has no effect, so calling this repeatedly is harmless.
    pub fn cancel(&self) -> Status {
        self.completion.cancel()
    }

    /// The current status of the request.
    pub fn status(&self) -> Status {
        self.completion.status()
    }

    /// Whether the request has reached a terminal state.
    pub fn is_done(&self) -> bool {
        self.status().is_terminal()
    }
}

impl<T> Future for ResponseFuture<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.completion.waker.register(cx.waker());
        match self.completion.state.lock().take() {
            Some(outcome) => Poll::Ready(outcome),
            None => Poll::Pending,
        }
    }
}
