use std::time::{Duration, Instant};

use tracing::trace;

use super::{ConnectionId, PooledConnection};

#[derive(Debug)]
struct Idle {
    at: Instant,
    inner: PooledConnection,
}

impl Idle {
    fn new(inner: PooledConnection) -> Self {
        Self {
            at: Instant::now(),
            inner,
        }
    }
}

/// Idle connections for a single key, oldest first.
///
/// Evicted connections are moved into a caller-provided list instead of being
/// dropped in place, so that the caller can destroy them after releasing any
/// locks it holds.
#[derive(Debug, Default)]
pub(super) struct IdleConnections {
    inner: Vec<Idle>,
}

impl IdleConnections {
    pub(super) fn push(&mut self, inner: PooledConnection) {
        self.inner.push(Idle::new(inner));
    }

    /// Pop the most recently returned connection which is still usable.
    pub(super) fn pop(
        &mut self,
        idle_timeout: Option<Duration>,
        evicted: &mut Vec<PooledConnection>,
    ) -> Option<PooledConnection> {
        let expired = expiry(idle_timeout);
        trace!("checking {} idle connections", self.len());

        while let Some(entry) = self.inner.pop() {
            if expired.is_some_and(|expired| entry.at < expired) {
                // Everything older than an expired entry is expired as well.
                trace!("found expired connection");
                evicted.push(entry.inner);
                evicted.extend(self.inner.drain(..).map(|idle| idle.inner));
                return None;
            }

            if entry.inner.is_open() {
                trace!(id = %entry.inner.id(), "found idle connection");
                return Some(entry.inner);
            }

            trace!(id = %entry.inner.id(), "found closed connection");
            evicted.push(entry.inner);
        }

        None
    }

    /// Move expired and closed connections into `evicted`.
    pub(super) fn evict(
        &mut self,
        idle_timeout: Option<Duration>,
        evicted: &mut Vec<PooledConnection>,
    ) {
        let expired = expiry(idle_timeout);
        let (keep, stale): (Vec<_>, Vec<_>) = self.inner.drain(..).partition(|entry| {
            entry.inner.is_open() && !expired.is_some_and(|expired| entry.at < expired)
        });
        self.inner = keep;
        evicted.extend(stale.into_iter().map(|idle| idle.inner));
    }

    pub(super) fn remove(&mut self, id: ConnectionId) -> Option<PooledConnection> {
        let position = self.inner.iter().position(|entry| entry.inner.id() == id)?;
        Some(self.inner.remove(position).inner)
    }

    pub(super) fn drain(&mut self) -> impl Iterator<Item = PooledConnection> + '_ {
        self.inner.drain(..).map(|idle| idle.inner)
    }

    pub(super) fn len(&self) -> usize {
        self.inner.len()
    }

    pub(super) fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

fn expiry(idle_timeout: Option<Duration>) -> Option<Instant> {
    idle_timeout
        .filter(|timeout| !timeout.is_zero())
        .and_then(|timeout| Instant::now().checked_sub(timeout))
}
