//! Admission control for new connections.
//!
//! The [`AdmissionController`] tracks how many connections are open in total and
//! for each [`ConnectionKey`], and hands out a [`Permit`] for every new connection
//! which fits within the configured [`Limits`]. Permits release their capacity
//! when dropped, so a connection holds on to its permit for as long as it exists,
//! including while it sits idle in a pool.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace};

use super::pool::ConnectionKey;

/// Too many connections are already open to admit a new one.
///
/// The message is always exactly `Too many connections`, whichever limit
/// was reached.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Too many connections")]
#[non_exhaustive]
pub struct AdmissionError;

/// Connection limits enforced by an [`AdmissionController`].
///
/// `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct Limits {
    /// Maximum number of connections open across all hosts.
    pub max_total: Option<usize>,

    /// Maximum number of connections open to a single [`ConnectionKey`].
    pub max_per_host: Option<usize>,
}

impl Limits {
    /// Create limits for a total and an optional per-host cap.
    pub fn new(max_total: Option<usize>, max_per_host: Option<usize>) -> Self {
        Self {
            max_total,
            max_per_host,
        }
    }

    /// No limits at all.
    pub fn unlimited() -> Self {
        Self::default()
    }
}

#[derive(Debug, Default)]
struct AdmissionState {
    total: usize,
    by_key: HashMap<ConnectionKey, usize>,
}

#[derive(Debug)]
struct AdmissionInner {
    limits: Limits,
    state: Mutex<AdmissionState>,
}

impl AdmissionInner {
    fn release(&self, key: &ConnectionKey) {
        let mut state = self.state.lock();
        debug_assert!(state.total > 0, "released more permits than were granted");
        state.total = state.total.saturating_sub(1);

        let remove = match state.by_key.get_mut(key) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => false,
        };

        if remove {
            state.by_key.remove(key);
        }

        trace!(%key, total = state.total, "connection permit released");
    }
}

/// Tracks open connections and grants permits for new ones.
///
/// Cloning the controller shares the underlying counters.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    inner: Arc<AdmissionInner>,
}

impl AdmissionController {
    /// Create a controller which enforces the given limits.
    pub fn new(limits: Limits) -> Self {
        Self {
            inner: Arc::new(AdmissionInner {
                limits,
                state: Mutex::new(AdmissionState::default()),
            }),
        }
    }

    /// The limits enforced by this controller.
    pub fn limits(&self) -> Limits {
        self.inner.limits
    }

    /// Try to reserve capacity for one new connection to `key`.
    ///
    /// The check and the increment happen under a single lock, so two callers
    /// can never both take the last unit of capacity. The total limit is
    /// checked before the per-host limit.
    pub fn try_acquire(&self, key: &ConnectionKey) -> Result<Permit, AdmissionError> {
        let limits = self.inner.limits;
        let mut state = self.inner.state.lock();

        if limits.max_total.is_some_and(|max| state.total >= max) {
            debug!(%key, total = state.total, "total connection limit reached");
            return Err(AdmissionError);
        }

        let for_key = state.by_key.get(key).copied().unwrap_or(0);
        if limits.max_per_host.is_some_and(|max| for_key >= max) {
            debug!(%key, open = for_key, "per-host connection limit reached");
            return Err(AdmissionError);
        }

        state.total += 1;
        *state.by_key.entry(key.clone()).or_default() += 1;
        trace!(%key, total = state.total, "connection permit granted");

        Ok(Permit {
            key: key.clone(),
            controller: self.inner.clone(),
        })
    }

    /// Number of connections currently holding a permit.
    pub fn open_connections(&self) -> usize {
        self.inner.state.lock().total
    }

    /// Number of connections to `key` currently holding a permit.
    pub fn open_for(&self, key: &ConnectionKey) -> usize {
        self.inner
            .state
            .lock()
            .by_key
            .get(key)
            .copied()
            .unwrap_or(0)
    }
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new(Limits::unlimited())
    }
}

/// One unit of open-connection capacity.
///
/// The capacity is returned to the controller exactly once, when the permit
/// is dropped.
pub struct Permit {
    key: ConnectionKey,
    controller: Arc<AdmissionInner>,
}

impl Permit {
    /// The key this permit was granted for.
    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }
}

impl fmt::Debug for Permit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Permit").field(&self.key).finish()
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.controller.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(AdmissionController: Send, Sync, Clone);
    assert_impl_all!(Permit: Send, Sync);
    assert_impl_all!(AdmissionError: std::error::Error, Send, Sync);

    fn key(host: &str) -> ConnectionKey {
        ConnectionKey::new(host, 80, false)
    }

    #[test]
    fn admission_error_message() {
        assert_eq!(AdmissionError.to_string(), "Too many connections");
    }

    #[test]
    fn unlimited_admits_everything() {
        let controller = AdmissionController::default();
        let permits: Vec<_> = (0..100)
            .map(|_| controller.try_acquire(&key("a")).unwrap())
            .collect();
        assert_eq!(controller.open_connections(), 100);
        drop(permits);
        assert_eq!(controller.open_connections(), 0);
    }

    #[test]
    fn total_limit() {
        let controller = AdmissionController::new(Limits::new(Some(2), None));

        let a = controller.try_acquire(&key("a")).unwrap();
        let _b = controller.try_acquire(&key("b")).unwrap();
        assert_eq!(controller.try_acquire(&key("c")).unwrap_err(), AdmissionError);

        drop(a);
        assert_eq!(controller.open_connections(), 1);
        assert!(controller.try_acquire(&key("c")).is_ok());
    }

    #[test]
    fn per_host_limit() {
        let controller = AdmissionController::new(Limits::new(None, Some(1)));

        let a = controller.try_acquire(&key("a")).unwrap();
        assert!(controller.try_acquire(&key("a")).is_err());
        let _b = controller.try_acquire(&key("b")).unwrap();

        assert_eq!(controller.open_for(&key("a")), 1);
        assert_eq!(controller.open_for(&key("b")), 1);

        drop(a);
        assert_eq!(controller.open_for(&key("a")), 0);
        assert!(controller.try_acquire(&key("a")).is_ok());
    }

    #[test]
    fn both_limits_report_one_error() {
        let controller = AdmissionController::new(Limits::new(Some(1), Some(1)));
        let _a = controller.try_acquire(&key("a")).unwrap();

        let err = controller.try_acquire(&key("a")).unwrap_err();
        assert_eq!(err.to_string(), "Too many connections");
    }

    #[test]
    fn release_once_per_permit() {
        let controller = AdmissionController::new(Limits::new(Some(3), None));
        let permit = controller.try_acquire(&key("a")).unwrap();
        let _other = controller.try_acquire(&key("a")).unwrap();

        assert_eq!(permit.key(), &key("a"));
        drop(permit);

        assert_eq!(controller.open_connections(), 1);
        assert_eq!(controller.open_for(&key("a")), 1);
    }

    #[test]
    fn concurrent_acquire_never_exceeds_limits() {
        const THREADS: usize = 16;
        let controller = AdmissionController::new(Limits::new(Some(4), Some(2)));
        let barrier = Barrier::new(THREADS);
        let granted = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for i in 0..THREADS {
                let controller = &controller;
                let barrier = &barrier;
                let granted = &granted;
                scope.spawn(move || {
                    let key = key(if i % 2 == 0 { "even" } else { "odd" });
                    barrier.wait();
                    for _ in 0..200 {
                        if let Ok(permit) = controller.try_acquire(&key) {
                            granted.fetch_add(1, Ordering::SeqCst);
                            assert!(controller.open_connections() <= 4);
                            assert!(controller.open_for(&key) <= 2);
                            drop(permit);
                        }
                    }
                });
            }
        });

        assert!(granted.load(Ordering::SeqCst) > 0);
        assert_eq!(controller.open_connections(), 0);
    }

    #[test]
    fn single_permit_contended() {
        const THREADS: usize = 8;
        let controller = AdmissionController::new(Limits::new(Some(1), None));
        let barrier = Barrier::new(THREADS);

        let permits: Vec<Option<Permit>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        controller.try_acquire(&key("a")).ok()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(permits.iter().filter(|p| p.is_some()).count(), 1);
    }
}
