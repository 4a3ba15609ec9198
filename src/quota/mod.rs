//! Process-wide admission quota over a fixed reset window.
//!
//! [`QuotaGate`] bounds how many completion requests may be admitted between
//! two resets, independent of who is asking. Admission uses a double-checked
//! pattern: a lock-free read rejects quickly once the quota is spent, and only
//! requests that pass it take the lock to re-check and increment. The lock is
//! never held across an `.await`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::background;

/// Limit used when `MaxRequestsPerHour` is absent or invalid.
pub const DEFAULT_LIMIT: usize = 500;

/// Default length of the quota window.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Admission counter shared by every request handler.
///
/// # Examples
///
/// ```
/// use promptgate::quota::QuotaGate;
///
/// let gate = QuotaGate::new(2);
/// assert!(gate.admit());
/// assert!(gate.admit());
/// assert!(!gate.admit());
///
/// gate.reset();
/// assert!(gate.admit());
/// ```
#[derive(Debug)]
pub struct QuotaGate {
    limit: usize,
    count: AtomicUsize,
    lock: Mutex<()>,
}

impl QuotaGate {
    /// Creates a gate admitting at most `limit` requests per window.
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            count: AtomicUsize::new(0),
            lock: Mutex::new(()),
        }
    }

    /// Creates a gate from the configured `MaxRequestsPerHour` value.
    ///
    /// Falls back to [`DEFAULT_LIMIT`] with a warning when the setting is
    /// absent or negative.
    pub fn from_setting(limit: Option<i64>) -> Self {
        let limit = match limit {
            Some(limit) => match usize::try_from(limit) {
                Ok(limit) => limit,
                Err(_) => {
                    warn!(limit, default = DEFAULT_LIMIT, "invalid MaxRequestsPerHour, using default");
                    DEFAULT_LIMIT
                }
            },
            None => {
                warn!(default = DEFAULT_LIMIT, "MaxRequestsPerHour not set, using default");
                DEFAULT_LIMIT
            }
        };
        Self::new(limit)
    }

    /// Reserves one unit of quota.
    ///
    /// Returns `true` and increments the counter if the quota is not spent,
    /// `false` without mutation otherwise. Never blocks for longer than the
    /// critical section of a concurrent `admit` or [`reset`](Self::reset).
    pub fn admit(&self) -> bool {
        // Stale reads only ever delay a rejection; the locked re-check below
        // is what keeps admissions within the limit.
        if self.count.load(Ordering::Acquire) >= self.limit {
            return false;
        }

        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let count = self.count.load(Ordering::Acquire);
        if count >= self.limit {
            return false;
        }
        self.count.store(count + 1, Ordering::Release);
        true
    }

    /// Returns the counter to zero.
    pub fn reset(&self) {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let used = self.count.swap(0, Ordering::AcqRel);
        debug!(used, limit = self.limit, "quota window reset");
    }

    /// Number of admissions in the current window.
    pub fn used(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Maximum admissions per window.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Starts the background loop that resets the counter every `window`
    /// until `shutdown` fires.
    pub fn spawn_reset(
        self: &Arc<Self>,
        window: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let gate = Arc::clone(self);
        background::spawn_periodic("quota-reset", window, shutdown, move || gate.reset())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn saturates_at_limit_without_mutation() {
        let gate = QuotaGate::new(3);
        assert_eq!((0..5).filter(|_| gate.admit()).count(), 3);
        assert_eq!(gate.used(), 3);
        assert!(!gate.admit());
        assert_eq!(gate.used(), 3);
    }

    #[test]
    fn zero_limit_never_admits() {
        let gate = QuotaGate::new(0);
        assert!(!gate.admit());
        assert_eq!(gate.used(), 0);
    }

    #[test]
    fn missing_or_negative_setting_uses_default() {
        assert_eq!(QuotaGate::from_setting(None).limit(), DEFAULT_LIMIT);
        assert_eq!(QuotaGate::from_setting(Some(-4)).limit(), DEFAULT_LIMIT);
        assert_eq!(QuotaGate::from_setting(Some(12)).limit(), 12);
    }

    #[test]
    fn concurrent_admissions_never_exceed_limit() {
        for limit in [1, 7, 64, 500] {
            let gate = QuotaGate::new(limit);
            let admitted: usize = thread::scope(|scope| {
                let workers: Vec<_> = (0..8)
                    .map(|_| scope.spawn(|| (0..200).filter(|_| gate.admit()).count()))
                    .collect();
                workers.into_iter().map(|w| w.join().unwrap()).sum()
            });
            assert_eq!(admitted, limit.min(8 * 200));
            assert_eq!(gate.used(), limit.min(8 * 200));
        }
    }

    #[test]
    fn admissions_racing_resets_stay_bounded_per_window() {
        let gate = QuotaGate::new(10);
        thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..1_000 {
                        gate.admit();
                        assert!(gate.used() <= gate.limit());
                    }
                });
            }
            scope.spawn(|| {
                for _ in 0..50 {
                    gate.reset();
                }
            });
        });
        assert!(gate.used() <= 10);
    }

    #[tokio::test(start_paused = true)]
    async fn background_reset_restores_admission() {
        let gate = Arc::new(QuotaGate::new(1));
        let shutdown = CancellationToken::new();
        let handle = gate.spawn_reset(DEFAULT_WINDOW, shutdown.clone());

        assert!(gate.admit());
        assert!(!gate.admit());

        tokio::time::sleep(DEFAULT_WINDOW + Duration::from_millis(1)).await;
        assert!(gate.admit());
        assert!(!gate.admit());

        shutdown.cancel();
        handle.await.unwrap();
    }
}
