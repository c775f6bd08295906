//! Exclusive ownership of numbered ICB slots.
//!
//! The arbiter tracks which slot indices are held and lets callers either
//! wait for a held slot or fail fast.
//!
//! # Wakeups
//!
//! All waiters share one condition variable. A release wakes every waiter
//! and each re-checks its own index, so under heavy contention on many
//! different slots a release causes a burst of wakeups that mostly go back
//! to sleep. There is no fairness between waiters on the same index: after a
//! release any of them may win.
//!
//! Slots are taken and given back only through [`Icb`](crate::icb::Icb)
//! handles, so a bit is cleared by the handle that set it and by nothing
//! else. The arbiter itself is public for introspection only.
//!
//! # Example
//!
//! ```rust
//! use meram::config::{ConfigSource, SessionConfig};
//! use meram::mapping::LocalMappingConfig;
//! use meram::session::Registry;
//!
//! let registry = Registry::with_local_mapping(
//!     SessionConfig::default().with_source(ConfigSource::Empty),
//!     LocalMappingConfig::default(),
//! );
//! let session = registry.open().unwrap();
//!
//! let icb = session.acquire_slot(3).unwrap();
//! assert!(registry.arbiter().is_held(3));
//! assert!(session.try_acquire_slot(3).is_err());
//!
//! icb.release();
//! assert!(!registry.arbiter().is_held(3));
//! ```

mod bitmap;

use crate::error::{Error, Result};
use bitmap::SlotBitmap;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Number of hardware slots.
pub const SLOT_COUNT: usize = 128;

/// Highest valid slot index.
pub const MAX_SLOT_INDEX: usize = SLOT_COUNT - 1;

/// Statistics about arbiter usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArbiterStats {
    /// Slots currently held.
    pub held: usize,
    /// Successful acquisitions.
    pub acquisitions: u64,
    /// Acquisitions that found the slot held and had to wait.
    pub waits: u64,
    /// Non-blocking or timed acquisitions that gave up.
    pub rejections: u64,
}

#[derive(Debug, Default)]
struct StatsInner {
    acquisitions: AtomicU64,
    waits: AtomicU64,
    rejections: AtomicU64,
}

/// Tracks occupancy of the [`SLOT_COUNT`] slot indices.
#[derive(Debug)]
pub struct SlotArbiter {
    bitmap: Mutex<SlotBitmap>,
    released: Condvar,
    stats: StatsInner,
}

impl SlotArbiter {
    /// Create an arbiter with every slot free.
    pub(crate) fn new() -> Self {
        Self {
            bitmap: Mutex::new(SlotBitmap::new()),
            released: Condvar::new(),
            stats: StatsInner::default(),
        }
    }

    /// Take `index`, waiting as long as necessary for its owner to release it.
    ///
    /// Never returns [`Error::SlotUnavailable`].
    pub(crate) fn acquire(&self, index: usize) -> Result<()> {
        self.acquire_until(index, None)
    }

    /// Take `index` if it is free, otherwise fail with
    /// [`Error::SlotUnavailable`] without waiting.
    pub(crate) fn try_acquire(&self, index: usize) -> Result<()> {
        check_index(index)?;

        let mut bitmap = self.bitmap.lock();
        if bitmap.is_set(index) {
            self.stats.rejections.fetch_add(1, Ordering::Relaxed);
            return Err(Error::SlotUnavailable { index });
        }
        self.take(&mut bitmap, index);
        Ok(())
    }

    /// Take `index`, waiting at most `timeout`.
    pub(crate) fn acquire_timeout(&self, index: usize, timeout: Duration) -> Result<()> {
        // An unrepresentable deadline is as good as no deadline.
        self.acquire_until(index, Instant::now().checked_add(timeout))
    }

    fn acquire_until(&self, index: usize, deadline: Option<Instant>) -> Result<()> {
        check_index(index)?;

        let mut bitmap = self.bitmap.lock();
        if bitmap.is_set(index) {
            self.stats.waits.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(index = index, "waiting for slot");
        }

        while bitmap.is_set(index) {
            match deadline {
                None => self.released.wait(&mut bitmap),
                Some(deadline) => {
                    if self.released.wait_until(&mut bitmap, deadline).timed_out()
                        && bitmap.is_set(index)
                    {
                        self.stats.rejections.fetch_add(1, Ordering::Relaxed);
                        return Err(Error::SlotUnavailable { index });
                    }
                }
            }
        }

        self.take(&mut bitmap, index);
        Ok(())
    }

    fn take(&self, bitmap: &mut SlotBitmap, index: usize) {
        bitmap.set(index);
        self.stats.acquisitions.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(index = index, "slot acquired");
    }

    /// Give `index` back and wake every waiter.
    ///
    /// Releasing a free slot is logged and otherwise ignored.
    pub(crate) fn release(&self, index: usize) {
        if index > MAX_SLOT_INDEX {
            tracing::warn!(index = index, "release of out-of-range slot ignored");
            return;
        }

        let mut bitmap = self.bitmap.lock();
        if !bitmap.clear(index) {
            tracing::warn!(index = index, "release of free slot ignored");
            return;
        }
        self.released.notify_all();
        tracing::trace!(index = index, "slot released");
    }

    /// Check whether `index` is currently held.
    ///
    /// Note: This is a snapshot and may change immediately after returning.
    pub fn is_held(&self, index: usize) -> bool {
        index <= MAX_SLOT_INDEX && self.bitmap.lock().is_set(index)
    }

    /// Number of slots currently held.
    pub fn held_count(&self) -> usize {
        self.bitmap.lock().count_set()
    }

    /// Get arbiter statistics.
    pub fn stats(&self) -> ArbiterStats {
        ArbiterStats {
            held: self.held_count(),
            acquisitions: self.stats.acquisitions.load(Ordering::Relaxed),
            waits: self.stats.waits.load(Ordering::Relaxed),
            rejections: self.stats.rejections.load(Ordering::Relaxed),
        }
    }
}

fn check_index(index: usize) -> Result<()> {
    if index > MAX_SLOT_INDEX {
        return Err(Error::InvalidIndex { index });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_acquire_release_reacquire() {
        let arbiter = SlotArbiter::new();

        arbiter.acquire(7).unwrap();
        assert!(arbiter.is_held(7));
        assert_eq!(arbiter.held_count(), 1);

        arbiter.release(7);
        assert!(!arbiter.is_held(7));

        arbiter.try_acquire(7).unwrap();
        assert!(arbiter.is_held(7));
    }

    #[test]
    fn test_try_acquire_held_slot_fails_without_mutation() {
        let arbiter = SlotArbiter::new();
        arbiter.acquire(0).unwrap();
        let before = arbiter.held_count();

        assert!(matches!(
            arbiter.try_acquire(0),
            Err(Error::SlotUnavailable { index: 0 })
        ));
        assert_eq!(arbiter.held_count(), before);
        assert!(arbiter.is_held(0));
        assert_eq!(arbiter.stats().rejections, 1);
    }

    #[test]
    fn test_invalid_index() {
        let arbiter = SlotArbiter::new();

        assert!(arbiter.acquire(MAX_SLOT_INDEX).is_ok());
        assert!(matches!(
            arbiter.acquire(SLOT_COUNT),
            Err(Error::InvalidIndex { index: SLOT_COUNT })
        ));
        assert!(matches!(
            arbiter.try_acquire(usize::MAX),
            Err(Error::InvalidIndex { .. })
        ));
        assert_eq!(arbiter.held_count(), 1);
        assert!(!arbiter.is_held(SLOT_COUNT));
    }

    #[test]
    fn test_release_free_slot_is_ignored() {
        let arbiter = SlotArbiter::new();
        arbiter.release(3);
        arbiter.release(SLOT_COUNT);
        assert_eq!(arbiter.held_count(), 0);
    }

    #[test]
    fn test_acquire_timeout_expires() {
        let arbiter = SlotArbiter::new();
        arbiter.acquire(9).unwrap();

        let start = Instant::now();
        let result = arbiter.acquire_timeout(9, Duration::from_millis(20));
        assert!(matches!(result, Err(Error::SlotUnavailable { index: 9 })));
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(arbiter.stats().waits, 1);
    }

    #[test]
    fn test_acquire_timeout_succeeds_on_free_slot() {
        let arbiter = SlotArbiter::new();
        arbiter.acquire_timeout(9, Duration::ZERO).unwrap();
        assert!(arbiter.is_held(9));
    }

    #[test]
    fn test_blocking_acquire_waits_for_release() {
        let arbiter = Arc::new(SlotArbiter::new());
        arbiter.acquire(1).unwrap();

        let waiter = {
            let arbiter = Arc::clone(&arbiter);
            thread::spawn(move || {
                let start = Instant::now();
                arbiter.acquire(1).unwrap();
                start.elapsed()
            })
        };

        thread::sleep(Duration::from_millis(50));
        arbiter.release(1);

        let elapsed = waiter.join().unwrap();
        assert!(elapsed >= Duration::from_millis(40));
        assert!(arbiter.is_held(1));
    }

    #[test]
    fn test_release_of_other_slot_does_not_satisfy_waiter() {
        let arbiter = Arc::new(SlotArbiter::new());
        arbiter.acquire(1).unwrap();
        arbiter.acquire(2).unwrap();

        let waiter = {
            let arbiter = Arc::clone(&arbiter);
            thread::spawn(move || arbiter.acquire(1))
        };

        thread::sleep(Duration::from_millis(20));
        arbiter.release(2);
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        arbiter.release(1);
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn test_single_owner_under_contention() {
        let arbiter = Arc::new(SlotArbiter::new());
        let owners: Arc<Vec<AtomicUsize>> =
            Arc::new((0..4).map(|_| AtomicUsize::new(0)).collect());

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let arbiter = Arc::clone(&arbiter);
                let owners = Arc::clone(&owners);
                thread::spawn(move || {
                    for i in 0..200 {
                        let index = (t + i) % 4;
                        arbiter.acquire(index).unwrap();
                        let prev = owners[index].fetch_add(1, Ordering::SeqCst);
                        assert_eq!(prev, 0, "slot {index} had two owners");
                        owners[index].fetch_sub(1, Ordering::SeqCst);
                        arbiter.release(index);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(arbiter.held_count(), 0);
        assert_eq!(arbiter.stats().acquisitions, 8 * 200);
    }
}
