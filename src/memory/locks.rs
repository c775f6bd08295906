//! Advisory locks over a mapped window.

use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct LockState {
    whole: bool,
    ranges: Vec<(usize, usize)>,
}

impl LockState {
    fn range_conflicts(&self, offset: usize, end: usize) -> bool {
        self.whole || self.ranges.iter().any(|&(o, e)| offset < e && o < end)
    }
}

/// Cooperative whole-window and byte-range locks.
///
/// A whole-window lock conflicts with everything; range locks conflict with
/// the whole-window lock and with overlapping ranges. Locking blocks until
/// the conflict clears. Nothing stops a caller from touching memory without
/// the lock; this only coordinates well-behaved users.
#[derive(Debug)]
pub struct LockTable {
    state: Mutex<LockState>,
    unlocked: Condvar,
    len: usize,
}

impl LockTable {
    /// Create a lock table for a window of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            unlocked: Condvar::new(),
            len,
        }
    }

    /// Take the whole-window lock.
    pub fn lock(&self) {
        let mut state = self.state.lock();
        while state.whole || !state.ranges.is_empty() {
            self.unlocked.wait(&mut state);
        }
        state.whole = true;
    }

    /// Release the whole-window lock.
    pub fn unlock(&self) {
        let mut state = self.state.lock();
        state.whole = false;
        self.unlocked.notify_all();
    }

    /// Take a lock over `len` bytes at `offset`.
    pub fn lock_range(&self, offset: usize, len: usize) -> Result<()> {
        let end = self.check_range(offset, len)?;
        let mut state = self.state.lock();
        while state.range_conflicts(offset, end) {
            self.unlocked.wait(&mut state);
        }
        state.ranges.push((offset, end));
        Ok(())
    }

    /// Release a range lock taken with the same `offset` and `len`.
    pub fn unlock_range(&self, offset: usize, len: usize) {
        let end = offset.saturating_add(len);
        let mut state = self.state.lock();
        if let Some(pos) = state.ranges.iter().position(|&r| r == (offset, end)) {
            state.ranges.swap_remove(pos);
            self.unlocked.notify_all();
        }
    }

    /// Returns true if any lock is held.
    pub fn is_locked(&self) -> bool {
        let state = self.state.lock();
        state.whole || !state.ranges.is_empty()
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<usize> {
        match offset.checked_add(len) {
            Some(end) if len > 0 && end <= self.len => Ok(end),
            _ => Err(Error::OutOfBounds { offset, len }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_disjoint_ranges_coexist() {
        let table = LockTable::new(4096);
        table.lock_range(0, 1024).unwrap();
        table.lock_range(1024, 1024).unwrap();
        assert!(table.is_locked());

        table.unlock_range(0, 1024);
        table.unlock_range(1024, 1024);
        assert!(!table.is_locked());
    }

    #[test]
    fn test_range_out_of_bounds() {
        let table = LockTable::new(4096);
        assert!(table.lock_range(4096, 1).is_err());
        assert!(table.lock_range(0, 0).is_err());
        assert!(table.lock_range(usize::MAX, 2).is_err());
    }

    #[test]
    fn test_whole_lock_waits_for_ranges() {
        let table = Arc::new(LockTable::new(4096));
        table.lock_range(0, 1024).unwrap();

        let waiter = {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                let start = Instant::now();
                table.lock();
                let waited = start.elapsed();
                table.unlock();
                waited
            })
        };

        thread::sleep(Duration::from_millis(50));
        table.unlock_range(0, 1024);

        assert!(waiter.join().unwrap() >= Duration::from_millis(40));
        assert!(!table.is_locked());
    }

    #[test]
    fn test_overlapping_range_waits() {
        let table = Arc::new(LockTable::new(4096));
        table.lock_range(0, 2048).unwrap();

        let waiter = {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                table.lock_range(1024, 2048).unwrap();
                table.unlock_range(1024, 2048);
            })
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        table.unlock_range(0, 2048);
        waiter.join().unwrap();
    }
}
