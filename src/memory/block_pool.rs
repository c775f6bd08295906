//! First-fit byte-range allocator for a mapped window.

use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Thread-safe byte-range allocator over `0..capacity`.
///
/// Free space is kept as a map of `start -> len` extents. Allocation is
/// first-fit in address order with the requested alignment; freeing merges
/// the range with its neighbours. The pool does not remember which ranges it
/// handed out, so a range may be returned in pieces (the region allocator
/// relies on that when it trims the edges of a rejected candidate).
#[derive(Debug)]
pub struct BlockPool {
    free: Mutex<BTreeMap<usize, usize>>,
    capacity: usize,
}

impl BlockPool {
    /// Create a pool with all of `0..capacity` free.
    pub fn new(capacity: usize) -> Self {
        let mut free = BTreeMap::new();
        if capacity > 0 {
            free.insert(0, capacity);
        }
        Self {
            free: Mutex::new(free),
            capacity,
        }
    }

    /// Allocate `size` bytes at an offset that is a multiple of `align`.
    ///
    /// Returns `None` if no free extent can hold the request.
    pub fn alloc(&self, size: usize, align: usize) -> Option<usize> {
        if size == 0 || !align.is_power_of_two() {
            return None;
        }

        let mut free = self.free.lock();
        let (start, len, offset) = free.iter().find_map(|(&start, &len)| {
            let offset = start.checked_next_multiple_of(align)?;
            let end = offset.checked_add(size)?;
            (end <= start + len).then_some((start, len, offset))
        })?;

        free.remove(&start);
        if offset > start {
            free.insert(start, offset - start);
        }
        let tail = start + len - (offset + size);
        if tail > 0 {
            free.insert(offset + size, tail);
        }
        Some(offset)
    }

    /// Return `size` bytes at `offset` to the pool.
    ///
    /// Ranges that fall outside the pool or overlap free space are ignored
    /// and reported as `false`.
    pub fn free(&self, offset: usize, size: usize) -> bool {
        let Some(end) = offset.checked_add(size) else {
            return false;
        };
        if size == 0 || end > self.capacity {
            return false;
        }

        let mut free = self.free.lock();

        let before = free
            .range(..=offset)
            .next_back()
            .map(|(&start, &len)| (start, len));
        if before.is_some_and(|(start, len)| start + len > offset) {
            return false;
        }
        if free.range(offset..end).next().is_some() {
            return false;
        }

        let mut start = offset;
        let mut len = size;
        if let Some((prev_start, prev_len)) = before
            && prev_start + prev_len == offset
        {
            free.remove(&prev_start);
            start = prev_start;
            len += prev_len;
        }
        if let Some(next_len) = free.remove(&end) {
            len += next_len;
        }
        free.insert(start, len);
        true
    }

    /// Total size of the pool in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of free bytes.
    pub fn free_bytes(&self) -> usize {
        self.free.lock().values().sum()
    }

    /// Size of the largest free extent.
    pub fn largest_free(&self) -> usize {
        self.free.lock().values().copied().max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_first_fit() {
        let pool = BlockPool::new(8192);
        assert_eq!(pool.alloc(1024, 1024), Some(0));
        assert_eq!(pool.alloc(2048, 1024), Some(1024));
        assert_eq!(pool.free_bytes(), 8192 - 3072);
    }

    #[test]
    fn test_pool_alignment() {
        let pool = BlockPool::new(8192);
        assert_eq!(pool.alloc(1024, 1024), Some(0));
        // Next aligned 4K slot skips the gap at 1024.
        assert_eq!(pool.alloc(1024, 4096), Some(4096));
        // The gap is still usable for smaller alignments.
        assert_eq!(pool.alloc(1024, 1024), Some(1024));
    }

    #[test]
    fn test_pool_exhaustion() {
        let pool = BlockPool::new(4096);
        assert_eq!(pool.alloc(4096, 1024), Some(0));
        assert_eq!(pool.alloc(1024, 1024), None);
        assert_eq!(pool.largest_free(), 0);
    }

    #[test]
    fn test_pool_free_coalesces() {
        let pool = BlockPool::new(4096);
        let a = pool.alloc(1024, 1024).unwrap();
        let b = pool.alloc(1024, 1024).unwrap();
        let c = pool.alloc(2048, 1024).unwrap();

        assert!(pool.free(b, 1024));
        assert!(pool.free(a, 1024));
        assert_eq!(pool.largest_free(), 2048);
        assert!(pool.free(c, 2048));
        assert_eq!(pool.largest_free(), 4096);
    }

    #[test]
    fn test_pool_partial_free() {
        let pool = BlockPool::new(8192);
        let offset = pool.alloc(8192, 1024).unwrap();

        // Return only the edges, keep the middle.
        assert!(pool.free(offset, 2048));
        assert!(pool.free(offset + 6144, 2048));
        assert_eq!(pool.free_bytes(), 4096);
        assert_eq!(pool.alloc(4096, 1024), None);
        assert_eq!(pool.alloc(2048, 1024), Some(0));
    }

    #[test]
    fn test_pool_rejects_double_free() {
        let pool = BlockPool::new(4096);
        let offset = pool.alloc(1024, 1024).unwrap();
        assert!(pool.free(offset, 1024));
        assert!(!pool.free(offset, 1024));
        assert!(!pool.free(4096, 1024));
        assert_eq!(pool.free_bytes(), 4096);
    }
}
