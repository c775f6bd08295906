//! Heap-backed memory segment.

use super::MemorySegment;
use crate::error::{Error, Result};
use std::sync::atomic::AtomicU32;

/// A window backed by a heap allocation.
///
/// Used when no device is present: it gives a single process a register
/// file or scratch bank with the same access rules as the real hardware.
/// It cannot be shared across processes.
///
/// # Example
///
/// ```rust
/// use meram::memory::{HeapSegment, MemorySegment};
///
/// let segment = HeapSegment::new(1024, 0xE800_0000).unwrap();
/// segment.write_u32(0x10, 7).unwrap();
/// assert_eq!(segment.read_u32(0x10).unwrap(), 7);
/// ```
pub struct HeapSegment {
    /// Word storage. Atomics give interior mutability and 4-byte alignment.
    words: Box<[AtomicU32]>,
    phys_addr: u64,
}

impl HeapSegment {
    /// Create a zeroed heap segment.
    ///
    /// # Errors
    ///
    /// Returns an error if `size` is 0 or not a multiple of 4.
    pub fn new(size: usize, phys_addr: u64) -> Result<Self> {
        if size == 0 || size % super::WORD_SIZE != 0 {
            return Err(Error::MappingUnavailable(format!(
                "heap window size {size} must be a non-zero multiple of 4"
            )));
        }

        let words = (0..size / super::WORD_SIZE)
            .map(|_| AtomicU32::new(0))
            .collect();

        Ok(Self { words, phys_addr })
    }
}

// SAFETY: the storage is owned, word aligned, lives as long as the segment and
// is only ever accessed through UnsafeCell-backed atomics.
unsafe impl MemorySegment for HeapSegment {
    fn as_ptr(&self) -> *mut u8 {
        self.words.as_ptr().cast::<u8>().cast_mut()
    }

    fn len(&self) -> usize {
        self.words.len() * super::WORD_SIZE
    }

    fn phys_addr(&self) -> u64 {
        self.phys_addr
    }
}

impl std::fmt::Debug for HeapSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapSegment")
            .field("len", &self.len())
            .field("phys_addr", &format_args!("{:#x}", self.phys_addr))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_segment_creation() {
        let segment = HeapSegment::new(1024, 0x1000).unwrap();
        assert_eq!(segment.len(), 1024);
        assert_eq!(segment.phys_addr(), 0x1000);
        assert!(!segment.is_empty());
    }

    #[test]
    fn test_heap_segment_bad_size_fails() {
        assert!(HeapSegment::new(0, 0).is_err());
        assert!(HeapSegment::new(6, 0).is_err());
    }

    #[test]
    fn test_heap_segment_is_zeroed() {
        let segment = HeapSegment::new(64, 0).unwrap();
        for offset in (0..64).step_by(4) {
            assert_eq!(segment.read_u32(offset).unwrap(), 0);
        }
    }

    #[test]
    fn test_heap_segment_bounds() {
        let segment = HeapSegment::new(64, 0).unwrap();
        assert!(segment.read_u32(60).is_ok());
        assert!(matches!(
            segment.read_u32(64),
            Err(Error::OutOfBounds { offset: 64, len: 4 })
        ));
        assert!(segment.read_u32(2).is_err());
        assert!(segment.write_u32(usize::MAX - 3, 1).is_err());
    }

    #[test]
    fn test_heap_segment_fill() {
        let segment = HeapSegment::new(64, 0).unwrap();
        segment.fill_u32(16, 32, 0xdead_beef).unwrap();

        assert_eq!(segment.read_u32(12).unwrap(), 0);
        assert_eq!(segment.read_u32(16).unwrap(), 0xdead_beef);
        assert_eq!(segment.read_u32(44).unwrap(), 0xdead_beef);
        assert_eq!(segment.read_u32(48).unwrap(), 0);
        assert!(segment.fill_u32(48, 32, 0).is_err());
    }
}
