//! Fixed-size occupancy bitmap for slot tracking.

use super::SLOT_COUNT;

const WORD_BITS: usize = u64::BITS as usize;
const WORDS: usize = SLOT_COUNT.div_ceil(WORD_BITS);

/// One bit per slot index: 0 = free, 1 = held.
///
/// Not synchronized on its own; the arbiter keeps it behind its mutex.
/// Indices must already be validated against [`SLOT_COUNT`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct SlotBitmap {
    words: [u64; WORDS],
}

impl SlotBitmap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[inline]
    fn locate(index: usize) -> (usize, u64) {
        debug_assert!(index < SLOT_COUNT);
        (index / WORD_BITS, 1u64 << (index % WORD_BITS))
    }

    pub(crate) fn is_set(&self, index: usize) -> bool {
        let (word, mask) = Self::locate(index);
        self.words[word] & mask != 0
    }

    /// Set the bit. Returns false if it was already set.
    pub(crate) fn set(&mut self, index: usize) -> bool {
        let (word, mask) = Self::locate(index);
        let was_clear = self.words[word] & mask == 0;
        self.words[word] |= mask;
        was_clear
    }

    /// Clear the bit. Returns false if it was already clear.
    pub(crate) fn clear(&mut self, index: usize) -> bool {
        let (word, mask) = Self::locate(index);
        let was_set = self.words[word] & mask != 0;
        self.words[word] &= !mask;
        was_set
    }

    pub(crate) fn count_set(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap_set_clear() {
        let mut bitmap = SlotBitmap::new();
        assert!(!bitmap.is_set(5));

        assert!(bitmap.set(5));
        assert!(bitmap.is_set(5));
        assert!(!bitmap.set(5));
        assert_eq!(bitmap.count_set(), 1);

        assert!(bitmap.clear(5));
        assert!(!bitmap.clear(5));
        assert_eq!(bitmap.count_set(), 0);
    }

    #[test]
    fn test_bitmap_word_boundaries() {
        let mut bitmap = SlotBitmap::new();
        for index in [0, 63, 64, SLOT_COUNT - 1] {
            assert!(bitmap.set(index));
        }
        assert_eq!(bitmap.count_set(), 4);
        assert!(bitmap.is_set(63));
        assert!(bitmap.is_set(64));
        assert!(!bitmap.is_set(62));
        assert!(!bitmap.is_set(65));
    }
}
