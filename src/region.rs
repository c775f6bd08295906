//! Reserved-range-aware block allocation in scratch memory.
//!
//! The mapping service hands out byte ranges without knowing about the
//! reserved blocks from the config file. [`RegionAllocator`] sits on top of
//! it and never returns a range touching a reserved block:
//!
//! 1. ask the mapping service for a candidate of the requested size
//! 2. if it touches no reserved range, return it
//! 3. otherwise give back the parts of the candidate before and after the
//!    first reserved range it touches, keep the overlapped middle claimed,
//!    and ask again
//!
//! The middle that stays claimed is exactly the reserved zone the pool keeps
//! wanting to hand out, so each retry removes a bit of reserved space from
//! the pool and the loop converges on either a clean range or exhaustion.
//! Those pins live until the mapping is torn down. The number of candidates
//! is capped so a pathological pool cannot loop forever.

use crate::config::ReservedRanges;
use crate::error::{Error, Result};
use crate::mapping::{MappingService, WindowKind};

/// log2 of [`BLOCK_SIZE`].
pub const BLOCK_SHIFT: u32 = 10;

/// Scratch memory allocation unit in bytes.
pub const BLOCK_SIZE: usize = 1 << BLOCK_SHIFT;

/// A range of scratch blocks owned by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocatedRange {
    /// First block.
    pub offset: usize,
    /// Number of blocks.
    pub size: usize,
}

impl AllocatedRange {
    /// Last block (inclusive).
    #[inline]
    pub fn last_block(&self) -> usize {
        self.offset + self.size - 1
    }

    /// Byte offset of the first block.
    #[inline]
    pub fn byte_offset(&self) -> usize {
        self.offset << BLOCK_SHIFT
    }

    /// Length in bytes.
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.size << BLOCK_SHIFT
    }
}

/// Carves clean block ranges out of the mapping service's pool.
pub struct RegionAllocator<'a> {
    mapping: &'a dyn MappingService,
    reserved: &'a ReservedRanges,
    max_attempts: usize,
}

impl<'a> RegionAllocator<'a> {
    /// Create an allocator over `mapping` that avoids `reserved`.
    pub fn new(
        mapping: &'a dyn MappingService,
        reserved: &'a ReservedRanges,
        max_attempts: usize,
    ) -> Self {
        Self {
            mapping,
            reserved,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Allocate `size` blocks that touch no reserved range.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidSize`] if `size` is 0
    /// - [`Error::AllocationExhausted`] if the pool has no room or the
    ///   attempt cap is reached
    pub fn alloc(&self, size: usize) -> Result<AllocatedRange> {
        if size == 0 {
            return Err(Error::InvalidSize);
        }
        let bytes = size
            .checked_mul(BLOCK_SIZE)
            .ok_or(Error::AllocationExhausted { size, attempts: 0 })?;
        let align = self.mapping.granularity().max(BLOCK_SIZE);

        for attempt in 1..=self.max_attempts {
            let Some(byte_offset) = self.mapping.alloc(bytes, align) else {
                tracing::debug!(size = size, attempt = attempt, "scratch pool exhausted");
                return Err(Error::AllocationExhausted {
                    size,
                    attempts: attempt,
                });
            };

            let candidate = AllocatedRange {
                offset: byte_offset >> BLOCK_SHIFT,
                size,
            };
            let (start, end) = (candidate.offset, candidate.last_block());

            let Some(reserved) = self.reserved.first_overlap(start, end) else {
                tracing::debug!(offset = start, size = size, "region allocated");
                return Ok(candidate);
            };

            tracing::warn!(
                offset = start,
                size = size,
                reserved_start = reserved.start_block,
                reserved_end = reserved.end_block,
                attempt = attempt,
                "candidate overlaps reserved range, retrying"
            );

            if start < reserved.start_block {
                self.free_blocks(start, reserved.start_block - start);
            }
            if end > reserved.end_block {
                self.free_blocks(reserved.end_block + 1, end - reserved.end_block);
            }
        }

        tracing::warn!(
            size = size,
            attempts = self.max_attempts,
            "no clean region within attempt cap"
        );
        Err(Error::AllocationExhausted {
            size,
            attempts: self.max_attempts,
        })
    }

    /// Return a range to the pool.
    ///
    /// The caller must own `range`; this is not checked.
    pub fn free(&self, range: AllocatedRange) {
        tracing::debug!(offset = range.offset, size = range.size, "region freed");
        self.free_blocks(range.offset, range.size);
    }

    /// Write `value` repeatedly over `n_blocks` blocks starting at block `offset`.
    pub fn fill(&self, offset: usize, n_blocks: usize, value: u32) -> Result<()> {
        let scratch = self
            .mapping
            .window(WindowKind::Scratch)
            .ok_or_else(|| Error::MappingUnavailable("no scratch window".into()))?;

        let out_of_bounds = || Error::OutOfBounds {
            offset: offset.saturating_mul(BLOCK_SIZE),
            len: n_blocks.saturating_mul(BLOCK_SIZE),
        };
        let byte_offset = offset.checked_mul(BLOCK_SIZE).ok_or_else(out_of_bounds)?;
        let byte_len = n_blocks.checked_mul(BLOCK_SIZE).ok_or_else(out_of_bounds)?;

        scratch.fill_u32(byte_offset, byte_len, value)
    }

    fn free_blocks(&self, offset: usize, size: usize) {
        self.mapping.free(offset << BLOCK_SHIFT, size << BLOCK_SHIFT);
    }
}

/// Blocks needed to cache `line_count` lines of `stride` bytes.
///
/// Lines up to 1 KiB take one block each; longer lines are rounded up to
/// the next power of two. Sizes too large to represent saturate, and such a
/// request then fails to allocate.
///
/// ```rust
/// use meram::region::required_memory_size;
///
/// assert_eq!(required_memory_size(1200, 4), 8);
/// assert_eq!(required_memory_size(800, 4), 4);
/// ```
pub fn required_memory_size(stride: usize, line_count: usize) -> usize {
    let bytes_per_line = if stride <= BLOCK_SIZE {
        BLOCK_SIZE
    } else {
        stride.checked_next_power_of_two().unwrap_or(usize::MAX)
    };
    bytes_per_line.saturating_mul(line_count) / BLOCK_SIZE
}
