//! Memory segment trait for mapped windows.

use crate::error::{Error, Result};

/// Width of one register or fill word in bytes.
pub const WORD_SIZE: usize = 4;

/// A contiguous mapped window: the MERAM control registers or the scratch
/// memory bank.
///
/// All accessors go through volatile 32-bit reads and writes because the
/// window may be device memory shared with hardware and other processes.
///
/// # Safety
///
/// Implementations must ensure that:
/// - `as_ptr()` is valid for reads and writes of `len()` bytes for the
///   lifetime of the segment
/// - the pointer is aligned to at least [`WORD_SIZE`]
/// - writes through the pointer from `&self` are permitted (the memory is
///   behind interior mutability or is foreign memory)
pub unsafe trait MemorySegment: Send + Sync {
    /// Pointer to the first byte of the window.
    fn as_ptr(&self) -> *mut u8;

    /// Size of the window in bytes.
    fn len(&self) -> usize;

    /// Returns true if the window has zero length.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Physical address the window represents on the bus.
    fn phys_addr(&self) -> u64;

    /// Validate a word-aligned access of `len` bytes at `offset`.
    fn check_access(&self, offset: usize, len: usize) -> Result<()> {
        let end = offset.checked_add(len);
        if offset % WORD_SIZE != 0 || len % WORD_SIZE != 0 || end.is_none_or(|e| e > self.len())
        {
            return Err(Error::OutOfBounds { offset, len });
        }
        Ok(())
    }

    /// Read one 32-bit word.
    fn read_u32(&self, offset: usize) -> Result<u32> {
        self.check_access(offset, WORD_SIZE)?;
        // SAFETY: offset is in bounds and word aligned; the trait contract
        // guarantees the pointer is valid and aligned.
        Ok(unsafe { std::ptr::read_volatile(self.as_ptr().add(offset).cast::<u32>()) })
    }

    /// Write one 32-bit word.
    fn write_u32(&self, offset: usize, value: u32) -> Result<()> {
        self.check_access(offset, WORD_SIZE)?;
        // SAFETY: see read_u32.
        unsafe { std::ptr::write_volatile(self.as_ptr().add(offset).cast::<u32>(), value) };
        Ok(())
    }

    /// Write `value` repeatedly over `len` bytes starting at `offset`.
    fn fill_u32(&self, offset: usize, len: usize, value: u32) -> Result<()> {
        self.check_access(offset, len)?;
        // SAFETY: offset is in bounds.
        let base = unsafe { self.as_ptr().add(offset).cast::<u32>() };
        for i in 0..len / WORD_SIZE {
            // SAFETY: every word lies inside the range checked above.
            unsafe { std::ptr::write_volatile(base.add(i), value) };
        }
        Ok(())
    }
}
