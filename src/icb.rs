//! Image cache blocks: the handle a client gets for one acquired slot.
//!
//! An [`Icb`] proves ownership of one slot index. It gives access to the
//! slot's 32-byte register block and can own one range of scratch memory.
//! Dropping the handle frees the memory first and then gives the slot back,
//! so the next owner never sees a stale binding.

use crate::error::{Error, Result};
use crate::mapping::WindowKind;
use crate::memory::WORD_SIZE;
use crate::region::AllocatedRange;
use crate::session::Session;

pub use crate::region::required_memory_size;

/// Register offset of ICB 0.
pub const ICB_BASE: usize = 0x400;

/// Distance between consecutive ICB register blocks.
pub const ICB_STRIDE: usize = 0x20;

/// Size of one ICB register block.
pub const ICB_REGISTER_LEN: usize = 0x20;

/// Base of the MERAM address space seen by bus masters.
pub const ICB_ADDRESS_BASE: u32 = 0xC000_0000;

/// Scratch memory attached to a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryBinding {
    /// No memory attached.
    #[default]
    Unbound,
    /// The handle owns this range.
    Bound(AllocatedRange),
}

impl MemoryBinding {
    /// The bound range, if any.
    pub fn range(&self) -> Option<AllocatedRange> {
        match self {
            MemoryBinding::Unbound => None,
            MemoryBinding::Bound(range) => Some(*range),
        }
    }
}

/// Which plane of a two-plane ICB a bus address refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Plane {
    /// Luma / first plane.
    A,
    /// Chroma / second plane.
    B,
}

/// Exclusive handle on one slot.
///
/// Returned by [`Session::acquire_slot`] and friends.
pub struct Icb<'s> {
    session: &'s Session<'s>,
    index: usize,
    binding: MemoryBinding,
}

impl<'s> Icb<'s> {
    /// Wrap a slot the caller already acquired from the arbiter.
    pub(crate) fn new(session: &'s Session<'s>, index: usize) -> Self {
        tracing::trace!(index = index, "icb created");
        Self {
            session,
            index,
            binding: MemoryBinding::Unbound,
        }
    }

    /// Slot index.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Byte offset of this slot's register block in the register window.
    #[inline]
    pub fn register_offset(&self) -> usize {
        ICB_BASE + self.index * ICB_STRIDE
    }

    /// Bus address of this ICB for the given plane.
    pub fn address(&self, plane: Plane) -> u32 {
        let plane: u32 = match plane {
            Plane::A => 0,
            Plane::B => 1,
        };
        ICB_ADDRESS_BASE | (plane << 23) | (((self.index as u32) & 0x1F) << 24)
    }

    /// Current memory binding.
    pub fn binding(&self) -> MemoryBinding {
        self.binding
    }

    /// Read the register at `sub_offset` within this slot's block.
    pub fn read(&self, sub_offset: usize) -> Result<u32> {
        let offset = self.register(sub_offset)?;
        self.session.window(WindowKind::Registers)?.read_u32(offset)
    }

    /// Write the register at `sub_offset` within this slot's block.
    pub fn write(&self, sub_offset: usize, value: u32) -> Result<()> {
        let offset = self.register(sub_offset)?;
        self.session
            .window(WindowKind::Registers)?
            .write_u32(offset, value)
    }

    fn register(&self, sub_offset: usize) -> Result<usize> {
        let offset = self.register_offset().saturating_add(sub_offset);
        if sub_offset % WORD_SIZE != 0 || sub_offset + WORD_SIZE > ICB_REGISTER_LEN {
            return Err(Error::OutOfBounds {
                offset,
                len: WORD_SIZE,
            });
        }
        Ok(offset)
    }

    /// Attach `size` blocks of scratch memory and return the first block.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidHandle`] if memory is already bound
    /// - any error from [`Session::alloc_region`]; the handle stays unbound
    pub fn bind_memory(&mut self, size: usize) -> Result<usize> {
        if let MemoryBinding::Bound(_) = self.binding {
            return Err(Error::InvalidHandle("memory already bound"));
        }

        let range = self.session.alloc_region(size)?;
        self.binding = MemoryBinding::Bound(range);
        tracing::debug!(
            index = self.index,
            offset = range.offset,
            size = range.size,
            "memory bound"
        );
        Ok(range.offset)
    }

    /// Free the bound memory, if any.
    pub fn unbind_memory(&mut self) {
        if let MemoryBinding::Bound(range) = std::mem::take(&mut self.binding) {
            self.session.free_region(range);
            tracing::debug!(index = self.index, "memory unbound");
        }
    }

    /// Free the bound memory and give the slot back.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for Icb<'_> {
    fn drop(&mut self) {
        self.unbind_memory();
        self.session.arbiter().release(self.index);
    }
}

impl std::fmt::Debug for Icb<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Icb")
            .field("index", &self.index)
            .field("binding", &self.binding)
            .finish()
    }
}

/// Release a handle. Equivalent to dropping it.
pub fn release_slot(icb: Icb<'_>) {
    icb.release();
}
