//! The mapping service: windows, byte-range allocation and advisory locks.
//!
//! [`MappingService`] is the seam between the session and whatever actually
//! maps the MERAM device. Everything above it (arbiter, region allocator,
//! session) only talks to this trait. [`LocalMapping`] is the implementation
//! shipped with the crate; it backs both windows with ordinary memory, which
//! is what tests and device-less hosts use.

use crate::error::{Error, Result};
use crate::memory::{BlockPool, HeapSegment, LockTable, MemorySegment, SharedMemorySegment};
use crate::region::BLOCK_SIZE;

/// Physical base of the MERAM control registers.
pub const MERAM_REG_BASE: u64 = 0xE800_0000;

/// Physical base of the MERAM scratch bank.
pub const MERAM_MEM_BASE: u64 = 0xE808_0000;

/// Default size of the register window (covers all ICB register blocks).
pub const DEFAULT_REGISTER_WINDOW: usize = 0x2000;

/// Default scratch bank size in blocks.
pub const DEFAULT_SCRATCH_BLOCKS: usize = 1536;

/// Which mapped window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WindowKind {
    /// Control registers (common block and ICB blocks).
    Registers,
    /// Scratch memory bank.
    Scratch,
}

/// Services the session consumes from the device mapping.
///
/// Implementations must be internally synchronized: the region allocator
/// calls `alloc`/`free` concurrently from many threads without holding any
/// lock of its own.
pub trait MappingService: Send + Sync {
    /// The mapped window of the given kind, if the device exposes it.
    fn window(&self, kind: WindowKind) -> Option<&dyn MemorySegment>;

    /// Minimum alignment (bytes) of ranges returned by [`alloc`](Self::alloc).
    fn granularity(&self) -> usize;

    /// Allocate `size` bytes of scratch memory aligned to `align`.
    ///
    /// Returns the byte offset within the scratch window, or `None` if the
    /// pool cannot satisfy the request.
    fn alloc(&self, size: usize, align: usize) -> Option<usize>;

    /// Return `size` bytes at `offset` to the scratch pool.
    ///
    /// Any sub-range of an earlier allocation may be returned on its own.
    fn free(&self, offset: usize, size: usize);

    /// Take the whole-device advisory lock (common registers).
    fn lock(&self) -> Result<()>;

    /// Release the whole-device advisory lock.
    fn unlock(&self);

    /// Take an advisory lock over `len` bytes of scratch memory at `offset`.
    fn partial_lock(&self, offset: usize, len: usize) -> Result<()>;

    /// Release a lock taken with [`partial_lock`](Self::partial_lock).
    fn partial_unlock(&self, offset: usize, len: usize);
}

/// What memory backs a [`LocalMapping`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backing {
    /// Process-private heap memory.
    #[default]
    Heap,
    /// memfd shared memory, mappable by other processes.
    SharedMemory,
}

/// Shape of a [`LocalMapping`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMappingConfig {
    /// Register window size in bytes.
    pub register_window: usize,
    /// Scratch bank size in blocks.
    pub scratch_blocks: usize,
    /// Allocation granularity in bytes (power of two).
    pub granularity: usize,
    /// Physical address reported for the register window.
    pub register_base: u64,
    /// Physical address reported for the scratch window.
    pub scratch_base: u64,
    /// Memory behind both windows.
    pub backing: Backing,
}

impl Default for LocalMappingConfig {
    fn default() -> Self {
        Self {
            register_window: DEFAULT_REGISTER_WINDOW,
            scratch_blocks: DEFAULT_SCRATCH_BLOCKS,
            granularity: BLOCK_SIZE,
            register_base: MERAM_REG_BASE,
            scratch_base: MERAM_MEM_BASE,
            backing: Backing::Heap,
        }
    }
}

impl LocalMappingConfig {
    /// Use a scratch bank of `blocks` blocks.
    pub fn with_scratch_blocks(mut self, blocks: usize) -> Self {
        self.scratch_blocks = blocks;
        self
    }

    /// Use the given backing.
    pub fn with_backing(mut self, backing: Backing) -> Self {
        self.backing = backing;
        self
    }
}

/// Mapping service backed by ordinary memory.
///
/// Scratch allocation is a first-fit [`BlockPool`]; locks are an in-process
/// [`LockTable`] per window.
///
/// # Example
///
/// ```rust
/// use meram::mapping::{LocalMapping, LocalMappingConfig, MappingService, WindowKind};
///
/// let mapping = LocalMapping::new(&LocalMappingConfig::default()).unwrap();
/// let offset = mapping.alloc(4096, 1024).unwrap();
/// assert_eq!(offset, 0);
/// assert!(mapping.window(WindowKind::Scratch).is_some());
/// ```
pub struct LocalMapping {
    registers: Box<dyn MemorySegment>,
    scratch: Box<dyn MemorySegment>,
    pool: BlockPool,
    register_locks: LockTable,
    scratch_locks: LockTable,
    granularity: usize,
}

impl LocalMapping {
    /// Create both windows as described by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the granularity is not a power of two or a
    /// window cannot be created.
    pub fn new(config: &LocalMappingConfig) -> Result<Self> {
        let scratch_len = config
            .scratch_blocks
            .checked_mul(BLOCK_SIZE)
            .ok_or_else(|| Error::MappingUnavailable("scratch bank too large".into()))?;

        let (registers, scratch): (Box<dyn MemorySegment>, Box<dyn MemorySegment>) =
            match config.backing {
                Backing::Heap => (
                    Box::new(HeapSegment::new(config.register_window, config.register_base)?),
                    Box::new(HeapSegment::new(scratch_len, config.scratch_base)?),
                ),
                Backing::SharedMemory => (
                    Box::new(SharedMemorySegment::new(
                        "meram-registers",
                        config.register_window,
                        config.register_base,
                    )?),
                    Box::new(SharedMemorySegment::new(
                        "meram-scratch",
                        scratch_len,
                        config.scratch_base,
                    )?),
                ),
            };

        Self::from_segments(registers, scratch, config.granularity)
    }

    /// Build a mapping over existing windows.
    pub fn from_segments(
        registers: Box<dyn MemorySegment>,
        scratch: Box<dyn MemorySegment>,
        granularity: usize,
    ) -> Result<Self> {
        if !granularity.is_power_of_two() {
            return Err(Error::MappingUnavailable(format!(
                "granularity {granularity} is not a power of two"
            )));
        }

        tracing::debug!(
            registers = registers.len(),
            scratch = scratch.len(),
            granularity = granularity,
            "local mapping created"
        );

        Ok(Self {
            pool: BlockPool::new(scratch.len()),
            register_locks: LockTable::new(registers.len()),
            scratch_locks: LockTable::new(scratch.len()),
            registers,
            scratch,
            granularity,
        })
    }

    /// The scratch pool, for inspection.
    pub fn pool(&self) -> &BlockPool {
        &self.pool
    }
}

impl MappingService for LocalMapping {
    fn window(&self, kind: WindowKind) -> Option<&dyn MemorySegment> {
        match kind {
            WindowKind::Registers => Some(self.registers.as_ref()),
            WindowKind::Scratch => Some(self.scratch.as_ref()),
        }
    }

    fn granularity(&self) -> usize {
        self.granularity
    }

    fn alloc(&self, size: usize, align: usize) -> Option<usize> {
        self.pool.alloc(size, align.max(self.granularity))
    }

    fn free(&self, offset: usize, size: usize) {
        if !self.pool.free(offset, size) {
            tracing::warn!(offset = offset, size = size, "free of unowned scratch range ignored");
        }
    }

    fn lock(&self) -> Result<()> {
        self.register_locks.lock();
        Ok(())
    }

    fn unlock(&self) {
        self.register_locks.unlock();
    }

    fn partial_lock(&self, offset: usize, len: usize) -> Result<()> {
        self.scratch_locks.lock_range(offset, len)
    }

    fn partial_unlock(&self, offset: usize, len: usize) {
        self.scratch_locks.unlock_range(offset, len);
    }
}

impl std::fmt::Debug for LocalMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMapping")
            .field("registers", &self.registers.len())
            .field("scratch", &self.scratch.len())
            .field("granularity", &self.granularity)
            .field("free_bytes", &self.pool.free_bytes())
            .finish()
    }
}
