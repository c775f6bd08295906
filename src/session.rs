//! Sessions: refcounted access to one mapped MERAM device.
//!
//! A [`Registry`] owns everything shared between sessions of one device: the
//! slot arbiter, and while at least one [`Session`] is open, the mapping
//! service and the parsed config file. The first open creates the mapping
//! and loads the config; the last close drops both. Opening and closing are
//! serialized by the registry mutex, so concurrent first opens never map the
//! device twice.
//!
//! The slot arbiter is not part of the per-mapping state and survives a full
//! close/reopen cycle.
//!
//! # Example
//!
//! ```rust
//! use meram::config::SessionConfig;
//! use meram::mapping::LocalMappingConfig;
//! use meram::session::Registry;
//!
//! let registry = Registry::with_local_mapping(
//!     SessionConfig::default().with_inline("reserved 0 15"),
//!     LocalMappingConfig::default(),
//! );
//!
//! let session = registry.open().unwrap();
//! let range = session.alloc_region(8).unwrap();
//! assert!(range.offset > 15);
//! session.free_region(range);
//! session.close();
//!
//! assert!(!registry.is_mapped());
//! ```

use crate::arbiter::SlotArbiter;
use crate::config::{MeramConfig, SessionConfig, TagEntry};
use crate::error::{Error, Result};
use crate::icb::Icb;
use crate::mapping::{LocalMapping, LocalMappingConfig, MappingService, WindowKind};
use crate::memory::{MemorySegment, WORD_SIZE};
use crate::region::{AllocatedRange, BLOCK_SHIFT, BLOCK_SIZE, RegionAllocator};
use parking_lot::Mutex;
use std::mem::ManuallyDrop;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Size of the common register block at the start of the register window.
pub const COMMON_REGISTER_LEN: usize = 0x80;

/// Creates the mapping service on the first open of a registry.
pub type MappingOpener = Box<dyn Fn() -> Result<Box<dyn MappingService>> + Send + Sync>;

/// State that exists only while at least one session is open.
struct Shared {
    mapping: Box<dyn MappingService>,
    config: MeramConfig,
    max_alloc_attempts: usize,
}

impl Drop for Shared {
    fn drop(&mut self) {
        tracing::debug!("mapping torn down");
    }
}

#[derive(Default)]
struct RegistryState {
    refs: usize,
    shared: Option<Arc<Shared>>,
}

/// Refcounted owner of one device's shared state.
pub struct Registry {
    config: SessionConfig,
    opener: MappingOpener,
    state: Mutex<RegistryState>,
    arbiter: SlotArbiter,
}

impl Registry {
    /// Create a registry whose first open calls `opener`.
    pub fn new<F>(config: SessionConfig, opener: F) -> Self
    where
        F: Fn() -> Result<Box<dyn MappingService>> + Send + Sync + 'static,
    {
        Self {
            config,
            opener: Box::new(opener),
            state: Mutex::new(RegistryState::default()),
            arbiter: SlotArbiter::new(),
        }
    }

    /// Create a registry backed by a fresh [`LocalMapping`] on every first open.
    pub fn with_local_mapping(config: SessionConfig, mapping: LocalMappingConfig) -> Self {
        Self::new(config, move || {
            let mapping = LocalMapping::new(&mapping)?;
            Ok(Box::new(mapping) as Box<dyn MappingService>)
        })
    }

    /// The process-wide registry used by [`open_session`].
    ///
    /// Built on first use from [`SessionConfig::from_env`] and a default
    /// [`LocalMapping`].
    pub fn global() -> &'static Registry {
        static GLOBAL: OnceLock<Registry> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            Registry::with_local_mapping(SessionConfig::from_env(), LocalMappingConfig::default())
        })
    }

    /// Open a session, mapping the device if no session is open yet.
    ///
    /// # Errors
    ///
    /// - [`Error::MappingUnavailable`] if the opener fails or a window is missing
    /// - [`Error::ConfigLoad`] / [`Error::ConfigRead`] if the config cannot be loaded
    ///
    /// On error the registry is left exactly as it was.
    pub fn open(&self) -> Result<Session<'_>> {
        let mut state = self.state.lock();

        let shared = match &state.shared {
            Some(shared) => Arc::clone(shared),
            None => {
                let shared = Arc::new(self.create_shared()?);
                state.shared = Some(Arc::clone(&shared));
                shared
            }
        };
        state.refs += 1;
        tracing::trace!(refs = state.refs, "session opened");

        Ok(Session {
            registry: self,
            shared: ManuallyDrop::new(shared),
        })
    }

    fn create_shared(&self) -> Result<Shared> {
        let mapping = (self.opener)().map_err(|e| match e {
            e @ Error::MappingUnavailable(_) => e,
            other => Error::MappingUnavailable(other.to_string()),
        })?;

        for kind in [WindowKind::Registers, WindowKind::Scratch] {
            if mapping.window(kind).is_none() {
                return Err(Error::MappingUnavailable(format!("{kind:?} window missing")));
            }
        }

        let config = MeramConfig::load(&self.config.config_source)?;

        tracing::debug!(
            granularity = mapping.granularity(),
            reserved = config.reserved.len(),
            "mapping opened"
        );

        Ok(Shared {
            mapping,
            config,
            max_alloc_attempts: self.config.max_alloc_attempts,
        })
    }

    fn retain(&self) {
        self.state.lock().refs += 1;
    }

    /// Give back one reference. On the last one the mapping is torn down
    /// before the lock is released, so a concurrent open never sees a
    /// second mapping alongside the dying one.
    fn release(&self, shared: Arc<Shared>) {
        let mut state = self.state.lock();
        state.refs = state.refs.saturating_sub(1);
        tracing::trace!(refs = state.refs, "session closed");

        drop(shared);
        if state.refs == 0 {
            drop(state.shared.take());
        }
    }

    /// Number of open sessions.
    pub fn ref_count(&self) -> usize {
        self.state.lock().refs
    }

    /// Check whether the device is currently mapped.
    pub fn is_mapped(&self) -> bool {
        self.state.lock().shared.is_some()
    }

    /// The slot arbiter shared by all sessions of this registry.
    ///
    /// Only occupancy and statistics are visible here; slots are taken and
    /// given back through [`Icb`] handles alone.
    ///
    /// ```rust,compile_fail
    /// # use meram::config::SessionConfig;
    /// # use meram::mapping::LocalMappingConfig;
    /// # use meram::session::Registry;
    /// let registry =
    ///     Registry::with_local_mapping(SessionConfig::default(), LocalMappingConfig::default());
    /// registry.arbiter().release(4);
    /// ```
    pub fn arbiter(&self) -> &SlotArbiter {
        &self.arbiter
    }

    /// Runtime configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("config", &self.config)
            .field("refs", &self.ref_count())
            .field("arbiter", &self.arbiter.stats())
            .finish()
    }
}

/// An open reference to a mapped device.
///
/// Cloning opens another reference; dropping (or [`close`](Self::close))
/// gives it back. The device stays mapped while any session of its registry
/// is alive.
pub struct Session<'r> {
    registry: &'r Registry,
    // Handed back to the registry on drop, see `Registry::release`.
    shared: ManuallyDrop<Arc<Shared>>,
}

impl<'r> Session<'r> {
    /// Close this session. Closing the last one unmaps the device.
    pub fn close(self) {
        drop(self);
    }

    /// Take slot `index`, waiting for its current owner to release it.
    pub fn acquire_slot(&self, index: usize) -> Result<Icb<'_>> {
        self.registry.arbiter.acquire(index)?;
        Ok(Icb::new(self, index))
    }

    /// Take slot `index` if it is free.
    ///
    /// # Errors
    ///
    /// [`Error::SlotUnavailable`] if another handle holds the slot.
    pub fn try_acquire_slot(&self, index: usize) -> Result<Icb<'_>> {
        self.registry.arbiter.try_acquire(index)?;
        Ok(Icb::new(self, index))
    }

    /// Take slot `index`, waiting at most `timeout`.
    pub fn acquire_slot_timeout(&self, index: usize, timeout: Duration) -> Result<Icb<'_>> {
        self.registry.arbiter.acquire_timeout(index, timeout)?;
        Ok(Icb::new(self, index))
    }

    /// Allocate `size` blocks of scratch memory clear of all reserved ranges.
    pub fn alloc_region(&self, size: usize) -> Result<AllocatedRange> {
        self.allocator().alloc(size)
    }

    /// Return a range obtained from [`alloc_region`](Self::alloc_region).
    pub fn free_region(&self, range: AllocatedRange) {
        self.allocator().free(range);
    }

    /// Fill `n_blocks` blocks starting at block `offset` with `value`.
    pub fn fill_region(&self, offset: usize, n_blocks: usize, value: u32) -> Result<()> {
        self.allocator().fill(offset, n_blocks, value)
    }

    /// Take the device-wide lock over the common registers.
    pub fn lock_registers(&self) -> Result<RegisterLock<'_>> {
        self.shared.mapping.lock()?;
        Ok(RegisterLock { session: self })
    }

    /// Take an advisory lock over `size` blocks starting at block `offset`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidSize`] if `size` is 0
    /// - [`Error::ReservedOverlap`] if the range touches a reserved range
    /// - [`Error::OutOfBounds`] if the range lies outside the scratch window
    pub fn lock_region(&self, offset: usize, size: usize) -> Result<RegionLock<'_>> {
        if size == 0 {
            return Err(Error::InvalidSize);
        }
        let last = offset
            .checked_add(size - 1)
            .ok_or(Error::ReservedOverlap { offset, size })?;
        if self.shared.config.reserved.first_overlap(offset, last).is_some() {
            return Err(Error::ReservedOverlap { offset, size });
        }

        let range = AllocatedRange { offset, size };
        let (byte_offset, byte_len) = byte_span(range)?;
        self.shared.mapping.partial_lock(byte_offset, byte_len)?;
        tracing::trace!(offset = offset, size = size, "region locked");

        Ok(RegionLock {
            session: self,
            byte_offset,
            byte_len,
        })
    }

    /// Look up an IPMMUI tag. The first entry in file order wins.
    pub fn tag(&self, name: &str) -> Option<&TagEntry> {
        self.shared.config.tags.get(name)
    }

    /// The parsed config file.
    pub fn config(&self) -> &MeramConfig {
        &self.shared.config
    }

    /// The mapping service.
    pub fn mapping(&self) -> &dyn MappingService {
        self.shared.mapping.as_ref()
    }

    /// The registry this session belongs to.
    pub fn registry(&self) -> &'r Registry {
        self.registry
    }

    pub(crate) fn arbiter(&self) -> &SlotArbiter {
        &self.registry.arbiter
    }

    pub(crate) fn window(&self, kind: WindowKind) -> Result<&dyn MemorySegment> {
        self.shared
            .mapping
            .window(kind)
            .ok_or_else(|| Error::MappingUnavailable(format!("{kind:?} window missing")))
    }

    fn allocator(&self) -> RegionAllocator<'_> {
        RegionAllocator::new(
            self.shared.mapping.as_ref(),
            &self.shared.config.reserved,
            self.shared.max_alloc_attempts,
        )
    }
}

impl Clone for Session<'_> {
    fn clone(&self) -> Self {
        self.registry.retain();
        Self {
            registry: self.registry,
            shared: ManuallyDrop::new(Arc::clone(&self.shared)),
        }
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        // SAFETY: `shared` is never touched again after this point.
        let shared = unsafe { ManuallyDrop::take(&mut self.shared) };
        self.registry.release(shared);
    }
}

impl std::fmt::Debug for Session<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("reserved", &self.shared.config.reserved.len())
            .field("tags", &self.shared.config.tags.len())
            .finish_non_exhaustive()
    }
}

fn byte_span(range: AllocatedRange) -> Result<(usize, usize)> {
    match (
        range.offset.checked_mul(BLOCK_SIZE),
        range.size.checked_mul(BLOCK_SIZE),
    ) {
        (Some(offset), Some(len)) => Ok((offset, len)),
        _ => Err(Error::OutOfBounds {
            offset: range.offset,
            len: range.size,
        }),
    }
}

/// Device-wide lock over the common register block. Unlocks on drop.
pub struct RegisterLock<'s> {
    session: &'s Session<'s>,
}

impl RegisterLock<'_> {
    /// Read a common register.
    pub fn read(&self, offset: usize) -> Result<u32> {
        check_common(offset)?;
        self.session.window(WindowKind::Registers)?.read_u32(offset)
    }

    /// Write a common register.
    pub fn write(&self, offset: usize, value: u32) -> Result<()> {
        check_common(offset)?;
        self.session
            .window(WindowKind::Registers)?
            .write_u32(offset, value)
    }
}

impl Drop for RegisterLock<'_> {
    fn drop(&mut self) {
        self.session.shared.mapping.unlock();
    }
}

fn check_common(offset: usize) -> Result<()> {
    if offset % WORD_SIZE != 0 || offset + WORD_SIZE > COMMON_REGISTER_LEN {
        return Err(Error::OutOfBounds {
            offset,
            len: WORD_SIZE,
        });
    }
    Ok(())
}

/// Advisory lock over a range of scratch blocks. Unlocks on drop.
pub struct RegionLock<'s> {
    session: &'s Session<'s>,
    byte_offset: usize,
    byte_len: usize,
}

impl RegionLock<'_> {
    /// Locked blocks.
    pub fn range(&self) -> AllocatedRange {
        AllocatedRange {
            offset: self.byte_offset >> BLOCK_SHIFT,
            size: self.byte_len >> BLOCK_SHIFT,
        }
    }
}

impl Drop for RegionLock<'_> {
    fn drop(&mut self) {
        self.session
            .shared
            .mapping
            .partial_unlock(self.byte_offset, self.byte_len);
    }
}

/// Open a session on the process-wide [`Registry::global`].
pub fn open_session() -> Result<Session<'static>> {
    Registry::global().open()
}

/// Close a session. Equivalent to dropping it.
pub fn close_session(session: Session<'_>) {
    session.close();
}
