//! # meram
//!
//! Slot arbitration and scratch-memory allocation for the MERAM on-chip
//! memory unit.
//!
//! MERAM exposes a fixed set of image cache blocks (ICBs) and a small bank
//! of scratch memory shared by every client on the chip. This crate lets
//! many threads share them safely:
//!
//! - **Slot arbiter**: at most one live [`Icb`](icb::Icb) per slot index,
//!   with blocking, non-blocking and timed acquisition
//! - **Region allocator**: block ranges carved from the scratch pool that
//!   never touch the reserved ranges listed in the config file
//! - **Sessions**: refcounted access to the device mapping; the first open
//!   maps it, the last close unmaps it
//!
//! ## Quick Start
//!
//! ```rust
//! use meram::prelude::*;
//!
//! let registry = Registry::with_local_mapping(
//!     SessionConfig::default().with_inline("reserved 0 63"),
//!     LocalMappingConfig::default(),
//! );
//! let session = registry.open()?;
//!
//! let mut icb = session.acquire_slot(4)?;
//! let blocks = required_memory_size(1920, 16);
//! let offset = icb.bind_memory(blocks)?;
//! assert!(offset > 63);
//!
//! icb.write(0x0, offset as u32)?;
//! icb.release();
//! session.close();
//! # Ok::<(), meram::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod arbiter;
pub mod config;
pub mod error;
pub mod icb;
pub mod mapping;
pub mod memory;
pub mod region;
pub mod session;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::arbiter::SlotArbiter;
    pub use crate::config::{ConfigSource, MeramConfig, SessionConfig};
    pub use crate::error::{Error, Result};
    pub use crate::icb::{Icb, MemoryBinding, Plane};
    pub use crate::mapping::{LocalMapping, LocalMappingConfig, MappingService, WindowKind};
    pub use crate::region::{AllocatedRange, required_memory_size};
    pub use crate::session::{Registry, Session, close_session, open_session};
}

pub use error::{Error, Result};
pub use icb::release_slot;
pub use region::required_memory_size;
pub use session::{close_session, open_session};
