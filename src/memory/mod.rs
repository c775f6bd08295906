//! Mapped windows and the primitives behind [`LocalMapping`](crate::mapping::LocalMapping).
//!
//! - [`MemorySegment`]: a register or scratch window with volatile word access
//! - [`HeapSegment`] / [`SharedMemorySegment`]: process-local and memfd backings
//! - [`BlockPool`]: first-fit byte-range allocator
//! - [`LockTable`]: advisory whole-window and range locks

mod block_pool;
mod heap;
mod locks;
mod segment;
mod shared;

pub use block_pool::BlockPool;
pub use heap::HeapSegment;
pub use locks::LockTable;
pub use segment::{MemorySegment, WORD_SIZE};
pub use shared::SharedMemorySegment;
