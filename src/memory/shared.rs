//! Shared memory window using Linux memfd.
//!
//! Stands in for the device node when several processes must see the same
//! register file and scratch bank: the memfd is passed to the other process
//! (fork, `SCM_RIGHTS`) and mapped again with [`SharedMemorySegment::from_fd`].

use super::MemorySegment;
use crate::error::{Error, Result};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::mm::{MapFlags, ProtFlags};
use std::ffi::CString;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr::NonNull;

/// A window backed by anonymous shared memory.
///
/// # Example
///
/// ```rust,no_run
/// use meram::memory::{MemorySegment, SharedMemorySegment};
///
/// let segment = SharedMemorySegment::new("meram-scratch", 1536 * 1024, 0xE808_0000)?;
/// segment.write_u32(0, 1)?;
/// # Ok::<(), meram::Error>(())
/// ```
pub struct SharedMemorySegment {
    fd: OwnedFd,
    ptr: NonNull<u8>,
    len: usize,
    phys_addr: u64,
    name: Option<String>,
}

impl SharedMemorySegment {
    /// Create a new zeroed shared window.
    ///
    /// # Errors
    ///
    /// Returns an error if `size` is 0, or if `memfd_create`, `ftruncate` or
    /// `mmap` fails.
    pub fn new(name: &str, size: usize, phys_addr: u64) -> Result<Self> {
        if size == 0 {
            return Err(Error::MappingUnavailable(
                "window size must be greater than 0".into(),
            ));
        }

        let cname = CString::new(name).map_err(|e| Error::MappingUnavailable(e.to_string()))?;
        let fd = rustix::fs::memfd_create(&cname, rustix::fs::MemfdFlags::CLOEXEC)?;
        rustix::fs::ftruncate(&fd, size as u64)?;

        // SAFETY: fresh fd of exactly `size` bytes.
        let mut segment = unsafe { Self::from_fd(fd, size, phys_addr)? };
        segment.name = Some(name.to_string());
        Ok(segment)
    }

    /// Map an existing memfd received from another process.
    ///
    /// # Safety
    ///
    /// `fd` must refer to a memfd of at least `size` bytes.
    pub unsafe fn from_fd(fd: OwnedFd, size: usize, phys_addr: u64) -> Result<Self> {
        if size == 0 {
            return Err(Error::MappingUnavailable(
                "window size must be greater than 0".into(),
            ));
        }

        // SAFETY: null hint, caller guarantees the fd covers `size` bytes.
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )?
        };

        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::MappingUnavailable("mmap returned null".into()))?;

        Ok(Self {
            fd,
            ptr,
            len: size,
            phys_addr,
            name: None,
        })
    }

    /// Duplicate the descriptor and map it a second time.
    ///
    /// The new mapping aliases the same pages, the way a second process
    /// would see them.
    pub fn try_clone(&self) -> Result<Self> {
        let fd = rustix::io::fcntl_dupfd_cloexec(&self.fd, 0)?;
        // SAFETY: the duplicate refers to the same memfd of `len` bytes.
        unsafe { Self::from_fd(fd, self.len, self.phys_addr) }
    }

    /// Raw descriptor, for passing to another process.
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Debug name of this window.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

// SAFETY: the mapping is page aligned, `len` bytes long, lives until drop and
// is shared memory, so writes through `&self` are permitted.
unsafe impl MemorySegment for SharedMemorySegment {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn len(&self) -> usize {
        self.len
    }

    fn phys_addr(&self) -> u64 {
        self.phys_addr
    }
}

impl Drop for SharedMemorySegment {
    fn drop(&mut self) {
        // SAFETY: ptr/len come from our own successful mmap.
        unsafe {
            let _ = rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

// SAFETY: the mapping is process-shared memory with no thread-local state.
unsafe impl Send for SharedMemorySegment {}
unsafe impl Sync for SharedMemorySegment {}

impl AsFd for SharedMemorySegment {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl std::fmt::Debug for SharedMemorySegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemorySegment")
            .field("name", &self.name)
            .field("len", &self.len)
            .field("phys_addr", &format_args!("{:#x}", self.phys_addr))
            .finish()
    }
}
