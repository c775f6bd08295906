//! Error types for meram.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using meram's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for meram operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The configuration source is malformed.
    #[error("config line {line}: {reason}")]
    ConfigLoad {
        /// 1-based line number of the offending line.
        line: usize,
        /// What was wrong with it.
        reason: String,
    },

    /// The configuration file could not be read.
    #[error("cannot read config {}: {source}", path.display())]
    ConfigRead {
        /// Path that was opened.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The mapping service could not be opened or lacks a required window.
    #[error("mapping unavailable: {0}")]
    MappingUnavailable(String),

    /// The slot is held by another handle and the caller chose not to wait.
    #[error("slot {index} is in use")]
    SlotUnavailable {
        /// Requested slot index.
        index: usize,
    },

    /// The slot index is outside the hardware range.
    #[error("slot index {index} out of range")]
    InvalidIndex {
        /// Requested slot index.
        index: usize,
    },

    /// No clean range of the requested size could be carved from the pool.
    #[error("scratch memory exhausted: no clean range of {size} blocks after {attempts} attempts")]
    AllocationExhausted {
        /// Requested size in blocks.
        size: usize,
        /// Number of candidates requested from the pool.
        attempts: usize,
    },

    /// The handle is in the wrong state for the operation.
    #[error("invalid handle: {0}")]
    InvalidHandle(&'static str),

    /// Zero-sized allocation request.
    #[error("allocation size must be greater than 0")]
    InvalidSize,

    /// Access outside a mapped window.
    #[error("access of {len} bytes at offset {offset:#x} is out of bounds")]
    OutOfBounds {
        /// Byte offset of the access.
        offset: usize,
        /// Length of the access in bytes.
        len: usize,
    },

    /// An explicit lock request covers reserved blocks.
    #[error("blocks {offset}..{} overlap a reserved range", offset + size)]
    ReservedOverlap {
        /// First block of the request.
        offset: usize,
        /// Size of the request in blocks.
        size: usize,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
