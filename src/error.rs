//! Error taxonomy for buffer construction, linking and serialization.

use crate::location::{BufferId, Location};
use thiserror::Error;

/// Errors produced by the buffer graph and the linker.
#[derive(Debug, Error)]
pub enum BufferError {
    /// A precondition on the buffer's state was violated.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The operation would exceed a reserved or maximum size.
    #[error("capacity exceeded: requested {requested} bytes, limit {limit}")]
    Capacity { requested: u64, limit: u64 },

    /// A fixup destination is not part of the closure being resolved.
    #[error("unresolved reference from {source_loc} to {destination}")]
    UnresolvedReference {
        source_loc: Location,
        destination: Location,
    },

    /// Two linked buffers disagree on pointer width or byte order.
    #[error("platform mismatch: {expected} vs {found} (buffer {buffer})")]
    PlatformMismatch {
        buffer: BufferId,
        expected: String,
        found: String,
    },

    /// A fixup points into a buffer that has been destroyed.
    #[error("dangling fixup at {source_loc}: destination buffer {destination} was destroyed")]
    DanglingFixup {
        source_loc: Location,
        destination: BufferId,
    },

    /// `add_*_fixup` was given a destination that does not exist.
    #[error("invalid fixup destination {0}")]
    InvalidDestination(Location),

    /// A fixup is already registered at this source location.
    #[error("a fixup is already registered at {0}")]
    DuplicateFixup(Location),

    /// The resolved value does not fit in the fixup's width.
    #[error("value {value} does not fit in {width} bytes at {at}")]
    EncodingOverflow { at: Location, value: i128, width: u32 },

    /// The stream write was cancelled; nothing was kept.
    #[error("write cancelled after {written} bytes, output discarded")]
    Cancelled { written: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BufferError {
    pub(crate) fn capacity(requested: impl Into<u64>, limit: impl Into<u64>) -> Self {
        BufferError::Capacity {
            requested: requested.into(),
            limit: limit.into(),
        }
    }

    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        BufferError::InvalidState(msg.into())
    }
}

/// Result type for buffer operations.
pub type BufferResult<T> = Result<T, BufferError>;
