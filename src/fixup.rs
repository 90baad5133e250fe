//! Deferred relocation records
//!
//! A fixup is stored in the outgoing table of the buffer that holds the bytes
//! to patch, keyed by offset. The destination buffer keeps an [`IncomingRef`]
//! back to that slot so the graph can be rewired when buffers are merged.

use crate::location::{BufferId, Location};
use crate::platform::Platform;
use std::fmt;

/// Width in bytes of an encoded offset fixup.
pub const OFFSET_FIXUP_SIZE: u32 = 4;

/// A relocation instruction resolved at link time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fixup {
    /// Offset to `destination`. Absolute offsets are measured from the start
    /// of the serialized blob, relative ones from the fixup's own position.
    Offset { destination: Location, absolute: bool },

    /// Runtime address of `destination` (load base + blob offset).
    Pointer {
        destination: Location,
        size: Option<u32>,
    },

    /// Class index, later swapped for a vtable address by the runtime loader.
    VTable { class_index: u32, size: Option<u32> },
}

impl Fixup {
    /// The referenced location, if this fixup has one.
    pub fn destination(&self) -> Option<Location> {
        match self {
            Fixup::Offset { destination, .. } | Fixup::Pointer { destination, .. } => {
                Some(*destination)
            }
            Fixup::VTable { .. } => None,
        }
    }

    /// Number of bytes patched when encoding for `platform`.
    pub fn width(&self, platform: &Platform) -> u32 {
        match self {
            Fixup::Offset { .. } => OFFSET_FIXUP_SIZE,
            Fixup::Pointer { size, .. } | Fixup::VTable { size, .. } => {
                size.unwrap_or_else(|| platform.pointer_width())
            }
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Fixup::Offset { absolute: true, .. } => "offset(abs)",
            Fixup::Offset { absolute: false, .. } => "offset(rel)",
            Fixup::Pointer { .. } => "pointer",
            Fixup::VTable { .. } => "vtable",
        }
    }

    /// Point the destination at `to` + `delta` if it currently targets `from`.
    pub(crate) fn retarget(&mut self, from: BufferId, to: BufferId, delta: u32) -> bool {
        match self {
            Fixup::Offset { destination, .. } | Fixup::Pointer { destination, .. }
                if destination.buffer == from =>
            {
                *destination = Location::new(destination.offset + delta, to);
                true
            }
            _ => false,
        }
    }
}

impl fmt::Display for Fixup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fixup::Offset { destination, .. } => {
                write!(f, "{} -> {}", self.kind_name(), destination)
            }
            Fixup::Pointer { destination, size } => match size {
                Some(size) => write!(f, "pointer[{}] -> {}", size, destination),
                None => write!(f, "pointer -> {}", destination),
            },
            Fixup::VTable { class_index, size } => match size {
                Some(size) => write!(f, "vtable[{}] class {}", size, class_index),
                None => write!(f, "vtable class {}", class_index),
            },
        }
    }
}

/// Back-reference kept by a destination buffer: "the fixup at
/// `referrer@offset` points at me". Never owns the referrer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IncomingRef {
    pub referrer: BufferId,
    pub offset: u32,
}

impl IncomingRef {
    pub fn location(&self) -> Location {
        Location::new(self.offset, self.referrer)
    }
}

impl From<Location> for IncomingRef {
    fn from(loc: Location) -> Self {
        Self {
            referrer: loc.buffer,
            offset: loc.offset,
        }
    }
}
