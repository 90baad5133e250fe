//! Buffer identifiers and byte locations.

use std::fmt;

/// Stable identifier of a buffer inside a [`BufferGraph`](crate::BufferGraph).
///
/// The generation changes every time a slot is reused, so an id held past
/// the destruction of its buffer never aliases a newer buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId {
    index: u32,
    generation: u32,
}

impl BufferId {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Arena slot index
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Slot generation
    pub const fn generation(&self) -> u32 {
        self.generation
    }

    /// Location at `offset` inside this buffer, unchecked.
    pub const fn at(self, offset: u32) -> Location {
        Location::new(offset, self)
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

/// An addressable byte position: `(offset, buffer)`.
///
/// Locations are plain values; holding one never keeps a buffer alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Location {
    pub offset: u32,
    pub buffer: BufferId,
}

impl Location {
    pub const fn new(offset: u32, buffer: BufferId) -> Self {
        Self { offset, buffer }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@0x{:x}", self.buffer, self.offset)
    }
}
