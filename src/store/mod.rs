//! Growable raw byte storage
//!
//! `ByteStore` tracks a logical size on top of a [`Backing`] and enforces an
//! optional maximum size. Growth is amortized: capacity is expanded by the
//! configured factor rather than to the exact requested length.

mod backing;

pub use backing::{Backing, HeapBacking, VirtualBacking};

use crate::error::{BufferError, BufferResult};
use serde::{Deserialize, Serialize};

/// How capacity grows when a store runs out of room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrowthPolicy {
    /// Smallest capacity committed on first growth
    #[serde(default = "default_min_capacity")]
    pub min_capacity: u32,

    /// Capacity multiplier applied on each expansion
    #[serde(default = "default_factor")]
    pub factor: u32,
}

fn default_min_capacity() -> u32 {
    64
}

fn default_factor() -> u32 {
    2
}

impl Default for GrowthPolicy {
    fn default() -> Self {
        Self {
            min_capacity: default_min_capacity(),
            factor: default_factor(),
        }
    }
}

/// Resizable byte region with an upper bound.
pub struct ByteStore {
    backing: Box<dyn Backing>,
    size: u32,
    max_size: u32,
    growth: GrowthPolicy,
}

impl ByteStore {
    pub fn new() -> Self {
        Self::with_growth(GrowthPolicy::default())
    }

    pub fn with_growth(growth: GrowthPolicy) -> Self {
        Self {
            backing: Box::new(HeapBacking::new()),
            size: 0,
            max_size: u32::MAX,
            growth,
        }
    }

    /// Bytes written so far
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Bytes usable without further allocation, never above `max_size`.
    pub fn capacity(&self) -> u32 {
        self.backing.committed().min(self.max_size as usize) as u32
    }

    pub fn max_size(&self) -> u32 {
        self.max_size
    }

    pub fn is_virtual(&self) -> bool {
        self.backing.is_virtual()
    }

    pub fn data(&self) -> &[u8] {
        &self.backing.as_slice()[..self.size as usize]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        let size = self.size as usize;
        &mut self.backing.as_mut_slice()[..size]
    }

    /// Base address of the current allocation (null when nothing is allocated).
    pub fn base_ptr(&self) -> *const u8 {
        let slice = self.backing.as_slice();
        if slice.is_empty() {
            std::ptr::null()
        } else {
            slice.as_ptr()
        }
    }

    /// Limit the store to `max_size` bytes. Only allowed while empty.
    pub fn set_max_size(&mut self, max_size: u32) -> BufferResult<()> {
        if !self.is_empty() {
            return Err(BufferError::invalid_state(
                "max size can only be set on an empty buffer",
            ));
        }
        if self.is_virtual() {
            return self.set_virtual(max_size);
        }
        // nothing is stored, so committed memory can go
        self.backing.decommit();
        self.backing.reserve(max_size as usize)?;
        self.max_size = max_size;
        Ok(())
    }

    /// Switch to a virtual-memory backing reserving `max_size` bytes.
    /// Only allowed while empty.
    pub fn set_virtual(&mut self, max_size: u32) -> BufferResult<()> {
        if !self.is_empty() {
            return Err(BufferError::invalid_state(
                "virtual backing can only be enabled on an empty buffer",
            ));
        }
        let mut backing = VirtualBacking::new();
        backing.reserve(max_size as usize)?;
        self.backing = Box::new(backing);
        self.max_size = max_size;
        Ok(())
    }

    /// Make sure at least `capacity` bytes are committed.
    pub fn reserve(&mut self, capacity: u32) -> BufferResult<()> {
        if capacity > self.max_size {
            return Err(BufferError::capacity(capacity, self.max_size));
        }
        self.backing.commit(capacity as usize)
    }

    /// Extend the size by `additional` zero bytes and return the offset
    /// where they start. On failure the store is unchanged.
    pub fn grow_by(&mut self, additional: u32) -> BufferResult<u32> {
        let start = self.size;
        let new_size = self
            .size
            .checked_add(additional)
            .ok_or_else(|| BufferError::capacity(self.size as u64 + additional as u64, self.max_size))?;
        if new_size > self.max_size {
            return Err(BufferError::capacity(new_size, self.max_size));
        }
        self.ensure_capacity(new_size)?;
        self.size = new_size;
        Ok(start)
    }

    /// Set the size to exactly `size` bytes, zero-filling on growth.
    pub fn resize(&mut self, size: u32) -> BufferResult<()> {
        if size > self.max_size {
            return Err(BufferError::capacity(size, self.max_size));
        }
        if size > self.size {
            self.ensure_capacity(size)?;
        } else {
            // keep the tail zeroed so later growth reads as zero
            let old = self.size as usize;
            self.backing.as_mut_slice()[size as usize..old].fill(0);
        }
        self.size = size;
        Ok(())
    }

    /// Move the written bytes out, leaving the store empty.
    pub fn take_data(&mut self) -> Vec<u8> {
        let data = self.backing.take(self.size as usize);
        if self.backing.is_virtual() {
            self.backing = Box::new(HeapBacking::new());
            if self.max_size != u32::MAX {
                // keep the limit; a heap reservation cannot fail
                let _ = self.backing.reserve(self.max_size as usize);
            }
        }
        self.size = 0;
        data
    }

    /// Drop all content and give back committed memory. Limits and
    /// backing kind are kept.
    pub fn clear(&mut self) {
        self.backing.decommit();
        self.size = 0;
    }

    fn ensure_capacity(&mut self, required: u32) -> BufferResult<()> {
        let capacity = self.capacity();
        if required <= capacity {
            return Ok(());
        }
        let amortized = capacity
            .saturating_mul(self.growth.factor.max(1))
            .max(self.growth.min_capacity)
            .max(required)
            .min(self.max_size);
        self.backing.commit(amortized as usize)
    }
}

impl Default for ByteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ByteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteStore")
            .field("size", &self.size)
            .field("capacity", &self.capacity())
            .field("max_size", &self.max_size)
            .field("virtual", &self.is_virtual())
            .finish()
    }
}
