//! Arena of buffers linked by fixups
//!
//! Buffers live in slots addressed by [`BufferId`]. Fixups store plain
//! locations, so a reference cycle between buffers never keeps anything
//! alive: a buffer is destroyed when its owner count drops to zero, and any
//! fixup still pointing at it is reported as dangling when the graph is linked.
//!
//! ```text
//!   A ──fixup@4──▶ B        A.outgoing[4]  = Pointer { B@0 }
//!   ▲              │        B.incoming     = { A@4 }
//!   └──fixup@0─────┘        B.outgoing[0]  = Offset  { A@8 }
//!                           A.incoming     = { B@0 }
//! ```

mod ops;

use crate::buffer::SmartBuffer;
use crate::config::{ConfigError, SmartBufferConfig};
use crate::error::{BufferError, BufferResult};
use crate::fixup::{Fixup, IncomingRef};
use crate::link::{ClosureSelection, Layout, LinkOptions, Linker, ResolvedImage};
use crate::location::{BufferId, Location};
use crate::platform::{is_valid_width, Platform};
use crate::store::GrowthPolicy;
use std::io::{Read, Write};

/// Generates `Location`-addressed typed writers and readers.
macro_rules! location_access {
    ($($write:ident / $read:ident : $ty:ty),* $(,)?) => {
        $(
            pub fn $write(&mut self, location: Location, value: $ty) -> BufferResult<()> {
                self.buffer_mut(location.buffer).$write(location.offset, value)
            }

            pub fn $read(&self, location: Location) -> Option<$ty> {
                self.get(location.buffer)?.$read(location.offset)
            }
        )*
    };
}

struct Entry {
    buffer: SmartBuffer,
    owners: u32,
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

/// Owns every buffer and the fixup edges between them.
pub struct BufferGraph {
    slots: Vec<Slot>,
    free: Vec<u32>,
    default_platform: Platform,
    growth: GrowthPolicy,
}

impl BufferGraph {
    pub fn new() -> Self {
        Self::with_defaults(Platform::default(), GrowthPolicy::default())
    }

    pub fn with_defaults(default_platform: Platform, growth: GrowthPolicy) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            default_platform,
            growth,
        }
    }

    /// A graph using the default platform and growth policy from `config`.
    pub fn with_config(config: &SmartBufferConfig) -> Result<Self, ConfigError> {
        Ok(Self::with_defaults(config.default_platform()?, config.growth))
    }

    pub fn default_platform(&self) -> &Platform {
        &self.default_platform
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Create an empty buffer on the default platform, owned once.
    pub fn create_buffer(&mut self) -> BufferId {
        let platform = self.default_platform.clone();
        self.create_buffer_for(platform)
    }

    /// Create an empty buffer on `platform`, owned once.
    pub fn create_buffer_for(&mut self, platform: Platform) -> BufferId {
        let entry = Entry {
            buffer: SmartBuffer::new(platform, self.growth),
            owners: 1,
        };
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.entry = Some(entry);
                BufferId::new(index, slot.generation)
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                BufferId::new(index, 0)
            }
        };
        tracing::debug!(buffer = %id, "Created buffer");
        id
    }

    /// Create a named buffer on the default platform.
    pub fn create_named(&mut self, name: impl Into<String>) -> BufferId {
        let id = self.create_buffer();
        self.buffer_mut(id).set_name(name);
        id
    }

    /// Create a buffer holding everything `reader` yields.
    pub fn create_from_reader<R: Read>(
        &mut self,
        reader: &mut R,
        platform: Platform,
    ) -> BufferResult<BufferId> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        let id = self.create_buffer_for(platform);
        if let Err(e) = self.buffer_mut(id).append_bytes(&bytes) {
            self.release(id);
            return Err(e);
        }
        Ok(id)
    }

    /// Whether `id` names a live buffer.
    pub fn contains(&self, id: BufferId) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: BufferId) -> Option<&SmartBuffer> {
        self.slots
            .get(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.entry.as_ref())
            .map(|entry| &entry.buffer)
    }

    pub fn get_mut(&mut self, id: BufferId) -> Option<&mut SmartBuffer> {
        self.entry_mut(id).map(|entry| &mut entry.buffer)
    }

    /// # Panics
    /// If `id` is not a live buffer.
    pub fn buffer(&self, id: BufferId) -> &SmartBuffer {
        match self.get(id) {
            Some(buffer) => buffer,
            None => panic!("buffer {} is not live", id),
        }
    }

    /// # Panics
    /// If `id` is not a live buffer.
    pub fn buffer_mut(&mut self, id: BufferId) -> &mut SmartBuffer {
        match self.get_mut(id) {
            Some(buffer) => buffer,
            None => panic!("buffer {} is not live", id),
        }
    }

    /// Number of live buffers
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of all live buffers in slot order.
    pub fn ids(&self) -> impl Iterator<Item = BufferId> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.entry
                .as_ref()
                .map(|_| BufferId::new(index as u32, slot.generation))
        })
    }

    /// Add an owner to `id`.
    pub fn retain(&mut self, id: BufferId) {
        match self.entry_mut(id) {
            Some(entry) => entry.owners += 1,
            None => panic!("retain of dead buffer {}", id),
        }
    }

    /// Drop an owner of `id`. Returns true if this destroyed the buffer.
    pub fn release(&mut self, id: BufferId) -> bool {
        let entry = match self.entry_mut(id) {
            Some(entry) => entry,
            None => panic!("release of dead buffer {}", id),
        };
        entry.owners -= 1;
        if entry.owners > 0 {
            return false;
        }
        self.destroy(id);
        true
    }

    pub fn owner_count(&self, id: BufferId) -> u32 {
        self.slots
            .get(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.entry.as_ref())
            .map_or(0, |entry| entry.owners)
    }

    fn destroy(&mut self, id: BufferId) {
        let slot = &mut self.slots[id.index() as usize];
        let entry = match slot.entry.take() {
            Some(entry) => entry,
            None => return,
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index());

        let buffer = entry.buffer;
        for (offset, fixup) in buffer.outgoing_fixups() {
            if let Some(destination) = fixup.destination() {
                if let Some(dest) = self.get_mut(destination.buffer) {
                    dest.remove_incoming(&IncomingRef {
                        referrer: id,
                        offset: *offset,
                    });
                }
            }
        }

        let dangling = buffer
            .incoming_fixups()
            .iter()
            .filter(|r| r.referrer != id)
            .count();
        if dangling > 0 {
            tracing::warn!(
                buffer = %id,
                dangling,
                "Destroyed buffer is still referenced by fixups"
            );
        } else {
            tracing::debug!(buffer = %id, "Destroyed buffer");
        }
    }

    fn entry_mut(&mut self, id: BufferId) -> Option<&mut Entry> {
        self.slots
            .get_mut(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.entry.as_mut())
    }

    // ------------------------------------------------------------------
    // Addressing
    // ------------------------------------------------------------------

    /// Location of the first byte.
    pub fn head_location(&self, id: BufferId) -> Location {
        assert!(self.contains(id), "buffer {} is not live", id);
        id.at(0)
    }

    /// Location just past the written data.
    pub fn current_location(&self, id: BufferId) -> Location {
        id.at(self.buffer(id).size())
    }

    /// # Panics
    /// If `offset` is beyond the buffer's size.
    pub fn offset_location(&self, id: BufferId, offset: u32) -> Location {
        let size = self.buffer(id).size();
        assert!(
            offset <= size,
            "offset {} beyond size {} of buffer {}",
            offset,
            size,
            id
        );
        id.at(offset)
    }

    /// Location of a raw address inside the buffer's allocation.
    ///
    /// # Panics
    /// If `address` is outside the written data.
    pub fn address_location(&self, id: BufferId, address: *const u8) -> Location {
        let store = self.buffer(id).store();
        let base = store.base_ptr() as usize;
        let addr = address as usize;
        assert!(
            !store.base_ptr().is_null() && addr >= base && addr < base + store.size() as usize,
            "address {:p} is outside buffer {}",
            address,
            id
        );
        id.at((addr - base) as u32)
    }

    // ------------------------------------------------------------------
    // Storage
    // ------------------------------------------------------------------

    pub fn grow_by(&mut self, id: BufferId, additional: u32) -> BufferResult<Location> {
        let offset = self.buffer_mut(id).store_mut().grow_by(additional)?;
        Ok(id.at(offset))
    }

    /// Set the size of `id`. Shrinking below a registered fixup is refused.
    pub fn resize(&mut self, id: BufferId, size: u32) -> BufferResult<()> {
        let buffer = self.buffer_mut(id);
        if let Some((&last, fixup)) = buffer.outgoing_fixups().iter().next_back() {
            if last + fixup.width(buffer.platform()) > size && size < buffer.size() {
                return Err(BufferError::invalid_state(format!(
                    "resize to {} would cut the fixup at offset {}",
                    size, last
                )));
            }
        }
        buffer.store_mut().resize(size)
    }

    pub fn reserve(&mut self, id: BufferId, capacity: u32) -> BufferResult<()> {
        self.buffer_mut(id).store_mut().reserve(capacity)
    }

    pub fn set_max_size(&mut self, id: BufferId, max_size: u32) -> BufferResult<()> {
        self.buffer_mut(id).store_mut().set_max_size(max_size)
    }

    pub fn set_virtual(&mut self, id: BufferId, max_size: u32) -> BufferResult<()> {
        self.buffer_mut(id).store_mut().set_virtual(max_size)
    }

    pub fn set_platform(&mut self, id: BufferId, platform: Platform) {
        self.buffer_mut(id).set_platform(platform);
    }

    /// Append `bytes` to `id` and return where they landed.
    pub fn append_bytes(&mut self, id: BufferId, bytes: &[u8]) -> BufferResult<Location> {
        let offset = self.buffer_mut(id).append_bytes(bytes)?;
        Ok(id.at(offset))
    }

    pub fn write_bytes(&mut self, location: Location, bytes: &[u8]) -> BufferResult<()> {
        self.buffer_mut(location.buffer)
            .write_bytes(location.offset, bytes)
    }

    location_access! {
        write_i8 / read_i8: i8,
        write_u8 / read_u8: u8,
        write_i16 / read_i16: i16,
        write_u16 / read_u16: u16,
        write_i32 / read_i32: i32,
        write_u32 / read_u32: u32,
        write_i64 / read_i64: i64,
        write_u64 / read_u64: u64,
        write_f32 / read_f32: f32,
        write_f64 / read_f64: f64,
    }

    /// Empty `id`: data and outgoing fixups are removed and its memory is
    /// given back.
    pub fn reset(&mut self, id: BufferId) {
        self.drop_outgoing(id);
        self.buffer_mut(id).store_mut().clear();
    }

    /// Move the bytes of `id` out to the caller, leaving the buffer empty.
    /// Its outgoing fixups go with the bytes they described.
    pub fn take_data(&mut self, id: BufferId) -> Vec<u8> {
        self.drop_outgoing(id);
        self.buffer_mut(id).store_mut().take_data()
    }

    fn drop_outgoing(&mut self, id: BufferId) {
        let outgoing = self.buffer_mut(id).take_outgoing();
        for (offset, fixup) in outgoing {
            if let Some(destination) = fixup.destination() {
                if let Some(dest) = self.get_mut(destination.buffer) {
                    dest.remove_incoming(&IncomingRef {
                        referrer: id,
                        offset,
                    });
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Fixups
    // ------------------------------------------------------------------

    /// Register `fixup` at `source`.
    ///
    /// Returns `InvalidDestination` if the destination buffer is gone or the
    /// destination offset lies beyond its capacity, and `DuplicateFixup` if
    /// `source` already holds a fixup. Neither leaves any trace in the graph.
    ///
    /// # Panics
    /// If the source buffer is not live, `source.offset` is not inside the
    /// written data, or a size override is not 1, 2, 4 or 8.
    pub fn add_fixup(&mut self, source: Location, fixup: Fixup) -> BufferResult<()> {
        let src = self.buffer(source.buffer);
        assert!(
            source.offset < src.size(),
            "fixup source {} beyond buffer size {}",
            source,
            src.size()
        );
        if let Fixup::Pointer { size: Some(size), .. } | Fixup::VTable { size: Some(size), .. } =
            fixup
        {
            assert!(is_valid_width(size), "unsupported fixup size {}", size);
        }

        if let Some(destination) = fixup.destination() {
            let valid = self
                .get(destination.buffer)
                .is_some_and(|dest| destination.offset <= dest.capacity().max(dest.size()));
            if !valid {
                return Err(BufferError::InvalidDestination(destination));
            }
        }
        if src.outgoing_fixups().contains_key(&source.offset) {
            return Err(BufferError::DuplicateFixup(source));
        }

        self.buffer_mut(source.buffer)
            .insert_outgoing(source.offset, fixup);
        if let Some(destination) = fixup.destination() {
            self.buffer_mut(destination.buffer)
                .add_incoming(IncomingRef::from(source));
        }
        Ok(())
    }

    /// Make `source` hold an offset to `destination` once linked.
    pub fn add_offset_fixup(
        &mut self,
        source: Location,
        destination: Location,
        absolute: bool,
    ) -> BufferResult<()> {
        self.add_fixup(
            source,
            Fixup::Offset {
                destination,
                absolute,
            },
        )
    }

    /// Make `source` hold the runtime address of `destination` once linked.
    /// `size` defaults to the source platform's pointer width.
    pub fn add_pointer_fixup(
        &mut self,
        source: Location,
        destination: Location,
        size: Option<u32>,
    ) -> BufferResult<()> {
        self.add_fixup(source, Fixup::Pointer { destination, size })
    }

    /// Make `source` hold `class_index` for the runtime loader to swap for a
    /// vtable address.
    pub fn add_vtable_fixup(
        &mut self,
        source: Location,
        class_index: u32,
        size: Option<u32>,
    ) -> BufferResult<()> {
        self.add_fixup(source, Fixup::VTable { class_index, size })
    }

    /// Unregister the fixup at `source`, if any.
    pub fn remove_fixup(&mut self, source: Location) -> Option<Fixup> {
        let fixup = self
            .get_mut(source.buffer)?
            .take_outgoing_at(source.offset)?;
        if let Some(destination) = fixup.destination() {
            if let Some(dest) = self.get_mut(destination.buffer) {
                dest.remove_incoming(&IncomingRef::from(source));
            }
        }
        Some(fixup)
    }

    // ------------------------------------------------------------------
    // Linking
    // ------------------------------------------------------------------

    /// Lay out, resolve and return the patched image of `selection`.
    pub fn link(
        &self,
        selection: ClosureSelection,
        options: LinkOptions,
    ) -> BufferResult<ResolvedImage> {
        let mut linker = Linker::new(self, selection, options);
        linker.resolve()?;
        linker
            .into_image()
            .ok_or_else(|| BufferError::invalid_state("linker produced no image"))
    }

    /// Link `selection` and write the blob to `out`. Returns bytes written.
    ///
    /// A link error writes nothing. An I/O error part way through leaves
    /// the bytes `out` already accepted; see [`Linker::write_staged`] for
    /// output that is discarded on failure.
    pub fn write_to_stream<W: Write>(
        &self,
        out: &mut W,
        selection: ClosureSelection,
        options: LinkOptions,
    ) -> BufferResult<u64> {
        let mut linker = Linker::new(self, selection, options);
        linker.write_to(out)
    }

    /// Link `selection` and copy the patched bytes back into each buffer.
    pub fn resolve_in_place(
        &mut self,
        selection: ClosureSelection,
        options: LinkOptions,
    ) -> BufferResult<Layout> {
        let image = self.link(selection, options)?;
        for placement in image.layout().placements() {
            let start = placement.offset as usize;
            let end = start + placement.size as usize;
            self.buffer_mut(placement.buffer)
                .data_mut()
                .copy_from_slice(&image.bytes()[start..end]);
        }
        Ok(image.into_layout())
    }
}

impl Default for BufferGraph {
    fn default() -> Self {
        Self::new()
    }
}
