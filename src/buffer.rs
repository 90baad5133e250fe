//! A growable buffer with relocation tables
//!
//! `SmartBuffer` owns its bytes and the fixups that patch them. It does not
//! know about other buffers: cross-buffer bookkeeping (back-references,
//! adoption, closure collection) lives in [`BufferGraph`](crate::BufferGraph).

use crate::error::{BufferError, BufferResult};
use crate::fixup::{Fixup, IncomingRef};
use crate::platform::{Endianness, Platform};
use crate::store::{ByteStore, GrowthPolicy};
use std::collections::{BTreeMap, BTreeSet};

/// Generates typed accessors that honour the buffer's byte order.
macro_rules! typed_access {
    ($($write:ident / $read:ident : $ty:ty),* $(,)?) => {
        $(
            #[doc = concat!("Write a `", stringify!($ty), "` at `offset` in platform byte order.")]
            pub fn $write(&mut self, offset: u32, value: $ty) -> BufferResult<()> {
                let bytes = match self.platform.endianness() {
                    Endianness::Little => value.to_le_bytes(),
                    Endianness::Big => value.to_be_bytes(),
                };
                self.write_bytes(offset, &bytes)
            }

            #[doc = concat!("Read a `", stringify!($ty), "` at `offset` in platform byte order.")]
            pub fn $read(&self, offset: u32) -> Option<$ty> {
                let start = offset as usize;
                let end = start.checked_add(std::mem::size_of::<$ty>())?;
                let raw = self.data().get(start..end)?.try_into().ok()?;
                Some(match self.platform.endianness() {
                    Endianness::Little => <$ty>::from_le_bytes(raw),
                    Endianness::Big => <$ty>::from_be_bytes(raw),
                })
            }
        )*
    };
}

/// Bytes plus the fixups that point out of and into them.
#[derive(Debug)]
pub struct SmartBuffer {
    name: Option<String>,
    type_tag: u32,
    platform: Platform,
    store: ByteStore,
    outgoing: BTreeMap<u32, Fixup>,
    incoming: BTreeSet<IncomingRef>,
}

impl SmartBuffer {
    pub fn new(platform: Platform, growth: GrowthPolicy) -> Self {
        Self {
            name: None,
            type_tag: 0,
            platform,
            store: ByteStore::with_growth(growth),
            outgoing: BTreeMap::new(),
            incoming: BTreeSet::new(),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    pub fn type_tag(&self) -> u32 {
        self.type_tag
    }

    pub fn set_type_tag(&mut self, type_tag: u32) {
        self.type_tag = type_tag;
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn set_platform(&mut self, platform: Platform) {
        self.platform = platform;
    }

    pub fn size(&self) -> u32 {
        self.store.size()
    }

    pub fn capacity(&self) -> u32 {
        self.store.capacity()
    }

    pub fn max_size(&self) -> u32 {
        self.store.max_size()
    }

    pub fn is_virtual(&self) -> bool {
        self.store.is_virtual()
    }

    pub fn data(&self) -> &[u8] {
        self.store.data()
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.store.data_mut()
    }

    /// Fixups stored in this buffer, keyed by offset.
    pub fn outgoing_fixups(&self) -> &BTreeMap<u32, Fixup> {
        &self.outgoing
    }

    /// Fixups elsewhere that point into this buffer.
    pub fn incoming_fixups(&self) -> &BTreeSet<IncomingRef> {
        &self.incoming
    }

    pub(crate) fn store(&self) -> &ByteStore {
        &self.store
    }

    pub(crate) fn store_mut(&mut self) -> &mut ByteStore {
        &mut self.store
    }

    /// Write `bytes` at `offset`, growing the buffer if they run past the end.
    ///
    /// # Panics
    /// If `offset` is beyond the current size.
    pub fn write_bytes(&mut self, offset: u32, bytes: &[u8]) -> BufferResult<()> {
        assert!(
            offset <= self.size(),
            "write at offset {} beyond buffer size {}",
            offset,
            self.size()
        );
        let len = u32::try_from(bytes.len())
            .map_err(|_| BufferError::capacity(bytes.len() as u64, self.max_size()))?;
        let end = offset
            .checked_add(len)
            .ok_or_else(|| BufferError::capacity(offset as u64 + len as u64, self.max_size()))?;
        if end > self.size() {
            self.store.grow_by(end - self.size())?;
        }
        self.store.data_mut()[offset as usize..end as usize].copy_from_slice(bytes);
        Ok(())
    }

    /// Append `bytes` and return the offset they were written at.
    pub fn append_bytes(&mut self, bytes: &[u8]) -> BufferResult<u32> {
        let offset = self.size();
        self.write_bytes(offset, bytes)?;
        Ok(offset)
    }

    typed_access! {
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

    pub(crate) fn insert_outgoing(&mut self, offset: u32, fixup: Fixup) {
        self.outgoing.insert(offset, fixup);
    }

    pub(crate) fn outgoing_mut(&mut self, offset: u32) -> Option<&mut Fixup> {
        self.outgoing.get_mut(&offset)
    }

    pub(crate) fn take_outgoing_at(&mut self, offset: u32) -> Option<Fixup> {
        self.outgoing.remove(&offset)
    }

    pub(crate) fn take_outgoing(&mut self) -> BTreeMap<u32, Fixup> {
        std::mem::take(&mut self.outgoing)
    }

    pub(crate) fn take_incoming(&mut self) -> BTreeSet<IncomingRef> {
        std::mem::take(&mut self.incoming)
    }

    pub(crate) fn add_incoming(&mut self, incoming: IncomingRef) {
        self.incoming.insert(incoming);
    }

    pub(crate) fn remove_incoming(&mut self, incoming: &IncomingRef) -> bool {
        self.incoming.remove(incoming)
    }
}
