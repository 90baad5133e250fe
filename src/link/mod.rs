//! Layout, fixup resolution and serialization
//!
//! A [`Linker`] walks one closure of a [`BufferGraph`] through four states:
//!
//! ```text
//! Unresolved ──lay_out──▶ LaidOut ──resolve──▶ Resolved ──write_to──▶ Written
//! ```
//!
//! Layout concatenates the selected buffers (optionally aligned). Resolution
//! copies their bytes into a private image and patches every fixup for the
//! buffers' platform. The graph itself is never modified, so a failure at
//! any step leaves no partial output behind.

mod sink;

pub use sink::{CancelToken, StagedFile, StagedSink, VecSink};

use crate::config::LinkConfig;
use crate::error::{BufferError, BufferResult};
use crate::fixup::Fixup;
use crate::graph::BufferGraph;
use crate::location::{BufferId, Location};
use crate::platform::{fits_signed, fits_unsigned, Platform};
use std::collections::{HashMap, HashSet};
use std::io::Write;

/// Chunk size used by cancellable writes.
const WRITE_CHUNK: usize = 64 * 1024;

/// Which buffers to serialize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClosureSelection {
    /// Everything reachable from the root.
    Whole(BufferId),
    /// Exactly these buffers, in this order.
    Subset(Vec<BufferId>),
}

/// Knobs for a single link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkOptions {
    /// Address the blob is loaded at; added to every pointer fixup.
    pub load_base: u64,
    /// Placement alignment of each buffer in the blob.
    pub alignment: u32,
    /// Leave fixups into unselected buffers for an external merge step
    /// instead of failing.
    pub allow_external: bool,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            load_base: 0,
            alignment: 1,
            allow_external: false,
        }
    }
}

impl From<&LinkConfig> for LinkOptions {
    fn from(config: &LinkConfig) -> Self {
        Self {
            load_base: config.load_base,
            alignment: config.alignment,
            allow_external: config.allow_external,
        }
    }
}

/// Progress of a [`Linker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Unresolved,
    LaidOut,
    Resolved,
    Written,
}

/// Where one buffer sits in the blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub buffer: BufferId,
    pub offset: u32,
    pub size: u32,
}

/// Final position of every buffer in the blob.
#[derive(Debug, Clone)]
pub struct Layout {
    placements: Vec<Placement>,
    index: HashMap<BufferId, usize>,
    total_size: u32,
    platform: Platform,
}

impl Layout {
    pub fn placements(&self) -> &[Placement] {
        &self.placements
    }

    pub fn placement(&self, id: BufferId) -> Option<&Placement> {
        self.index.get(&id).map(|&i| &self.placements[i])
    }

    /// Blob offset of buffer `id`.
    pub fn offset_of(&self, id: BufferId) -> Option<u32> {
        self.placement(id).map(|p| p.offset)
    }

    /// Blob offset of `location`.
    pub fn resolve(&self, location: Location) -> Option<u64> {
        self.offset_of(location.buffer)
            .map(|base| base as u64 + location.offset as u64)
    }

    pub fn total_size(&self) -> u32 {
        self.total_size
    }

    /// Platform shared by every buffer in the layout.
    pub fn platform(&self) -> &Platform {
        &self.platform
    }
}

/// A fixup left for an external merge step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalFixup {
    pub source: Location,
    /// Position of the fixup bytes in the blob.
    pub blob_offset: u32,
    pub fixup: Fixup,
}

/// Patched bytes of a laid-out closure.
#[derive(Debug, Clone)]
pub struct ResolvedImage {
    bytes: Vec<u8>,
    layout: Layout,
    external: Vec<ExternalFixup>,
}

impl ResolvedImage {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn into_layout(self) -> Layout {
        self.layout
    }

    /// The patched bytes belonging to one buffer.
    pub fn buffer_bytes(&self, id: BufferId) -> Option<&[u8]> {
        let p = self.layout.placement(id)?;
        Some(&self.bytes[p.offset as usize..(p.offset + p.size) as usize])
    }

    /// Fixups pointing outside the selection, left unpatched.
    pub fn external_fixups(&self) -> &[ExternalFixup] {
        &self.external
    }
}

/// Drives one closure from layout to serialized bytes.
pub struct Linker<'g> {
    graph: &'g BufferGraph,
    selection: ClosureSelection,
    options: LinkOptions,
    state: LinkState,
    layout: Option<Layout>,
    image: Option<ResolvedImage>,
}

impl<'g> Linker<'g> {
    pub fn new(graph: &'g BufferGraph, selection: ClosureSelection, options: LinkOptions) -> Self {
        Self {
            graph,
            selection,
            options,
            state: LinkState::Unresolved,
            layout: None,
            image: None,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn layout(&self) -> Option<&Layout> {
        self.layout.as_ref()
    }

    pub fn image(&self) -> Option<&ResolvedImage> {
        self.image.as_ref()
    }

    pub fn into_image(self) -> Option<ResolvedImage> {
        self.image
    }

    /// Assign every selected buffer its blob offset.
    pub fn lay_out(&mut self) -> BufferResult<&Layout> {
        if self.state != LinkState::Unresolved {
            return Err(BufferError::invalid_state(format!(
                "cannot lay out a linker in state {:?}",
                self.state
            )));
        }
        if self.options.alignment == 0 || !self.options.alignment.is_power_of_two() {
            return Err(BufferError::invalid_state(format!(
                "alignment {} is not a power of two",
                self.options.alignment
            )));
        }

        let buffers = self.selected_buffers()?;
        let first = buffers
            .first()
            .ok_or_else(|| BufferError::invalid_state("nothing selected to link"))?;
        let platform = self.graph.buffer(*first).platform().clone();

        let align = self.options.alignment as u64;
        let mut cursor: u64 = 0;
        let mut placements = Vec::with_capacity(buffers.len());
        let mut index = HashMap::with_capacity(buffers.len());

        for id in buffers {
            let buffer = self.graph.buffer(id);
            if !buffer.platform().compatible_with(&platform) {
                return Err(BufferError::PlatformMismatch {
                    buffer: id,
                    expected: platform.to_string(),
                    found: buffer.platform().to_string(),
                });
            }
            let offset = cursor.div_ceil(align) * align;
            let end = offset + buffer.size() as u64;
            if end > u32::MAX as u64 {
                return Err(BufferError::capacity(end, u32::MAX));
            }
            index.insert(id, placements.len());
            placements.push(Placement {
                buffer: id,
                offset: offset as u32,
                size: buffer.size(),
            });
            cursor = end;
        }

        tracing::debug!(
            buffers = placements.len(),
            total_size = cursor,
            platform = %platform,
            "Laid out closure"
        );

        self.state = LinkState::LaidOut;
        Ok(self.layout.insert(Layout {
            placements,
            index,
            total_size: cursor as u32,
            platform,
        }))
    }

    /// Patch every fixup of the laid-out buffers into a fresh image.
    /// Lays out first if that has not happened yet.
    pub fn resolve(&mut self) -> BufferResult<&ResolvedImage> {
        if self.state == LinkState::Unresolved {
            self.lay_out()?;
        }
        if self.state != LinkState::LaidOut {
            return Err(BufferError::invalid_state(format!(
                "cannot resolve a linker in state {:?}",
                self.state
            )));
        }
        let layout = match self.layout.as_ref() {
            Some(layout) => layout,
            None => return Err(BufferError::invalid_state("missing layout")),
        };

        let mut bytes = vec![0u8; layout.total_size() as usize];
        for p in layout.placements() {
            let start = p.offset as usize;
            bytes[start..start + p.size as usize].copy_from_slice(self.graph.buffer(p.buffer).data());
        }

        let mut external = Vec::new();
        for p in layout.placements() {
            let buffer = self.graph.buffer(p.buffer);
            for (&offset, fixup) in buffer.outgoing_fixups() {
                let source = p.buffer.at(offset);
                let width = fixup.width(buffer.platform());
                if offset as u64 + width as u64 > buffer.size() as u64 {
                    return Err(BufferError::capacity(
                        offset as u64 + width as u64,
                        buffer.size(),
                    ));
                }
                let at = p.offset + offset;

                let value = match self.fixup_value(layout, source, at, fixup)? {
                    Some(value) => value,
                    None => {
                        external.push(ExternalFixup {
                            source,
                            blob_offset: at,
                            fixup: *fixup,
                        });
                        continue;
                    }
                };
                let fits = match fixup {
                    Fixup::Offset { absolute: false, .. } => fits_signed(value, width),
                    _ => fits_unsigned(value, width),
                };
                if !fits {
                    return Err(BufferError::EncodingOverflow {
                        at: source,
                        value,
                        width,
                    });
                }
                let start = at as usize;
                buffer
                    .platform()
                    .endianness()
                    .encode_uint(value as u64, &mut bytes[start..start + width as usize]);
            }
        }

        if !external.is_empty() {
            tracing::debug!(count = external.len(), "Left fixups for external merge");
        }
        tracing::debug!(bytes = bytes.len(), "Resolved closure");

        self.state = LinkState::Resolved;
        Ok(self.image.insert(ResolvedImage {
            bytes,
            layout: layout.clone(),
            external,
        }))
    }

    /// Resolve if needed and write the blob to `out`.
    ///
    /// Nothing is written unless resolution succeeds, but a stream that
    /// fails mid-write keeps whatever it accepted. The linker stays
    /// `Resolved` in that case. Use [`Linker::write_staged`] when partial
    /// output must never be visible.
    pub fn write_to<W: Write>(&mut self, out: &mut W) -> BufferResult<u64> {
        let bytes = self.ready_bytes()?;
        out.write_all(bytes)?;
        out.flush()?;
        let written = bytes.len() as u64;
        self.finish(written);
        Ok(written)
    }

    /// Resolve if needed and write the blob to `sink` in chunks, checking
    /// `cancel` between chunks. On cancellation or error the sink is
    /// discarded; on success it is committed.
    pub fn write_staged<S: StagedSink>(
        &mut self,
        mut sink: S,
        cancel: &CancelToken,
    ) -> BufferResult<u64> {
        let bytes = match self.ready_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                sink.discard()?;
                return Err(e);
            }
        };

        let mut written = 0u64;
        for chunk in bytes.chunks(WRITE_CHUNK) {
            if cancel.is_cancelled() {
                tracing::debug!(written, "Write cancelled, discarding output");
                sink.discard()?;
                return Err(BufferError::Cancelled { written });
            }
            if let Err(e) = sink.write_all(chunk) {
                let _ = sink.discard();
                return Err(e.into());
            }
            written += chunk.len() as u64;
        }
        if cancel.is_cancelled() {
            sink.discard()?;
            return Err(BufferError::Cancelled { written });
        }
        sink.commit()?;
        self.finish(written);
        Ok(written)
    }

    fn ready_bytes(&mut self) -> BufferResult<&[u8]> {
        match self.state {
            LinkState::Unresolved | LinkState::LaidOut => {
                self.resolve()?;
            }
            LinkState::Resolved => {}
            LinkState::Written => {
                return Err(BufferError::invalid_state("blob was already written"));
            }
        }
        match self.image.as_ref() {
            Some(image) => Ok(image.bytes()),
            None => Err(BufferError::invalid_state("missing resolved image")),
        }
    }

    fn finish(&mut self, written: u64) {
        self.state = LinkState::Written;
        tracing::info!(bytes = written, "Wrote blob");
    }

    /// Concrete value for `fixup`, or `None` if it must be left external.
    fn fixup_value(
        &self,
        layout: &Layout,
        source: Location,
        at: u32,
        fixup: &Fixup,
    ) -> BufferResult<Option<i128>> {
        let destination = match fixup {
            Fixup::VTable { class_index, .. } => return Ok(Some(*class_index as i128)),
            Fixup::Offset { destination, .. } | Fixup::Pointer { destination, .. } => *destination,
        };

        let dest_buffer = match self.graph.get(destination.buffer) {
            Some(buffer) => buffer,
            None => {
                tracing::warn!(source = %source, destination = %destination.buffer, "Dangling fixup");
                return Err(BufferError::DanglingFixup {
                    source_loc: source,
                    destination: destination.buffer,
                });
            }
        };
        let dest_abs = match layout.resolve(destination) {
            Some(abs) if destination.offset <= dest_buffer.size() => abs as i128,
            Some(_) => {
                return Err(BufferError::UnresolvedReference {
                    source_loc: source,
                    destination,
                })
            }
            None if self.options.allow_external => return Ok(None),
            None => {
                return Err(BufferError::UnresolvedReference {
                    source_loc: source,
                    destination,
                })
            }
        };

        Ok(Some(match fixup {
            Fixup::Offset { absolute: true, .. } => dest_abs,
            Fixup::Offset { absolute: false, .. } => dest_abs - at as i128,
            _ => self.options.load_base as i128 + dest_abs,
        }))
    }

    fn selected_buffers(&self) -> BufferResult<Vec<BufferId>> {
        match &self.selection {
            ClosureSelection::Whole(root) => {
                if !self.graph.contains(*root) {
                    return Err(BufferError::invalid_state(format!(
                        "closure root {} is not live",
                        root
                    )));
                }
                Ok(self.graph.collect_closure(*root))
            }
            ClosureSelection::Subset(ids) => {
                let mut seen = HashSet::new();
                let mut out = Vec::with_capacity(ids.len());
                for &id in ids {
                    if !self.graph.contains(id) {
                        return Err(BufferError::invalid_state(format!(
                            "selected buffer {} is not live",
                            id
                        )));
                    }
                    if seen.insert(id) {
                        out.push(id);
                    }
                }
                Ok(out)
            }
        }
    }
}
