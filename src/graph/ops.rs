//! Graph-wide operations: merging buffers and walking fixup edges.

use super::BufferGraph;
use crate::error::{BufferError, BufferResult};
use crate::fixup::IncomingRef;
use crate::location::BufferId;
use std::collections::HashSet;
use std::fmt::Write as _;

/// Bytes shown per buffer by [`BufferGraph::dump`].
const DUMP_PREVIEW: usize = 64;

impl BufferGraph {
    /// Append the bytes of `other` to `target` and move every fixup from and
    /// into `other` over to `target`, rebased by the returned base offset.
    ///
    /// `other` is left empty but alive; its owner decides when to release it.
    pub fn adopt_buffer(&mut self, target: BufferId, other: BufferId) -> BufferResult<u32> {
        if target == other {
            return Err(BufferError::invalid_state("a buffer cannot adopt itself"));
        }
        let (base, bytes) = {
            let dst = self.buffer(target);
            let src = self.buffer(other);
            if !dst.platform().compatible_with(src.platform()) {
                return Err(BufferError::PlatformMismatch {
                    buffer: other,
                    expected: dst.platform().to_string(),
                    found: src.platform().to_string(),
                });
            }
            let required = dst.size() as u64 + src.size() as u64;
            if required > dst.max_size() as u64 {
                return Err(BufferError::capacity(required, dst.max_size()));
            }
            (dst.size(), src.data().to_vec())
        };

        self.buffer_mut(target).append_bytes(&bytes)?;
        if let Err(e) = self.inherit_fixups(target, other, base) {
            // shrinking back to the old size cannot fail
            let _ = self.buffer_mut(target).store_mut().resize(base);
            return Err(e);
        }
        self.buffer_mut(other).store_mut().clear();

        tracing::debug!(
            target = %target,
            adopted = %other,
            base,
            bytes = bytes.len(),
            "Adopted buffer"
        );
        Ok(base)
    }

    /// Move all fixups of `source` onto `target`, shifted by `delta` bytes.
    ///
    /// Outgoing fixups of `source` are re-keyed at `offset + delta` in
    /// `target`; fixups anywhere in the graph that pointed into `source` are
    /// redirected to `target` at `destination + delta`. The bytes themselves
    /// are not copied: the caller has already placed them.
    pub fn inherit_fixups(
        &mut self,
        target: BufferId,
        source: BufferId,
        delta: u32,
    ) -> BufferResult<()> {
        if target == source {
            return Err(BufferError::invalid_state(
                "a buffer cannot inherit its own fixups",
            ));
        }

        // Validate everything before touching the graph.
        {
            let dst = self.buffer(target);
            let src = self.buffer(source);
            if !dst.platform().compatible_with(src.platform()) {
                return Err(BufferError::PlatformMismatch {
                    buffer: source,
                    expected: dst.platform().to_string(),
                    found: src.platform().to_string(),
                });
            }
            for (&offset, fixup) in src.outgoing_fixups() {
                let rebased = offset as u64 + delta as u64;
                let end = rebased + fixup.width(src.platform()) as u64;
                if end > dst.size() as u64 {
                    return Err(BufferError::capacity(end, dst.size()));
                }
                if dst.outgoing_fixups().contains_key(&(rebased as u32)) {
                    return Err(BufferError::DuplicateFixup(target.at(rebased as u32)));
                }
            }
            let dest_limit = dst.capacity().max(dst.size()) as u64;
            for incoming in src.incoming_fixups() {
                let referring = if incoming.referrer == source {
                    src.outgoing_fixups().get(&incoming.offset)
                } else {
                    self.get(incoming.referrer)
                        .and_then(|r| r.outgoing_fixups().get(&incoming.offset))
                };
                if let Some(destination) = referring.and_then(|f| f.destination()) {
                    if destination.offset as u64 + delta as u64 > dest_limit {
                        return Err(BufferError::capacity(
                            destination.offset as u64 + delta as u64,
                            dest_limit,
                        ));
                    }
                }
            }
        }

        let outgoing = self.buffer_mut(source).take_outgoing();
        let incoming = self.buffer_mut(source).take_incoming();

        for (offset, mut fixup) in outgoing {
            let rebased = offset + delta;
            let old_ref = IncomingRef {
                referrer: source,
                offset,
            };
            let new_ref = IncomingRef {
                referrer: target,
                offset: rebased,
            };
            if fixup.retarget(source, target, delta) {
                self.buffer_mut(target).add_incoming(new_ref);
            } else if let Some(destination) = fixup.destination() {
                if let Some(dest) = self.get_mut(destination.buffer) {
                    dest.remove_incoming(&old_ref);
                    dest.add_incoming(new_ref);
                }
            }
            self.buffer_mut(target).insert_outgoing(rebased, fixup);
        }

        for incoming_ref in incoming {
            if incoming_ref.referrer == source {
                // self-reference, already moved with the outgoing table
                continue;
            }
            let redirected = self
                .get_mut(incoming_ref.referrer)
                .and_then(|referrer| referrer.outgoing_mut(incoming_ref.offset))
                .map(|fixup| fixup.retarget(source, target, delta))
                .unwrap_or(false);
            if redirected {
                self.buffer_mut(target).add_incoming(incoming_ref);
            }
        }
        Ok(())
    }

    /// Every buffer reachable from `root` through outgoing fixups, in
    /// depth-first pre-order with edges taken in ascending offset order.
    /// Each buffer appears once; cycles are fine. Destroyed destinations are
    /// skipped here and reported by the linker.
    pub fn collect_closure(&self, root: BufferId) -> Vec<BufferId> {
        assert!(self.contains(root), "closure root {} is not live", root);

        let mut order = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![root];

        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            let Some(buffer) = self.get(id) else {
                continue;
            };
            order.push(id);

            let children: Vec<BufferId> = buffer
                .outgoing_fixups()
                .values()
                .filter_map(|f| f.destination())
                .map(|loc| loc.buffer)
                .collect();
            for child in children.into_iter().rev() {
                if !visited.contains(&child) {
                    stack.push(child);
                }
            }
        }

        tracing::debug!(root = %root, buffers = order.len(), "Collected closure");
        order
    }

    /// Human-readable listing of a buffer's bytes and fixups.
    pub fn dump(&self, id: BufferId) -> String {
        let buffer = self.buffer(id);
        let mut out = String::new();

        let _ = writeln!(
            out,
            "buffer {} '{}' type={} platform={} size={} capacity={} max={}{}",
            id,
            buffer.name().unwrap_or(""),
            buffer.type_tag(),
            buffer.platform(),
            buffer.size(),
            buffer.capacity(),
            buffer.max_size(),
            if buffer.is_virtual() { " virtual" } else { "" }
        );

        let data = buffer.data();
        let shown = data.len().min(DUMP_PREVIEW);
        let _ = writeln!(
            out,
            "  data: {}{}",
            hex::encode(&data[..shown]),
            if data.len() > shown { "..." } else { "" }
        );

        for (offset, fixup) in buffer.outgoing_fixups() {
            let state = match fixup.destination() {
                Some(dest) if !self.contains(dest.buffer) => " (dangling)",
                _ => "",
            };
            let _ = writeln!(out, "  out 0x{:08x}: {}{}", offset, fixup, state);
        }
        for incoming in buffer.incoming_fixups() {
            let _ = writeln!(out, "  in  from {}", incoming.location());
        }
        out
    }
}
