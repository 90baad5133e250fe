//! Fixup resolution tests
//!
//! Covers the value of every fixup kind after linking, the failure modes
//! that abort a link, and randomized layouts.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use smartbuffer::{
    BufferError, BufferGraph, CancelToken, ClosureSelection, Endianness, GrowthPolicy,
    LinkOptions, LinkState, Linker, Location, Platform, StagedFile, VecSink,
};

fn graph(platform: Platform) -> BufferGraph {
    BufferGraph::with_defaults(platform, GrowthPolicy::default())
}

fn read_u32(bytes: &[u8], at: usize, endianness: Endianness) -> u32 {
    endianness.decode_uint(&bytes[at..at + 4]) as u32
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn test_x86_pointer_after_head() {
    let mut g = graph(Platform::X86);
    let a = g.create_buffer();
    let b = g.create_buffer();
    g.grow_by(a, 8).unwrap();
    g.grow_by(b, 4).unwrap();
    g.add_pointer_fixup(a.at(0), b.at(0), None).unwrap();

    let image = g
        .link(ClosureSelection::Whole(a), LinkOptions::default())
        .unwrap();
    assert_eq!(image.layout().offset_of(b), Some(8));
    assert_eq!(&image.bytes()[0..4], &8u32.to_le_bytes());
}

#[test]
fn test_power32_pointer_with_load_base() {
    let mut g = graph(Platform::POWER32);
    let a = g.create_buffer();
    let b = g.create_buffer();
    g.grow_by(a, 8).unwrap();
    g.grow_by(b, 8).unwrap();
    g.add_pointer_fixup(a.at(4), b.at(2), None).unwrap();

    let options = LinkOptions {
        load_base: 0x8000_0000,
        ..LinkOptions::default()
    };
    let image = g.link(ClosureSelection::Whole(a), options).unwrap();
    assert_eq!(&image.bytes()[4..8], &0x8000_000Au32.to_be_bytes());
}

#[test]
fn test_offset_fixups_absolute_and_relative() {
    let mut g = graph(Platform::X86);
    let a = g.create_buffer();
    let b = g.create_buffer();
    g.grow_by(a, 12).unwrap();
    g.grow_by(b, 8).unwrap();
    g.add_offset_fixup(a.at(4), b.at(4), true).unwrap();
    g.add_offset_fixup(a.at(8), b.at(4), false).unwrap();
    // backwards relative offset
    g.add_offset_fixup(b.at(0), a.at(0), false).unwrap();

    let image = g
        .link(ClosureSelection::Whole(a), LinkOptions::default())
        .unwrap();
    let bytes = image.bytes();
    assert_eq!(read_u32(bytes, 4, Endianness::Little), 16);
    assert_eq!(read_u32(bytes, 8, Endianness::Little), 8);
    assert_eq!(read_u32(bytes, 12, Endianness::Little) as i32, -12);
}

#[test]
fn test_vtable_fixup_writes_class_index() {
    let wide = Platform::new("Power64", 8, Endianness::Big).unwrap();
    let mut g = graph(wide);
    let a = g.create_buffer();
    g.grow_by(a, 12).unwrap();
    g.add_vtable_fixup(a.at(0), 0x42, None).unwrap();
    g.add_vtable_fixup(a.at(8), 7, Some(2)).unwrap();

    let image = g
        .link(ClosureSelection::Whole(a), LinkOptions::default())
        .unwrap();
    assert_eq!(&image.bytes()[0..8], &0x42u64.to_be_bytes());
    assert_eq!(&image.bytes()[8..10], &[0, 7]);
}

#[test]
fn test_self_reference() {
    let mut g = graph(Platform::X86);
    let a = g.create_buffer();
    g.grow_by(a, 16).unwrap();
    g.add_pointer_fixup(a.at(12), a.at(4), None).unwrap();

    let options = LinkOptions {
        load_base: 0x100,
        ..LinkOptions::default()
    };
    let image = g.link(ClosureSelection::Whole(a), options).unwrap();
    assert_eq!(read_u32(image.bytes(), 12, Endianness::Little), 0x104);
}

// ============================================================================
// Failure modes
// ============================================================================

#[test]
fn test_destroyed_destination_is_dangling() {
    let mut g = graph(Platform::X86);
    let a = g.create_buffer();
    let b = g.create_buffer();
    g.grow_by(a, 4).unwrap();
    g.grow_by(b, 4).unwrap();
    g.add_pointer_fixup(a.at(0), b.at(0), None).unwrap();
    assert!(g.release(b));

    let mut out = Vec::new();
    let result = g.write_to_stream(&mut out, ClosureSelection::Whole(a), LinkOptions::default());
    assert!(matches!(
        result,
        Err(BufferError::DanglingFixup { destination, .. }) if destination == b
    ));
    assert!(out.is_empty());
}

#[test]
fn test_mixed_platforms_rejected() {
    let mut g = graph(Platform::X86);
    let a = g.create_buffer();
    let b = g.create_buffer_for(Platform::POWER32);
    g.grow_by(a, 4).unwrap();
    g.grow_by(b, 4).unwrap();
    g.add_pointer_fixup(a.at(0), b.at(0), None).unwrap();

    assert!(matches!(
        g.link(ClosureSelection::Whole(a), LinkOptions::default()),
        Err(BufferError::PlatformMismatch { buffer, .. }) if buffer == b
    ));
}

#[test]
fn test_same_shape_platforms_link() {
    let alias = Platform::new("i386", 4, Endianness::Little).unwrap();
    let mut g = graph(Platform::X86);
    let a = g.create_buffer();
    let b = g.create_buffer_for(alias);
    g.grow_by(a, 4).unwrap();
    g.grow_by(b, 4).unwrap();
    g.add_pointer_fixup(a.at(0), b.at(0), None).unwrap();

    assert!(g
        .link(ClosureSelection::Whole(a), LinkOptions::default())
        .is_ok());
}

#[test]
fn test_partial_selection_unresolved() {
    let mut g = graph(Platform::X86);
    let a = g.create_buffer();
    let b = g.create_buffer();
    g.grow_by(a, 8).unwrap();
    g.grow_by(b, 4).unwrap();
    g.add_pointer_fixup(a.at(0), b.at(0), None).unwrap();
    g.add_vtable_fixup(a.at(4), 3, None).unwrap();

    assert!(matches!(
        g.link(ClosureSelection::Subset(vec![a]), LinkOptions::default()),
        Err(BufferError::UnresolvedReference { destination, .. }) if destination == b.at(0)
    ));

    let options = LinkOptions {
        allow_external: true,
        ..LinkOptions::default()
    };
    let image = g.link(ClosureSelection::Subset(vec![a]), options).unwrap();
    assert_eq!(image.bytes().len(), 8);
    assert_eq!(read_u32(image.bytes(), 4, Endianness::Little), 3);

    let external = image.external_fixups();
    assert_eq!(external.len(), 1);
    assert_eq!(external[0].source, a.at(0));
    assert_eq!(external[0].blob_offset, 0);
}

#[test]
fn test_destination_shrunk_after_registration() {
    let mut g = graph(Platform::X86);
    let a = g.create_buffer();
    let b = g.create_buffer();
    g.grow_by(a, 4).unwrap();
    g.grow_by(b, 16).unwrap();
    g.add_offset_fixup(a.at(0), b.at(12), true).unwrap();
    g.resize(b, 4).unwrap();

    assert!(matches!(
        g.link(ClosureSelection::Whole(a), LinkOptions::default()),
        Err(BufferError::UnresolvedReference { .. })
    ));
}

#[test]
fn test_fixup_past_buffer_end_is_capacity_error() {
    let mut g = graph(Platform::X86);
    let a = g.create_buffer();
    g.grow_by(a, 6).unwrap();
    g.add_vtable_fixup(a.at(4), 1, None).unwrap();

    assert!(matches!(
        g.link(ClosureSelection::Whole(a), LinkOptions::default()),
        Err(BufferError::Capacity { requested: 8, limit: 6 })
    ));
}

#[test]
fn test_failed_resolve_keeps_state() {
    let mut g = graph(Platform::X86);
    let a = g.create_buffer();
    let b = g.create_buffer();
    g.grow_by(a, 4).unwrap();
    g.grow_by(b, 4).unwrap();
    g.add_pointer_fixup(a.at(0), b.at(0), None).unwrap();
    g.release(b);

    let mut linker = Linker::new(&g, ClosureSelection::Whole(a), LinkOptions::default());
    assert!(linker.resolve().is_err());
    assert_eq!(linker.state(), LinkState::LaidOut);
    assert!(linker.image().is_none());
}

// ============================================================================
// Output
// ============================================================================

#[test]
fn test_resolve_in_place_patches_buffers() {
    let mut g = graph(Platform::POWER32);
    let a = g.create_buffer();
    let b = g.create_buffer();
    g.grow_by(a, 4).unwrap();
    g.grow_by(b, 4).unwrap();
    g.add_offset_fixup(b.at(0), a.at(0), false).unwrap();
    g.add_pointer_fixup(a.at(0), b.at(0), None).unwrap();

    let layout = g
        .resolve_in_place(ClosureSelection::Whole(a), LinkOptions::default())
        .unwrap();
    assert_eq!(layout.total_size(), 8);
    assert_eq!(g.read_u32(a.at(0)), Some(4));
    assert_eq!(g.read_i32(b.at(0)), Some(-4));
}

#[test]
fn test_staged_file_write() {
    let mut g = graph(Platform::X86);
    let a = g.create_buffer();
    g.append_bytes(a, b"relocatable").unwrap();

    let dir = std::env::temp_dir().join(format!("smartbuffer_write_{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("out.blob");

    let cancel = CancelToken::new();
    cancel.cancel();
    let mut linker = Linker::new(&g, ClosureSelection::Whole(a), LinkOptions::default());
    let sink = StagedFile::create(&path).unwrap();
    assert!(matches!(
        linker.write_staged(sink, &cancel),
        Err(BufferError::Cancelled { .. })
    ));
    assert!(!path.exists());
    assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 0);

    let sink = StagedFile::create(&path).unwrap();
    let written = linker.write_staged(sink, &CancelToken::new()).unwrap();
    assert_eq!(written, 11);
    assert_eq!(std::fs::read(&path).unwrap(), b"relocatable");
    assert_eq!(linker.state(), LinkState::Written);

    std::fs::remove_dir_all(&dir).unwrap();
}

/// Accepts `limit` bytes, then fails every write.
struct ShortWriter {
    accepted: Vec<u8>,
    limit: usize,
}

impl std::io::Write for ShortWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let room = self.limit - self.accepted.len();
        if room == 0 {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
        }
        let n = room.min(buf.len());
        self.accepted.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_stream_failure_keeps_resolved_state() {
    let mut g = graph(Platform::X86);
    let a = g.create_buffer();
    g.append_bytes(a, &[5; 16]).unwrap();

    let mut linker = Linker::new(&g, ClosureSelection::Whole(a), LinkOptions::default());
    let mut short = ShortWriter {
        accepted: Vec::new(),
        limit: 5,
    };
    assert!(matches!(
        linker.write_to(&mut short),
        Err(BufferError::Io(_))
    ));
    assert_eq!(linker.state(), LinkState::Resolved);

    // a staged retry publishes the whole blob
    let mut out = Vec::new();
    let written = linker
        .write_staged(VecSink::new(&mut out), &CancelToken::new())
        .unwrap();
    assert_eq!(written, 16);
    assert_eq!(out, vec![5; 16]);
    assert_eq!(linker.state(), LinkState::Written);
}

#[test]
fn test_vec_sink_appends() {
    let mut g = graph(Platform::X86);
    let a = g.create_buffer();
    g.append_bytes(a, &[1, 2]).unwrap();

    let mut out = vec![9];
    let mut linker = Linker::new(&g, ClosureSelection::Whole(a), LinkOptions::default());
    linker
        .write_staged(VecSink::new(&mut out), &CancelToken::new())
        .unwrap();
    assert_eq!(out, vec![9, 1, 2]);
}

// ============================================================================
// Randomized layouts
// ============================================================================

struct Recorded {
    source: Location,
    destination: Location,
    absolute: bool,
}

#[test]
fn test_random_offset_layouts() {
    let mut rng = ChaCha8Rng::seed_from_u64(0x5EED);

    for _ in 0..64 {
        let platform = if rng.gen_bool(0.5) {
            Platform::X86
        } else {
            Platform::POWER32
        };
        let endianness = platform.endianness();
        let mut g = graph(platform);

        let count = rng.gen_range(1..6);
        let mut ids = Vec::new();
        for _ in 0..count {
            let id = g.create_buffer();
            let slots = rng.gen_range(2..12u32);
            g.grow_by(id, slots * 4).unwrap();
            ids.push(id);
        }
        // chain every buffer into the root's closure through slot 0
        for pair in ids.windows(2) {
            g.add_pointer_fixup(pair[0].at(0), pair[1].at(0), None)
                .unwrap();
        }

        let mut recorded = Vec::new();
        for &id in &ids {
            let slots = g.buffer(id).size() / 4;
            for slot in 1..slots {
                if rng.gen_bool(0.4) {
                    continue;
                }
                let dest_id = ids[rng.gen_range(0..ids.len())];
                let dest_offset = rng.gen_range(0..=g.buffer(dest_id).size());
                let absolute = rng.gen_bool(0.5);
                let source = id.at(slot * 4);
                let destination = dest_id.at(dest_offset);
                g.add_offset_fixup(source, destination, absolute).unwrap();
                recorded.push(Recorded {
                    source,
                    destination,
                    absolute,
                });
            }
        }

        let alignment = [1u32, 2, 4, 8, 16][rng.gen_range(0..5)];
        let options = LinkOptions {
            alignment,
            ..LinkOptions::default()
        };
        let image = g.link(ClosureSelection::Whole(ids[0]), options).unwrap();
        let layout = image.layout();

        for r in &recorded {
            let src = layout.resolve(r.source).unwrap() as i64;
            let dst = layout.resolve(r.destination).unwrap() as i64;
            let expected = if r.absolute { dst } else { dst - src };
            let actual = read_u32(image.bytes(), src as usize, endianness) as i32 as i64;
            assert_eq!(actual, expected, "fixup at {}", r.source);
        }
    }
}

#[test]
fn test_random_typed_roundtrip() {
    let mut rng = ChaCha8Rng::seed_from_u64(42);

    for platform in [Platform::X86, Platform::POWER32] {
        let mut g = graph(platform.clone());
        let id = g.create_buffer();
        g.grow_by(id, 64).unwrap();

        for _ in 0..200 {
            let offset = rng.gen_range(0..g.buffer(id).size());
            let loc = g.offset_location(id, offset);
            match rng.gen_range(0..10) {
                0 => {
                    let v: i8 = rng.gen();
                    g.write_i8(loc, v).unwrap();
                    assert_eq!(g.read_i8(loc), Some(v));
                }
                1 => {
                    let v: u8 = rng.gen();
                    g.write_u8(loc, v).unwrap();
                    assert_eq!(g.read_u8(loc), Some(v));
                }
                2 => {
                    let v: i16 = rng.gen();
                    g.write_i16(loc, v).unwrap();
                    assert_eq!(g.read_i16(loc), Some(v));
                }
                3 => {
                    let v: u16 = rng.gen();
                    g.write_u16(loc, v).unwrap();
                    assert_eq!(g.read_u16(loc), Some(v));
                }
                4 => {
                    let v: i32 = rng.gen();
                    g.write_i32(loc, v).unwrap();
                    assert_eq!(g.read_i32(loc), Some(v));
                }
                5 => {
                    let v: u32 = rng.gen();
                    g.write_u32(loc, v).unwrap();
                    assert_eq!(g.read_u32(loc), Some(v));
                }
                6 => {
                    let v: i64 = rng.gen();
                    g.write_i64(loc, v).unwrap();
                    assert_eq!(g.read_i64(loc), Some(v));
                }
                7 => {
                    let v: u64 = rng.gen();
                    g.write_u64(loc, v).unwrap();
                    assert_eq!(g.read_u64(loc), Some(v));
                }
                8 => {
                    let v: f32 = rng.gen();
                    g.write_f32(loc, v).unwrap();
                    assert_eq!(g.read_f32(loc), Some(v));
                }
                _ => {
                    let v: f64 = rng.gen();
                    g.write_f64(loc, v).unwrap();
                    assert_eq!(g.read_f64(loc), Some(v));
                }
            }
        }

        // byte order is the platform's
        g.write_u16(id.at(0), 0x0102).unwrap();
        let expected = match platform.endianness() {
            Endianness::Little => [0x02, 0x01],
            Endianness::Big => [0x01, 0x02],
        };
        assert_eq!(&g.buffer(id).data()[0..2], &expected);
    }
}
