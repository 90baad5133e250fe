//! SmartBuffer - relocatable binary blob builder
//!
//! Builds platform-portable blobs out of many growable buffers that refer to
//! each other through deferred fixups. The final value of a fixup (an offset,
//! a runtime address or a vtable class index) is only known once every buffer
//! has been laid out and the target's pointer width and byte order are fixed.
//!
//! # Features
//!
//! - **Growable buffers**: amortized heap growth or reserved virtual memory
//!   committed on demand, with an optional hard maximum size
//! - **Typed writes**: integers and floats encoded in the buffer's byte order
//! - **Fixups**: offset (absolute or relative), pointer and vtable relocations
//! - **Graph operations**: adoption (merge with rebasing), fixup inheritance,
//!   cycle-safe closure collection
//! - **Linking**: deterministic layout, all-or-nothing resolution, whole or
//!   partial serialization, cancellable staged writes
//!
//! # Example
//!
//! ```rust
//! use smartbuffer::{BufferGraph, ClosureSelection, LinkOptions, Platform};
//!
//! let mut graph = BufferGraph::new();
//! let header = graph.create_buffer_for(Platform::X86);
//! let body = graph.create_buffer_for(Platform::X86);
//!
//! // header: [u32 pointer to body][u32 count]
//! graph.write_u32(header.at(0), 0).unwrap();
//! graph.write_u32(header.at(4), 3).unwrap();
//! graph.append_bytes(body, &[10, 20, 30]).unwrap();
//! graph.add_pointer_fixup(header.at(0), body.at(0), None).unwrap();
//!
//! let mut blob = Vec::new();
//! graph
//!     .write_to_stream(&mut blob, ClosureSelection::Whole(header), LinkOptions::default())
//!     .unwrap();
//! assert_eq!(blob, [8, 0, 0, 0, 3, 0, 0, 0, 10, 20, 30]);
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   add_*_fixup    ┌──────────────┐
//! │ SmartBuffer  │ ───────────────▶ │ SmartBuffer  │   BufferGraph (arena)
//! │ ByteStore    │ ◀─────────────── │ ByteStore    │
//! └──────┬───────┘   incoming refs  └──────────────┘
//!        │ collect_closure
//!        ▼
//! ┌──────────────┐  lay_out  ┌──────────┐  resolve  ┌──────────┐  write_to
//! │  Unresolved  │ ────────▶ │ LaidOut  │ ────────▶ │ Resolved │ ─────────▶ Written
//! └──────────────┘           └──────────┘           └──────────┘
//! ```

#![warn(clippy::all)]

pub mod buffer;
pub mod config;
pub mod error;
pub mod fixup;
pub mod graph;
pub mod link;
pub mod location;
pub mod platform;
pub mod store;

// Re-export commonly used types
pub use buffer::SmartBuffer;
pub use config::{ConfigError, LinkConfig, PlatformDescriptor, SmartBufferConfig};
pub use error::{BufferError, BufferResult};
pub use fixup::{Fixup, IncomingRef, OFFSET_FIXUP_SIZE};
pub use graph::BufferGraph;
pub use link::{
    CancelToken, ClosureSelection, ExternalFixup, Layout, LinkOptions, LinkState, Linker,
    Placement, ResolvedImage, StagedFile, StagedSink, VecSink,
};
pub use location::{BufferId, Location};
pub use platform::{Endianness, Platform, PlatformRegistry};
pub use store::{Backing, ByteStore, GrowthPolicy, HeapBacking, VirtualBacking};
