//! Archive container and restore sources
//!
//! This crate handles every byte that flows into a restore:
//!
//! - Position-tracking sources over files, gzip files, stdin and archive streams
//! - The archive wire format (magic, JSON header, framed chunks)
//! - `Multiplexer`: interleaves many namespaces into one archive stream
//! - `Demultiplexer`: splits one archive stream back into per-namespace receivers

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod demux;
pub mod format;
pub mod mux;
pub mod receiver;
pub mod source;

pub use demux::{DemuxStats, Demultiplexer};
pub use format::{
    write_prelude, ArchiveHeader, ChunkHeader, ChunkKind, ChunkReader, NamespaceEntry,
    ARCHIVE_FORMAT_VERSION, ARCHIVE_MAGIC, MAX_CHUNK_LEN, MAX_HEADER_LEN, TERMINATOR,
};
pub use mux::Multiplexer;
pub use receiver::{
    Delivery, Frame, PreludeReader, PreludeSlot, Receiver, RegularReader, SpecialCache,
    SpecialCacheReader, DEFAULT_REGULAR_CAPACITY,
};
pub use source::{GzipSource, IntentFile, PosRead, PosTrackingReader, PositionHandle, SourceKind};
