//! Position-tracking byte sources
//!
//! Every Intent reads its bytes through an [`IntentFile`], whatever the
//! backing store: a plain file, a gzip file, stdin, or one of the archive
//! receivers. Readers report how many bytes they consumed so progress can be
//! polled from another thread.

use crate::receiver::{PreludeSlot, RegularReader, SpecialCache};
use docrestore_core::{Error, Result};
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A readable source that knows how far it has read
pub trait PosRead: Read + Send {
    /// Bytes consumed from the underlying store so far
    fn pos(&self) -> u64;
}

/// Shared byte counter readable from other threads
#[derive(Debug, Clone, Default)]
pub struct PositionHandle(Arc<AtomicU64>);

impl PositionHandle {
    /// A counter at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Advance by `n` bytes
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }
}

/// Counts bytes read through it
pub struct PosTrackingReader<R> {
    inner: R,
    pos: PositionHandle,
}

impl<R: Read> PosTrackingReader<R> {
    /// Wrap `inner` with a fresh counter
    pub fn new(inner: R) -> Self {
        Self::with_handle(inner, PositionHandle::new())
    }

    /// Wrap `inner`, counting into an existing handle
    pub fn with_handle(inner: R, pos: PositionHandle) -> Self {
        Self { inner, pos }
    }

    /// Handle to the byte counter
    pub fn handle(&self) -> PositionHandle {
        self.pos.clone()
    }
}

impl<R: Read> Read for PosTrackingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.pos.add(n as u64);
        Ok(n)
    }
}

impl<R: Read + Send> PosRead for PosTrackingReader<R> {
    fn pos(&self) -> u64 {
        self.pos.get()
    }
}

/// Gzip-decompressing source.
///
/// Reads yield decompressed bytes while `pos` reports compressed bytes
/// consumed from the file, so progress compares against the on-disk size.
pub struct GzipSource<R: Read> {
    decoder: MultiGzDecoder<PosTrackingReader<BufReader<R>>>,
    compressed: PositionHandle,
}

impl<R: Read> GzipSource<R> {
    /// Wrap a compressed byte source
    pub fn new(inner: R) -> Self {
        let compressed = PositionHandle::new();
        let tracked = PosTrackingReader::with_handle(BufReader::new(inner), compressed.clone());
        Self {
            decoder: MultiGzDecoder::new(tracked),
            compressed,
        }
    }
}

impl<R: Read> Read for GzipSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.decoder.read(buf)
    }
}

impl<R: Read + Send> PosRead for GzipSource<R> {
    fn pos(&self) -> u64 {
        self.compressed.get()
    }
}

/// Where an Intent's bytes come from
pub enum SourceKind {
    /// A dump file, optionally gzip-compressed
    File {
        /// Path on disk
        path: PathBuf,
        /// Whether the file is gzip-compressed
        gzip: bool,
    },
    /// Standard input
    Stdin,
    /// An archive namespace streamed through a bounded channel
    ArchiveRegular(Option<RegularReader>),
    /// An archive namespace buffered in full before it is read
    ArchiveSpecial(SpecialCache),
    /// The metadata block of an archive namespace
    MetadataPrelude(PreludeSlot),
}

impl std::fmt::Debug for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::File { path, gzip } => f
                .debug_struct("File")
                .field("path", path)
                .field("gzip", gzip)
                .finish(),
            SourceKind::Stdin => f.write_str("Stdin"),
            SourceKind::ArchiveRegular(_) => f.write_str("ArchiveRegular"),
            SourceKind::ArchiveSpecial(_) => f.write_str("ArchiveSpecial"),
            SourceKind::MetadataPrelude(_) => f.write_str("MetadataPrelude"),
        }
    }
}

/// Open/read/position/close capability over one Intent source
pub struct IntentFile {
    kind: SourceKind,
    reader: Option<Box<dyn PosRead>>,
    closed: bool,
    last_pos: u64,
}

impl std::fmt::Debug for IntentFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntentFile")
            .field("kind", &self.kind)
            .field("open", &self.reader.is_some())
            .field("position", &self.position())
            .finish()
    }
}

impl IntentFile {
    /// A source that is not yet open
    pub fn new(kind: SourceKind) -> Self {
        Self {
            kind,
            reader: None,
            closed: false,
            last_pos: 0,
        }
    }

    /// A plain or gzip dump file; gzip is inferred from a `.gz` suffix
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let gzip = path.extension().map(|e| e == "gz").unwrap_or(false);
        Self::new(SourceKind::File { path, gzip })
    }

    /// The backing source variant
    pub fn kind(&self) -> &SourceKind {
        &self.kind
    }

    /// Human-readable location for logs and errors
    pub fn location(&self) -> String {
        match &self.kind {
            SourceKind::File { path, .. } => path.display().to_string(),
            SourceKind::Stdin => "-".to_string(),
            SourceKind::ArchiveRegular(_) => "archive stream".to_string(),
            SourceKind::ArchiveSpecial(_) => "archive cache".to_string(),
            SourceKind::MetadataPrelude(_) => "archive metadata".to_string(),
        }
    }

    /// Open the source for reading.
    ///
    /// Archive sources may block here until their bytes are available.
    pub fn open(&mut self) -> Result<()> {
        if self.reader.is_some() {
            return Err(Error::invalid_operation(format!(
                "{} is already open",
                self.location()
            )));
        }
        if self.closed {
            return Err(Error::invalid_operation(format!(
                "{} was already closed",
                self.location()
            )));
        }
        let reader: Box<dyn PosRead> = match &mut self.kind {
            SourceKind::File { path, gzip } => {
                let file = File::open(&*path).map_err(|e| {
                    Error::Io(io::Error::new(
                        e.kind(),
                        format!("open {}: {e}", path.display()),
                    ))
                })?;
                if *gzip {
                    Box::new(GzipSource::new(file))
                } else {
                    Box::new(PosTrackingReader::new(BufReader::new(file)))
                }
            }
            SourceKind::Stdin => Box::new(PosTrackingReader::new(io::stdin())),
            SourceKind::ArchiveRegular(slot) => {
                let reader = slot.take().ok_or_else(|| {
                    Error::invalid_operation("archive stream can only be opened once")
                })?;
                Box::new(reader)
            }
            SourceKind::ArchiveSpecial(cache) => Box::new(cache.reader()?),
            SourceKind::MetadataPrelude(slot) => Box::new(slot.reader()),
        };
        self.reader = Some(reader);
        Ok(())
    }

    /// Whether `open` succeeded and `close` has not been called
    pub fn is_open(&self) -> bool {
        self.reader.is_some()
    }

    /// Bytes consumed so far, as reported by the open reader
    pub fn position(&self) -> u64 {
        self.reader.as_ref().map(|r| r.pos()).unwrap_or(self.last_pos)
    }

    /// Read everything that remains into memory
    pub fn read_all(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.read_to_end(&mut out)?;
        Ok(out)
    }

    /// Release the reader. Further reads fail.
    pub fn close(&mut self) {
        if let Some(reader) = self.reader.take() {
            self.last_pos = reader.pos();
        }
        self.closed = true;
    }
}

impl Read for IntentFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.reader.as_mut() {
            Some(reader) => reader.read(buf),
            None => Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{} is not open", self.location()),
            )),
        }
    }
}
