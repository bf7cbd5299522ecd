//! Archive wire format
//!
//! ```text
//! ┌────────────┬──────────────┬─────────────────────┬─────────┬────────────┐
//! │ Magic (4)  │ Hdr len (4)  │ JSON ArchiveHeader  │ Chunk*  │ 0xFF (opt) │
//! └────────────┴──────────────┴─────────────────────┴─────────┴────────────┘
//!
//! Chunk:
//! ┌──────────┬─────────────┬──────────┬───────────────────────────────────┐
//! │ Kind (1) │ ns len (2)  │ ns bytes │ value (4): body length or CRC32   │
//! └──────────┴─────────────┴──────────┴───────────────────────────────────┘
//! ```
//!
//! Metadata and Data chunks are followed by `value` body bytes; an Eof chunk
//! carries the CRC32 of every Data byte of its namespace and has no body.
//! All integers are little-endian.

use docrestore_core::{Error, Namespace, Result};
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

/// First four bytes of every archive
pub const ARCHIVE_MAGIC: u32 = 0x8199_e26d;

/// Header format version written by [`crate::Multiplexer`]
pub const ARCHIVE_FORMAT_VERSION: u32 = 1;

/// Largest accepted header
pub const MAX_HEADER_LEN: usize = 16 * 1024 * 1024;

/// Largest accepted chunk body
pub const MAX_CHUNK_LEN: usize = 64 * 1024 * 1024;

/// Byte that ends the chunk sequence
pub const TERMINATOR: u8 = 0xFF;

/// Chunk type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkKind {
    /// Collection metadata JSON
    Metadata = 0x01,
    /// A run of document bytes
    Data = 0x02,
    /// End of a namespace's data, with its checksum
    Eof = 0x03,
}

impl ChunkKind {
    /// Decode a kind byte
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(ChunkKind::Metadata),
            0x02 => Some(ChunkKind::Data),
            0x03 => Some(ChunkKind::Eof),
            _ => None,
        }
    }
}

/// Fixed part of a chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Chunk type
    pub kind: ChunkKind,
    /// Namespace the chunk belongs to, `db.collection`
    pub namespace: String,
    /// Body length for Metadata/Data, CRC32 for Eof
    pub value: u32,
}

impl ChunkHeader {
    /// Serialize the header (without body)
    pub fn encode(&self) -> Result<Vec<u8>> {
        let ns = self.namespace.as_bytes();
        let ns_len = u16::try_from(ns.len()).map_err(|_| {
            Error::invalid_operation(format!("namespace {} is too long", self.namespace))
        })?;
        let mut out = Vec::with_capacity(1 + 2 + ns.len() + 4);
        out.push(self.kind as u8);
        out.extend_from_slice(&ns_len.to_le_bytes());
        out.extend_from_slice(ns);
        out.extend_from_slice(&self.value.to_le_bytes());
        Ok(out)
    }

    /// Body length following this header
    pub fn body_len(&self) -> usize {
        match self.kind {
            ChunkKind::Metadata | ChunkKind::Data => self.value as usize,
            ChunkKind::Eof => 0,
        }
    }
}

/// One namespace listed in the archive header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceEntry {
    /// Database name
    pub db: String,
    /// Collection name
    pub collection: String,
    /// Full collection name when `collection` was shortened
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_name: Option<String>,
    /// `collection`, `timeseries` or `oplog`
    #[serde(rename = "type", default = "default_entry_type")]
    pub kind: String,
    /// Data bytes the namespace will carry
    #[serde(default)]
    pub size: u64,
    /// Whether a Metadata chunk precedes the data
    #[serde(default)]
    pub has_metadata: bool,
}

fn default_entry_type() -> String {
    "collection".to_string()
}

impl NamespaceEntry {
    /// Entry for a plain collection
    pub fn collection(ns: &Namespace, size: u64, has_metadata: bool) -> Self {
        Self {
            db: ns.db.clone(),
            collection: ns.collection.clone(),
            collection_name: None,
            kind: default_entry_type(),
            size,
            has_metadata,
        }
    }

    /// Entry for the oplog
    pub fn oplog(size: u64) -> Self {
        let ns = Namespace::oplog();
        Self {
            kind: "oplog".to_string(),
            ..Self::collection(&ns, size, false)
        }
    }

    /// The namespace this entry describes, preferring the full name
    pub fn namespace(&self) -> Namespace {
        let coll = self.collection_name.as_deref().unwrap_or(&self.collection);
        Namespace::new(self.db.clone(), coll)
    }

    /// Key used in chunk headers
    pub fn chunk_key(&self) -> String {
        self.namespace().to_string()
    }

    /// Whether the entry is the oplog
    pub fn is_oplog(&self) -> bool {
        self.kind == "oplog" || self.namespace().is_oplog()
    }
}

/// Archive prelude: version strings and the list of namespaces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveHeader {
    /// Archive format version
    pub format_version: u32,
    /// Version of the server the dump came from
    #[serde(default)]
    pub server_version: String,
    /// Version of the tool that wrote the archive
    #[serde(default)]
    pub tool_version: String,
    /// Every namespace carried by the archive
    #[serde(default)]
    pub namespaces: Vec<NamespaceEntry>,
}

impl ArchiveHeader {
    /// Header with the current format version
    pub fn new(server_version: impl Into<String>, namespaces: Vec<NamespaceEntry>) -> Self {
        Self {
            format_version: ARCHIVE_FORMAT_VERSION,
            server_version: server_version.into(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            namespaces,
        }
    }
}

/// Reads magic, header, and chunk headers from an archive stream.
///
/// Tracks the byte offset so corruption reports say where it happened.
pub struct ChunkReader<R> {
    inner: R,
    offset: u64,
    finished: bool,
}

impl<R: Read> ChunkReader<R> {
    /// Wrap an archive stream positioned at the magic number
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            offset: 0,
            finished: false,
        }
    }

    /// Bytes consumed so far
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read and validate the magic number and the JSON header
    pub fn read_prelude(&mut self) -> Result<ArchiveHeader> {
        let mut magic = [0u8; 4];
        self.fill(&mut magic, "magic number")?;
        let magic = u32::from_le_bytes(magic);
        if magic != ARCHIVE_MAGIC {
            return Err(Error::corrupt(format!(
                "bad magic {magic:#010x}, expected {ARCHIVE_MAGIC:#010x}"
            )));
        }

        let len = self.read_u32("header length")? as usize;
        if len > MAX_HEADER_LEN {
            return Err(Error::corrupt(format!(
                "header length {len} exceeds the {MAX_HEADER_LEN} byte limit"
            )));
        }
        let body = self.read_body(len, "archive header")?;
        serde_json::from_slice(&body)
            .map_err(|e| Error::corrupt(format!("unreadable archive header: {e}")))
    }

    /// Next chunk header; `None` at the terminator or a clean end of stream
    pub fn next_header(&mut self) -> Result<Option<ChunkHeader>> {
        if self.finished {
            return Ok(None);
        }
        let start = self.offset;
        let mut kind = [0u8; 1];
        loop {
            match self.inner.read(&mut kind) {
                Ok(0) => {
                    self.finished = true;
                    return Ok(None);
                }
                Ok(_) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        self.offset += 1;
        if kind[0] == TERMINATOR {
            self.finished = true;
            return Ok(None);
        }
        let kind = ChunkKind::from_byte(kind[0]).ok_or_else(|| {
            Error::corrupt(format!("unknown chunk kind {:#04x} at offset {start}", kind[0]))
        })?;

        let mut ns_len = [0u8; 2];
        self.fill(&mut ns_len, "chunk namespace length")?;
        let ns_len = u16::from_le_bytes(ns_len) as usize;
        let ns = self.read_body(ns_len, "chunk namespace")?;
        let namespace = String::from_utf8(ns)
            .map_err(|_| Error::corrupt(format!("chunk namespace at offset {start} is not UTF-8")))?;
        let value = self.read_u32("chunk length")?;

        let header = ChunkHeader {
            kind,
            namespace,
            value,
        };
        if header.body_len() > MAX_CHUNK_LEN {
            return Err(Error::corrupt(format!(
                "chunk for {} at offset {start} declares {} bytes, limit is {MAX_CHUNK_LEN}",
                header.namespace,
                header.body_len()
            )));
        }
        Ok(Some(header))
    }

    /// Read exactly `len` body bytes; a short stream is corruption.
    pub fn read_body(&mut self, len: usize, what: &str) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(len.min(1 << 20));
        let got = (&mut self.inner).take(len as u64).read_to_end(&mut buf)?;
        self.offset += got as u64;
        if got < len {
            return Err(Error::corrupt(format!(
                "{what} declares {len} bytes but the stream ended after {got} (offset {})",
                self.offset
            )));
        }
        Ok(buf)
    }

    fn read_u32(&mut self, what: &str) -> Result<u32> {
        let mut b = [0u8; 4];
        self.fill(&mut b, what)?;
        Ok(u32::from_le_bytes(b))
    }

    fn fill(&mut self, buf: &mut [u8], what: &str) -> Result<()> {
        self.inner.read_exact(buf).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                Error::corrupt(format!("stream ended inside {what} at offset {}", self.offset))
            } else {
                Error::Io(e)
            }
        })?;
        self.offset += buf.len() as u64;
        Ok(())
    }
}

/// Write the magic number and header
pub fn write_prelude<W: Write>(w: &mut W, header: &ArchiveHeader) -> Result<()> {
    let body = serde_json::to_vec(header)?;
    if body.len() > MAX_HEADER_LEN {
        return Err(Error::invalid_operation("archive header is too large"));
    }
    w.write_all(&ARCHIVE_MAGIC.to_le_bytes())?;
    w.write_all(&(body.len() as u32).to_le_bytes())?;
    w.write_all(&body)?;
    Ok(())
}
