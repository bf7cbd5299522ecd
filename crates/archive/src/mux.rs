//! Archive writer
//!
//! Interleaves namespaces into one stream in the format read by
//! [`crate::Demultiplexer`]. Callers control interleaving by the order of
//! their `write` calls.

use crate::format::{write_prelude, ArchiveHeader, ChunkHeader, ChunkKind, MAX_CHUNK_LEN, TERMINATOR};
use docrestore_core::{Error, Result};
use std::collections::{BTreeMap, HashSet};
use std::io::Write;

/// Writes an archive stream
pub struct Multiplexer<W: Write> {
    out: W,
    open: BTreeMap<String, crc32fast::Hasher>,
    closed: HashSet<String>,
}

impl<W: Write> Multiplexer<W> {
    /// Write the prelude and return a writer ready for chunks
    pub fn new(mut out: W, header: &ArchiveHeader) -> Result<Self> {
        write_prelude(&mut out, header)?;
        Ok(Self {
            out,
            open: BTreeMap::new(),
            closed: HashSet::new(),
        })
    }

    /// Write the metadata block of `namespace`; must precede its data
    pub fn write_metadata(&mut self, namespace: &str, metadata: &[u8]) -> Result<()> {
        if self.closed.contains(namespace) || self.open.contains_key(namespace) {
            return Err(Error::invalid_operation(format!(
                "metadata for {namespace} must be written before its data"
            )));
        }
        if metadata.len() > MAX_CHUNK_LEN {
            return Err(Error::invalid_operation(format!(
                "metadata for {namespace} exceeds {MAX_CHUNK_LEN} bytes"
            )));
        }
        self.chunk(ChunkKind::Metadata, namespace, metadata.len() as u32)?;
        self.out.write_all(metadata)?;
        Ok(())
    }

    /// Append data bytes to `namespace`, split into chunks as needed
    pub fn write(&mut self, namespace: &str, data: &[u8]) -> Result<()> {
        if self.closed.contains(namespace) {
            return Err(Error::invalid_operation(format!(
                "{namespace} was already closed"
            )));
        }
        self.open
            .entry(namespace.to_string())
            .or_insert_with(crc32fast::Hasher::new)
            .update(data);
        for piece in data.chunks(MAX_CHUNK_LEN) {
            self.chunk(ChunkKind::Data, namespace, piece.len() as u32)?;
            self.out.write_all(piece)?;
        }
        Ok(())
    }

    /// Write the end marker of `namespace`
    pub fn close_namespace(&mut self, namespace: &str) -> Result<()> {
        if !self.closed.insert(namespace.to_string()) {
            return Err(Error::invalid_operation(format!(
                "{namespace} was already closed"
            )));
        }
        let crc = self
            .open
            .remove(namespace)
            .unwrap_or_default()
            .finalize();
        self.chunk(ChunkKind::Eof, namespace, crc)
    }

    /// Close every namespace still open, write the terminator, and flush
    pub fn finish(mut self) -> Result<W> {
        let pending: Vec<String> = self.open.keys().cloned().collect();
        for ns in pending {
            self.close_namespace(&ns)?;
        }
        self.out.write_all(&[TERMINATOR])?;
        self.out.flush()?;
        Ok(self.out)
    }

    /// Recover the sink as-is, without end markers or terminator
    pub fn into_inner(self) -> W {
        self.out
    }

    fn chunk(&mut self, kind: ChunkKind, namespace: &str, value: u32) -> Result<()> {
        let header = ChunkHeader {
            kind,
            namespace: namespace.to_string(),
            value,
        };
        self.out.write_all(&header.encode()?)?;
        Ok(())
    }
}
