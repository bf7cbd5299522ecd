//! Document model and frame codec
//!
//! Collection data files, the oplog file, and archive data chunks all carry a
//! concatenation of document frames:
//!
//! ```text
//! ┌──────────────────────────────┬───────────────────────────────┐
//! │ Total length (u32 LE, incl.) │ MessagePack document body     │
//! └──────────────────────────────┴───────────────────────────────┘
//! ```

use crate::error::{Error, Result};
use serde_json::{Map, Value};
use std::io::{self, Read, Write};

/// A document: an ordered map of field name to value
pub type Document = Map<String, Value>;

/// Largest frame accepted by the reader (16 MiB document + 16 KiB slack)
pub const MAX_DOCUMENT_FRAME_SIZE: usize = 16 * 1024 * 1024 + 16 * 1024;

const LEN_PREFIX: usize = 4;

/// Encode one document as a length-prefixed frame.
pub fn encode_document(doc: &Document) -> Result<Vec<u8>> {
    let body = rmp_serde::to_vec_named(doc)?;
    let total = body.len() + LEN_PREFIX;
    if total > MAX_DOCUMENT_FRAME_SIZE {
        return Err(Error::serialization(format!(
            "document of {total} bytes exceeds the {MAX_DOCUMENT_FRAME_SIZE} byte limit"
        )));
    }
    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&(total as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode a single frame, returning the document and bytes consumed.
pub fn decode_document(bytes: &[u8]) -> Result<(Document, usize)> {
    if bytes.len() < LEN_PREFIX {
        return Err(Error::serialization("truncated document length prefix"));
    }
    let total = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    check_frame_len(total)?;
    if bytes.len() < total {
        return Err(Error::serialization(format!(
            "truncated document: need {total} bytes, have {}",
            bytes.len()
        )));
    }
    let doc: Document = rmp_serde::from_slice(&bytes[LEN_PREFIX..total])?;
    Ok((doc, total))
}

fn check_frame_len(total: usize) -> Result<()> {
    if total <= LEN_PREFIX {
        return Err(Error::serialization(format!(
            "invalid document length {total}"
        )));
    }
    if total > MAX_DOCUMENT_FRAME_SIZE {
        return Err(Error::serialization(format!(
            "document length {total} exceeds the {MAX_DOCUMENT_FRAME_SIZE} byte limit"
        )));
    }
    Ok(())
}

/// Streaming reader over a sequence of document frames.
pub struct DocumentReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: Read> DocumentReader<R> {
    /// Wrap a byte source.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(4096),
        }
    }

    /// Read the next document; `Ok(None)` at a clean end of stream.
    pub fn next_document(&mut self) -> Result<Option<Document>> {
        let mut len_buf = [0u8; LEN_PREFIX];
        let mut filled = 0;
        while filled < LEN_PREFIX {
            match self.inner.read(&mut len_buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(Error::serialization(
                        "stream ended inside a document length prefix",
                    ))
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }

        let total = u32::from_le_bytes(len_buf) as usize;
        check_frame_len(total)?;

        self.buf.resize(total - LEN_PREFIX, 0);
        self.inner.read_exact(&mut self.buf).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                Error::serialization(format!("stream ended inside a {total} byte document"))
            } else {
                Error::Io(e)
            }
        })?;

        Ok(Some(rmp_serde::from_slice(&self.buf)?))
    }
}

impl<R: Read> Iterator for DocumentReader<R> {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_document().transpose()
    }
}

/// Writes document frames to a byte sink.
pub struct DocumentWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> DocumentWriter<W> {
    /// Wrap a byte sink.
    pub fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }

    /// Append one document.
    pub fn write_document(&mut self, doc: &Document) -> Result<()> {
        let frame = encode_document(doc)?;
        self.inner.write_all(&frame)?;
        self.written += 1;
        Ok(())
    }

    /// Number of documents written
    pub fn documents_written(&self) -> u64 {
        self.written
    }

    /// Flush and return the sink.
    pub fn finish(mut self) -> Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}
