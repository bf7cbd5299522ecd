//! Archive demultiplexer
//!
//! One thread owns the archive cursor and routes each chunk to the receiver
//! registered for its namespace. Backpressure comes from the receivers: a
//! full regular channel stalls the whole stream until its worker catches up.
//!
//! Any framing problem is fatal because the shared cursor cannot be
//! resynchronised. On every exit path all receivers are closed so blocked
//! readers wake up.

use crate::format::{ArchiveHeader, ChunkHeader, ChunkKind, ChunkReader};
use crate::receiver::{Delivery, Receiver};
use docrestore_core::{CancellationToken, Error, Namespace, Result};
use std::collections::{HashMap, HashSet};
use std::io::Read;
use tracing::{debug, info, warn};

/// Counters for one demultiplexer run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DemuxStats {
    /// Chunks read, all kinds
    pub chunks: u64,
    /// Data bytes routed to live receivers
    pub data_bytes: u64,
    /// Data and metadata bytes dropped by muted receivers
    pub muted_bytes: u64,
    /// Metadata blocks captured
    pub metadata_blocks: usize,
    /// Namespaces that reached their Eof chunk
    pub namespaces_completed: usize,
    /// Regular receivers demoted to muted because their reader went away
    pub detached: usize,
}

struct DataSlot {
    receiver: Receiver,
    crc: crc32fast::Hasher,
}

/// Splits one archive stream into per-namespace receivers
pub struct Demultiplexer<R> {
    chunks: ChunkReader<R>,
    header: Option<ArchiveHeader>,
    data: HashMap<String, DataSlot>,
    metadata: HashMap<String, Receiver>,
    finished: HashSet<String>,
    cancel: CancellationToken,
    stats: DemuxStats,
}

impl<R: Read> Demultiplexer<R> {
    /// Wrap an archive stream positioned at its magic number
    pub fn new(reader: R) -> Self {
        Self {
            chunks: ChunkReader::new(reader),
            header: None,
            data: HashMap::new(),
            metadata: HashMap::new(),
            finished: HashSet::new(),
            cancel: CancellationToken::new(),
            stats: DemuxStats::default(),
        }
    }

    /// Check `token` between chunks
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Read the magic number and header; idempotent
    pub fn read_header(&mut self) -> Result<&ArchiveHeader> {
        if self.header.is_none() {
            let header = self.chunks.read_prelude()?;
            info!(
                namespaces = header.namespaces.len(),
                format_version = header.format_version,
                server_version = %header.server_version,
                "Read archive header"
            );
            self.header = Some(header);
        }
        self.header
            .as_ref()
            .ok_or_else(|| Error::invalid_operation("archive header unavailable"))
    }

    /// The header, once read
    pub fn header(&self) -> Option<&ArchiveHeader> {
        self.header.as_ref()
    }

    /// Register a receiver for `namespace`.
    ///
    /// `MetadataPrelude` receivers take the metadata slot; every other variant
    /// takes the data slot. Each slot can be opened once.
    pub fn open(&mut self, namespace: &str, receiver: Receiver) -> Result<()> {
        let taken = match &receiver {
            Receiver::MetadataPrelude(_) => self.metadata.contains_key(namespace),
            _ => self.data.contains_key(namespace),
        };
        if taken {
            return Err(Error::invalid_operation(format!(
                "{} receiver for {namespace} is already open",
                receiver.kind_name()
            )));
        }
        debug!(namespace, kind = receiver.kind_name(), "Opened archive receiver");
        match receiver {
            Receiver::MetadataPrelude(_) => {
                self.metadata.insert(namespace.to_string(), receiver);
            }
            receiver => {
                self.data.insert(
                    namespace.to_string(),
                    DataSlot {
                        receiver,
                        crc: crc32fast::Hasher::new(),
                    },
                );
            }
        }
        Ok(())
    }

    /// Whether a data receiver is registered for `namespace`
    pub fn is_open(&self, namespace: &str) -> bool {
        self.data.contains_key(namespace)
    }

    /// Consume the stream to the end, routing every chunk.
    ///
    /// All receivers are closed before this returns, whatever the outcome.
    pub fn run(mut self) -> Result<DemuxStats> {
        let result = self.pump();
        self.close_all(result.is_ok());
        match result {
            Ok(()) => {
                info!(
                    chunks = self.stats.chunks,
                    data_bytes = self.stats.data_bytes,
                    namespaces = self.stats.namespaces_completed,
                    "Archive demultiplexed"
                );
                Ok(self.stats)
            }
            Err(e) => {
                warn!(error = %e, offset = self.chunks.offset(), "Archive demultiplexing stopped");
                Err(e)
            }
        }
    }

    fn pump(&mut self) -> Result<()> {
        self.read_header()?;
        loop {
            self.cancel.check()?;
            let Some(chunk) = self.chunks.next_header()? else {
                return Ok(());
            };
            self.stats.chunks += 1;
            match chunk.kind {
                ChunkKind::Metadata => self.route_metadata(chunk)?,
                ChunkKind::Data => self.route_data(chunk)?,
                ChunkKind::Eof => self.finish_namespace(chunk)?,
            }
        }
    }

    fn route_metadata(&mut self, chunk: ChunkHeader) -> Result<()> {
        let ns = chunk.namespace;
        if let Some(mut receiver) = self.metadata.remove(&ns) {
            let body = self.chunks.read_body(chunk.value as usize, "metadata chunk")?;
            receiver.deliver(body);
            receiver.close(true);
            self.stats.metadata_blocks += 1;
            return Ok(());
        }
        match self.data.get(&ns) {
            Some(slot) if slot.receiver.is_muted() => {
                let body = self.chunks.read_body(chunk.value as usize, "metadata chunk")?;
                self.stats.muted_bytes += body.len() as u64;
                Ok(())
            }
            _ => Err(Error::UnexpectedNamespace(ns)),
        }
    }

    fn route_data(&mut self, chunk: ChunkHeader) -> Result<()> {
        let ns = chunk.namespace;
        if self.finished.contains(&ns) {
            return Err(Error::corrupt(format!("data for {ns} after its end marker")));
        }
        if !self.data.contains_key(&ns) {
            return Err(Error::UnexpectedNamespace(ns));
        }
        // A bucket namespace's metadata block is filed under its view.
        let view = Namespace::parse(&ns).view_namespace().to_string();
        for owner in [&ns, &view] {
            if let Some(meta) = self.metadata.remove(owner.as_str()) {
                meta.close(false);
                return Err(Error::corrupt(format!(
                    "metadata for {owner} must precede the data of {ns}"
                )));
            }
        }
        // The body is read in full before delivery so a short stream never
        // hands partial bytes to a receiver.
        let body = self.chunks.read_body(chunk.value as usize, "data chunk")?;
        let Some(slot) = self.data.get_mut(&ns) else {
            return Err(Error::UnexpectedNamespace(ns));
        };
        slot.crc.update(&body);
        let len = body.len() as u64;
        if slot.receiver.is_muted() {
            self.stats.muted_bytes += len;
            return Ok(());
        }
        match slot.receiver.deliver(body) {
            Delivery::Accepted => self.stats.data_bytes += len,
            Delivery::Detached => {
                warn!(namespace = %ns, "Reader went away; discarding the rest of this namespace");
                slot.receiver = Receiver::Muted;
                self.stats.detached += 1;
                self.stats.muted_bytes += len;
            }
        }
        Ok(())
    }

    fn finish_namespace(&mut self, chunk: ChunkHeader) -> Result<()> {
        let ns = chunk.namespace;
        let Some(slot) = self.data.remove(&ns) else {
            if self.finished.contains(&ns) {
                return Err(Error::corrupt(format!("duplicate end marker for {ns}")));
            }
            return Err(Error::UnexpectedNamespace(ns));
        };
        if let Some(meta) = self.metadata.remove(&ns) {
            meta.close(true);
        }
        let actual = slot.crc.finalize();
        if actual != chunk.value {
            slot.receiver.close(false);
            return Err(Error::corrupt(format!(
                "checksum mismatch for {ns}: archive says {:#010x}, data hashes to {actual:#010x}",
                chunk.value
            )));
        }
        debug!(namespace = %ns, receiver = slot.receiver.kind_name(), "Namespace complete");
        slot.receiver.close(true);
        self.finished.insert(ns);
        self.stats.namespaces_completed += 1;
        Ok(())
    }

    fn close_all(&mut self, clean: bool) {
        for (ns, meta) in self.metadata.drain() {
            meta.close(clean);
            debug!(namespace = %ns, "Metadata receiver closed without a block");
        }
        for (ns, slot) in self.data.drain() {
            if clean && !slot.receiver.is_muted() {
                warn!(namespace = %ns, "Archive ended before this namespace's end marker");
            }
            slot.receiver.close(clean);
        }
    }
}
