//! Per-namespace destinations for demultiplexed archive bytes
//!
//! A [`Receiver`] is the demultiplexer's end; each variant pairs with a
//! reader handed to the restore worker that consumes the namespace.

use crate::source::{PosRead, PositionHandle};
use docrestore_core::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::io::{self, Read};
use std::sync::mpsc::{self, Receiver as ChannelReceiver, SyncSender};
use std::sync::Arc;

/// Chunks buffered per regular namespace before the demultiplexer blocks
pub const DEFAULT_REGULAR_CAPACITY: usize = 4;

/// Outcome of handing a chunk to a receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The receiver took (or deliberately discarded) the bytes
    Accepted,
    /// The consuming side has gone away
    Detached,
}

/// What travels through a regular receiver's channel
#[derive(Debug)]
pub enum Frame {
    /// One chunk body
    Bytes(Vec<u8>),
    /// The stream was abandoned; the namespace is incomplete
    Aborted,
}

/// Demultiplexer end of one namespace slot
pub enum Receiver {
    /// Streams chunks through a bounded channel
    Regular(SyncSender<Frame>),
    /// Discards everything
    Muted,
    /// Accumulates the whole payload before any reader sees it
    SpecialCache(SpecialCache),
    /// Captures one metadata block
    MetadataPrelude(PreludeSlot),
}

impl Receiver {
    /// A regular receiver and the reader draining it
    pub fn regular(capacity: usize) -> (Receiver, RegularReader) {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        (Receiver::Regular(tx), RegularReader::new(rx))
    }

    /// A special-cache receiver and a handle readers can wait on
    pub fn special_cache() -> (Receiver, SpecialCache) {
        let cache = SpecialCache::new();
        (Receiver::SpecialCache(cache.clone()), cache)
    }

    /// A metadata-prelude receiver and a handle readers can wait on
    pub fn metadata_prelude() -> (Receiver, PreludeSlot) {
        let slot = PreludeSlot::new();
        (Receiver::MetadataPrelude(slot.clone()), slot)
    }

    /// Variant name for logs
    pub fn kind_name(&self) -> &'static str {
        match self {
            Receiver::Regular(_) => "regular",
            Receiver::Muted => "muted",
            Receiver::SpecialCache(_) => "special-cache",
            Receiver::MetadataPrelude(_) => "metadata-prelude",
        }
    }

    /// Whether this receiver discards its input
    pub fn is_muted(&self) -> bool {
        matches!(self, Receiver::Muted)
    }

    /// Hand over one chunk body
    pub fn deliver(&mut self, bytes: Vec<u8>) -> Delivery {
        match self {
            Receiver::Regular(tx) => match tx.send(Frame::Bytes(bytes)) {
                Ok(()) => Delivery::Accepted,
                Err(_) => Delivery::Detached,
            },
            Receiver::Muted => Delivery::Accepted,
            Receiver::SpecialCache(cache) => {
                cache.append(&bytes);
                Delivery::Accepted
            }
            Receiver::MetadataPrelude(slot) => {
                slot.fill(bytes);
                Delivery::Accepted
            }
        }
    }

    /// Signal end of input.
    ///
    /// `complete` is false when the stream was abandoned; cache readers then
    /// see an error instead of a short payload.
    pub fn close(self, complete: bool) {
        match self {
            Receiver::Regular(tx) => {
                if !complete {
                    // Fails only when the reader is already gone.
                    let _ = tx.send(Frame::Aborted);
                }
            }
            Receiver::Muted => {}
            Receiver::SpecialCache(cache) => cache.finish(complete),
            Receiver::MetadataPrelude(slot) => slot.close(),
        }
    }
}

/// Consumer side of a regular receiver
pub struct RegularReader {
    rx: ChannelReceiver<Frame>,
    current: Vec<u8>,
    offset: usize,
    pos: PositionHandle,
}

impl RegularReader {
    fn new(rx: ChannelReceiver<Frame>) -> Self {
        Self {
            rx,
            current: Vec::new(),
            offset: 0,
            pos: PositionHandle::new(),
        }
    }
}

impl Read for RegularReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.offset >= self.current.len() {
            match self.rx.recv() {
                Ok(Frame::Bytes(chunk)) => {
                    self.current = chunk;
                    self.offset = 0;
                }
                Ok(Frame::Aborted) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "archive stream ended before this namespace was complete",
                    ))
                }
                // Sender dropped: end of this namespace.
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len() - self.offset);
        buf[..n].copy_from_slice(&self.current[self.offset..self.offset + n]);
        self.offset += n;
        self.pos.add(n as u64);
        Ok(n)
    }
}

impl PosRead for RegularReader {
    fn pos(&self) -> u64 {
        self.pos.get()
    }
}

#[derive(Debug)]
enum CacheStatus {
    Filling(Vec<u8>),
    Complete(Arc<Vec<u8>>),
    Truncated,
}

struct CacheInner {
    state: Mutex<CacheStatus>,
    done: Condvar,
}

/// Whole-payload buffer shared between the demultiplexer and readers
#[derive(Clone)]
pub struct SpecialCache {
    inner: Arc<CacheInner>,
}

impl SpecialCache {
    fn new() -> Self {
        Self {
            inner: Arc::new(CacheInner {
                state: Mutex::new(CacheStatus::Filling(Vec::new())),
                done: Condvar::new(),
            }),
        }
    }

    fn append(&self, bytes: &[u8]) {
        if let CacheStatus::Filling(buf) = &mut *self.inner.state.lock() {
            buf.extend_from_slice(bytes);
        }
    }

    fn finish(&self, complete: bool) {
        let mut state = self.inner.state.lock();
        if matches!(*state, CacheStatus::Filling(_)) {
            let prev = std::mem::replace(&mut *state, CacheStatus::Truncated);
            if let (true, CacheStatus::Filling(buf)) = (complete, prev) {
                *state = CacheStatus::Complete(Arc::new(buf));
            }
        }
        self.inner.done.notify_all();
    }

    /// Whether the payload is complete, without blocking
    pub fn is_complete(&self) -> bool {
        matches!(&*self.inner.state.lock(), CacheStatus::Complete(_))
    }

    /// Block until the stream finishes, returning the payload
    pub fn wait(&self) -> Result<Arc<Vec<u8>>> {
        let mut state = self.inner.state.lock();
        loop {
            match &*state {
                CacheStatus::Complete(data) => return Ok(Arc::clone(data)),
                CacheStatus::Truncated => {
                    return Err(Error::corrupt(
                        "archive stream ended before a cached namespace was complete",
                    ))
                }
                CacheStatus::Filling(_) => {}
            }
            self.inner.done.wait(&mut state);
        }
    }

    /// Block until complete and return a reader over the payload
    pub fn reader(&self) -> Result<SpecialCacheReader> {
        Ok(SpecialCacheReader {
            data: self.wait()?,
            offset: 0,
        })
    }
}

/// Reader over a completed special cache
pub struct SpecialCacheReader {
    data: Arc<Vec<u8>>,
    offset: usize,
}

impl Read for SpecialCacheReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let rest = &self.data[self.offset..];
        let n = buf.len().min(rest.len());
        buf[..n].copy_from_slice(&rest[..n]);
        self.offset += n;
        Ok(n)
    }
}

impl PosRead for SpecialCacheReader {
    fn pos(&self) -> u64 {
        self.offset as u64
    }
}

#[derive(Default)]
struct SlotState {
    block: Option<Arc<Vec<u8>>>,
    closed: bool,
}

struct SlotInner {
    state: Mutex<SlotState>,
    ready: Condvar,
}

/// One-shot metadata block shared between the demultiplexer and a reader
#[derive(Clone)]
pub struct PreludeSlot {
    inner: Arc<SlotInner>,
}

impl PreludeSlot {
    fn new() -> Self {
        Self {
            inner: Arc::new(SlotInner {
                state: Mutex::new(SlotState::default()),
                ready: Condvar::new(),
            }),
        }
    }

    fn fill(&self, bytes: Vec<u8>) {
        let mut state = self.inner.state.lock();
        if state.block.is_none() {
            state.block = Some(Arc::new(bytes));
        }
        self.inner.ready.notify_all();
    }

    fn close(&self) {
        self.inner.state.lock().closed = true;
        self.inner.ready.notify_all();
    }

    /// Block until the block arrives or the stream closes without one
    pub fn wait(&self) -> Option<Arc<Vec<u8>>> {
        let mut state = self.inner.state.lock();
        while state.block.is_none() && !state.closed {
            self.inner.ready.wait(&mut state);
        }
        state.block.clone()
    }

    /// Block until resolved and return a reader; empty when no block arrived
    pub fn reader(&self) -> PreludeReader {
        PreludeReader {
            data: self.wait().unwrap_or_default(),
            offset: 0,
        }
    }
}

/// Reader over a captured metadata block
pub struct PreludeReader {
    data: Arc<Vec<u8>>,
    offset: usize,
}

impl Read for PreludeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let rest = &self.data[self.offset..];
        let n = buf.len().min(rest.len());
        buf[..n].copy_from_slice(&rest[..n]);
        self.offset += n;
        Ok(n)
    }
}

impl PosRead for PreludeReader {
    fn pos(&self) -> u64 {
        self.offset as u64
    }
}
