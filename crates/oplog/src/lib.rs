//! Oplog replay with transaction reassembly
//!
//! Entries are read in stream order. Multi-statement transactions arrive as
//! several `applyOps` entries that may interleave with other writes; they are
//! buffered per transaction and applied as one unit when their commit marker
//! arrives.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod entry;
pub mod reassembler;
pub mod replay;

pub use entry::{EntryClass, OpKind, OplogEntry, Timestamp, TxnId};
pub use reassembler::{OplogApplier, ReassemblerStats, TxnReassembler};
pub use replay::{is_internal_namespace, OplogReplayer, ReplayStats};
