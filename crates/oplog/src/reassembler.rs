//! Transaction reassembly
//!
//! Entries are processed strictly in arrival order. Plain writes are applied
//! at once; transaction batches wait in a per-transaction buffer until the
//! commit marker arrives, then the whole transaction is applied as one unit.

use crate::entry::{EntryClass, OplogEntry, Timestamp, TxnId};
use docrestore_core::{Document, Error, Result};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Receives operations to apply.
///
/// Each call is one atomic unit: a single plain operation, or every
/// operation of a committed transaction in original order.
pub trait OplogApplier {
    /// Apply `ops` as one unit
    fn apply(&mut self, ops: &[Document]) -> Result<()>;
}

impl<F> OplogApplier for F
where
    F: FnMut(&[Document]) -> Result<()>,
{
    fn apply(&mut self, ops: &[Document]) -> Result<()> {
        self(ops)
    }
}

/// Counters for one reassembly run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReassemblerStats {
    /// Plain operations applied on their own
    pub plain_ops: u64,
    /// `applyOps` units outside transactions
    pub units: u64,
    /// Operations delivered inside units and transactions
    pub unit_ops: u64,
    /// Transactions applied
    pub committed: u64,
    /// Transactions discarded by an abort marker
    pub aborted: u64,
    /// Commit markers with no buffered batches
    pub unknown_commits: u64,
    /// No-op entries skipped
    pub noops: u64,
    /// Buffered operations never applied (aborted or left open)
    pub discarded_ops: u64,
}

impl ReassemblerStats {
    /// Every operation handed to the applier
    pub fn ops_applied(&self) -> u64 {
        self.plain_ops + self.unit_ops
    }
}

#[derive(Debug)]
struct TxnBuffer {
    ops: Vec<Document>,
    first_ts: Timestamp,
    batches: usize,
}

/// Buffers transaction batches until their commit or abort marker
#[derive(Debug, Default)]
pub struct TxnReassembler {
    buffers: HashMap<TxnId, TxnBuffer>,
    stats: ReassemblerStats,
}

impl TxnReassembler {
    /// An empty reassembler
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters so far
    pub fn stats(&self) -> &ReassemblerStats {
        &self.stats
    }

    /// Transactions still waiting for a marker
    pub fn pending_transactions(&self) -> usize {
        self.buffers.len()
    }

    /// Operations buffered across open transactions
    pub fn pending_ops(&self) -> usize {
        self.buffers.values().map(|b| b.ops.len()).sum()
    }

    /// Route one entry
    pub fn process<A: OplogApplier + ?Sized>(
        &mut self,
        entry: &OplogEntry,
        applier: &mut A,
    ) -> Result<()> {
        match entry.classify() {
            EntryClass::Noop => {
                self.stats.noops += 1;
            }
            EntryClass::Plain => {
                applier.apply(&[entry.to_operation()?])?;
                self.stats.plain_ops += 1;
            }
            EntryClass::Unit => {
                let ops = entry.sub_operations()?;
                if !ops.is_empty() {
                    applier.apply(&ops)?;
                    self.stats.unit_ops += ops.len() as u64;
                }
                self.stats.units += 1;
            }
            EntryClass::Buffer => {
                let id = require_txn(entry)?;
                let ops = entry.sub_operations()?;
                let buffer = self.buffers.entry(id).or_insert_with(|| TxnBuffer {
                    ops: Vec::new(),
                    first_ts: entry.ts,
                    batches: 0,
                });
                buffer.ops.extend(ops);
                buffer.batches += 1;
            }
            EntryClass::Commit => {
                let id = require_txn(entry)?;
                let tail = entry.sub_operations()?;
                let ops = match self.buffers.remove(&id) {
                    Some(mut buffer) => {
                        debug!(
                            txn = %id,
                            batches = buffer.batches + 1,
                            started = %buffer.first_ts,
                            committed = %entry.ts,
                            "Applying transaction"
                        );
                        buffer.ops.extend(tail);
                        buffer.ops
                    }
                    None => {
                        self.stats.unknown_commits += 1;
                        tail
                    }
                };
                if !ops.is_empty() {
                    applier.apply(&ops)?;
                    self.stats.unit_ops += ops.len() as u64;
                }
                self.stats.committed += 1;
            }
            EntryClass::Abort => {
                let id = require_txn(entry)?;
                if let Some(buffer) = self.buffers.remove(&id) {
                    debug!(txn = %id, ops = buffer.ops.len(), "Discarding aborted transaction");
                    self.stats.discarded_ops += buffer.ops.len() as u64;
                }
                self.stats.aborted += 1;
            }
        }
        Ok(())
    }

    /// Drop every open buffer, returning `(transactions, operations)` lost
    pub fn discard_pending(&mut self) -> (usize, usize) {
        let txns = self.buffers.len();
        let ops = self.pending_ops();
        for (id, buffer) in self.buffers.drain() {
            warn!(
                txn = %id,
                ops = buffer.ops.len(),
                started = %buffer.first_ts,
                "Transaction never committed or aborted"
            );
        }
        self.stats.discarded_ops += ops as u64;
        (txns, ops)
    }

    /// End of stream. Open buffers are discarded and reported as
    /// `TransactionIncomplete`.
    pub fn finish(mut self) -> (ReassemblerStats, Option<Error>) {
        let (transactions, operations) = self.discard_pending();
        let incomplete = (transactions > 0).then_some(Error::TransactionIncomplete {
            transactions,
            operations,
        });
        (self.stats, incomplete)
    }
}

fn require_txn(entry: &OplogEntry) -> Result<TxnId> {
    entry.txn_id().ok_or_else(|| {
        Error::serialization(format!("transaction entry at {} has no session id", entry.ts))
    })
}
