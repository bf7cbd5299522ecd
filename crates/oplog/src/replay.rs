//! Oplog replay driver
//!
//! Decodes entries from a document stream, drops what must not be replayed,
//! and feeds the rest through a [`TxnReassembler`].

use crate::entry::{OplogEntry, Timestamp};
use crate::reassembler::{OplogApplier, TxnReassembler};
use docrestore_core::{CancellationToken, Document, DocumentReader, Error, Result};
use serde_json::Value;
use std::io::Read;
use tracing::{info, warn};

const INTERNAL_NAMESPACES: &[&str] = &["config.system.sessions", "config.transactions"];

/// Whether entries for `ns` are never replayed
pub fn is_internal_namespace(ns: &str) -> bool {
    INTERNAL_NAMESPACES.contains(&ns)
        || ns.starts_with("config.cache.")
        || ns.ends_with(".system.profile")
}

/// Outcome of one replay
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Entries decoded from the stream
    pub entries_read: u64,
    /// Entries and sub-operations dropped for internal namespaces
    pub entries_filtered: u64,
    /// Operations handed to the applier
    pub ops_applied: u64,
    /// Transactions applied
    pub transactions_committed: u64,
    /// Transactions discarded by abort markers
    pub transactions_aborted: u64,
    /// Transactions still open at end of stream
    pub transactions_incomplete: usize,
    /// Buffered operations never applied
    pub buffered_ops_undelivered: u64,
    /// No-op entries skipped
    pub noops_skipped: u64,
    /// Whether replay stopped at the timestamp limit
    pub stopped_at_limit: bool,
    /// Timestamp of the last entry processed
    pub last_ts: Option<Timestamp>,
}

impl ReplayStats {
    /// Whether everything read was applied or deliberately skipped
    pub fn is_clean(&self) -> bool {
        self.transactions_incomplete == 0
    }
}

/// Replays an oplog stream
#[derive(Debug, Clone, Default)]
pub struct OplogReplayer {
    limit: Option<Timestamp>,
    strict_transactions: bool,
    cancel: CancellationToken,
}

impl OplogReplayer {
    /// Replay everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop before the first entry at or after `limit`
    pub fn with_limit(mut self, limit: Option<Timestamp>) -> Self {
        self.limit = limit;
        self
    }

    /// Fail when transactions are left open at end of stream
    pub fn strict_transactions(mut self, strict: bool) -> Self {
        self.strict_transactions = strict;
        self
    }

    /// Check `token` between entries
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Replay the entries in `source` through `applier`
    pub fn replay<R: Read, A: OplogApplier + ?Sized>(
        &self,
        source: R,
        applier: &mut A,
    ) -> Result<ReplayStats> {
        let mut stats = ReplayStats::default();
        let mut reassembler = TxnReassembler::new();
        let mut filtered = 0u64;

        {
            let mut sink = FilteringApplier {
                inner: applier,
                filtered: &mut filtered,
            };
            for doc in DocumentReader::new(source) {
                if let Err(e) = self.cancel.check() {
                    reassembler.discard_pending();
                    return Err(e);
                }
                let entry = OplogEntry::from_document(doc?)?;
                stats.entries_read += 1;
                if let Some(limit) = self.limit {
                    if entry.ts >= limit {
                        info!(limit = %limit, ts = %entry.ts, "Reached oplog limit");
                        stats.stopped_at_limit = true;
                        break;
                    }
                }
                stats.last_ts = Some(entry.ts);
                if is_internal_namespace(&entry.ns) {
                    *sink.filtered += 1;
                    continue;
                }
                reassembler.process(&entry, &mut sink)?;
            }
        }

        let (r, incomplete) = reassembler.finish();
        stats.entries_filtered = filtered;
        stats.ops_applied = r.ops_applied();
        stats.transactions_committed = r.committed;
        stats.transactions_aborted = r.aborted;
        stats.buffered_ops_undelivered = r.discarded_ops;
        stats.noops_skipped = r.noops;

        if let Some(err) = incomplete {
            if let Error::TransactionIncomplete { transactions, .. } = &err {
                stats.transactions_incomplete = *transactions;
            }
            if self.strict_transactions {
                return Err(err);
            }
            warn!(error = %err, "Oplog ended with open transactions");
        }

        info!(
            entries = stats.entries_read,
            applied = stats.ops_applied,
            committed = stats.transactions_committed,
            aborted = stats.transactions_aborted,
            filtered = stats.entries_filtered,
            "Oplog replay complete"
        );
        Ok(stats)
    }
}

/// Drops sub-operations that target internal namespaces
struct FilteringApplier<'a, A: ?Sized> {
    inner: &'a mut A,
    filtered: &'a mut u64,
}

impl<A: OplogApplier + ?Sized> OplogApplier for FilteringApplier<'_, A> {
    fn apply(&mut self, ops: &[Document]) -> Result<()> {
        let internal = |op: &Document| {
            op.get("ns")
                .and_then(Value::as_str)
                .map(is_internal_namespace)
                .unwrap_or(false)
        };
        if !ops.iter().any(internal) {
            return self.inner.apply(ops);
        }
        let kept: Vec<Document> = ops.iter().filter(|&op| !internal(op)).cloned().collect();
        *self.filtered += (ops.len() - kept.len()) as u64;
        if kept.is_empty() {
            return Ok(());
        }
        self.inner.apply(&kept)
    }
}
