//! What a restore did

use docrestore_archive::DemuxStats;
use docrestore_core::{Error, Namespace};
use docrestore_intents::SkippedNamespace;
use docrestore_oplog::ReplayStats;
use std::fmt;
use tracing::{info, warn};

/// One namespace restored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceResult {
    /// Destination namespace
    pub namespace: Namespace,
    /// Documents inserted
    pub documents: u64,
    /// Secondary indexes created
    pub indexes: usize,
}

/// One namespace that failed
#[derive(Debug)]
pub struct NamespaceFailure {
    /// Destination namespace
    pub namespace: Namespace,
    /// Why
    pub error: Error,
}

/// Outcome of a restore run
#[derive(Debug, Default)]
pub struct RestoreSummary {
    /// Namespaces restored, in completion order
    pub restored: Vec<NamespaceResult>,
    /// Namespaces skipped during discovery
    pub skipped: Vec<SkippedNamespace>,
    /// Namespaces whose restore failed
    pub failures: Vec<NamespaceFailure>,
    /// Dump entries discovery could not use
    pub discovery_errors: Vec<Error>,
    /// Oplog replay, when it ran
    pub oplog: Option<ReplayStats>,
    /// Archive demultiplexing, for archive restores
    pub demux: Option<DemuxStats>,
    /// The error that aborted the restore
    pub fatal: Option<Error>,
}

impl RestoreSummary {
    /// Documents inserted across all namespaces
    pub fn documents_restored(&self) -> u64 {
        self.restored.iter().map(|r| r.documents).sum()
    }

    /// Whether nothing failed
    pub fn is_success(&self) -> bool {
        self.fatal.is_none() && self.failures.is_empty()
    }

    /// The result for `ns`, if it was restored
    pub fn restored_namespace(&self, ns: &Namespace) -> Option<&NamespaceResult> {
        self.restored.iter().find(|r| &r.namespace == ns)
    }

    /// Record an aborting error; only the first is kept
    pub fn record_fatal(&mut self, error: Error) {
        if self.fatal.is_none() {
            warn!(error = %error, "Restore aborted");
            self.fatal = Some(error);
        } else {
            warn!(error = %error, "Additional error after abort");
        }
    }

    pub(crate) fn record_failure(&mut self, namespace: Namespace, error: Error) {
        warn!(namespace = %namespace, error = %error, "Namespace restore failed");
        self.failures.push(NamespaceFailure { namespace, error });
    }

    /// Emit the summary as one structured log line
    pub fn log(&self) {
        info!(
            namespaces = self.restored.len(),
            documents = self.documents_restored(),
            skipped = self.skipped.len(),
            failures = self.failures.len(),
            discovery_errors = self.discovery_errors.len(),
            oplog_ops = self.oplog.as_ref().map_or(0, |s| s.ops_applied),
            success = self.is_success(),
            "Restore finished"
        );
    }
}

impl fmt::Display for RestoreSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} document(s) restored into {} namespace(s)",
            self.documents_restored(),
            self.restored.len()
        )?;
        for s in &self.skipped {
            writeln!(f, "  skipped {}: {}", s.namespace, s.reason)?;
        }
        for e in &self.discovery_errors {
            writeln!(f, "  discovery: {e}")?;
        }
        for failure in &self.failures {
            writeln!(f, "  failed {}: {}", failure.namespace, failure.error)?;
        }
        if let Some(oplog) = &self.oplog {
            writeln!(
                f,
                "  oplog: {} op(s) applied, {} transaction(s) committed, {} aborted, {} buffered op(s) undelivered",
                oplog.ops_applied,
                oplog.transactions_committed,
                oplog.transactions_aborted,
                oplog.buffered_ops_undelivered
            )?;
        }
        if let Some(fatal) = &self.fatal {
            writeln!(f, "  aborted: {fatal}")?;
        }
        Ok(())
    }
}
