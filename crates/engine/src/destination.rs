//! Destination server abstraction
//!
//! The restore driver only needs three operations from the server it
//! writes to. Everything else (index builds, drops, oplog application) goes
//! through `run_command`.

use docrestore_core::{Document, Error, Namespace, Result};
use docrestore_oplog::OplogApplier;
use serde_json::{json, Value};
use thiserror::Error;

/// Errors reported by a destination
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DestinationError {
    /// `create` on a namespace that already exists
    #[error("Namespace already exists: {0}")]
    NamespaceExists(String),

    /// Command against a namespace that does not exist
    #[error("Namespace not found: {0}")]
    NamespaceNotFound(String),

    /// Insert of an `_id` already present
    #[error("Duplicate key in {namespace}: {key}")]
    DuplicateKey {
        /// Target namespace
        namespace: String,
        /// Offending `_id`, as JSON
        key: String,
    },

    /// Command the destination does not implement
    #[error("Unsupported command: {0}")]
    UnsupportedCommand(String),

    /// Malformed request
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl DestinationError {
    /// Wrap as a per-namespace apply failure
    pub fn into_apply(self, ns: &Namespace) -> Error {
        Error::apply(ns.to_string(), self.to_string())
    }
}

/// The server a restore writes into
pub trait Destination: Send + Sync {
    /// Create a collection with the given options
    fn create_collection(
        &self,
        ns: &Namespace,
        options: &Document,
    ) -> std::result::Result<(), DestinationError>;

    /// Insert documents; returns how many were inserted
    fn insert_batch(
        &self,
        ns: &Namespace,
        docs: Vec<Document>,
    ) -> std::result::Result<u64, DestinationError>;

    /// Run a database command
    fn run_command(
        &self,
        db: &str,
        command: &Document,
    ) -> std::result::Result<Document, DestinationError>;
}

fn command(value: Value) -> Document {
    match value {
        Value::Object(doc) => doc,
        _ => Document::new(),
    }
}

/// `{drop: <collection>}`
pub fn drop_command(ns: &Namespace) -> Document {
    command(json!({ "drop": ns.collection }))
}

/// `{createIndexes: <collection>, indexes: [...]}`
pub fn create_indexes_command(ns: &Namespace, indexes: &[Document]) -> Document {
    command(json!({ "createIndexes": ns.collection, "indexes": indexes }))
}

/// `{applyOps: [...]}`
pub fn apply_ops_command(ops: &[Document]) -> Document {
    command(json!({ "applyOps": ops }))
}

/// Applies reassembled oplog units through `applyOps` on the admin database
pub struct DestinationApplier<'a, D: Destination + ?Sized> {
    destination: &'a D,
    units: u64,
}

impl<'a, D: Destination + ?Sized> DestinationApplier<'a, D> {
    /// Apply into `destination`
    pub fn new(destination: &'a D) -> Self {
        Self {
            destination,
            units: 0,
        }
    }

    /// `applyOps` commands sent so far
    pub fn units(&self) -> u64 {
        self.units
    }
}

impl<D: Destination + ?Sized> OplogApplier for DestinationApplier<'_, D> {
    fn apply(&mut self, ops: &[Document]) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        self.destination
            .run_command("admin", &apply_ops_command(ops))
            .map_err(|e| {
                let ns = ops
                    .first()
                    .and_then(|op| op.get("ns"))
                    .and_then(Value::as_str)
                    .unwrap_or("admin.$cmd");
                Error::apply(ns, e.to_string())
            })?;
        self.units += 1;
        Ok(())
    }
}
