//! Oplog entry model and classification

use docrestore_core::{Document, Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Oplog timestamp: seconds plus an ordinal within the second
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp {
    /// Seconds since the epoch
    pub t: u32,
    /// Increment within the second
    pub i: u32,
}

impl Timestamp {
    /// Create a timestamp
    pub fn new(t: u32, i: u32) -> Self {
        Self { t, i }
    }

    /// Parse `t` or `t:i`
    pub fn parse(s: &str) -> Result<Self> {
        let (t, i) = s.split_once(':').unwrap_or((s, "0"));
        let parse = |v: &str| {
            v.trim()
                .parse::<u32>()
                .map_err(|_| Error::Config(format!("invalid timestamp {s:?}")))
        };
        Ok(Self::new(parse(t)?, parse(i)?))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.t, self.i)
    }
}

/// Operation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    /// Insert
    #[serde(rename = "i")]
    Insert,
    /// Update
    #[serde(rename = "u")]
    Update,
    /// Delete
    #[serde(rename = "d")]
    Delete,
    /// Command, including `applyOps` and transaction markers
    #[serde(rename = "c")]
    Command,
    /// No-op
    #[serde(rename = "n")]
    Noop,
}

/// Transaction identity: logical session plus transaction number
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxnId {
    /// Canonical JSON of the session id
    pub lsid: String,
    /// Transaction number within the session
    pub txn_number: i64,
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.lsid, self.txn_number)
    }
}

/// One oplog entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OplogEntry {
    /// Position in the log
    pub ts: Timestamp,
    /// Operation type
    pub op: OpKind,
    /// Target namespace
    #[serde(default)]
    pub ns: String,
    /// Operation body
    #[serde(default)]
    pub o: Document,
    /// Update query
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub o2: Option<Document>,
    /// Logical session id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lsid: Option<Value>,
    /// Transaction number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txn_number: Option<i64>,
    /// Previous entry of the same transaction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_op_time: Option<Value>,
}

/// How the reassembler treats an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryClass {
    /// Applied immediately on its own
    Plain,
    /// Part of an unfinished transaction; buffered
    Buffer,
    /// Ends a transaction; buffered ops plus its own are applied
    Commit,
    /// Ends a transaction; buffered ops are discarded
    Abort,
    /// `applyOps` outside a transaction; applied immediately as one unit
    Unit,
    /// Skipped
    Noop,
}

impl OplogEntry {
    /// Decode from a document
    pub fn from_document(doc: Document) -> Result<Self> {
        serde_json::from_value(Value::Object(doc))
            .map_err(|e| Error::serialization(format!("invalid oplog entry: {e}")))
    }

    /// Encode as a document
    pub fn to_document(&self) -> Result<Document> {
        match serde_json::to_value(self)? {
            Value::Object(doc) => Ok(doc),
            _ => Err(Error::serialization("oplog entry did not encode as a document")),
        }
    }

    /// Transaction id, when the entry carries both session and number
    pub fn txn_id(&self) -> Option<TxnId> {
        let lsid = self.lsid.as_ref()?;
        let txn_number = self.txn_number?;
        Some(TxnId {
            lsid: sorted_keys(lsid).to_string(),
            txn_number,
        })
    }

    /// Name of the command, the first key of `o`
    pub fn command_name(&self) -> Option<&str> {
        if self.op != OpKind::Command {
            return None;
        }
        self.o.keys().next().map(String::as_str)
    }

    /// Embedded sub-operations of an `applyOps` entry
    pub fn apply_ops(&self) -> Option<&Vec<Value>> {
        if self.command_name() != Some("applyOps") {
            return None;
        }
        self.o.get("applyOps").and_then(Value::as_array)
    }

    fn flag(&self, name: &str) -> bool {
        self.o.get(name).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Classify for transaction reassembly
    pub fn classify(&self) -> EntryClass {
        if self.op == OpKind::Noop {
            return EntryClass::Noop;
        }
        let txn = self.txn_id().is_some();
        match self.command_name() {
            Some("applyOps") if !txn => EntryClass::Unit,
            Some("applyOps") if self.flag("partialTxn") || self.flag("prepare") => {
                EntryClass::Buffer
            }
            Some("applyOps") => EntryClass::Commit,
            Some("commitTransaction") if txn => EntryClass::Commit,
            Some("abortTransaction") if txn => EntryClass::Abort,
            // A marker with no transaction to end has nothing to apply.
            Some("commitTransaction") | Some("abortTransaction") => EntryClass::Noop,
            _ => EntryClass::Plain,
        }
    }

    /// The entry as a single operation for an `applyOps` batch
    pub fn to_operation(&self) -> Result<Document> {
        let mut op = Document::new();
        op.insert("op".into(), serde_json::to_value(self.op)?);
        op.insert("ns".into(), Value::String(self.ns.clone()));
        op.insert("o".into(), Value::Object(self.o.clone()));
        if let Some(o2) = &self.o2 {
            op.insert("o2".into(), Value::Object(o2.clone()));
        }
        Ok(op)
    }

    /// Embedded sub-operations as documents; non-document items are an error
    pub fn sub_operations(&self) -> Result<Vec<Document>> {
        let Some(ops) = self.apply_ops() else {
            return Ok(Vec::new());
        };
        ops.iter()
            .map(|v| match v {
                Value::Object(doc) => Ok(doc.clone()),
                other => Err(Error::serialization(format!(
                    "applyOps item at {} is not a document: {other}",
                    self.ts
                ))),
            })
            .collect()
    }
}

/// `value` with object keys in lexical order at every depth
fn sorted_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut fields: Vec<_> = map.iter().collect();
            fields.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                fields
                    .into_iter()
                    .map(|(k, v)| (k.clone(), sorted_keys(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted_keys).collect()),
        other => other.clone(),
    }
}
