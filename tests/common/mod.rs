//! Shared test utilities for the integration suites.
//!
//! Import via `#[path = "../common/mod.rs"] mod common;` from a suite's
//! main.rs.

#![allow(dead_code)]

use docrestore::{
    ArchiveHeader, Document, DocumentWriter, InMemoryDestination, Multiplexer, Namespace,
    NamespaceEntry, RestoreConfig, Restorer,
};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{json, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use tempfile::TempDir;

static INIT_TRACING: Once = Once::new();

/// Route library logs to the test harness output.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

/// A JSON object literal as a document
pub fn doc(v: Value) -> Document {
    match v {
        Value::Object(map) => map,
        other => panic!("not a document: {other}"),
    }
}

/// Encode documents as a document stream
pub fn frames(docs: &[Value]) -> Vec<u8> {
    let mut w = DocumentWriter::new(Vec::new());
    for d in docs {
        w.write_document(&doc(d.clone())).unwrap();
    }
    w.finish().unwrap()
}

/// Gzip `bytes`
pub fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(bytes).unwrap();
    enc.finish().unwrap()
}

/// Metadata block with the given options and secondary index names
pub fn metadata(options: Value, index_fields: &[&str]) -> Value {
    let mut indexes = vec![json!({"v": 2, "key": {"_id": 1}, "name": "_id_"})];
    for f in index_fields {
        indexes.push(json!({"v": 2, "key": {*f: 1}, "name": format!("{f}_1")}));
    }
    json!({"options": options, "indexes": indexes})
}

/// Insert oplog entry
pub fn insert_entry(t: u32, ns: &str, o: Value) -> Value {
    json!({"ts": {"t": t, "i": 0}, "op": "i", "ns": ns, "o": o})
}

/// One entry of a transaction split across several `applyOps` entries
pub fn txn_entry(t: u32, session: &str, txn: i64, ops: Vec<Value>, partial: bool) -> Value {
    let mut o = json!({"applyOps": ops});
    if partial {
        o["partialTxn"] = json!(true);
    }
    json!({
        "ts": {"t": t, "i": 0}, "op": "c", "ns": "admin.$cmd",
        "lsid": {"id": session}, "txnNumber": txn, "o": o
    })
}

/// `applyOps` sub-operation
pub fn sub_op(op: &str, ns: &str, o: Value, o2: Option<Value>) -> Value {
    let mut v = json!({"op": op, "ns": ns, "o": o});
    if let Some(o2) = o2 {
        v["o2"] = o2;
    }
    v
}

// ============================================================================
// Dump directories
// ============================================================================

/// A dump directory under construction
pub struct DumpDir {
    pub dir: TempDir,
}

impl DumpDir {
    pub fn new() -> Self {
        DumpDir {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    fn db_dir(&self, db: &str) -> PathBuf {
        let dir = self.dir.path().join(db);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Write `<db>/<coll>.bson`
    pub fn collection(&self, db: &str, coll: &str, docs: &[Value]) -> &Self {
        fs::write(self.db_dir(db).join(format!("{coll}.bson")), frames(docs)).unwrap();
        self
    }

    /// Write `<db>/<coll>.bson.gz`
    pub fn collection_gz(&self, db: &str, coll: &str, docs: &[Value]) -> &Self {
        let bytes = gzip(&frames(docs));
        fs::write(self.db_dir(db).join(format!("{coll}.bson.gz")), bytes).unwrap();
        self
    }

    /// Write `<db>/<coll>.metadata.json`
    pub fn metadata(&self, db: &str, coll: &str, meta: &Value) -> &Self {
        fs::write(
            self.db_dir(db).join(format!("{coll}.metadata.json")),
            serde_json::to_vec(meta).unwrap(),
        )
        .unwrap();
        self
    }

    /// Write `oplog.bson` at the root
    pub fn oplog(&self, entries: &[Value]) -> &Self {
        fs::write(self.dir.path().join("oplog.bson"), frames(entries)).unwrap();
        self
    }
}

// ============================================================================
// Archives
// ============================================================================

/// One namespace to put in an archive
pub struct ArchiveNs {
    pub ns: Namespace,
    pub metadata: Option<Value>,
    pub docs: Vec<Value>,
}

impl ArchiveNs {
    pub fn new(ns: &str, docs: Vec<Value>) -> Self {
        ArchiveNs {
            ns: Namespace::parse(ns),
            metadata: None,
            docs,
        }
    }

    pub fn with_metadata(mut self, meta: Value) -> Self {
        self.metadata = Some(meta);
        self
    }
}

/// Build an archive, interleaving each namespace's documents one per chunk
pub fn archive(namespaces: &[ArchiveNs], oplog: Option<&[Value]>) -> Vec<u8> {
    let encoded: Vec<Vec<Vec<u8>>> = namespaces
        .iter()
        .map(|n| n.docs.iter().map(|d| frames(std::slice::from_ref(d))).collect())
        .collect();
    let mut entries: Vec<NamespaceEntry> = namespaces
        .iter()
        .zip(&encoded)
        .map(|(n, docs)| {
            let size = docs.iter().map(|d| d.len() as u64).sum();
            NamespaceEntry::collection(&n.ns, size, n.metadata.is_some())
        })
        .collect();
    let oplog_bytes = oplog.map(frames);
    if let Some(bytes) = &oplog_bytes {
        entries.push(NamespaceEntry::oplog(bytes.len() as u64));
    }
    let header = ArchiveHeader::new("7.0.0", entries);
    let mut mux = Multiplexer::new(Vec::new(), &header).unwrap();

    for n in namespaces {
        if let Some(meta) = &n.metadata {
            mux.write_metadata(&n.ns.to_string(), &serde_json::to_vec(meta).unwrap())
                .unwrap();
        }
    }
    let longest = encoded.iter().map(Vec::len).max().unwrap_or(0);
    for i in 0..longest {
        for (n, docs) in namespaces.iter().zip(&encoded) {
            if let Some(bytes) = docs.get(i) {
                mux.write(&n.ns.to_string(), bytes).unwrap();
            }
        }
    }
    if let Some(bytes) = &oplog_bytes {
        mux.write(&Namespace::oplog().to_string(), bytes).unwrap();
    }
    mux.finish().unwrap()
}

// ============================================================================
// Restore helpers
// ============================================================================

/// A restorer over a fresh in-memory destination
pub fn memory_restorer(
    config: RestoreConfig,
) -> (Restorer<InMemoryDestination>, Arc<InMemoryDestination>) {
    init_tracing();
    let dest = Arc::new(InMemoryDestination::new());
    let restorer = Restorer::new(config, dest.clone()).unwrap();
    (restorer, dest)
}

/// Documents in `ns` as JSON values, ordered by `_id`
pub fn contents(dest: &InMemoryDestination, ns: &str) -> Vec<Value> {
    dest.documents(&Namespace::parse(ns))
        .into_iter()
        .map(Value::Object)
        .collect()
}
