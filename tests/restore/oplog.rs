//! Oplog replay through the restore driver

use crate::common::*;
use docrestore::{
    Destination, DestinationError, Document, Error, InMemoryDestination, Namespace, RestoreConfig,
    Restorer,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;

/// Records every `applyOps` batch before forwarding it
#[derive(Default)]
struct RecordingDestination {
    inner: InMemoryDestination,
    batches: Mutex<Vec<Vec<Value>>>,
}

impl Destination for RecordingDestination {
    fn create_collection(&self, ns: &Namespace, options: &Document) -> Result<(), DestinationError> {
        self.inner.create_collection(ns, options)
    }

    fn insert_batch(&self, ns: &Namespace, docs: Vec<Document>) -> Result<u64, DestinationError> {
        self.inner.insert_batch(ns, docs)
    }

    fn run_command(&self, db: &str, command: &Document) -> Result<Document, DestinationError> {
        if let Some(Value::Array(ops)) = command.get("applyOps") {
            self.batches.lock().push(ops.clone());
        }
        self.inner.run_command(db, command)
    }
}

fn marker(t: u32, session: &str, txn: i64, name: &str) -> Value {
    json!({
        "ts": {"t": t, "i": 0}, "op": "c", "ns": "admin.$cmd",
        "lsid": {"id": session}, "txnNumber": txn, "o": {name: 1}
    })
}

fn insert_op(id: i64) -> Value {
    sub_op("i", "shop.orders", json!({"_id": id}), None)
}

#[test]
fn interleaved_transactions_apply_as_units_at_commit() {
    let dump = DumpDir::new();
    dump.collection("shop", "orders", &[]).oplog(&[
        txn_entry(1, "s1", 1, vec![insert_op(1)], true),
        txn_entry(2, "s2", 1, vec![insert_op(3)], true),
        txn_entry(3, "s1", 1, vec![insert_op(2)], true),
        txn_entry(4, "s2", 1, vec![insert_op(4)], true),
        marker(5, "s1", 1, "commitTransaction"),
        marker(6, "s2", 1, "commitTransaction"),
    ]);

    init_tracing();
    let dest = Arc::new(RecordingDestination::default());
    let config = RestoreConfig::default().with_oplog_replay(true);
    let restorer = Restorer::new(config, dest.clone()).unwrap();
    let summary = restorer.restore_directory(dump.path());
    assert!(summary.is_success(), "{summary}");

    let batches = dest.batches.lock().clone();
    let ids: Vec<Vec<i64>> = batches
        .iter()
        .map(|ops| ops.iter().map(|op| op["o"]["_id"].as_i64().unwrap()).collect())
        .collect();
    assert_eq!(ids, vec![vec![1, 2], vec![3, 4]]);
    assert_eq!(summary.oplog.unwrap().transactions_committed, 2);
}

#[test]
fn aborted_transaction_leaves_no_trace() {
    let dump = DumpDir::new();
    dump.collection("shop", "orders", &[json!({"_id": 1})]).oplog(&[
        txn_entry(1, "s1", 7, vec![insert_op(2)], true),
        insert_entry(2, "shop.orders", json!({"_id": 3})),
        marker(3, "s1", 7, "abortTransaction"),
    ]);

    let (restorer, dest) = memory_restorer(RestoreConfig::default().with_oplog_replay(true));
    let summary = restorer.restore_directory(dump.path());
    assert!(summary.is_success(), "{summary}");
    assert_eq!(contents(&dest, "shop.orders"), vec![json!({"_id": 1}), json!({"_id": 3})]);

    let stats = summary.oplog.unwrap();
    assert_eq!(stats.transactions_aborted, 1);
    assert_eq!(stats.buffered_ops_undelivered, 1);
}

#[test]
fn replaying_the_same_dump_twice_is_idempotent() {
    let dump = DumpDir::new();
    dump.collection("shop", "orders", &[json!({"_id": 1, "n": 0})]).oplog(&[
        txn_entry(
            1,
            "s1",
            1,
            vec![
                sub_op("u", "shop.orders", json!({"$set": {"n": 1}}), Some(json!({"_id": 1}))),
                insert_op(2),
            ],
            false,
        ),
    ]);
    let expected = vec![json!({"_id": 1, "n": 1}), json!({"_id": 2})];

    for _ in 0..2 {
        let (restorer, dest) = memory_restorer(RestoreConfig::default().with_oplog_replay(true));
        let summary = restorer.restore_directory(dump.path());
        assert!(summary.is_success(), "{summary}");
        assert_eq!(contents(&dest, "shop.orders"), expected);
    }

    let dest = Arc::new(InMemoryDestination::new());
    let config = RestoreConfig::default().with_oplog_replay(true).with_drop(true);
    let restorer = Restorer::new(config, dest.clone()).unwrap();
    for _ in 0..2 {
        let summary = restorer.restore_directory(dump.path());
        assert!(summary.is_success(), "{summary}");
        assert_eq!(contents(&dest, "shop.orders"), expected);
    }
}

#[test]
fn limit_and_internal_namespaces_are_honored() {
    let dump = DumpDir::new();
    dump.collection("shop", "orders", &[]).oplog(&[
        insert_entry(1, "shop.orders", json!({"_id": 1})),
        insert_entry(2, "config.transactions", json!({"_id": "x"})),
        insert_entry(3, "shop.orders", json!({"_id": 2})),
        insert_entry(4, "shop.orders", json!({"_id": 3})),
    ]);

    let config = RestoreConfig::default()
        .with_oplog_replay(true)
        .with_oplog_limit("4");
    let (restorer, dest) = memory_restorer(config);
    let summary = restorer.restore_directory(dump.path());
    assert!(summary.is_success(), "{summary}");
    assert_eq!(contents(&dest, "shop.orders"), vec![json!({"_id": 1}), json!({"_id": 2})]);
    assert!(dest.documents(&Namespace::new("config", "transactions")).is_empty());

    let stats = summary.oplog.unwrap();
    assert!(stats.stopped_at_limit);
    assert_eq!(stats.entries_filtered, 1);
}

#[test]
fn unterminated_transaction_warns_or_fails_in_strict_mode() {
    let dump = DumpDir::new();
    dump.collection("shop", "orders", &[]).oplog(&[
        insert_entry(1, "shop.orders", json!({"_id": 1})),
        txn_entry(2, "s1", 1, vec![insert_op(2)], true),
    ]);

    let (restorer, dest) = memory_restorer(RestoreConfig::default().with_oplog_replay(true));
    let summary = restorer.restore_directory(dump.path());
    assert!(summary.is_success(), "{summary}");
    assert_eq!(summary.oplog.as_ref().unwrap().transactions_incomplete, 1);
    assert_eq!(contents(&dest, "shop.orders"), vec![json!({"_id": 1})]);

    let config = RestoreConfig::default()
        .with_oplog_replay(true)
        .with_strict_transactions(true);
    let (restorer, _) = memory_restorer(config);
    let summary = restorer.restore_directory(dump.path());
    assert!(matches!(summary.fatal, Some(Error::TransactionIncomplete { .. })));
}

#[test]
fn oplog_is_ignored_without_replay() {
    let dump = DumpDir::new();
    dump.collection("shop", "orders", &[json!({"_id": 1})])
        .oplog(&[insert_entry(1, "shop.orders", json!({"_id": 2}))]);

    let (restorer, dest) = memory_restorer(RestoreConfig::default());
    let summary = restorer.restore_directory(dump.path());
    assert!(summary.is_success(), "{summary}");
    assert!(summary.oplog.is_none());
    assert_eq!(dest.count(&Namespace::new("shop", "orders")), 1);
}
