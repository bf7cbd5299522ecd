//! Archive stream restores

use crate::common::*;
use docrestore::{
    ArchiveHeader, Error, Multiplexer, Namespace, NamespaceEntry, RestoreConfig, SkipReason,
};
use serde_json::json;
use std::io::Cursor;

fn shop_archive() -> Vec<u8> {
    let orders = ArchiveNs::new(
        "shop.orders",
        (1..=4).map(|i| json!({"_id": i, "qty": i})).collect(),
    )
    .with_metadata(metadata(json!({}), &["qty"]));
    let carts = ArchiveNs::new("shop.carts", vec![json!({"_id": 1}), json!({"_id": 2})])
        .with_metadata(metadata(json!({"capped": false}), &[]));
    let users = ArchiveNs::new(
        "admin.system.users",
        vec![json!({"_id": "shop.alice", "user": "alice", "db": "shop"})],
    );
    let oplog = [
        txn_entry(
            100,
            "s1",
            1,
            vec![sub_op(
                "u",
                "shop.orders",
                json!({"$set": {"qty": 40}}),
                Some(json!({"_id": 4})),
            )],
            true,
        ),
        txn_entry(
            101,
            "s1",
            1,
            vec![sub_op("d", "shop.carts", json!({"_id": 2}), None)],
            false,
        ),
    ];
    archive(&[orders, carts, users], Some(&oplog[..]))
}

#[test]
fn interleaved_archive_restores_every_namespace() {
    let (restorer, dest) = memory_restorer(RestoreConfig::default().with_oplog_replay(true));
    let summary = restorer.restore_archive(Cursor::new(shop_archive()));
    assert!(summary.is_success(), "{summary}");

    assert_eq!(
        contents(&dest, "shop.orders"),
        vec![
            json!({"_id": 1, "qty": 1}),
            json!({"_id": 2, "qty": 2}),
            json!({"_id": 3, "qty": 3}),
            json!({"_id": 4, "qty": 40}),
        ]
    );
    assert_eq!(contents(&dest, "shop.carts"), vec![json!({"_id": 1})]);
    assert_eq!(dest.count(&Namespace::new("admin", "system.users")), 1);
    assert_eq!(dest.indexes(&Namespace::new("shop", "orders")).len(), 1);
    assert_eq!(
        dest.options(&Namespace::new("shop", "carts")).unwrap()["capped"],
        false
    );

    let demux = summary.demux.as_ref().unwrap();
    assert_eq!(demux.namespaces_completed, 4);
    assert_eq!(demux.metadata_blocks, 2);
    assert_eq!(summary.oplog.as_ref().unwrap().transactions_committed, 1);
    assert_eq!(summary.documents_restored(), 7);
}

#[test]
fn excluded_archive_namespace_is_drained_not_restored() {
    let config = RestoreConfig::default()
        .with_oplog_replay(true)
        .with_exclude("shop.carts");
    let (restorer, dest) = memory_restorer(config);
    let summary = restorer.restore_archive(Cursor::new(shop_archive()));

    // The oplog still deletes from the excluded collection, which does not exist.
    assert!(summary.fatal.is_none(), "{summary}");
    assert_eq!(dest.count(&Namespace::new("shop", "orders")), 4);
    let carts = Namespace::new("shop", "carts");
    assert!(summary
        .skipped
        .iter()
        .any(|s| s.reason == SkipReason::Excluded && s.namespace == carts));
    assert!(dest.options(&carts).is_none());
    assert!(summary.demux.as_ref().unwrap().muted_bytes > 0);
}

#[test]
fn archive_without_replay_skips_the_oplog() {
    let (restorer, dest) = memory_restorer(RestoreConfig::default());
    let summary = restorer.restore_archive(Cursor::new(shop_archive()));
    assert!(summary.is_success(), "{summary}");
    assert!(summary.oplog.is_none());
    assert!(summary
        .skipped
        .iter()
        .any(|s| s.reason == SkipReason::OplogNotReplayed));
    assert_eq!(contents(&dest, "shop.orders")[3], json!({"_id": 4, "qty": 4}));
}

#[test]
fn truncated_archive_aborts_before_the_oplog() {
    let mut bytes = shop_archive();
    bytes.truncate(bytes.len() - 3);

    let (restorer, dest) = memory_restorer(RestoreConfig::default().with_oplog_replay(true));
    let summary = restorer.restore_archive(Cursor::new(bytes));
    assert!(matches!(summary.fatal, Some(Error::CorruptArchive(_))));
    assert!(summary.oplog.is_none());

    // shop.orders never saw its end marker; shop.carts did.
    let orders = Namespace::new("shop", "orders");
    assert!(summary.failures.iter().any(|f| f.namespace == orders));
    assert_eq!(dest.count(&orders), 0);
    assert_eq!(dest.count(&Namespace::new("shop", "carts")), 2);
}

#[test]
fn bad_magic_is_fatal_at_discovery() {
    let (restorer, dest) = memory_restorer(RestoreConfig::default());
    let summary = restorer.restore_archive(Cursor::new(b"not an archive".to_vec()));
    assert!(matches!(summary.fatal, Some(Error::CorruptArchive(_))));
    assert!(dest.collection_names().is_empty());
}

#[test]
fn data_before_metadata_aborts_instead_of_stalling() {
    let ns = Namespace::new("shop", "orders");
    let header = ArchiveHeader::new("7.0.0", vec![NamespaceEntry::collection(&ns, 0, true)]);
    let mut mux = Multiplexer::new(Vec::new(), &header).unwrap();
    // More chunks than the worker's channel holds, and no metadata block.
    for i in 0..20 {
        mux.write("shop.orders", &frames(&[json!({"_id": i})])).unwrap();
    }
    let bytes = mux.finish().unwrap();

    let config = RestoreConfig {
        archive_channel_capacity: 2,
        ..RestoreConfig::default()
    };
    let (restorer, dest) = memory_restorer(config);
    let summary = restorer.restore_archive(Cursor::new(bytes));
    assert!(matches!(summary.fatal, Some(Error::CorruptArchive(_))), "{summary}");
    assert_eq!(dest.count(&ns), 0);
}

#[test]
fn timeseries_view_and_buckets_restore_together() {
    let view = NamespaceEntry {
        kind: "timeseries".into(),
        ..NamespaceEntry::collection(&Namespace::new("metrics", "cpu"), 0, true)
    };
    let bucket_docs = [json!({"_id": 1, "control": {"version": 1}}), json!({"_id": 2})];
    let bucket_bytes = frames(&bucket_docs);
    let buckets = NamespaceEntry::collection(
        &Namespace::new("metrics", "system.buckets.cpu"),
        bucket_bytes.len() as u64,
        false,
    );
    let header = ArchiveHeader::new("7.0.0", vec![view, buckets]);
    let mut mux = Multiplexer::new(Vec::new(), &header).unwrap();
    let meta = json!({
        "options": {"timeseries": {"timeField": "t"}},
        "indexes": [],
        "type": "timeseries"
    });
    mux.write_metadata("metrics.cpu", &serde_json::to_vec(&meta).unwrap())
        .unwrap();
    mux.write("metrics.system.buckets.cpu", &bucket_bytes).unwrap();
    let bytes = mux.finish().unwrap();

    let (restorer, dest) = memory_restorer(RestoreConfig::default());
    let summary = restorer.restore_archive(Cursor::new(bytes));
    assert!(summary.is_success(), "{summary}");
    assert_eq!(dest.count(&Namespace::new("metrics", "system.buckets.cpu")), 2);
    assert!(dest
        .options(&Namespace::new("metrics", "cpu"))
        .unwrap()
        .contains_key("timeseries"));
    assert_eq!(summary.documents_restored(), 2);
}
