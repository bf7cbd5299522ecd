//! Dump directory restores

use crate::common::*;
use docrestore::{IntentFile, Namespace, RestoreConfig, SkipReason, CONFIG_FILE_NAME};
use serde_json::json;
use std::fs;

#[test]
fn orders_with_metadata_and_transaction_restore_exact_post_image() {
    let dump = DumpDir::new();
    dump.collection(
        "mydb",
        "orders",
        &[
            json!({"_id": 1, "status": "new", "qty": 1}),
            json!({"_id": 2, "status": "new", "qty": 2}),
        ],
    )
    .metadata("mydb", "orders", &metadata(json!({}), &["status"]))
    .oplog(&[
        txn_entry(
            10,
            "s1",
            1,
            vec![sub_op(
                "u",
                "mydb.orders",
                json!({"$set": {"status": "paid"}}),
                Some(json!({"_id": 1})),
            )],
            true,
        ),
        txn_entry(
            11,
            "s1",
            1,
            vec![sub_op(
                "i",
                "mydb.orders",
                json!({"_id": 3, "status": "new", "qty": 5}),
                None,
            )],
            false,
        ),
    ]);

    let (restorer, dest) = memory_restorer(RestoreConfig::default().with_oplog_replay(true));
    let summary = restorer.restore_directory(dump.path());
    assert!(summary.is_success(), "{summary}");

    assert_eq!(
        contents(&dest, "mydb.orders"),
        vec![
            json!({"_id": 1, "status": "paid", "qty": 1}),
            json!({"_id": 2, "status": "new", "qty": 2}),
            json!({"_id": 3, "status": "new", "qty": 5}),
        ]
    );
    let orders = Namespace::new("mydb", "orders");
    assert_eq!(dest.indexes(&orders).len(), 1);
    assert_eq!(summary.documents_restored(), 2);

    let oplog = summary.oplog.as_ref().unwrap();
    assert_eq!(oplog.transactions_committed, 1);
    assert_eq!(oplog.ops_applied, 2);
    assert!(oplog.is_clean());
}

#[test]
fn system_collections_and_filters_are_skipped() {
    let dump = DumpDir::new();
    dump.collection("shop", "orders", &[json!({"_id": 1})])
        .metadata("shop", "orders", &metadata(json!({}), &[]))
        .collection("shop", "system.profile", &[json!({"_id": 1})])
        .collection("shop", "tmp_scratch", &[json!({"_id": 1})])
        .collection("other", "things", &[json!({"_id": 1})]);

    let config = RestoreConfig::default()
        .with_include("shop.*")
        .with_exclude("shop.tmp_*");
    let (restorer, dest) = memory_restorer(config);
    let summary = restorer.restore_directory(dump.path());
    assert!(summary.is_success(), "{summary}");

    assert_eq!(dest.collection_names(), vec![Namespace::new("shop", "orders")]);
    let reasons: Vec<_> = summary.skipped.iter().map(|s| s.reason).collect();
    assert!(reasons.contains(&SkipReason::Profile));
    assert!(reasons.contains(&SkipReason::Excluded));
    assert!(reasons.contains(&SkipReason::NotIncluded));
}

#[test]
fn rename_moves_data_and_indexes() {
    let dump = DumpDir::new();
    dump.collection("shop", "orders", &[json!({"_id": 1})])
        .metadata("shop", "orders", &metadata(json!({}), &["sku"]));

    let config = RestoreConfig::default().with_rename("shop.*", "archive.*");
    let (restorer, dest) = memory_restorer(config);
    let summary = restorer.restore_directory(dump.path());
    assert!(summary.is_success(), "{summary}");

    let renamed = Namespace::new("archive", "orders");
    assert_eq!(dest.count(&renamed), 1);
    assert_eq!(dest.indexes(&renamed).len(), 1);
    assert_eq!(dest.count(&Namespace::new("shop", "orders")), 0);
}

#[test]
fn gzip_files_restore_like_plain_ones() {
    let dump = DumpDir::new();
    let docs: Vec<_> = (0..5).map(|i| json!({"_id": i, "v": i * 10})).collect();
    dump.collection_gz("shop", "orders", &docs);

    let (restorer, dest) = memory_restorer(RestoreConfig::default().with_batch_size(2));
    let summary = restorer.restore_directory(dump.path());
    assert!(summary.is_success(), "{summary}");
    assert_eq!(dest.count(&Namespace::new("shop", "orders")), 5);
}

#[test]
fn many_collections_with_few_workers() {
    let dump = DumpDir::new();
    for c in 0..9 {
        let docs: Vec<_> = (0..c + 1).map(|i| json!({"_id": i})).collect();
        dump.collection("bulk", &format!("c{c}"), &docs);
    }

    let (restorer, dest) = memory_restorer(RestoreConfig::default().with_parallel_collections(2));
    let summary = restorer.restore_directory(dump.path());
    assert!(summary.is_success(), "{summary}");
    assert_eq!(summary.restored.len(), 9);
    assert_eq!(summary.documents_restored(), 45);
    assert_eq!(dest.count(&Namespace::new("bulk", "c8")), 9);
}

#[test]
fn corrupt_collection_does_not_stop_siblings() {
    let dump = DumpDir::new();
    dump.collection("shop", "good", &[json!({"_id": 1})]);
    let mut broken = frames(&[json!({"_id": 1}), json!({"_id": 2})]);
    broken.truncate(broken.len() - 3);
    fs::write(dump.path().join("shop").join("broken.bson"), broken).unwrap();

    let (restorer, dest) = memory_restorer(RestoreConfig::default());
    let summary = restorer.restore_directory(dump.path());
    assert!(summary.fatal.is_none());
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].namespace, Namespace::new("shop", "broken"));
    assert_eq!(dest.count(&Namespace::new("shop", "good")), 1);
}

#[test]
fn single_collection_file_via_custom_discovery() {
    let dump = DumpDir::new();
    dump.collection("src", "people", &[json!({"_id": "a"}), json!({"_id": "b"})]);
    let file = dump.path().join("src").join("people.bson");
    let target = Namespace::new("crm", "contacts");

    let (restorer, dest) = memory_restorer(RestoreConfig::default());
    let summary = restorer.restore_with(|d| d.collection_file(&file, &target));
    assert!(summary.is_success(), "{summary}");
    assert_eq!(dest.count(&target), 2);

    // The path is reported as the source location.
    let source = IntentFile::from_path(&file);
    assert!(source.location().contains("people.bson"));
}

#[test]
fn config_file_drives_the_restore() {
    let dump = DumpDir::new();
    dump.collection("shop", "orders", &[json!({"_id": 1})])
        .collection("shop", "carts", &[json!({"_id": 1})]);
    let config_path = dump.path().join(CONFIG_FILE_NAME);
    fs::write(&config_path, "exclude = [\"shop.carts\"]\nbatch_size = 1\n").unwrap();

    let config = RestoreConfig::from_file(&config_path).unwrap();
    let (restorer, dest) = memory_restorer(config);
    let summary = restorer.restore_directory(dump.path());
    assert!(summary.is_success(), "{summary}");
    assert_eq!(dest.collection_names(), vec![Namespace::new("shop", "orders")]);
}

#[test]
fn single_database_restores_under_a_new_name() {
    let dump = DumpDir::new();
    dump.collection("shop", "orders", &[json!({"_id": 1}), json!({"_id": 2})])
        .collection("shop", "$audit", &[json!({"_id": 1})]);

    let (restorer, dest) = memory_restorer(RestoreConfig::default());
    let summary = restorer.restore_database(&dump.path().join("shop"), "shop_copy");
    assert!(summary.is_success(), "{summary}");
    assert_eq!(dest.count(&Namespace::new("shop_copy", "orders")), 2);
    // `$` collections are only skipped when several databases are restored.
    assert_eq!(dest.count(&Namespace::new("shop_copy", "$audit")), 1);
}
