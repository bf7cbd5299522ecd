//! Restore driver
//!
//! A restore runs in three phases:
//!
//! 1. Discovery registers Intents into a fresh catalog, which is then
//!    ordered: regular data, special collections, the oplog.
//! 2. Regular data is restored concurrently. Directory restores use a fixed
//!    pool pulling from a shared queue; archive restores run one worker per
//!    namespace next to the demultiplexer thread, since every namespace's
//!    chunks can appear anywhere in the stream.
//! 3. Special collections are restored one at a time, then the oplog is
//!    replayed through `applyOps`.
//!
//! Failures confined to one namespace are recorded and the rest of the
//! restore continues, unless `stop_on_error` is set. Anything else aborts
//! the run and lands in [`RestoreSummary::fatal`].

use crate::config::RestoreConfig;
use crate::destination::{
    create_indexes_command, drop_command, Destination, DestinationApplier, DestinationError,
};
use crate::summary::{NamespaceResult, RestoreSummary};
use docrestore_archive::Demultiplexer;
use docrestore_core::{CancellationToken, Document, DocumentReader, Error, Namespace, Result};
use docrestore_intents::{
    Discoverer, DiscoveryOptions, Intent, IntentCatalog, IntentType, RestoreOrder,
};
use docrestore_oplog::{OplogReplayer, ReplayStats};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

/// Restores dumps into a destination
pub struct Restorer<D: Destination + ?Sized> {
    config: RestoreConfig,
    destination: Arc<D>,
    cancel: CancellationToken,
}

impl<D: Destination + ?Sized> Restorer<D> {
    /// Create a restorer; the config is validated here
    pub fn new(config: RestoreConfig, destination: Arc<D>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            destination,
            cancel: CancellationToken::new(),
        })
    }

    /// Share an external cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// The token that aborts this restore
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// The active configuration
    pub fn config(&self) -> &RestoreConfig {
        &self.config
    }

    /// Restore a full dump directory
    pub fn restore_directory(&self, dir: &Path) -> RestoreSummary {
        info!(path = %dir.display(), "Restoring dump directory");
        self.restore_with(|d| d.directory(dir))
    }

    /// Restore one database directory as database `db`
    pub fn restore_database(&self, dir: &Path, db: &str) -> RestoreSummary {
        info!(path = %dir.display(), db, "Restoring database directory");
        self.restore_with(|d| d.database(dir, db))
    }

    /// Restore from files or stdin registered by `discover`.
    ///
    /// Data Intents are restored by a pool of `num_parallel_collections`
    /// workers.
    pub fn restore_with<F>(&self, discover: F) -> RestoreSummary
    where
        F: FnOnce(&mut Discoverer<'_>) -> Result<()>,
    {
        let mut summary = RestoreSummary::default();
        let order = match self.discover(&mut summary, discover) {
            Ok(order) => order,
            Err(e) => {
                summary.record_fatal(e);
                return summary;
            }
        };
        let RestoreOrder {
            data,
            special,
            oplog,
        } = order;

        let results = self.run_pool(data);
        for (ns, result) in results {
            self.record(&mut summary, ns, result);
        }
        self.finish(&mut summary, special, oplog);
        summary
    }

    /// Restore an archive stream.
    ///
    /// The stream is read exactly once, on its own thread, while one worker
    /// per namespace consumes what the demultiplexer routes to it.
    pub fn restore_archive<R: Read + Send>(&self, reader: R) -> RestoreSummary {
        info!("Restoring archive");
        let mut summary = RestoreSummary::default();
        let mut demux = Demultiplexer::new(reader).with_cancellation(self.cancel.clone());
        let order = match self.discover(&mut summary, |d| d.archive(&mut demux)) {
            Ok(order) => order,
            Err(e) => {
                summary.record_fatal(e);
                return summary;
            }
        };
        if let Some(header) = demux.header() {
            info!(
                server_version = %header.server_version,
                namespaces = header.namespaces.len(),
                "Archive header read"
            );
        }
        let RestoreOrder {
            data,
            special,
            oplog,
        } = order;

        thread::scope(|s| {
            let demux_thread = s.spawn(move || demux.run());
            let workers: Vec<_> = data
                .into_iter()
                .map(|intent| {
                    let ns = intent.destination.clone();
                    let handle = s.spawn(move || {
                        let result = self.restore_intent(intent);
                        self.on_worker_result(&result);
                        result
                    });
                    (ns, handle)
                })
                .collect();

            for (ns, handle) in workers {
                let result = handle
                    .join()
                    .unwrap_or_else(|_| Err(Error::invalid_operation("restore worker panicked")));
                self.record(&mut summary, ns, result);
            }
            match demux_thread.join() {
                Ok(Ok(stats)) => summary.demux = Some(stats),
                Ok(Err(e)) => summary.record_fatal(e),
                Err(_) => summary.record_fatal(Error::invalid_operation("demultiplexer panicked")),
            }
        });

        self.finish(&mut summary, special, oplog);
        summary
    }

    fn discover<F>(&self, summary: &mut RestoreSummary, discover: F) -> Result<RestoreOrder>
    where
        F: FnOnce(&mut Discoverer<'_>) -> Result<()>,
    {
        let mut catalog = IntentCatalog::with_filter(self.config.namespace_filter()?);
        let options = DiscoveryOptions {
            replay_oplog: self.config.oplog_replay,
            channel_capacity: self.config.archive_channel_capacity,
        };
        let mut discoverer = Discoverer::new(&mut catalog, options);
        let outcome = discover(&mut discoverer);
        let report = discoverer.finish();
        summary.skipped = report.skipped;
        summary.discovery_errors = report.errors;
        outcome?;
        catalog.order(self.config.oplog_replay)
    }

    fn run_pool(&self, data: Vec<Intent>) -> Vec<(Namespace, Result<NamespaceResult>)> {
        let workers = self.config.num_parallel_collections.min(data.len());
        let queue = Mutex::new(VecDeque::from(data));
        let results = Mutex::new(Vec::new());
        debug!(workers, "Starting restore workers");

        thread::scope(|s| {
            for _ in 0..workers {
                s.spawn(|| loop {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    let Some(intent) = queue.lock().pop_front() else {
                        break;
                    };
                    let ns = intent.destination.clone();
                    let result = self.restore_intent(intent);
                    self.on_worker_result(&result);
                    results.lock().push((ns, result));
                });
            }
        });

        let mut results = results.into_inner();
        for intent in queue.into_inner() {
            results.push((intent.destination, Err(Error::Cancelled)));
        }
        results
    }

    fn on_worker_result(&self, result: &Result<NamespaceResult>) {
        if result.is_err() && self.config.stop_on_error {
            self.cancel.cancel();
        }
    }

    fn record(&self, summary: &mut RestoreSummary, ns: Namespace, result: Result<NamespaceResult>) {
        match result {
            Ok(done) => summary.restored.push(done),
            Err(Error::Cancelled) if summary.fatal.is_some() || self.cancel.is_cancelled() => {
                summary.record_failure(ns, Error::Cancelled)
            }
            Err(e) if self.config.stop_on_error && summary.fatal.is_none() => {
                summary.record_fatal(e)
            }
            Err(e) => summary.record_failure(ns, e),
        }
    }

    /// Specials and the oplog run only when nothing fatal happened
    fn finish(&self, summary: &mut RestoreSummary, special: Vec<Intent>, oplog: Option<Intent>) {
        if summary.fatal.is_none() && self.cancel.is_cancelled() {
            summary.record_fatal(Error::Cancelled);
        }
        if summary.fatal.is_some() {
            summary.log();
            return;
        }

        for intent in special {
            let ns = intent.destination.clone();
            let result = self.restore_intent(intent);
            self.on_worker_result(&result);
            self.record(summary, ns, result);
            if summary.fatal.is_some() {
                summary.log();
                return;
            }
        }

        if let Some(intent) = oplog {
            match self.replay_oplog(intent) {
                Ok(stats) => summary.oplog = Some(stats),
                Err(e) => summary.record_fatal(e),
            }
        }
        summary.log();
    }

    fn replay_oplog(&self, mut intent: Intent) -> Result<ReplayStats> {
        let Some(mut file) = intent.data.take() else {
            return Err(Error::invalid_operation("oplog Intent has no data source"));
        };
        info!(source = %file.location(), size = intent.size, "Replaying oplog");
        file.open()?;
        let replayer = OplogReplayer::new()
            .with_limit(self.config.oplog_limit_ts()?)
            .strict_transactions(self.config.strict_transactions)
            .with_cancellation(self.cancel.clone());
        let mut applier = DestinationApplier::new(&*self.destination);
        let stats = replayer.replay(&mut file, &mut applier);
        file.close();
        stats
    }

    /// Restore one collection: metadata, optional drop, documents, indexes
    fn restore_intent(&self, mut intent: Intent) -> Result<NamespaceResult> {
        let ns = intent.destination.clone();
        let metadata = intent.load_metadata()?;
        if intent.kind == IntentType::Timeseries && metadata.is_none() {
            return Err(Error::apply(
                ns.to_string(),
                "timeseries collection has no metadata",
            ));
        }
        let data_ns = intent.data_namespace();
        let dest = &*self.destination;

        if self.config.drop {
            for target in [&ns, &data_ns] {
                match dest.run_command(&target.db, &drop_command(target)) {
                    Ok(_) | Err(DestinationError::NamespaceNotFound(_)) => {}
                    Err(e) => return Err(e.into_apply(target)),
                }
            }
        }

        if let Some(meta) = &metadata {
            match dest.create_collection(&ns, &meta.options) {
                Ok(()) | Err(DestinationError::NamespaceExists(_)) => {}
                Err(e) => return Err(e.into_apply(&ns)),
            }
        }

        let mut documents = 0;
        if let Some(mut file) = intent.data.take() {
            file.open()?;
            let loaded = self.load_documents(&mut file, &data_ns);
            debug!(
                namespace = %data_ns,
                source = %file.location(),
                read = file.position(),
                size = intent.size,
                "Data source consumed"
            );
            file.close();
            documents = loaded?;
        }

        let mut indexes = 0;
        if let Some(meta) = metadata.as_ref().filter(|_| !self.config.no_index_restore) {
            let specs: Vec<Document> = meta.secondary_indexes().cloned().collect();
            if !specs.is_empty() {
                dest.run_command(&ns.db, &create_indexes_command(&ns, &specs))
                    .map_err(|e| e.into_apply(&ns))?;
                indexes = specs.len();
            }
        }

        info!(namespace = %ns, documents, indexes, "Restored namespace");
        Ok(NamespaceResult {
            namespace: ns,
            documents,
            indexes,
        })
    }

    fn load_documents<R: Read>(&self, source: R, ns: &Namespace) -> Result<u64> {
        let mut reader = DocumentReader::new(source);
        let mut inserted = 0;
        let mut batch = Vec::with_capacity(self.config.batch_size);
        while let Some(doc) = reader.next_document()? {
            batch.push(doc);
            if batch.len() == self.config.batch_size {
                inserted += self.insert(ns, std::mem::take(&mut batch))?;
                self.cancel.check()?;
            }
        }
        if !batch.is_empty() {
            inserted += self.insert(ns, batch)?;
        }
        Ok(inserted)
    }

    fn insert(&self, ns: &Namespace, batch: Vec<Document>) -> Result<u64> {
        let n = batch.len();
        self.destination.insert_batch(ns, batch).map_err(|e| {
            warn!(namespace = %ns, batch = n, error = %e, "Insert batch rejected");
            e.into_apply(ns)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryDestination;
    use docrestore_core::DocumentWriter;
    use serde_json::{json, Value};
    use std::fs;
    use tempfile::TempDir;

    fn frames(docs: &[Value]) -> Vec<u8> {
        let mut w = DocumentWriter::new(Vec::new());
        for d in docs {
            w.write_document(d.as_object().unwrap()).unwrap();
        }
        w.finish().unwrap()
    }

    fn restorer(config: RestoreConfig) -> (Restorer<InMemoryDestination>, Arc<InMemoryDestination>) {
        let dest = Arc::new(InMemoryDestination::new());
        (Restorer::new(config, dest.clone()).unwrap(), dest)
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dest = Arc::new(InMemoryDestination::new());
        let config = RestoreConfig::default().with_batch_size(0);
        assert!(matches!(Restorer::new(config, dest), Err(Error::Config(_))));
    }

    #[test]
    fn test_batches_and_indexes() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("shop");
        fs::create_dir(&db).unwrap();
        let docs: Vec<Value> = (0..5).map(|i| json!({"_id": i})).collect();
        fs::write(db.join("orders.bson"), frames(&docs)).unwrap();
        fs::write(
            db.join("orders.metadata.json"),
            r#"{"options": {}, "indexes": [
                {"v": 2, "key": {"_id": 1}, "name": "_id_"},
                {"v": 2, "key": {"sku": 1}, "name": "sku_1"}]}"#,
        )
        .unwrap();

        let (restorer, dest) = restorer(RestoreConfig::default().with_batch_size(2));
        let summary = restorer.restore_directory(dir.path());
        assert!(summary.is_success(), "{summary}");
        let orders = Namespace::new("shop", "orders");
        assert_eq!(dest.count(&orders), 5);
        assert_eq!(dest.indexes(&orders).len(), 1);
        assert_eq!(summary.restored_namespace(&orders).map(|r| r.indexes), Some(1));
    }

    #[test]
    fn test_failure_is_confined_to_its_namespace() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("shop");
        fs::create_dir(&db).unwrap();
        fs::write(db.join("a.bson"), frames(&[json!({"_id": 1})])).unwrap();
        fs::write(db.join("b.bson"), frames(&[json!({"_id": 1})])).unwrap();

        let dest = Arc::new(InMemoryDestination::new().with_rejected(Namespace::new("shop", "a")));
        let restorer = Restorer::new(RestoreConfig::default(), dest.clone()).unwrap();
        let summary = restorer.restore_directory(dir.path());
        assert!(summary.fatal.is_none());
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].namespace, Namespace::new("shop", "a"));
        assert_eq!(dest.count(&Namespace::new("shop", "b")), 1);
    }

    #[test]
    fn test_stop_on_error_aborts() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("shop");
        fs::create_dir(&db).unwrap();
        fs::write(db.join("a.bson"), frames(&[json!({"_id": 1})])).unwrap();

        let dest = Arc::new(InMemoryDestination::new().with_rejected(Namespace::new("shop", "a")));
        let config = RestoreConfig::default().with_stop_on_error(true);
        let restorer = Restorer::new(config, dest).unwrap();
        let summary = restorer.restore_directory(dir.path());
        assert!(matches!(summary.fatal, Some(Error::Apply { .. })));
    }

    #[test]
    fn test_timeseries_without_metadata_fails() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("metrics");
        fs::create_dir(&db).unwrap();
        fs::write(
            db.join("system.buckets.cpu.bson"),
            frames(&[json!({"_id": 1})]),
        )
        .unwrap();

        let (restorer, dest) = restorer(RestoreConfig::default());
        let summary = restorer.restore_directory(dir.path());
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].namespace, Namespace::new("metrics", "cpu"));
        assert!(dest.collection_names().is_empty());
    }

    #[test]
    fn test_timeseries_data_goes_to_buckets() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("metrics");
        fs::create_dir(&db).unwrap();
        fs::write(
            db.join("system.buckets.cpu.bson"),
            frames(&[json!({"_id": 1})]),
        )
        .unwrap();
        fs::write(
            db.join("cpu.metadata.json"),
            r#"{"options": {"timeseries": {"timeField": "t"}}, "indexes": [], "type": "timeseries"}"#,
        )
        .unwrap();

        let (restorer, dest) = restorer(RestoreConfig::default());
        let summary = restorer.restore_directory(dir.path());
        assert!(summary.is_success(), "{summary}");
        assert!(dest.options(&Namespace::new("metrics", "cpu")).unwrap().contains_key("timeseries"));
        assert_eq!(dest.count(&Namespace::new("metrics", "system.buckets.cpu")), 1);
    }

    #[test]
    fn test_drop_replaces_existing_documents() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("shop");
        fs::create_dir(&db).unwrap();
        fs::write(db.join("orders.bson"), frames(&[json!({"_id": 1})])).unwrap();

        let (restorer, dest) = restorer(RestoreConfig::default().with_drop(true));
        let orders = Namespace::new("shop", "orders");
        dest.insert_batch(&orders, vec![json!({"_id": 9}).as_object().cloned().unwrap()])
            .unwrap();
        let summary = restorer.restore_directory(dir.path());
        assert!(summary.is_success(), "{summary}");
        assert_eq!(dest.count(&orders), 1);
    }

    #[test]
    fn test_cancelled_before_start() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("shop");
        fs::create_dir(&db).unwrap();
        fs::write(db.join("orders.bson"), frames(&[json!({"_id": 1})])).unwrap();

        let (restorer, dest) = restorer(RestoreConfig::default());
        restorer.cancellation_token().cancel();
        let summary = restorer.restore_directory(dir.path());
        assert!(matches!(summary.fatal, Some(Error::Cancelled)));
        assert_eq!(dest.count(&Namespace::new("shop", "orders")), 0);
    }
}
