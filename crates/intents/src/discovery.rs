//! Intent discovery
//!
//! Walks a dump directory, or the header of an archive stream, and registers
//! one Intent per restorable namespace. Problems with a single database or
//! collection are recorded in the [`DiscoveryReport`] and discovery moves on
//! to its siblings; conflicts in the catalog itself abort discovery.
//!
//! Dump directory layout:
//!
//! ```text
//! dump/
//!   oplog.bson[.gz]
//!   <db>/
//!     <escaped coll>.bson[.gz]            (legacy: .bin)
//!     <escaped coll>.metadata.json[.gz]
//! ```

use crate::catalog::IntentCatalog;
use crate::intent::{is_special_namespace, Intent, IntentType};
use docrestore_archive::{
    Demultiplexer, IntentFile, NamespaceEntry, Receiver, SourceKind, DEFAULT_REGULAR_CAPACITY,
};
use docrestore_core::{
    is_truncated_name, unescape_collection_name, validate_collection_name, validate_db_name,
    CollectionMetadata, Error, Namespace, Result,
};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Why a namespace found in the dump is not restored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Profiling collection
    Profile,
    /// Legacy index catalog, superseded by metadata files
    SystemIndexes,
    /// `$`-prefixed collection in a multi-database restore
    DollarPrefix,
    /// Matched an exclude pattern
    Excluded,
    /// Not matched by any include pattern
    NotIncluded,
    /// The oplog, when replay was not requested
    OplogNotReplayed,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SkipReason::Profile => "profiling collection",
            SkipReason::SystemIndexes => "legacy system.indexes with metadata files present",
            SkipReason::DollarPrefix => "'$' prefix in a multi-database restore",
            SkipReason::Excluded => "excluded by filter",
            SkipReason::NotIncluded => "not included by filter",
            SkipReason::OplogNotReplayed => "oplog replay not requested",
        };
        f.write_str(text)
    }
}

/// A namespace deliberately left out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedNamespace {
    /// Source namespace
    pub namespace: Namespace,
    /// Why it was skipped
    pub reason: SkipReason,
}

/// What discovery found
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    /// Intents (or Intent parts) registered
    pub registered: usize,
    /// Namespaces skipped by policy or filter
    pub skipped: Vec<SkippedNamespace>,
    /// Per-subtree failures; discovery continued past each of them
    pub errors: Vec<Error>,
}

impl DiscoveryReport {
    fn skip(&mut self, namespace: Namespace, reason: SkipReason) {
        if !self.skipped.iter().any(|s| s.namespace == namespace) {
            debug!(namespace = %namespace, %reason, "Skipping namespace");
            self.skipped.push(SkippedNamespace { namespace, reason });
        }
    }

    fn error(&mut self, err: Error) {
        warn!(error = %err, "Discovery problem; continuing with siblings");
        self.errors.push(err);
    }
}

/// Discovery settings
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Register the oplog Intent
    pub replay_oplog: bool,
    /// Chunks buffered per regular archive namespace
    pub channel_capacity: usize,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            replay_oplog: false,
            channel_capacity: DEFAULT_REGULAR_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileRole {
    Data,
    Metadata,
}

/// Split a dump file name into its escaped collection name and role
fn classify_file(name: &str) -> Option<(&str, FileRole)> {
    let base = name.strip_suffix(".gz").unwrap_or(name);
    if let Some(coll) = base.strip_suffix(".metadata.json") {
        return Some((coll, FileRole::Metadata));
    }
    base.strip_suffix(".bson")
        .or_else(|| base.strip_suffix(".bin"))
        .map(|coll| (coll, FileRole::Data))
}

/// Registers Intents into a catalog
pub struct Discoverer<'a> {
    catalog: &'a mut IntentCatalog,
    options: DiscoveryOptions,
    report: DiscoveryReport,
}

impl<'a> Discoverer<'a> {
    /// Discover into `catalog`
    pub fn new(catalog: &'a mut IntentCatalog, options: DiscoveryOptions) -> Self {
        Self {
            catalog,
            options,
            report: DiscoveryReport::default(),
        }
    }

    /// Finish and return what was found
    pub fn finish(self) -> DiscoveryReport {
        info!(
            registered = self.report.registered,
            skipped = self.report.skipped.len(),
            errors = self.report.errors.len(),
            "Discovery complete"
        );
        self.report
    }

    /// Walk a full dump directory: one subdirectory per database.
    pub fn directory(&mut self, root: &Path) -> Result<()> {
        let entries = read_dir_sorted(root)?;
        for path in entries {
            let name = file_name(&path);
            if path.is_dir() {
                if let Err(e) = validate_db_name(&name) {
                    self.report.error(e);
                    continue;
                }
                if let Err(e) = self.database_inner(&path, &name, true) {
                    if e.is_fatal() {
                        return Err(e);
                    }
                    self.report.error(e);
                }
            } else if name == "oplog.bson" || name == "oplog.bson.gz" {
                self.oplog_file(&path)?;
            } else {
                debug!(path = %path.display(), "Ignoring file at dump root");
            }
        }
        Ok(())
    }

    /// Walk one database directory restored as database `db`.
    pub fn database(&mut self, dir: &Path, db: &str) -> Result<()> {
        validate_db_name(db)?;
        self.database_inner(dir, db, false)
    }

    fn database_inner(&mut self, dir: &Path, db: &str, multi_db: bool) -> Result<()> {
        let entries = read_dir_sorted(dir)?;
        let has_metadata_files = entries
            .iter()
            .any(|p| classify_file(&file_name(p)).map(|(_, r)| r) == Some(FileRole::Metadata));

        for path in entries {
            let name = file_name(&path);
            if path.is_dir() {
                debug!(path = %path.display(), "Ignoring subdirectory of a database directory");
                continue;
            }
            let Some((escaped, role)) = classify_file(&name) else {
                debug!(path = %path.display(), "Ignoring unrecognised dump file");
                continue;
            };
            let collection = match self.collection_name(dir, &name, escaped, role) {
                Ok(c) => c,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    self.report.error(e);
                    continue;
                }
            };
            if let Err(e) = validate_collection_name(&collection) {
                self.report.error(e);
                continue;
            }

            let source = Namespace::new(db, collection);
            if let Some(reason) = self.skip_reason(&source, multi_db, has_metadata_files) {
                self.report.skip(source, reason);
                continue;
            }

            let file = IntentFile::from_path(&path);
            let intent = match role {
                FileRole::Data => {
                    let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                    self.new_intent(&source).with_data(file, size)
                }
                FileRole::Metadata => self.new_intent(&source).with_metadata(file),
            };
            self.register(intent)?;
        }
        Ok(())
    }

    /// Register one collection file restored into `ns`.
    ///
    /// A sibling `<stem>.metadata.json[.gz]` is picked up when present.
    pub fn collection_file(&mut self, path: &Path, ns: &Namespace) -> Result<()> {
        validate_db_name(&ns.db)?;
        validate_collection_name(&ns.collection)?;
        let name = file_name(path);
        let stem = match classify_file(&name) {
            Some((stem, FileRole::Data)) => stem.to_string(),
            _ => {
                return Err(Error::discovery(
                    path.display().to_string(),
                    "expected a .bson, .bson.gz or .bin file",
                ))
            }
        };
        let size = fs::metadata(path).map(|m| m.len())?;
        let mut intent =
            self.new_intent(ns).with_data(IntentFile::from_path(path), size);
        if let Some(meta) = sibling_metadata(path, &stem) {
            intent = intent.with_metadata(IntentFile::from_path(meta));
        }
        self.register(intent)
    }

    /// Register an explicit oplog file.
    pub fn oplog_file(&mut self, path: &Path) -> Result<()> {
        if !self.options.replay_oplog {
            self.report.skip(Namespace::oplog(), SkipReason::OplogNotReplayed);
            return Ok(());
        }
        let size = fs::metadata(path).map(|m| m.len())?;
        self.catalog
            .put_oplog(Intent::oplog(IntentFile::from_path(path), size))?;
        self.report.registered += 1;
        info!(path = %path.display(), size, "Registered oplog");
        Ok(())
    }

    /// Register a collection whose documents arrive on stdin.
    pub fn stdin(&mut self, ns: &Namespace) -> Result<()> {
        validate_db_name(&ns.db)?;
        validate_collection_name(&ns.collection)?;
        let intent = self
            .new_intent(ns)
            .with_data(IntentFile::new(SourceKind::Stdin), 0);
        self.register(intent)
    }

    /// Register every namespace listed in an archive header and open the
    /// matching receivers on `demux`.
    ///
    /// Every listed namespace gets a data receiver, muted when skipped, so
    /// the demultiplexer never meets an unregistered namespace.
    pub fn archive<R: Read>(&mut self, demux: &mut Demultiplexer<R>) -> Result<()> {
        let entries = demux.read_header()?.namespaces.clone();
        let dbs: HashSet<&str> = entries
            .iter()
            .filter(|e| !e.is_oplog())
            .map(|e| e.db.as_str())
            .collect();
        let multi_db = dbs.len() > 1;
        let mut dbs_with_metadata: BTreeMap<&str, bool> = BTreeMap::new();
        for e in &entries {
            *dbs_with_metadata.entry(e.db.as_str()).or_default() |= e.has_metadata;
        }

        for entry in &entries {
            let key = entry.chunk_key();
            if entry.is_oplog() {
                self.archive_oplog(demux, &key, entry)?;
                continue;
            }
            let source = entry.namespace();
            let checked = validate_db_name(&source.db)
                .and_then(|_| validate_collection_name(&source.collection));
            if let Err(e) = checked {
                self.report.error(e);
                mute(demux, &key, entry)?;
                continue;
            }
            let db_meta = dbs_with_metadata.get(source.db.as_str()).copied().unwrap_or(false);
            if let Some(reason) = self.skip_reason(&source, multi_db, db_meta) {
                self.report.skip(source, reason);
                mute(demux, &key, entry)?;
                continue;
            }

            let mut intent = self.new_intent(&source);
            // A timeseries view carries only metadata; its documents arrive
            // under the bucket namespace and merge into the same Intent.
            let view_only = entry.kind == "timeseries" && !source.is_buckets();
            if view_only {
                intent.kind = IntentType::Timeseries;
                demux.open(&key, Receiver::Muted)?;
            } else {
                let data = if intent.kind == IntentType::SpecialCache {
                    let (rx, cache) = Receiver::special_cache();
                    demux.open(&key, rx)?;
                    SourceKind::ArchiveSpecial(cache)
                } else {
                    let (rx, reader) = Receiver::regular(self.options.channel_capacity);
                    demux.open(&key, rx)?;
                    SourceKind::ArchiveRegular(Some(reader))
                };
                intent = intent.with_data(IntentFile::new(data), entry.size);
            }
            if entry.has_metadata {
                let (rx, slot) = Receiver::metadata_prelude();
                demux.open(&key, rx)?;
                intent = intent.with_metadata(IntentFile::new(SourceKind::MetadataPrelude(slot)));
            } else if view_only {
                continue;
            }
            self.register(intent)?;
        }
        Ok(())
    }

    fn archive_oplog<R: Read>(
        &mut self,
        demux: &mut Demultiplexer<R>,
        key: &str,
        entry: &NamespaceEntry,
    ) -> Result<()> {
        if !self.options.replay_oplog {
            self.report.skip(Namespace::oplog(), SkipReason::OplogNotReplayed);
            return mute(demux, key, entry);
        }
        // Held in full so data namespaces keep flowing while it accumulates.
        let (rx, cache) = Receiver::special_cache();
        demux.open(key, rx)?;
        self.catalog.put_oplog(Intent::oplog(
            IntentFile::new(SourceKind::ArchiveSpecial(cache)),
            entry.size,
        ))?;
        self.report.registered += 1;
        Ok(())
    }

    fn new_intent(&self, source: &Namespace) -> Intent {
        let kind = if source.is_buckets() {
            IntentType::Timeseries
        } else if is_special_namespace(source) {
            IntentType::SpecialCache
        } else {
            IntentType::Regular
        };
        let destination = self.catalog.destination_for(source);
        Intent::new(source.view_namespace(), destination, kind)
    }

    fn register(&mut self, intent: Intent) -> Result<()> {
        self.catalog.put(intent)?;
        self.report.registered += 1;
        Ok(())
    }

    fn skip_reason(
        &self,
        source: &Namespace,
        multi_db: bool,
        has_metadata_files: bool,
    ) -> Option<SkipReason> {
        if source.collection == "system.profile" {
            return Some(SkipReason::Profile);
        }
        if source.collection == "system.indexes" && has_metadata_files {
            return Some(SkipReason::SystemIndexes);
        }
        if multi_db && source.collection.starts_with('$') {
            return Some(SkipReason::DollarPrefix);
        }
        if self.catalog.is_excluded(source) {
            return Some(SkipReason::Excluded);
        }
        if !self.catalog.is_included(source) {
            return Some(SkipReason::NotIncluded);
        }
        None
    }

    /// Unescape a file's collection name, recovering truncated names from
    /// the collection's metadata file.
    fn collection_name(
        &self,
        dir: &Path,
        file: &str,
        escaped: &str,
        role: FileRole,
    ) -> Result<String> {
        if !is_truncated_name(escaped) {
            return unescape_collection_name(escaped);
        }
        let meta_path = match role {
            FileRole::Metadata => dir.join(file),
            FileRole::Data => sibling_metadata(&dir.join(file), escaped).ok_or_else(|| {
                Error::invalid_operation(format!(
                    "{file} has a truncated name and no metadata file to recover it from"
                ))
            })?,
        };
        let mut meta_file = IntentFile::from_path(&meta_path);
        meta_file.open()?;
        let bytes = meta_file.read_all();
        meta_file.close();
        let metadata = CollectionMetadata::from_json(&bytes?)?;
        metadata.collection_name.ok_or_else(|| {
            Error::invalid_operation(format!(
                "{} lacks collectionName needed to recover the truncated name {escaped}",
                meta_path.display()
            ))
        })
    }
}

fn mute<R: Read>(demux: &mut Demultiplexer<R>, key: &str, entry: &NamespaceEntry) -> Result<()> {
    demux.open(key, Receiver::Muted)?;
    if entry.has_metadata {
        debug!(namespace = key, "Muted namespace metadata will be discarded");
    }
    Ok(())
}

fn read_dir_sorted(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir)
        .map_err(|e| Error::discovery(dir.display().to_string(), format!("cannot list: {e}")))?;
    let mut paths = Vec::new();
    for entry in entries {
        match entry {
            Ok(entry) => paths.push(entry.path()),
            Err(e) => {
                return Err(Error::discovery(
                    dir.display().to_string(),
                    format!("unreadable entry: {e}"),
                ))
            }
        }
    }
    paths.sort();
    Ok(paths)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn sibling_metadata(data_path: &Path, stem: &str) -> Option<PathBuf> {
    let dir = data_path.parent()?;
    [
        format!("{stem}.metadata.json"),
        format!("{stem}.metadata.json.gz"),
    ]
    .into_iter()
    .map(|name| dir.join(name))
    .find(|p| p.is_file())
}
