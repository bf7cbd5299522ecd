//! One unit of restore work

use docrestore_archive::IntentFile;
use docrestore_core::{CollectionMetadata, Error, Namespace, Result};

/// Namespaces restored through the special-cache path
pub const SPECIAL_NAMESPACES: &[(&str, &str)] = &[
    ("admin", "system.users"),
    ("admin", "system.roles"),
    ("admin", "system.version"),
];

/// Whether `ns` is restored after all regular collections
pub fn is_special_namespace(ns: &Namespace) -> bool {
    SPECIAL_NAMESPACES
        .iter()
        .any(|(db, coll)| ns.db == *db && ns.collection == *coll)
}

/// How an Intent is scheduled and applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntentType {
    /// Plain collection
    Regular,
    /// Users, roles, and version documents; restored after regular data
    SpecialCache,
    /// Timeseries view whose data lives in its bucket collection
    Timeseries,
    /// The operation log
    Oplog,
}

/// A namespace's sources and where they land
#[derive(Debug)]
pub struct Intent {
    /// Namespace in the dump, under its view name for timeseries
    pub source: Namespace,
    /// Namespace in the destination after renaming
    pub destination: Namespace,
    /// Document stream
    pub data: Option<IntentFile>,
    /// Metadata block
    pub metadata: Option<IntentFile>,
    /// Size of the data source in bytes, for scheduling and progress
    pub size: u64,
    /// Scheduling class
    pub kind: IntentType,
}

impl Intent {
    /// An Intent with no sources attached yet
    pub fn new(source: Namespace, destination: Namespace, kind: IntentType) -> Self {
        Self {
            source,
            destination,
            data: None,
            metadata: None,
            size: 0,
            kind,
        }
    }

    /// The oplog Intent over `data`
    pub fn oplog(data: IntentFile, size: u64) -> Self {
        Self::new(Namespace::oplog(), Namespace::oplog(), IntentType::Oplog).with_data(data, size)
    }

    /// Attach the data source
    pub fn with_data(mut self, data: IntentFile, size: u64) -> Self {
        self.data = Some(data);
        self.size = size;
        self
    }

    /// Attach the metadata source
    pub fn with_metadata(mut self, metadata: IntentFile) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Namespace the documents are inserted into.
    ///
    /// Timeseries data goes to the bucket collection behind the view.
    pub fn data_namespace(&self) -> Namespace {
        match self.kind {
            IntentType::Timeseries => self.destination.buckets_namespace(),
            _ => self.destination.clone(),
        }
    }

    /// Whether this is the oplog Intent
    pub fn is_oplog(&self) -> bool {
        self.kind == IntentType::Oplog
    }

    /// Whether this Intent is restored after regular collections
    pub fn is_special(&self) -> bool {
        self.kind == IntentType::SpecialCache
    }

    /// Read and parse the metadata block, if there is one.
    ///
    /// An empty block (an archive namespace whose metadata never arrived)
    /// reads as `None`.
    pub fn load_metadata(&mut self) -> Result<Option<CollectionMetadata>> {
        let Some(file) = self.metadata.as_mut() else {
            return Ok(None);
        };
        file.open()?;
        let bytes = file.read_all();
        file.close();
        let bytes = bytes?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        CollectionMetadata::from_json(&bytes).map(Some).map_err(|e| {
            Error::apply(
                self.destination.to_string(),
                format!("unreadable metadata: {e}"),
            )
        })
    }

    /// Absorb the complementary part of `other` (data or metadata).
    pub(crate) fn merge(&mut self, other: Intent) {
        if self.data.is_none() && other.data.is_some() {
            self.data = other.data;
            self.size = other.size;
        }
        if self.metadata.is_none() {
            self.metadata = other.metadata;
        }
        if other.kind == IntentType::Timeseries {
            self.kind = IntentType::Timeseries;
        }
    }
}
