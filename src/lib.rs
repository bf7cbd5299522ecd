//! docrestore - restore document database dumps and archives
//!
//! docrestore reads a dump directory or a single multiplexed archive stream,
//! restores every collection it finds into a destination, and then replays
//! the captured operation log with multi-statement transactions applied
//! atomically.
//!
//! # Quick Start
//!
//! ```ignore
//! use docrestore::{InMemoryDestination, RestoreConfig, Restorer};
//! use std::sync::Arc;
//!
//! let config = RestoreConfig::default().with_oplog_replay(true);
//! let destination = Arc::new(InMemoryDestination::new());
//! let restorer = Restorer::new(config, destination)?;
//!
//! let summary = restorer.restore_directory("dump".as_ref());
//! println!("{summary}");
//! ```
//!
//! # Architecture
//!
//! - `docrestore-core`: namespaces, documents, metadata, filters, errors
//! - `docrestore-archive`: archive format, demultiplexer, sources
//! - `docrestore-intents`: Intent catalog and dump discovery
//! - `docrestore-oplog`: transaction reassembly and oplog replay
//! - `docrestore-engine`: configuration, destinations, the restore driver

pub use docrestore_archive::{
    ArchiveHeader, DemuxStats, Demultiplexer, IntentFile, Multiplexer, NamespaceEntry, Receiver,
    SourceKind,
};
pub use docrestore_core::{
    CancellationToken, CollectionMetadata, Document, DocumentReader, DocumentWriter, Error,
    Namespace, NamespaceFilter, Result,
};
pub use docrestore_engine::{
    ConfigError, Destination, DestinationError, InMemoryDestination, NamespaceFailure,
    NamespaceResult, RestoreConfig, RestoreSummary, Restorer, CONFIG_FILE_NAME,
};
pub use docrestore_intents::{
    Discoverer, DiscoveryOptions, DiscoveryReport, Intent, IntentCatalog, IntentType,
    RestoreOrder, SkipReason,
};
pub use docrestore_oplog::{OplogApplier, OplogEntry, OplogReplayer, ReplayStats, Timestamp};
