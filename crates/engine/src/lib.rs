//! Restore engine
//!
//! This crate drives a restore end to end:
//! - RestoreConfig: settings loaded from `docrestore.toml`
//! - Destination: the target database, as a trait
//! - InMemoryDestination: a destination for tests and dry runs
//! - Restorer: discovery, parallel data restore, then oplog replay
//! - RestoreSummary: what happened, per namespace
//!
//! The engine is the only component that knows about:
//! - Scheduling Intents onto worker threads
//! - Running the demultiplexer alongside its consumers
//! - Translating oplog units into destination commands

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod destination;
pub mod memory;
pub mod restore;
pub mod summary;

pub use config::{ConfigError, RenameRule, RestoreConfig, CONFIG_FILE_NAME};
pub use destination::{Destination, DestinationApplier, DestinationError};
pub use memory::InMemoryDestination;
pub use restore::Restorer;
pub use summary::{NamespaceFailure, NamespaceResult, RestoreSummary};
