//! Core types for docrestore
//!
//! This crate defines the foundational types shared by every restore stage:
//! - Namespace: `(db, collection)` identity key used for filtering and renaming
//! - Document: ordered document model and its on-disk frame codec
//! - CollectionMetadata: contents of a `*.metadata.json` block
//! - NamespaceFilter: include / exclude / rename rules consulted at discovery
//! - Error: the restore error taxonomy
//! - CancellationToken: cooperative abort shared across threads

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cancel;
pub mod document;
pub mod error;
pub mod filter;
pub mod metadata;
pub mod namespace;

pub use cancel::CancellationToken;
pub use document::{
    decode_document, encode_document, Document, DocumentReader, DocumentWriter,
    MAX_DOCUMENT_FRAME_SIZE,
};
pub use error::{Error, Result};
pub use filter::{NamespaceFilter, NamespacePattern};
pub use metadata::CollectionMetadata;
pub use namespace::{
    escape_collection_name, is_truncated_name, unescape_collection_name,
    validate_collection_name, validate_db_name, Namespace, BUCKETS_PREFIX, TRUNCATED_NAME_LEN,
};
