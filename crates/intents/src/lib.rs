//! Intent discovery and the restore catalog
//!
//! An Intent is one unit of restore work: a namespace's data and metadata
//! sources plus where they land. Discovery walks a dump directory or an
//! archive header and registers Intents in an [`IntentCatalog`], which then
//! hands them out in dependency order.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod catalog;
pub mod discovery;
pub mod intent;

pub use catalog::{IntentCatalog, RestoreOrder};
pub use discovery::{
    DiscoveryOptions, DiscoveryReport, Discoverer, SkipReason, SkippedNamespace,
};
pub use intent::{is_special_namespace, Intent, IntentType, SPECIAL_NAMESPACES};
