//! The Intent catalog
//!
//! Append-only while discovery runs; `order()` drains it into the sequence
//! the restore driver follows and seals it against further registration.

use crate::intent::{Intent, IntentType};
use docrestore_core::{Error, Namespace, NamespaceFilter, Result};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use tracing::debug;

/// Intents in dependency order
#[derive(Debug, Default)]
pub struct RestoreOrder {
    /// Regular and timeseries Intents, largest first
    pub data: Vec<Intent>,
    /// Special-cache Intents, restored once all data Intents are done
    pub special: Vec<Intent>,
    /// The oplog, when replay was requested
    pub oplog: Option<Intent>,
}

impl RestoreOrder {
    /// Total number of Intents
    pub fn len(&self) -> usize {
        self.data.len() + self.special.len() + usize::from(self.oplog.is_some())
    }

    /// Whether there is nothing to restore
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flatten into the single sequence: data, special, oplog
    pub fn into_sequence(self) -> Vec<Intent> {
        let mut out = self.data;
        out.extend(self.special);
        out.extend(self.oplog);
        out
    }
}

/// Destination namespace to Intent, plus the oplog slot
#[derive(Debug, Default)]
pub struct IntentCatalog {
    intents: BTreeMap<Namespace, Intent>,
    oplog: Option<Intent>,
    filter: NamespaceFilter,
    sealed: bool,
}

impl IntentCatalog {
    /// An empty catalog that includes everything
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty catalog that applies `filter` during discovery
    pub fn with_filter(filter: NamespaceFilter) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    /// The include / exclude / rename rules
    pub fn filter(&self) -> &NamespaceFilter {
        &self.filter
    }

    /// Whether `source` passes the include list
    pub fn is_included(&self, source: &Namespace) -> bool {
        self.filter.is_included(source)
    }

    /// Whether `source` is excluded
    pub fn is_excluded(&self, source: &Namespace) -> bool {
        self.filter.is_excluded(source)
    }

    /// Where `source` is restored to after renaming.
    ///
    /// Bucket collections are renamed under their view name.
    pub fn destination_for(&self, source: &Namespace) -> Namespace {
        self.filter.rename_target(&source.view_namespace())
    }

    /// Register a data and/or metadata Intent.
    ///
    /// A second part for the same destination is merged when it comes from
    /// the same source and supplies what the first one lacks.
    pub fn put(&mut self, intent: Intent) -> Result<()> {
        self.ensure_open()?;
        if intent.is_oplog() {
            return self.put_oplog(intent);
        }
        match self.intents.entry(intent.destination.clone()) {
            Entry::Vacant(slot) => {
                debug!(
                    source = %intent.source,
                    destination = %intent.destination,
                    kind = ?intent.kind,
                    "Registered intent"
                );
                slot.insert(intent);
                Ok(())
            }
            Entry::Occupied(mut slot) => {
                let existing = slot.get_mut();
                let same_source =
                    existing.source.view_namespace() == intent.source.view_namespace();
                let complementary = (existing.data.is_none() && intent.metadata.is_none())
                    || (existing.metadata.is_none() && intent.data.is_none());
                if same_source && complementary {
                    existing.merge(intent);
                    Ok(())
                } else {
                    Err(Error::DuplicateNamespace(format!(
                        "{} (from {} and {})",
                        existing.destination, existing.source, intent.source
                    )))
                }
            }
        }
    }

    /// Register the oplog Intent; there can be only one
    pub fn put_oplog(&mut self, mut intent: Intent) -> Result<()> {
        self.ensure_open()?;
        if self.oplog.is_some() {
            return Err(Error::DuplicateNamespace(Namespace::oplog().to_string()));
        }
        intent.kind = IntentType::Oplog;
        self.oplog = Some(intent);
        Ok(())
    }

    /// Look up by destination
    pub fn get(&self, destination: &Namespace) -> Option<&Intent> {
        self.intents.get(destination)
    }

    /// The oplog Intent, if registered
    pub fn oplog(&self) -> Option<&Intent> {
        self.oplog.as_ref()
    }

    /// Number of data/metadata Intents (the oplog is not counted)
    pub fn len(&self) -> usize {
        self.intents.len()
    }

    /// Whether no data/metadata Intent is registered
    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }

    /// Drain into dependency order and seal the catalog.
    ///
    /// The oplog is included only when `replay_oplog` is set; otherwise it is
    /// dropped unread.
    pub fn order(&mut self, replay_oplog: bool) -> Result<RestoreOrder> {
        self.ensure_open()?;
        self.sealed = true;

        let mut order = RestoreOrder::default();
        for (_, intent) in std::mem::take(&mut self.intents) {
            if intent.is_special() {
                order.special.push(intent);
            } else {
                order.data.push(intent);
            }
        }
        // Largest first; BTreeMap iteration already fixed the tie order.
        order.data.sort_by(|a, b| b.size.cmp(&a.size));
        order.oplog = self.oplog.take().filter(|_| replay_oplog);
        debug!(
            data = order.data.len(),
            special = order.special.len(),
            oplog = order.oplog.is_some(),
            "Catalog sealed"
        );
        Ok(order)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.sealed {
            Err(Error::invalid_operation(
                "intent catalog is sealed once ordered",
            ))
        } else {
            Ok(())
        }
    }
}
