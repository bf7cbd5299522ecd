//! Namespace identity and name validation

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Collection prefix of the raw storage behind a timeseries view
pub const BUCKETS_PREFIX: &str = "system.buckets.";

/// Length at which dump file names are truncated.
///
/// An escaped collection name of exactly this length that contains an
/// escaped `$` (`%24`) was cut short and its real name must come from the
/// collection's metadata block.
pub const TRUNCATED_NAME_LEN: usize = 238;

const MAX_DB_NAME_LEN: usize = 64;
const INVALID_DB_CHARS: &[char] = &['/', '\\', '.', ' ', '"', '$', '*', '<', '>', ':', '|', '?'];

/// A `(db, collection)` pair.
///
/// The textual form is always `db.collection`; the oplog uses an empty
/// database (`.oplog`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Namespace {
    /// Database name
    pub db: String,
    /// Collection name
    pub collection: String,
}

impl Namespace {
    /// Create a new namespace
    pub fn new(db: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            collection: collection.into(),
        }
    }

    /// The namespace used for the oplog Intent
    pub fn oplog() -> Self {
        Self::new("", "oplog")
    }

    /// Split `db.collection` at the first dot.
    ///
    /// A string without a dot is a bare database name.
    pub fn parse(s: &str) -> Self {
        match s.split_once('.') {
            Some((db, coll)) => Self::new(db, coll),
            None => Self::new(s, ""),
        }
    }

    /// Whether this is the raw bucket collection of a timeseries view
    pub fn is_buckets(&self) -> bool {
        self.collection.starts_with(BUCKETS_PREFIX)
    }

    /// The namespace filters and the catalog key this namespace under.
    ///
    /// `db.system.buckets.x` becomes `db.x`; everything else is unchanged.
    pub fn view_namespace(&self) -> Namespace {
        match self.collection.strip_prefix(BUCKETS_PREFIX) {
            Some(view) => Namespace::new(self.db.clone(), view),
            None => self.clone(),
        }
    }

    /// The bucket collection backing this (view) namespace
    pub fn buckets_namespace(&self) -> Namespace {
        if self.is_buckets() {
            self.clone()
        } else {
            Namespace::new(self.db.clone(), format!("{BUCKETS_PREFIX}{}", self.collection))
        }
    }

    /// Whether this is the oplog namespace
    pub fn is_oplog(&self) -> bool {
        self.db.is_empty() && self.collection == "oplog"
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.collection)
    }
}

/// Validate a database name.
pub fn validate_db_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::discovery(name, "database name cannot be empty"));
    }
    if name.len() >= MAX_DB_NAME_LEN {
        return Err(Error::discovery(
            name,
            format!("database name must be shorter than {MAX_DB_NAME_LEN} bytes"),
        ));
    }
    if let Some(c) = name.chars().find(|c| INVALID_DB_CHARS.contains(c) || *c == '\0') {
        return Err(Error::discovery(
            name,
            format!("database name contains invalid character {c:?}"),
        ));
    }
    Ok(())
}

/// Validate a collection name.
pub fn validate_collection_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::discovery(name, "collection name cannot be empty"));
    }
    if name.contains('\0') {
        return Err(Error::discovery(name, "collection name contains a null byte"));
    }
    Ok(())
}

/// Escape a collection name for use as a file name.
pub fn escape_collection_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for b in name.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~' | b'!') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

/// Reverse [`escape_collection_name`].
pub fn unescape_collection_name(escaped: &str) -> Result<String> {
    let bytes = escaped.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| {
                    Error::discovery(escaped, format!("invalid escape sequence at byte {i}"))
                })?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out)
        .map_err(|_| Error::discovery(escaped, "unescaped name is not valid UTF-8"))
}

/// Whether an escaped file name was truncated by the dump writer.
pub fn is_truncated_name(escaped: &str) -> bool {
    escaped.len() == TRUNCATED_NAME_LEN && escaped.contains("%24")
}
