//! Restore configuration via `docrestore.toml`
//!
//! Settings can come from a file, or be built in code with the `with_*`
//! setters. Either way `validate()` runs before a restore starts.

use docrestore_core::{Error, NamespaceFilter, Result};
use docrestore_oplog::Timestamp;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Config file name looked up next to a dump
pub const CONFIG_FILE_NAME: &str = "docrestore.toml";

/// One `ns_from` -> `ns_to` rename
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RenameRule {
    /// Source pattern, `*` wildcards allowed
    pub from: String,
    /// Target pattern with the same number of wildcards
    pub to: String,
}

/// Restore configuration loaded from `docrestore.toml`.
///
/// # Example
///
/// ```toml
/// num_parallel_collections = 4
/// batch_size = 1000
/// oplog_replay = true
/// oplog_limit = "1700000000:1"
/// include = ["shop.*"]
///
/// [[rename]]
/// from = "shop.*"
/// to = "shop_restored.*"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RestoreConfig {
    /// Collections restored concurrently from a dump directory
    pub num_parallel_collections: usize,
    /// Documents per insert batch
    pub batch_size: usize,
    /// Chunks buffered per archive namespace before the stream stalls
    pub archive_channel_capacity: usize,
    /// Replay the oplog after the data
    pub oplog_replay: bool,
    /// Exclusive upper bound for replay, `t` or `t:i`
    pub oplog_limit: Option<String>,
    /// Fail the restore when the oplog ends inside a transaction
    pub strict_transactions: bool,
    /// Drop each collection before restoring it
    pub drop: bool,
    /// Skip index creation
    pub no_index_restore: bool,
    /// Treat the first namespace failure as fatal
    pub stop_on_error: bool,
    /// Include patterns; empty means everything
    pub include: Vec<String>,
    /// Exclude patterns
    pub exclude: Vec<String>,
    /// Rename rules, first match wins
    pub rename: Vec<RenameRule>,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            num_parallel_collections: 4,
            batch_size: 1000,
            archive_channel_capacity: docrestore_archive::DEFAULT_REGULAR_CAPACITY,
            oplog_replay: false,
            oplog_limit: None,
            strict_transactions: false,
            drop: false,
            no_index_restore: false,
            stop_on_error: false,
            include: Vec::new(),
            exclude: Vec::new(),
            rename: Vec::new(),
        }
    }
}

impl RestoreConfig {
    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# docrestore configuration

# Collections restored concurrently from a dump directory (default: 4).
# Archive restores run one worker per collection regardless.
num_parallel_collections = 4

# Documents per insert batch (default: 1000)
batch_size = 1000

# Chunks buffered per archive collection before the stream waits (default: 4)
archive_channel_capacity = 4

# Replay oplog.bson after restoring data (default: false)
oplog_replay = false

# Stop replay before this timestamp ("seconds" or "seconds:increment")
# oplog_limit = "1700000000:1"

# Fail when the oplog ends with transactions still open (default: false)
strict_transactions = false

# Drop each collection before restoring it (default: false)
drop = false

# Skip index creation (default: false)
no_index_restore = false

# Abort on the first failed collection (default: false)
stop_on_error = false

# Namespace filters; "*" matches any run of characters
# include = ["shop.*"]
# exclude = ["shop.tmp_*"]

# [[rename]]
# from = "shop.*"
# to = "shop_restored.*"
"#
    }

    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: RestoreConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?;
        config.validate().map_err(|e| Error::Config(e.to_string()))?;
        Ok(config)
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                Error::Config(format!(
                    "Failed to write default config file '{}': {e}",
                    path.display()
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content).map_err(|e| {
            Error::Config(format!(
                "Failed to write config file '{}': {e}",
                path.display()
            ))
        })
    }

    /// Set the directory-restore worker count
    pub fn with_parallel_collections(mut self, n: usize) -> Self {
        self.num_parallel_collections = n;
        self
    }

    /// Set the insert batch size
    pub fn with_batch_size(mut self, n: usize) -> Self {
        self.batch_size = n;
        self
    }

    /// Enable or disable oplog replay
    pub fn with_oplog_replay(mut self, replay: bool) -> Self {
        self.oplog_replay = replay;
        self
    }

    /// Set the replay bound
    pub fn with_oplog_limit(mut self, limit: impl Into<String>) -> Self {
        self.oplog_limit = Some(limit.into());
        self
    }

    /// Fail on unterminated transactions
    pub fn with_strict_transactions(mut self, strict: bool) -> Self {
        self.strict_transactions = strict;
        self
    }

    /// Drop collections before restoring
    pub fn with_drop(mut self, drop: bool) -> Self {
        self.drop = drop;
        self
    }

    /// Skip index creation
    pub fn with_no_index_restore(mut self, skip: bool) -> Self {
        self.no_index_restore = skip;
        self
    }

    /// Stop on the first namespace failure
    pub fn with_stop_on_error(mut self, stop: bool) -> Self {
        self.stop_on_error = stop;
        self
    }

    /// Add an include pattern
    pub fn with_include(mut self, pattern: impl Into<String>) -> Self {
        self.include.push(pattern.into());
        self
    }

    /// Add an exclude pattern
    pub fn with_exclude(mut self, pattern: impl Into<String>) -> Self {
        self.exclude.push(pattern.into());
        self
    }

    /// Add a rename rule
    pub fn with_rename(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.rename.push(RenameRule {
            from: from.into(),
            to: to.into(),
        });
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.num_parallel_collections == 0 {
            return Err(ConfigError::ZeroParallelism);
        }
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.archive_channel_capacity == 0 {
            return Err(ConfigError::ZeroChannelCapacity);
        }
        self.oplog_limit_ts()?;
        self.namespace_filter()?;
        Ok(())
    }

    /// The parsed replay bound
    pub fn oplog_limit_ts(&self) -> std::result::Result<Option<Timestamp>, ConfigError> {
        self.oplog_limit
            .as_deref()
            .map(|s| Timestamp::parse(s).map_err(|_| ConfigError::InvalidOplogLimit(s.to_string())))
            .transpose()
    }

    /// Build the include / exclude / rename filter
    pub fn namespace_filter(&self) -> std::result::Result<NamespaceFilter, ConfigError> {
        let invalid = |e: Error| ConfigError::InvalidFilter(e.to_string());
        let mut filter = NamespaceFilter::new();
        for p in &self.include {
            filter = filter.include(p).map_err(invalid)?;
        }
        for p in &self.exclude {
            filter = filter.exclude(p).map_err(invalid)?;
        }
        for r in &self.rename {
            filter = filter.rename(&r.from, &r.to).map_err(invalid)?;
        }
        Ok(filter)
    }
}

/// Configuration validation errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    /// `num_parallel_collections` is zero
    #[error("num_parallel_collections must be at least 1")]
    ZeroParallelism,

    /// `batch_size` is zero
    #[error("batch_size must be at least 1")]
    ZeroBatchSize,

    /// `archive_channel_capacity` is zero
    #[error("archive_channel_capacity must be at least 1")]
    ZeroChannelCapacity,

    /// `oplog_limit` does not parse
    #[error("Invalid oplog_limit '{0}': expected \"seconds\" or \"seconds:increment\"")]
    InvalidOplogLimit(String),

    /// A filter or rename pattern is malformed
    #[error("Invalid namespace filter: {0}")]
    InvalidFilter(String),
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}
