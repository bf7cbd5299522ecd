//! Collection metadata blocks (`*.metadata.json`)

use crate::document::Document;
use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Metadata captured alongside a collection's data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionMetadata {
    /// Creation options (capped, validator, timeseries, ...)
    #[serde(default)]
    pub options: Document,
    /// Index specifications, each with at least `key` and `name`
    #[serde(default)]
    pub indexes: Vec<Document>,
    /// Collection UUID as captured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    /// Unescaped collection name; required when the file name was truncated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_name: Option<String>,
    /// Collection type (`collection`, `timeseries`, `view`)
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl CollectionMetadata {
    /// Parse a metadata block.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Whether the metadata describes a timeseries collection
    pub fn is_timeseries(&self) -> bool {
        self.kind.as_deref() == Some("timeseries") || self.options.contains_key("timeseries")
    }

    /// Index specs other than the implicit `_id_` index
    pub fn secondary_indexes(&self) -> impl Iterator<Item = &Document> {
        self.indexes
            .iter()
            .filter(|spec| spec.get("name").and_then(|n| n.as_str()) != Some("_id_"))
    }
}
