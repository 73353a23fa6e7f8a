//! Persisted per-storage metadata and the stored-value envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Access tokens and version of a storage, persisted as `metadata.json`.
///
/// On disk the secret key field is named `secret`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageMetadata {
    /// Incremented on every key rotation; starts at 1
    pub version: u64,

    /// Identifies the storage for application access
    #[serde(rename = "apiKey")]
    pub api_key: String,

    /// Grants read-write application access
    #[serde(rename = "secret")]
    pub secret_key: String,

    /// Grants read-only application access
    #[serde(rename = "readonlyKey")]
    pub readonly_key: String,
}

impl StorageMetadata {
    /// Fresh metadata at version 1 with the given tokens.
    pub fn new(api_key: String, secret_key: String, readonly_key: String) -> Self {
        Self {
            version: 1,
            api_key,
            secret_key,
            readonly_key,
        }
    }

    /// Serialize to the on-disk JSON form.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse the on-disk JSON form.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// A value as kept at rest: `{_d: value[, modified, source]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredValue {
    /// The caller's value
    #[serde(rename = "_d", default)]
    pub data: Value,

    /// Last write time in ms since Unix epoch (metadata-keeping only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<i64>,

    /// Caller-supplied description of the writer (metadata-keeping only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl StoredValue {
    /// Envelope without write metadata.
    pub fn bare(data: Value) -> Self {
        Self {
            data,
            modified: None,
            source: None,
        }
    }

    /// Envelope recording when and by whom the value was written.
    pub fn with_metadata(data: Value, modified: i64, source: Option<String>) -> Self {
        Self {
            data,
            modified: Some(modified),
            source,
        }
    }

    /// Serialize to the at-rest JSON form.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse the at-rest JSON form.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// The envelope as a JSON value, as returned to callers asking for metadata.
    pub fn to_value(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert("_d".to_string(), self.data.clone());
        if let Some(modified) = self.modified {
            map.insert("modified".to_string(), Value::from(modified));
        }
        if let Some(source) = &self.source {
            map.insert("source".to_string(), Value::from(source.clone()));
        }
        Value::Object(map)
    }
}
