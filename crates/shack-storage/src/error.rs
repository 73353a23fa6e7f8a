//! Storage layer error types.

use std::io;
use std::path::Path;

use shack_types::ConfigError;
use thiserror::Error;

/// Result alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in the storage layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// Bad storage id or key
    #[error("Invalid id: {0}")]
    InvalidId(String),

    /// Key, path or storage is absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate create or api key collision
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A quota would be exceeded; nothing was written
    #[error("Policy validation error: {0}")]
    PolicyViolation(String),

    /// Presented access keys do not grant the requested access
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Value has the wrong shape for the requested operation
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// Persisted storage metadata exists but cannot be parsed
    #[error("Corrupted storage metadata at {path}: {reason}")]
    DataCorruption {
        /// Location of the unreadable entry
        path: String,
        /// Parser message
        reason: String,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Backing medium failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Storage type or cache configuration is unusable
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl StorageError {
    /// True for errors meaning "absent", which callers may recover from.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    /// Map an I/O error on `path`, turning a missing entry into `NotFound`.
    pub(crate) fn from_io(path: &Path, err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            StorageError::NotFound(path.display().to_string())
        } else {
            StorageError::Io(err)
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
