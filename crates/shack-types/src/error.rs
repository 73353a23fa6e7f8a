//! Error types for shared ShackDB types.

use thiserror::Error;

/// Errors raised while building configuration-derived types.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Settings could not be loaded or deserialized
    #[error("Configuration error: {0}")]
    Load(String),

    /// Policies map contained a key that is not a known quota dimension
    #[error("Invalid policies key: {0}")]
    UnknownPolicyKey(String),

    /// Policies map named one quota dimension more than once
    #[error("Duplicate policies key: {0}")]
    DuplicatePolicyKey(String),

    /// Cache bounds are inconsistent
    #[error("Invalid cache configuration: {0}")]
    InvalidCache(String),

    /// A storage type references a policy, cache or type that does not exist
    #[error("Unknown {kind} '{name}'")]
    UnknownReference {
        /// What was referenced ("policy", "cache", "storage type")
        kind: &'static str,
        /// The missing name
        name: String,
    },
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::Load(err.to_string())
    }
}
