//! # shack-types
//!
//! Shared domain types for the ShackDB storage engine.
//!
//! This crate defines the I/O-free pieces used throughout the system:
//! - Id validation: which strings may name a storage or a key
//! - Policies: per-storage-type quotas
//! - Metadata: the persisted access tokens of a storage and the
//!   at-rest envelope wrapping every stored value
//! - Settings: layered configuration
//!
//! ## Usage
//!
//! ```rust
//! use shack_types::is_valid_id;
//!
//! assert!(is_valid_id("profile"));
//! assert!(!is_valid_id("../etc"));
//! ```

pub mod config;
pub mod error;
pub mod id;
pub mod metadata;
pub mod policies;

pub use config::{
    CacheConfig, CacheKind, DriverKind, Settings, StorageSettings, StorageTypeConfig,
};
pub use error::ConfigError;
pub use id::is_valid_id;
pub use metadata::{StorageMetadata, StoredValue};
pub use policies::{Policies, POLICY_KEYS};
