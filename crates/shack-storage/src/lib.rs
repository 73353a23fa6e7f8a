//! Storage engine for ShackDB.
//!
//! Provides multi-tenant key-value storages with:
//! - Pluggable persistence: memory, filesystem, batched filesystem
//! - Per storage-type quotas enforced before any write
//! - Optional bounded read cache with random eviction
//! - Access tokens (api/secret/readonly) persisted per storage
//! - Api key lookup of live storages across managers
//!
//! ## Usage
//!
//! ```rust,no_run
//! use shack_storage::StorageCatalog;
//! use shack_types::Settings;
//!
//! # async fn demo() -> Result<(), shack_storage::StorageError> {
//! let settings = Settings::default();
//! let catalog = StorageCatalog::from_settings(&settings)?;
//! let manager = catalog.manager(settings.owner_root("alice"), Some("memory"))?;
//!
//! let storage = manager.create("profile").await?;
//! storage.set("name", serde_json::json!("Alice"), Some("docs")).await?;
//! assert_eq!(storage.get("name").await?, serde_json::json!("Alice"));
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod catalog;
pub mod drivers;
pub mod error;
pub mod manager;
pub mod registry;
pub mod storage;

pub use cache::{Cache, CacheFactory, DictionaryCache};
pub use catalog::{StorageCatalog, StorageTypeInfo};
pub use drivers::{
    CachedFilesystemDrivers, Drivers, DriversFactory, FilesystemDrivers, MemoryDrivers,
    MemoryStore,
};
pub use error::{StorageError, StorageResult};
pub use manager::{ManagerConfig, StoragesManager};
pub use registry::ApiKeyRegistry;
pub use storage::{AccessLevel, Storage, StorageConfig, StorageStats};
