//! Storage types resolved from settings.
//!
//! The catalog turns the named storage types, policies and caches of
//! [`Settings`] into factories, once, and hands out managers built from
//! them. There is at most one manager per (owner root, storage type), so
//! every caller sees the same resident storages. All managers of one
//! catalog share its api key registry and its memory store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use shack_types::{ConfigError, DriverKind, Policies, Settings};
use tracing::debug;

use crate::cache::CacheFactory;
use crate::drivers::{DriversFactory, MemoryStore};
use crate::error::StorageResult;
use crate::manager::{ManagerConfig, StoragesManager};
use crate::registry::ApiKeyRegistry;

/// Operator-facing description of a storage type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageTypeInfo {
    pub name: String,
    pub drivers: DriverKind,
    pub description: &'static str,
    pub persistent: bool,
    pub policy: Option<String>,
    pub policies: Policies,
    pub cache: Option<String>,
}

#[derive(Debug, Clone)]
struct ResolvedType {
    info: StorageTypeInfo,
    manager: ManagerConfig,
}

/// Registry of configured storage types.
#[derive(Debug)]
pub struct StorageCatalog {
    default_type: String,
    types: BTreeMap<String, ResolvedType>,
    registry: Arc<ApiKeyRegistry>,
    managers: DashMap<(PathBuf, String), Arc<StoragesManager>>,
}

impl StorageCatalog {
    /// Build a catalog with a fresh memory store.
    pub fn from_settings(settings: &Settings) -> StorageResult<Self> {
        Self::with_memory_store(settings, MemoryStore::new())
    }

    /// Build a catalog whose memory drivers use `memory_store`.
    ///
    /// Fails when a storage type references an unknown policy or cache, or
    /// a cache has inconsistent bounds.
    pub fn with_memory_store(settings: &Settings, memory_store: MemoryStore) -> StorageResult<Self> {
        settings.validate()?;
        let soft_cache_window = Duration::from_secs(settings.storage.soft_cache_secs);

        let mut types = BTreeMap::new();
        for (name, type_config) in &settings.storage_types {
            let policies = match &type_config.policy {
                Some(policy) => settings.policies.get(policy).cloned().ok_or_else(|| {
                    ConfigError::UnknownReference {
                        kind: "policy",
                        name: policy.clone(),
                    }
                })?,
                None => Policies::unlimited(),
            };
            let cache = match &type_config.cache {
                Some(cache) => {
                    let config = settings.caches.get(cache).cloned().ok_or_else(|| {
                        ConfigError::UnknownReference {
                            kind: "cache",
                            name: cache.clone(),
                        }
                    })?;
                    Some(CacheFactory::new(config)?)
                }
                None => None,
            };
            let drivers = DriversFactory::new(
                type_config.drivers,
                Duration::from_secs(type_config.flush_interval_secs),
                memory_store.clone(),
            );

            let info = StorageTypeInfo {
                name: name.clone(),
                drivers: type_config.drivers,
                description: type_config.drivers.description(),
                persistent: type_config.drivers != DriverKind::Memory,
                policy: type_config.policy.clone(),
                policies: policies.clone(),
                cache: type_config.cache.clone(),
            };
            let manager = ManagerConfig {
                storage_type: name.clone(),
                drivers,
                policies: Arc::new(policies),
                cache,
                keep_metadata: settings.storage.keep_metadata,
                soft_cache_window,
            };
            debug!(storage_type = %name, drivers = %type_config.drivers, "Resolved storage type");
            types.insert(name.clone(), ResolvedType { info, manager });
        }

        Ok(Self {
            default_type: settings.default_storage_type.clone(),
            types,
            registry: Arc::new(ApiKeyRegistry::new()),
            managers: DashMap::new(),
        })
    }

    /// Names of every configured storage type.
    pub fn storage_types(&self) -> Vec<String> {
        self.types.keys().cloned().collect()
    }

    pub fn default_type(&self) -> &str {
        &self.default_type
    }

    /// Api key registry shared by every manager of this catalog.
    pub fn registry(&self) -> &Arc<ApiKeyRegistry> {
        &self.registry
    }

    fn resolve(&self, storage_type: Option<&str>) -> StorageResult<(&str, &ResolvedType)> {
        let name = storage_type.unwrap_or(&self.default_type);
        self.types
            .get_key_value(name)
            .map(|(name, resolved)| (name.as_str(), resolved))
            .ok_or_else(|| {
                ConfigError::UnknownReference {
                    kind: "storage type",
                    name: name.to_string(),
                }
                .into()
            })
    }

    /// Describe a storage type; the default type when `None`.
    pub fn describe(&self, storage_type: Option<&str>) -> StorageResult<StorageTypeInfo> {
        Ok(self.resolve(storage_type)?.1.info.clone())
    }

    /// Manager for `owner_root` and a storage type (the default type when
    /// `None`). Built on first use and shared afterwards.
    pub fn manager(
        &self,
        owner_root: impl AsRef<Path>,
        storage_type: Option<&str>,
    ) -> StorageResult<Arc<StoragesManager>> {
        let (name, resolved) = self.resolve(storage_type)?;
        let owner_root = owner_root.as_ref();
        match self.managers.entry((owner_root.to_path_buf(), name.to_string())) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let manager = Arc::new(StoragesManager::new(
                    owner_root,
                    resolved.manager.clone(),
                    Arc::clone(&self.registry),
                )?);
                entry.insert(Arc::clone(&manager));
                Ok(manager)
            }
        }
    }

    /// Number of managers built so far.
    pub fn manager_count(&self) -> usize {
        self.managers.len()
    }
}
