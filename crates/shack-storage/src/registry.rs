//! Api key to storage lookup.
//!
//! The registry never owns a storage: entries are weak handles, and the
//! manager that created a storage is its sole owner. Managers prune their
//! entries on delete, purge and cache clears; an entry whose storage has
//! been dropped simply stops resolving.

use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::error::{StorageError, StorageResult};
use crate::storage::Storage;

/// Concurrent map from api key to a live storage.
#[derive(Debug, Default)]
pub struct ApiKeyRegistry {
    entries: DashMap<String, Weak<Storage>>,
}

impl ApiKeyRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `storage` under its api key.
    ///
    /// Re-registering the same storage is a no-op. Fails with `Conflict` if
    /// a different live storage already holds the key.
    pub fn add(&self, storage: &Arc<Storage>) -> StorageResult<()> {
        let api_key = storage.api_key();
        match self.entries.entry(api_key.clone()) {
            Entry::Occupied(mut occupied) => {
                if let Some(existing) = occupied.get().upgrade() {
                    if !Arc::ptr_eq(&existing, storage) && existing.id() != storage.id() {
                        return Err(StorageError::Conflict(format!(
                            "api key of storage {} is already bound to storage {}",
                            storage.id(),
                            existing.id()
                        )));
                    }
                }
                occupied.insert(Arc::downgrade(storage));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::downgrade(storage));
            }
        }
        debug!(storage_id = %storage.id(), "Registered api key");
        Ok(())
    }

    /// Drop the entry for `api_key`.
    pub fn remove(&self, api_key: &str) {
        self.entries.remove(api_key);
    }

    /// Live storage registered under `api_key`.
    pub fn get(&self, api_key: &str) -> Option<Arc<Storage>> {
        let storage = self.entries.get(api_key)?.upgrade();
        if storage.is_none() {
            self.entries.remove_if(api_key, |_, weak| weak.strong_count() == 0);
        }
        storage
    }

    /// Number of entries, including ones whose storage is gone.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry.
    pub fn purge(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{Drivers, MemoryDrivers, MemoryStore};
    use crate::storage::StorageConfig;

    fn open(store: &MemoryStore, id: &str) -> Arc<Storage> {
        let drivers: Arc<dyn Drivers> = Arc::new(MemoryDrivers::new(store.clone()));
        Arc::new(Storage::open(id, format!("root/{id}"), StorageConfig::new(drivers)).unwrap())
    }

    #[test]
    fn test_add_get_remove() {
        let store = MemoryStore::new();
        let registry = ApiKeyRegistry::new();
        let storage = open(&store, "s1");

        registry.add(&storage).unwrap();
        registry.add(&storage).unwrap();
        let found = registry.get(&storage.api_key()).unwrap();
        assert!(Arc::ptr_eq(&found, &storage));

        registry.remove(&storage.api_key());
        assert!(registry.get(&storage.api_key()).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_collision_with_other_storage() {
        let store = MemoryStore::new();
        let registry = ApiKeyRegistry::new();
        let first = open(&store, "s1");
        registry.add(&first).unwrap();

        // s2 carries a copy of s1's tokens.
        let metadata = first.metadata().to_json().unwrap();
        MemoryDrivers::new(store.clone())
            .set(std::path::Path::new("root/s2/metadata.json"), &metadata)
            .await
            .unwrap();
        let second = open(&store, "s2");

        assert_eq!(second.api_key(), first.api_key());
        assert!(matches!(
            registry.add(&second).unwrap_err(),
            StorageError::Conflict(_)
        ));
    }

    #[test]
    fn test_dead_entries_stop_resolving() {
        let store = MemoryStore::new();
        let registry = ApiKeyRegistry::new();
        let storage = open(&store, "s1");
        let api_key = storage.api_key();
        registry.add(&storage).unwrap();

        drop(storage);
        assert!(registry.get(&api_key).is_none());
        assert!(registry.is_empty());

        let replacement = open(&store, "s3");
        registry.add(&replacement).unwrap();
        registry.purge();
        assert_eq!(registry.len(), 0);
    }
}
