//! Owner of the storages of one (owner root, storage type) pair.
//!
//! Storages live at `<owner_root>/<storage_type>/<storage_id>/`. The
//! manager keeps opened storages resident and registered in the api key
//! registry until they are deleted, purged or the residency cache is
//! cleared. Residency is a memo: the drivers remain the source of truth.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use shack_types::{is_valid_id, Policies};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::CacheFactory;
use crate::drivers::{Drivers, DriversFactory, FilesystemDrivers};
use crate::error::{StorageError, StorageResult};
use crate::registry::ApiKeyRegistry;
use crate::storage::{Storage, StorageConfig, DEFAULT_SOFT_CACHE_WINDOW};

/// What a manager needs to build the storages of its type.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub storage_type: String,
    pub drivers: DriversFactory,
    pub policies: Arc<Policies>,
    pub cache: Option<CacheFactory>,
    pub keep_metadata: bool,
    pub soft_cache_window: Duration,
}

impl ManagerConfig {
    /// Unconstrained, uncached storage type.
    pub fn new(storage_type: impl Into<String>, drivers: DriversFactory) -> Self {
        Self {
            storage_type: storage_type.into(),
            drivers,
            policies: Arc::new(Policies::unlimited()),
            cache: None,
            keep_metadata: true,
            soft_cache_window: DEFAULT_SOFT_CACHE_WINDOW,
        }
    }
}

/// Creates, resolves and removes the storages of one type for one owner.
#[derive(Debug)]
pub struct StoragesManager {
    config: ManagerConfig,
    root: PathBuf,
    drivers: Arc<dyn Drivers>,
    /// Persistent record of storage ids when the drivers are not persistent
    shadow: Option<Arc<dyn Drivers>>,
    registry: Arc<ApiKeyRegistry>,
    storages: Mutex<HashMap<String, Arc<Storage>>>,
}

type Residents = HashMap<String, Arc<Storage>>;

impl StoragesManager {
    /// Create a manager rooted at `<owner_root>/<storage_type>`.
    pub fn new(
        owner_root: impl AsRef<Path>,
        config: ManagerConfig,
        registry: Arc<ApiKeyRegistry>,
    ) -> StorageResult<Self> {
        let root = owner_root.as_ref().join(&config.storage_type);
        let drivers = config.drivers.build();
        drivers.init_sync(&root)?;

        let shadow = if drivers.persistent() {
            None
        } else {
            let shadow: Arc<dyn Drivers> = Arc::new(FilesystemDrivers::new());
            shadow.init_sync(&root)?;
            Some(shadow)
        };

        info!(
            storage_type = %config.storage_type,
            drivers = %config.drivers.kind(),
            root = %root.display(),
            "Created storages manager"
        );
        Ok(Self {
            config,
            root,
            drivers,
            shadow,
            registry,
            storages: Mutex::new(HashMap::new()),
        })
    }

    pub fn storage_type(&self) -> &str {
        &self.config.storage_type
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn policies(&self) -> &Policies {
        &self.config.policies
    }

    /// Whether storage data survives a restart.
    pub fn persistent(&self) -> bool {
        self.drivers.persistent()
    }

    /// Drivers recording which storage ids exist.
    fn id_drivers(&self) -> &Arc<dyn Drivers> {
        self.shadow.as_ref().unwrap_or(&self.drivers)
    }

    fn validate_id(id: &str) -> StorageResult<()> {
        if is_valid_id(id) {
            Ok(())
        } else {
            Err(StorageError::InvalidId(id.to_string()))
        }
    }

    fn open_storage(&self, id: &str) -> StorageResult<Storage> {
        let cache = match &self.config.cache {
            Some(factory) => Some(factory.build()?),
            None => None,
        };
        let config = StorageConfig {
            drivers: self.config.drivers.build(),
            metadata_drivers: self.shadow.clone(),
            policies: Arc::clone(&self.config.policies),
            cache,
            keep_metadata: self.config.keep_metadata,
            soft_cache_window: self.config.soft_cache_window,
        };
        Storage::open(id, self.root.join(id), config)
    }

    async fn exists_on_disk(&self, id: &str) -> bool {
        self.id_drivers().exist(&self.root.join(id)).await
    }

    async fn load(&self, residents: &mut Residents, id: &str) -> StorageResult<Option<Arc<Storage>>> {
        if let Some(storage) = residents.get(id) {
            return Ok(Some(Arc::clone(storage)));
        }
        if !self.exists_on_disk(id).await {
            return Ok(None);
        }
        let storage = Arc::new(self.open_storage(id)?);
        self.registry.add(&storage)?;
        residents.insert(id.to_string(), Arc::clone(&storage));
        debug!(storage_id = %id, "Loaded storage");
        Ok(Some(storage))
    }

    async fn create_new(&self, residents: &mut Residents, id: &str) -> StorageResult<Arc<Storage>> {
        let storage = Arc::new(self.open_storage(id)?);
        storage.save_metadata().await?;
        self.registry.add(&storage)?;
        residents.insert(id.to_string(), Arc::clone(&storage));
        info!(storage_id = %id, storage_type = %self.config.storage_type, "Created storage");
        Ok(storage)
    }

    /// Resolve an existing storage.
    pub async fn get(&self, id: &str) -> StorageResult<Arc<Storage>> {
        Self::validate_id(id)?;
        let mut residents = self.storages.lock().await;
        self.load(&mut residents, id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("storage {id}")))
    }

    /// Create a new storage with fresh access keys.
    pub async fn create(&self, id: &str) -> StorageResult<Arc<Storage>> {
        Self::validate_id(id)?;
        let mut residents = self.storages.lock().await;
        if residents.contains_key(id) || self.exists_on_disk(id).await {
            return Err(StorageError::Conflict(format!("storage {id} already exists")));
        }
        self.create_new(&mut residents, id).await
    }

    /// Resolve a storage, creating it when missing. The flag is true when
    /// the storage was created.
    pub async fn get_or_create(&self, id: &str) -> StorageResult<(Arc<Storage>, bool)> {
        Self::validate_id(id)?;
        let mut residents = self.storages.lock().await;
        match self.load(&mut residents, id).await? {
            Some(storage) => Ok((storage, false)),
            None => Ok((self.create_new(&mut residents, id).await?, true)),
        }
    }

    /// Whether a storage with this id exists.
    pub async fn exist(&self, id: &str) -> bool {
        if !is_valid_id(id) {
            return false;
        }
        if self.storages.lock().await.contains_key(id) {
            return true;
        }
        self.exists_on_disk(id).await
    }

    /// Sorted ids of every storage of this type.
    pub async fn list(&self) -> StorageResult<Vec<String>> {
        let mut ids: Vec<String> = self
            .id_drivers()
            .list(&self.root)
            .await?
            .into_iter()
            .filter(|name| is_valid_id(name))
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn remove_root(&self, drivers: &Arc<dyn Drivers>, path: &Path) -> StorageResult<()> {
        match drivers.delete(path).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    /// Delete a storage and all of its data.
    ///
    /// A storage that is not resident is removed without being opened, so
    /// storages with unreadable metadata can still be deleted.
    pub async fn delete(&self, id: &str) -> StorageResult<()> {
        Self::validate_id(id)?;
        let mut residents = self.storages.lock().await;
        if let Some(storage) = residents.remove(id) {
            self.registry.remove(&storage.api_key());
            storage.purge().await?;
        } else if !self.exists_on_disk(id).await {
            return Err(StorageError::NotFound(format!("storage {id}")));
        }

        let path = self.root.join(id);
        self.remove_root(&self.drivers, &path).await?;
        if let Some(shadow) = &self.shadow {
            self.remove_root(shadow, &path).await?;
        }
        self.drivers.flush().await?;
        info!(storage_id = %id, storage_type = %self.config.storage_type, "Deleted storage");
        Ok(())
    }

    /// Delete every storage of this type.
    pub async fn purge(&self) -> StorageResult<()> {
        let mut residents = self.storages.lock().await;
        for (_, storage) in residents.drain() {
            self.registry.remove(&storage.api_key());
            storage.purge().await?;
        }
        self.drivers.purge(&self.root).await?;
        if let Some(shadow) = &self.shadow {
            shadow.purge(&self.root).await?;
        }
        self.drivers.init(&self.root).await?;
        self.drivers.flush().await?;
        info!(storage_type = %self.config.storage_type, "Purged all storages");
        Ok(())
    }

    /// Flush and drop every resident storage. Persisted data is untouched.
    ///
    /// Every storage is dropped even when a flush fails; the first failure
    /// is returned.
    pub async fn clear_cache(&self) -> StorageResult<()> {
        let mut residents = self.storages.lock().await;
        let mut result = Ok(());
        for (id, storage) in residents.drain() {
            if let Err(e) = storage.flush().await {
                warn!(storage_id = %id, error = %e, "Failed to flush storage while clearing cache");
                if result.is_ok() {
                    result = Err(e);
                }
            }
            self.registry.remove(&storage.api_key());
        }
        debug!(storage_type = %self.config.storage_type, "Cleared storage cache");
        result
    }

    /// Flush every resident storage and the manager's own drivers.
    ///
    /// Returns the number of storages flushed.
    pub async fn flush_all(&self) -> StorageResult<usize> {
        let residents = self.storages.lock().await;
        for storage in residents.values() {
            storage.flush().await?;
        }
        self.drivers.flush().await?;
        Ok(residents.len())
    }

    /// Writes accepted but not yet durable, across resident storages.
    pub async fn pending_changes(&self) -> usize {
        let residents = self.storages.lock().await;
        residents
            .values()
            .map(|storage| storage.pending_changes())
            .sum::<usize>()
            + self.drivers.pending_changes()
    }

    /// Number of storages currently resident.
    pub async fn resident_count(&self) -> usize {
        self.storages.lock().await.len()
    }
}
