//! A single key-value namespace.
//!
//! On disk a storage is a root holding `data/` (one entry per key) and
//! `metadata.json` (api/secret/readonly tokens plus a version counter).
//!
//! All data operations run under one async mutex per storage. Quota checks
//! read the current key set and size before writing, and the lock makes that
//! check-then-write sequence atomic with respect to other callers.
//!
//! Key count and total size are "soft facts": memoized for a freshness
//! window, patched on every local mutation, recomputed from the drivers once
//! the window has passed.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use std::time::Duration;

use serde_json::{Map, Value};
use shack_types::{is_valid_id, Policies, StorageMetadata, StoredValue};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::cache::Cache;
use crate::drivers::Drivers;
use crate::error::{StorageError, StorageResult};

const DATA_DIR: &str = "data";
const METADATA_FILE: &str = "metadata.json";

/// Default freshness window of the soft size and key facts.
pub const DEFAULT_SOFT_CACHE_WINDOW: Duration = Duration::from_secs(30);

/// Access granted by a presented key pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessLevel {
    /// Secret key matched
    ReadWrite,
    /// Only the readonly key matched
    ReadOnly,
}

/// Point-in-time usage figures of a storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageStats {
    pub keys: usize,
    pub size_bytes: u64,
    pub pending_changes: usize,
    pub cached_keys: usize,
}

/// Everything a storage needs besides its id and root.
#[derive(Debug)]
pub struct StorageConfig {
    /// Drivers holding the data
    pub drivers: Arc<dyn Drivers>,
    /// Drivers holding `metadata.json`; the data drivers when `None`
    pub metadata_drivers: Option<Arc<dyn Drivers>>,
    pub policies: Arc<Policies>,
    pub cache: Option<Box<dyn Cache>>,
    /// Record `modified` and `source` in every envelope
    pub keep_metadata: bool,
    pub soft_cache_window: Duration,
}

impl StorageConfig {
    /// Unconstrained, uncached storage over `drivers`.
    pub fn new(drivers: Arc<dyn Drivers>) -> Self {
        Self {
            drivers,
            metadata_drivers: None,
            policies: Arc::new(Policies::unlimited()),
            cache: None,
            keep_metadata: true,
            soft_cache_window: DEFAULT_SOFT_CACHE_WINDOW,
        }
    }
}

#[derive(Debug)]
struct SoftFact<T> {
    value: T,
    refreshed: Instant,
}

impl<T> SoftFact<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            refreshed: Instant::now(),
        }
    }

    fn is_fresh(&self, window: Duration) -> bool {
        self.refreshed.elapsed() < window
    }
}

#[derive(Debug)]
struct StorageState {
    cache: Option<Box<dyn Cache>>,
    size: Option<SoftFact<u64>>,
    keys: Option<SoftFact<BTreeSet<String>>>,
}

/// One named key-value namespace.
#[derive(Debug)]
pub struct Storage {
    id: String,
    root: PathBuf,
    data_path: PathBuf,
    metadata_path: PathBuf,
    drivers: Arc<dyn Drivers>,
    metadata_drivers: Arc<dyn Drivers>,
    policies: Arc<Policies>,
    keep_metadata: bool,
    soft_cache_window: Duration,
    state: Mutex<StorageState>,
    metadata: RwLock<StorageMetadata>,
}

fn generate_token() -> String {
    Uuid::new_v4().simple().to_string()
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Storage {
    /// Open the storage rooted at `root`, creating its data container.
    ///
    /// Existing metadata is loaded; when none exists fresh tokens are
    /// generated at version 1 (call [`Storage::save_metadata`] to persist
    /// them). Metadata that exists but cannot be parsed is an error.
    pub fn open(id: &str, root: impl Into<PathBuf>, config: StorageConfig) -> StorageResult<Self> {
        if !is_valid_id(id) {
            return Err(StorageError::InvalidId(id.to_string()));
        }
        let root = root.into();
        let data_path = root.join(DATA_DIR);
        let metadata_path = root.join(METADATA_FILE);
        let metadata_drivers = config
            .metadata_drivers
            .unwrap_or_else(|| Arc::clone(&config.drivers));

        config.drivers.init_sync(&data_path)?;
        if !Arc::ptr_eq(&metadata_drivers, &config.drivers) {
            metadata_drivers.init_sync(&root)?;
        }

        let metadata = match metadata_drivers.get_sync(&metadata_path) {
            Ok(text) => StorageMetadata::from_json(&text).map_err(|e| {
                error!(storage_id = %id, error = %e, "Storage metadata is corrupted");
                StorageError::DataCorruption {
                    path: metadata_path.display().to_string(),
                    reason: e.to_string(),
                }
            })?,
            Err(e) if e.is_not_found() => {
                StorageMetadata::new(generate_token(), generate_token(), generate_token())
            }
            Err(e) => return Err(e),
        };

        debug!(storage_id = %id, version = metadata.version, "Opened storage");
        Ok(Self {
            id: id.to_string(),
            root,
            data_path,
            metadata_path,
            drivers: config.drivers,
            metadata_drivers,
            policies: config.policies,
            keep_metadata: config.keep_metadata,
            soft_cache_window: config.soft_cache_window,
            state: Mutex::new(StorageState {
                cache: config.cache,
                size: None,
                keys: None,
            }),
            metadata: RwLock::new(metadata),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn policies(&self) -> &Policies {
        &self.policies
    }

    /// Whether the data drivers survive a restart.
    pub fn persistent(&self) -> bool {
        self.drivers.persistent()
    }

    fn read_metadata(&self) -> RwLockReadGuard<'_, StorageMetadata> {
        self.metadata.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the current metadata.
    pub fn metadata(&self) -> StorageMetadata {
        self.read_metadata().clone()
    }

    pub fn metadata_version(&self) -> u64 {
        self.read_metadata().version
    }

    pub fn api_key(&self) -> String {
        self.read_metadata().api_key.clone()
    }

    pub fn secret_key(&self) -> String {
        self.read_metadata().secret_key.clone()
    }

    pub fn readonly_key(&self) -> String {
        self.read_metadata().readonly_key.clone()
    }

    /// Persist the current metadata, bypassing write batching.
    pub async fn save_metadata(&self) -> StorageResult<()> {
        let text = self.read_metadata().to_json()?;
        self.metadata_drivers
            .set_immediate(&self.metadata_path, &text)
            .await
    }

    /// Replace the secret key and return the new one.
    pub async fn generate_secret_key(&self) -> StorageResult<String> {
        self.rotate(|metadata| &mut metadata.secret_key).await
    }

    /// Replace the readonly key and return the new one.
    pub async fn generate_readonly_key(&self) -> StorageResult<String> {
        self.rotate(|metadata| &mut metadata.readonly_key).await
    }

    async fn rotate(&self, field: fn(&mut StorageMetadata) -> &mut String) -> StorageResult<String> {
        let _state = self.state.lock().await;
        let mut next = self.metadata();
        let previous = field(&mut next).clone();
        let mut token = generate_token();
        while token == previous {
            token = generate_token();
        }
        *field(&mut next) = token.clone();
        next.version += 1;

        // In-memory metadata only changes once the new tokens are durable.
        self.metadata_drivers
            .set_immediate(&self.metadata_path, &next.to_json()?)
            .await?;
        let version = next.version;
        *self.metadata.write().unwrap_or_else(PoisonError::into_inner) = next;
        info!(storage_id = %self.id, version, "Rotated storage key");
        Ok(token)
    }

    /// Check a presented key pair.
    ///
    /// At least one key must be given, any key given must match, and
    /// writes require the secret key.
    pub fn authorize(
        &self,
        secret_key: Option<&str>,
        readonly_key: Option<&str>,
        write: bool,
    ) -> StorageResult<AccessLevel> {
        let metadata = self.read_metadata();
        match (secret_key, readonly_key) {
            (Some(secret), _) if secret == metadata.secret_key => Ok(AccessLevel::ReadWrite),
            (Some(_), _) => Err(StorageError::AccessDenied("invalid secret key".to_string())),
            (None, _) if write => Err(StorageError::AccessDenied(
                "secret key is required to modify a storage".to_string(),
            )),
            (None, Some(readonly)) if readonly == metadata.readonly_key => {
                Ok(AccessLevel::ReadOnly)
            }
            (None, Some(_)) => Err(StorageError::AccessDenied("invalid readonly key".to_string())),
            (None, None) => Err(StorageError::AccessDenied("missing access key".to_string())),
        }
    }

    fn validate_key(&self, key: &str) -> StorageResult<PathBuf> {
        if !is_valid_id(key) {
            return Err(StorageError::InvalidId(key.to_string()));
        }
        Ok(self.data_path.join(key))
    }

    fn envelope(&self, data: Value, source: Option<&str>) -> StoredValue {
        if self.keep_metadata {
            StoredValue::with_metadata(data, now_millis(), source.map(str::to_string))
        } else {
            StoredValue::bare(data)
        }
    }

    fn key_not_found(&self, key: &str, err: StorageError) -> StorageError {
        if err.is_not_found() {
            StorageError::NotFound(format!("key {key} in storage {}", self.id))
        } else {
            err
        }
    }

    async fn load_envelope(
        &self,
        state: &mut StorageState,
        key: &str,
        path: &Path,
    ) -> StorageResult<StoredValue> {
        if let Some(hit) = state.cache.as_ref().and_then(|cache| cache.get(key)) {
            return Ok(hit);
        }
        let text = self
            .drivers
            .get(path)
            .await
            .map_err(|e| self.key_not_found(key, e))?;
        let envelope = StoredValue::from_json(&text)
            .map_err(|e| StorageError::Serialization(format!("value of key {key}: {e}")))?;
        if let Some(cache) = state.cache.as_mut() {
            cache.set(key, envelope.clone());
        }
        Ok(envelope)
    }

    async fn current_keys<'a>(
        &self,
        state: &'a mut StorageState,
    ) -> StorageResult<&'a BTreeSet<String>> {
        let stale = !matches!(&state.keys, Some(fact) if fact.is_fresh(self.soft_cache_window));
        if stale {
            let keys = self.drivers.list(&self.data_path).await?.into_iter().collect();
            state.keys = Some(SoftFact::new(keys));
        }
        Ok(&state
            .keys
            .get_or_insert_with(|| SoftFact::new(BTreeSet::new()))
            .value)
    }

    async fn current_size(&self, state: &mut StorageState) -> StorageResult<u64> {
        match &state.size {
            Some(fact) if fact.is_fresh(self.soft_cache_window) => Ok(fact.value),
            _ => {
                let size = self.drivers.total_size_bytes(&self.data_path).await?;
                state.size = Some(SoftFact::new(size));
                Ok(size)
            }
        }
    }

    /// Size of the entry currently stored at `path`, if the soft size fact
    /// needs to be netted.
    async fn stored_entry_size(&self, state: &StorageState, key: &str, path: &Path) -> Option<u64> {
        state.size.as_ref()?;
        let text = self.drivers.get(path).await.ok()?;
        Some((key.len() + text.len()) as u64)
    }

    async fn write_envelope(
        &self,
        state: &mut StorageState,
        key: &str,
        path: &Path,
        envelope: StoredValue,
    ) -> StorageResult<()> {
        let serialized = envelope.to_json()?;
        let entry_size = (key.len() + serialized.len()) as u64;

        if let Some(max) = self.policies.max_key_length() {
            if key.chars().count() as u64 > max {
                return Err(StorageError::PolicyViolation("key is too long.".to_string()));
            }
        }
        let keys = self.current_keys(state).await?;
        let is_new = !keys.contains(key);
        if let Some(max) = self.policies.max_keys() {
            if is_new && keys.len() as u64 >= max {
                return Err(StorageError::PolicyViolation(
                    "too many keys are set.".to_string(),
                ));
            }
        }
        if let Some(max) = self.policies.max_value_size_bytes() {
            if serialized.len() as u64 > max {
                return Err(StorageError::PolicyViolation("value is too big.".to_string()));
            }
        }
        if let Some(max) = self.policies.max_size_bytes() {
            if self.current_size(state).await? + entry_size > max {
                return Err(StorageError::PolicyViolation(
                    "storage size limit exceeded.".to_string(),
                ));
            }
        }

        let previous = if is_new {
            Some(0)
        } else {
            self.stored_entry_size(state, key, path).await
        };
        self.drivers.set(path, &serialized).await?;

        let netted = match (state.size.as_mut(), previous) {
            (Some(fact), Some(previous)) => {
                fact.value = fact.value.saturating_sub(previous) + entry_size;
                true
            }
            _ => false,
        };
        if !netted {
            state.size = None;
        }
        if let Some(fact) = state.keys.as_mut() {
            fact.value.insert(key.to_string());
        }
        if let Some(cache) = state.cache.as_mut() {
            cache.set(key, envelope);
        }
        Ok(())
    }

    /// Value stored under `key`.
    pub async fn get(&self, key: &str) -> StorageResult<Value> {
        Ok(self.get_envelope(key).await?.data)
    }

    /// Value under `key` with its envelope: `{_d, modified?, source?}`.
    pub async fn get_with_metadata(&self, key: &str) -> StorageResult<Value> {
        Ok(self.get_envelope(key).await?.to_value())
    }

    async fn get_envelope(&self, key: &str) -> StorageResult<StoredValue> {
        let path = self.validate_key(key)?;
        let mut state = self.state.lock().await;
        self.load_envelope(&mut state, key, &path).await
    }

    /// Store `value` under `key`, enforcing the storage policies.
    ///
    /// Nothing is written when a policy rejects the value.
    pub async fn set(&self, key: &str, value: Value, source: Option<&str>) -> StorageResult<()> {
        let path = self.validate_key(key)?;
        let envelope = self.envelope(value, source);
        let mut state = self.state.lock().await;
        self.write_envelope(&mut state, key, &path, envelope).await
    }

    /// Shallow-merge the object `patch` into the object stored under `key`
    /// (an empty object when absent).
    ///
    /// Returns the merged value and whether the key was created.
    pub async fn update(
        &self,
        key: &str,
        patch: Value,
        source: Option<&str>,
    ) -> StorageResult<(Value, bool)> {
        let path = self.validate_key(key)?;
        let Value::Object(patch) = patch else {
            return Err(StorageError::InvalidValue(
                "update patch must be a JSON object".to_string(),
            ));
        };
        let mut state = self.state.lock().await;
        let (mut merged, created) = match self.load_envelope(&mut state, key, &path).await {
            Ok(StoredValue {
                data: Value::Object(existing),
                ..
            }) => (existing, false),
            Ok(_) => {
                return Err(StorageError::InvalidValue(format!(
                    "value of key {key} is not an object"
                )))
            }
            Err(e) if e.is_not_found() => (Map::new(), true),
            Err(e) => return Err(e),
        };
        merged.extend(patch);
        let merged = Value::Object(merged);
        let envelope = self.envelope(merged.clone(), source);
        self.write_envelope(&mut state, key, &path, envelope).await?;
        Ok((merged, created))
    }

    /// Remove `key`.
    pub async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.validate_key(key)?;
        let mut state = self.state.lock().await;
        let previous = self.stored_entry_size(&state, key, &path).await;
        self.drivers
            .delete(&path)
            .await
            .map_err(|e| self.key_not_found(key, e))?;

        let netted = match (state.size.as_mut(), previous) {
            (Some(fact), Some(previous)) => {
                fact.value = fact.value.saturating_sub(previous);
                true
            }
            _ => false,
        };
        if !netted {
            state.size = None;
        }
        if let Some(fact) = state.keys.as_mut() {
            fact.value.remove(key);
        }
        if let Some(cache) = state.cache.as_mut() {
            cache.delete(key);
        }
        Ok(())
    }

    /// Whether `key` holds a value.
    pub async fn exist(&self, key: &str) -> StorageResult<bool> {
        let path = self.validate_key(key)?;
        let state = self.state.lock().await;
        if state.cache.as_ref().is_some_and(|cache| cache.get(key).is_some()) {
            return Ok(true);
        }
        Ok(self.drivers.exist(&path).await)
    }

    /// Sorted key names. May lag behind other writers by the freshness window.
    pub async fn list(&self) -> StorageResult<Vec<String>> {
        let mut state = self.state.lock().await;
        Ok(self.current_keys(&mut state).await?.iter().cloned().collect())
    }

    /// Sum of key and envelope lengths. May lag like [`Storage::list`].
    pub async fn total_size_bytes(&self) -> StorageResult<u64> {
        let mut state = self.state.lock().await;
        self.current_size(&mut state).await
    }

    /// Remove every key. Access tokens are kept.
    pub async fn purge(&self) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        self.drivers.purge(&self.data_path).await?;
        if let Some(cache) = state.cache.as_mut() {
            cache.clear();
        }
        state.keys = Some(SoftFact::new(BTreeSet::new()));
        state.size = Some(SoftFact::new(0));
        info!(storage_id = %self.id, "Purged storage");
        Ok(())
    }

    /// Commit batched writes.
    pub async fn flush(&self) -> StorageResult<()> {
        self.drivers.flush().await?;
        if !Arc::ptr_eq(&self.drivers, &self.metadata_drivers) {
            self.metadata_drivers.flush().await?;
        }
        Ok(())
    }

    /// Writes accepted but not yet durable.
    pub fn pending_changes(&self) -> usize {
        self.drivers.pending_changes()
    }

    /// Values resident in the read cache.
    pub async fn cached_keys(&self) -> usize {
        let state = self.state.lock().await;
        state.cache.as_ref().map_or(0, |cache| cache.keys_count())
    }

    /// Usage figures for operators.
    pub async fn stats(&self) -> StorageResult<StorageStats> {
        let mut state = self.state.lock().await;
        let keys = self.current_keys(&mut state).await?.len();
        let size_bytes = self.current_size(&mut state).await?;
        Ok(StorageStats {
            keys,
            size_bytes,
            pending_changes: self.drivers.pending_changes(),
            cached_keys: state.cache.as_ref().map_or(0, |cache| cache.keys_count()),
        })
    }
}
