//! Persistence backends.
//!
//! Every backend implements [`Drivers`], a small path-keyed interface over
//! a hierarchical namespace: directories hold children, leaves hold string
//! payloads. Storages never talk to a medium directly; they hold an
//! `Arc<dyn Drivers>` built by a [`DriversFactory`] for their storage type.
//!
//! | Kind | Persistent | Writes |
//! |------|------------|--------|
//! | [`MemoryDrivers`] | no | immediate, shared in-process store |
//! | [`FilesystemDrivers`] | yes | one file per key, durable on return |
//! | [`CachedFilesystemDrivers`] | yes | batched, flushed on timer or `flush()` |

mod cached;
mod filesystem;
mod memory;

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use shack_types::DriverKind;

use crate::error::StorageResult;

pub use cached::CachedFilesystemDrivers;
pub use filesystem::FilesystemDrivers;
pub use memory::{MemoryDrivers, MemoryStore};

/// Data access layer behind a storage.
///
/// Paths are opaque hierarchical locations. `get`, `delete` and
/// `total_size_bytes` fail with `NotFound` on a missing path; `exist` never
/// fails. Medium failures surface as `StorageError::Io` and are not retried.
#[async_trait]
pub trait Drivers: Send + Sync + fmt::Debug {
    /// Which backend this is.
    fn kind(&self) -> DriverKind;

    /// Whether data survives a process restart.
    fn persistent(&self) -> bool;

    /// Number of writes accepted but not yet durable.
    fn pending_changes(&self) -> usize;

    /// Commit pending writes, if any.
    async fn flush(&self) -> StorageResult<()>;

    /// Read the payload at `path`.
    async fn get(&self, path: &Path) -> StorageResult<String>;

    /// Blocking equivalent of [`Drivers::get`].
    fn get_sync(&self, path: &Path) -> StorageResult<String>;

    /// Upsert the payload at `path`. May be batched.
    async fn set(&self, path: &Path, data: &str) -> StorageResult<()>;

    /// Upsert bypassing any batching; durable when this returns.
    async fn set_immediate(&self, path: &Path, data: &str) -> StorageResult<()>;

    /// Remove the entry (leaf or subtree) at `path`.
    async fn delete(&self, path: &Path) -> StorageResult<()>;

    /// Whether anything exists at `path`.
    async fn exist(&self, path: &Path) -> bool;

    /// Names of the children directly under `path`.
    async fn list(&self, path: &Path) -> StorageResult<Vec<String>>;

    /// Recursively delete everything under `path`, leaving it empty.
    async fn purge(&self, path: &Path) -> StorageResult<()>;

    /// Ensure a container exists at `path`.
    async fn init(&self, path: &Path) -> StorageResult<()>;

    /// Blocking equivalent of [`Drivers::init`].
    fn init_sync(&self, path: &Path) -> StorageResult<()>;

    /// Sum of payload lengths plus child name lengths directly under `path`.
    async fn total_size_bytes(&self, path: &Path) -> StorageResult<u64>;
}

/// Builds drivers of one kind for a storage type.
///
/// All memory drivers built by the same factory (and its clones) share one
/// [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct DriversFactory {
    kind: DriverKind,
    flush_interval: Duration,
    memory_store: MemoryStore,
}

impl DriversFactory {
    /// Create a factory. `flush_interval` only applies to cached drivers.
    pub fn new(kind: DriverKind, flush_interval: Duration, memory_store: MemoryStore) -> Self {
        Self {
            kind,
            flush_interval,
            memory_store,
        }
    }

    /// Backend kind this factory builds.
    pub fn kind(&self) -> DriverKind {
        self.kind
    }

    /// Build a fresh drivers instance.
    pub fn build(&self) -> Arc<dyn Drivers> {
        match self.kind {
            DriverKind::Memory => Arc::new(MemoryDrivers::new(self.memory_store.clone())),
            DriverKind::Filesystem => Arc::new(FilesystemDrivers::new()),
            DriverKind::CachedFilesystem => {
                Arc::new(CachedFilesystemDrivers::new(self.flush_interval))
            }
        }
    }
}

/// Final component of `path` as an owned string.
pub(crate) fn base_name(path: &Path) -> Option<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
}
