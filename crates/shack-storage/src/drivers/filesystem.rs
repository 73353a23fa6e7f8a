//! Filesystem drivers: one directory per container, one file per value.

use std::path::Path;

use async_trait::async_trait;
use shack_types::DriverKind;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::Drivers;
use crate::error::{StorageError, StorageResult};

/// Drivers writing straight to the local filesystem.
///
/// Every write is synced before returning, so there is never anything
/// pending.
#[derive(Debug, Clone, Default)]
pub struct FilesystemDrivers;

impl FilesystemDrivers {
    /// Create filesystem drivers.
    pub fn new() -> Self {
        Self
    }

    /// Name and byte length of every file directly under `path`.
    pub(crate) async fn entry_sizes(&self, path: &Path) -> StorageResult<Vec<(String, u64)>> {
        let mut entries = tokio::fs::read_dir(path)
            .await
            .map_err(|e| StorageError::from_io(path, e))?;
        let mut sizes = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if metadata.is_file() {
                sizes.push((
                    entry.file_name().to_string_lossy().into_owned(),
                    metadata.len(),
                ));
            }
        }
        Ok(sizes)
    }
}

#[async_trait]
impl Drivers for FilesystemDrivers {
    fn kind(&self) -> DriverKind {
        DriverKind::Filesystem
    }

    fn persistent(&self) -> bool {
        true
    }

    fn pending_changes(&self) -> usize {
        0
    }

    async fn flush(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn get(&self, path: &Path) -> StorageResult<String> {
        tokio::fs::read_to_string(path)
            .await
            .map_err(|e| StorageError::from_io(path, e))
    }

    fn get_sync(&self, path: &Path) -> StorageResult<String> {
        std::fs::read_to_string(path).map_err(|e| StorageError::from_io(path, e))
    }

    async fn set(&self, path: &Path, data: &str) -> StorageResult<()> {
        let mut file = tokio::fs::File::create(path)
            .await
            .map_err(|e| StorageError::from_io(path, e))?;
        file.write_all(data.as_bytes()).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn set_immediate(&self, path: &Path, data: &str) -> StorageResult<()> {
        self.set(path, data).await
    }

    async fn delete(&self, path: &Path) -> StorageResult<()> {
        let metadata = tokio::fs::symlink_metadata(path)
            .await
            .map_err(|e| StorageError::from_io(path, e))?;
        let removed = if metadata.is_dir() {
            tokio::fs::remove_dir_all(path).await
        } else {
            tokio::fs::remove_file(path).await
        };
        removed.map_err(|e| StorageError::from_io(path, e))
    }

    async fn exist(&self, path: &Path) -> bool {
        tokio::fs::symlink_metadata(path).await.is_ok()
    }

    async fn list(&self, path: &Path) -> StorageResult<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    async fn purge(&self, path: &Path) -> StorageResult<()> {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(path).await?;
        debug!(path = %path.display(), "Purged directory");
        Ok(())
    }

    async fn init(&self, path: &Path) -> StorageResult<()> {
        tokio::fs::create_dir_all(path).await?;
        Ok(())
    }

    fn init_sync(&self, path: &Path) -> StorageResult<()> {
        if !path.exists() {
            std::fs::create_dir_all(path)?;
            debug!(path = %path.display(), "Created directory");
        }
        Ok(())
    }

    async fn total_size_bytes(&self, path: &Path) -> StorageResult<u64> {
        Ok(self
            .entry_sizes(path)
            .await?
            .iter()
            .map(|(name, len)| len + name.len() as u64)
            .sum())
    }
}
