//! Batched filesystem drivers.
//!
//! Writes and deletes are buffered in memory and committed to disk either
//! when the flush timer fires or when [`Drivers::flush`] is called. Reads
//! see buffered changes immediately.
//!
//! ## Flush protocol
//!
//! 1. The pending map is moved into `flushing`, so concurrent reads still
//!    see the values while they are being written.
//! 2. Each entry is applied to disk. Deleting an already-missing entry is
//!    not an error.
//! 3. On failure, entries not yet applied go back to `pending` unless a
//!    newer write for the same path arrived meanwhile, and the timer is
//!    re-armed.
//!
//! Only one flush runs at a time. Operations writing to disk directly
//! (`set_immediate`, `purge`) wait for an in-flight flush so a stale batch
//! cannot overwrite them.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use shack_types::DriverKind;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{base_name, Drivers, FilesystemDrivers};
use crate::error::{StorageError, StorageResult};

#[derive(Debug, Clone)]
enum PendingWrite {
    Value(String),
    Tombstone,
}

#[derive(Debug, Default)]
struct Batch {
    pending: HashMap<PathBuf, PendingWrite>,
    flushing: HashMap<PathBuf, PendingWrite>,
}

impl Batch {
    fn lookup(&self, path: &Path) -> Option<PendingWrite> {
        self.pending
            .get(path)
            .or_else(|| self.flushing.get(path))
            .cloned()
    }

    fn len(&self) -> usize {
        self.pending.len()
            + self
                .flushing
                .keys()
                .filter(|path| !self.pending.contains_key(*path))
                .count()
    }

    /// Drop buffered changes under `root`, optionally keeping `root` itself.
    fn discard_under(&mut self, root: &Path, inclusive: bool) {
        let keep = |path: &PathBuf| !(path.starts_with(root) && (inclusive || path != root));
        self.pending.retain(|path, _| keep(path));
        self.flushing.retain(|path, _| keep(path));
    }

    /// Buffered changes to direct children of `parent`; pending wins.
    fn children_of(&self, parent: &Path) -> BTreeMap<String, PendingWrite> {
        let mut children = BTreeMap::new();
        for map in [&self.flushing, &self.pending] {
            for (path, write) in map {
                if path.parent() == Some(parent) {
                    if let Some(name) = base_name(path) {
                        children.insert(name, write.clone());
                    }
                }
            }
        }
        children
    }
}

/// Apply `writes` in order, stopping at the first failure.
///
/// Returns how many writes were applied alongside the outcome.
async fn apply_writes(
    filesystem: &FilesystemDrivers,
    writes: &[(PathBuf, PendingWrite)],
) -> (usize, StorageResult<()>) {
    let mut applied = 0;
    for (path, write) in writes {
        let outcome = match write {
            PendingWrite::Value(data) => filesystem.set(path, data).await,
            PendingWrite::Tombstone => match filesystem.delete(path).await {
                Err(e) if e.is_not_found() => Ok(()),
                other => other,
            },
        };
        if let Err(e) = outcome {
            return (applied, Err(e));
        }
        applied += 1;
    }
    (applied, Ok(()))
}

#[derive(Debug)]
struct BatchState {
    filesystem: FilesystemDrivers,
    batch: Mutex<Batch>,
    flush_lock: tokio::sync::Mutex<()>,
    timer: Mutex<Option<CancellationToken>>,
    flush_interval: Duration,
}

impl BatchState {
    fn batch(&self) -> MutexGuard<'_, Batch> {
        self.batch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn arm_timer(self: &Arc<Self>) {
        let mut timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if timer.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let state = Arc::downgrade(self);
        let interval = self.flush_interval;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(interval) => {
                    if let Some(state) = state.upgrade() {
                        if let Err(e) = state.flush().await {
                            error!(error = %e, "Deferred flush failed");
                        }
                    }
                }
            }
        });
        *timer = Some(token);
    }

    fn disarm_timer(&self) {
        let token = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(token) = token {
            token.cancel();
        }
    }

    async fn flush(self: &Arc<Self>) -> StorageResult<()> {
        self.disarm_timer();
        let _flushing = self.flush_lock.lock().await;

        let snapshot: Vec<(PathBuf, PendingWrite)> = {
            let mut batch = self.batch();
            let pending = std::mem::take(&mut batch.pending);
            batch.flushing = pending.clone();
            pending.into_iter().collect()
        };
        if snapshot.is_empty() {
            return Ok(());
        }

        let (applied, result) = apply_writes(&self.filesystem, &snapshot).await;

        {
            let mut batch = self.batch();
            batch.flushing.clear();
            if result.is_err() {
                for (path, write) in snapshot.into_iter().skip(applied) {
                    batch.pending.entry(path).or_insert(write);
                }
            }
        }

        match &result {
            Ok(()) => debug!(count = applied, "Flushed batched writes"),
            Err(e) => {
                warn!(applied, error = %e, "Flush failed, requeued remaining writes");
                self.arm_timer();
            }
        }
        result
    }
}

impl Drop for BatchState {
    fn drop(&mut self) {
        if let Some(token) = self
            .timer
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            token.cancel();
        }
        let batch = self.batch.get_mut().unwrap_or_else(PoisonError::into_inner);
        if batch.pending.is_empty() {
            return;
        }
        let writes: Vec<(PathBuf, PendingWrite)> = std::mem::take(&mut batch.pending)
            .into_iter()
            .collect();

        // The last handle is gone, so the timer can no longer reach this
        // state. Hand the remaining writes to a detached final flush.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(count = writes.len(), "Scheduling final flush of dropped drivers");
                let filesystem = self.filesystem.clone();
                handle.spawn(async move {
                    let (applied, result) = apply_writes(&filesystem, &writes).await;
                    match result {
                        Ok(()) => debug!(count = applied, "Final flush completed"),
                        Err(e) => error!(
                            applied,
                            lost = writes.len() - applied,
                            error = %e,
                            "Final flush failed"
                        ),
                    }
                });
            }
            Err(_) => {
                warn!(
                    count = writes.len(),
                    "Dropping batched drivers outside a runtime, unflushed writes are lost"
                );
            }
        }
    }
}

/// Filesystem drivers with write batching.
///
/// Dropping the last handle schedules a final flush on the current tokio
/// runtime. Call [`Drivers::flush`] before shutting the runtime down, or
/// writes still buffered at that point are lost.
#[derive(Debug)]
pub struct CachedFilesystemDrivers {
    state: Arc<BatchState>,
}

impl CachedFilesystemDrivers {
    /// Create batched drivers committing at most `flush_interval` after
    /// the first buffered change.
    pub fn new(flush_interval: Duration) -> Self {
        Self {
            state: Arc::new(BatchState {
                filesystem: FilesystemDrivers::new(),
                batch: Mutex::new(Batch::default()),
                flush_lock: tokio::sync::Mutex::new(()),
                timer: Mutex::new(None),
                flush_interval,
            }),
        }
    }

    fn buffer(&self, path: &Path, write: PendingWrite) {
        self.state.batch().pending.insert(path.to_path_buf(), write);
        self.state.arm_timer();
    }

    fn clear_tombstone(&self, path: &Path) {
        let mut batch = self.state.batch();
        if matches!(batch.pending.get(path), Some(PendingWrite::Tombstone)) {
            batch.pending.remove(path);
        }
    }
}

#[async_trait]
impl Drivers for CachedFilesystemDrivers {
    fn kind(&self) -> DriverKind {
        DriverKind::CachedFilesystem
    }

    fn persistent(&self) -> bool {
        true
    }

    fn pending_changes(&self) -> usize {
        self.state.batch().len()
    }

    async fn flush(&self) -> StorageResult<()> {
        self.state.flush().await
    }

    async fn get(&self, path: &Path) -> StorageResult<String> {
        let buffered = self.state.batch().lookup(path);
        match buffered {
            Some(PendingWrite::Value(data)) => Ok(data),
            Some(PendingWrite::Tombstone) => {
                Err(StorageError::NotFound(path.display().to_string()))
            }
            None => self.state.filesystem.get(path).await,
        }
    }

    fn get_sync(&self, path: &Path) -> StorageResult<String> {
        match self.state.batch().lookup(path) {
            Some(PendingWrite::Value(data)) => Ok(data),
            Some(PendingWrite::Tombstone) => {
                Err(StorageError::NotFound(path.display().to_string()))
            }
            None => self.state.filesystem.get_sync(path),
        }
    }

    async fn set(&self, path: &Path, data: &str) -> StorageResult<()> {
        self.buffer(path, PendingWrite::Value(data.to_string()));
        Ok(())
    }

    async fn set_immediate(&self, path: &Path, data: &str) -> StorageResult<()> {
        let _flushing = self.state.flush_lock.lock().await;
        self.state.filesystem.set(path, data).await?;
        self.state.batch().pending.remove(path);
        Ok(())
    }

    async fn delete(&self, path: &Path) -> StorageResult<()> {
        if !self.exist(path).await {
            return Err(StorageError::NotFound(path.display().to_string()));
        }
        self.state.batch().discard_under(path, false);
        self.buffer(path, PendingWrite::Tombstone);
        Ok(())
    }

    async fn exist(&self, path: &Path) -> bool {
        let buffered = self.state.batch().lookup(path);
        match buffered {
            Some(PendingWrite::Value(_)) => true,
            Some(PendingWrite::Tombstone) => false,
            None => self.state.filesystem.exist(path).await,
        }
    }

    async fn list(&self, path: &Path) -> StorageResult<Vec<String>> {
        let mut names: BTreeSet<String> = self
            .state
            .filesystem
            .list(path)
            .await?
            .into_iter()
            .collect();
        let children = self.state.batch().children_of(path);
        for (name, write) in children {
            match write {
                PendingWrite::Value(_) => names.insert(name),
                PendingWrite::Tombstone => names.remove(&name),
            };
        }
        Ok(names.into_iter().collect())
    }

    async fn purge(&self, path: &Path) -> StorageResult<()> {
        let _flushing = self.state.flush_lock.lock().await;
        self.state.filesystem.purge(path).await?;
        self.state.batch().discard_under(path, true);
        Ok(())
    }

    async fn init(&self, path: &Path) -> StorageResult<()> {
        self.state.filesystem.init(path).await?;
        self.clear_tombstone(path);
        Ok(())
    }

    fn init_sync(&self, path: &Path) -> StorageResult<()> {
        self.state.filesystem.init_sync(path)?;
        self.clear_tombstone(path);
        Ok(())
    }

    async fn total_size_bytes(&self, path: &Path) -> StorageResult<u64> {
        let mut sizes: BTreeMap<String, u64> = self
            .state
            .filesystem
            .entry_sizes(path)
            .await?
            .into_iter()
            .collect();
        let children = self.state.batch().children_of(path);
        for (name, write) in children {
            match write {
                PendingWrite::Value(data) => {
                    sizes.insert(name, data.len() as u64);
                }
                PendingWrite::Tombstone => {
                    sizes.remove(&name);
                }
            }
        }
        Ok(sizes
            .iter()
            .map(|(name, len)| len + name.len() as u64)
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_writes_are_buffered_until_flush() {
        let dir = TempDir::new().unwrap();
        let drivers = CachedFilesystemDrivers::new(Duration::from_secs(3600));
        let key = dir.path().join("k");

        drivers.set(&key, "v1").await.unwrap();
        assert_eq!(drivers.pending_changes(), 1);
        assert_eq!(drivers.get(&key).await.unwrap(), "v1");
        assert!(!key.exists());

        drivers.flush().await.unwrap();
        assert_eq!(drivers.pending_changes(), 0);
        assert_eq!(std::fs::read_to_string(&key).unwrap(), "v1");
    }

    #[tokio::test]
    async fn test_delete_hides_then_removes() {
        let dir = TempDir::new().unwrap();
        let drivers = CachedFilesystemDrivers::new(Duration::from_secs(3600));
        let key = dir.path().join("k");
        std::fs::write(&key, "old").unwrap();

        drivers.delete(&key).await.unwrap();
        assert!(!drivers.exist(&key).await);
        assert!(drivers.get(&key).await.unwrap_err().is_not_found());
        assert!(drivers.list(dir.path()).await.unwrap().is_empty());
        assert!(key.exists());

        drivers.flush().await.unwrap();
        assert!(!key.exists());
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let drivers = CachedFilesystemDrivers::new(Duration::from_secs(3600));
        let err = drivers.delete(&dir.path().join("nope")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_set_immediate_supersedes_pending() {
        let dir = TempDir::new().unwrap();
        let drivers = CachedFilesystemDrivers::new(Duration::from_secs(3600));
        let key = dir.path().join("k");

        drivers.set(&key, "stale").await.unwrap();
        drivers.set_immediate(&key, "fresh").await.unwrap();
        assert_eq!(drivers.pending_changes(), 0);

        drivers.flush().await.unwrap();
        assert_eq!(std::fs::read_to_string(&key).unwrap(), "fresh");
    }

    #[tokio::test]
    async fn test_list_and_size_include_pending() {
        let dir = TempDir::new().unwrap();
        let drivers = CachedFilesystemDrivers::new(Duration::from_secs(3600));
        std::fs::write(dir.path().join("a"), "11").unwrap();

        drivers.set(&dir.path().join("b"), "222").await.unwrap();
        drivers.set(&dir.path().join("a"), "1").await.unwrap();

        assert_eq!(drivers.list(dir.path()).await.unwrap(), vec!["a", "b"]);
        assert_eq!(drivers.total_size_bytes(dir.path()).await.unwrap(), 1 + 1 + 3 + 1);
    }

    #[tokio::test]
    async fn test_purge_discards_pending_in_subtree() {
        let dir = TempDir::new().unwrap();
        let drivers = CachedFilesystemDrivers::new(Duration::from_secs(3600));
        let sub = dir.path().join("sub");
        drivers.init(&sub).await.unwrap();

        drivers.set(&sub.join("k"), "v").await.unwrap();
        drivers.set(&dir.path().join("other"), "v").await.unwrap();
        drivers.purge(&sub).await.unwrap();

        assert_eq!(drivers.pending_changes(), 1);
        assert!(!drivers.exist(&sub.join("k")).await);
        assert!(sub.is_dir());
    }

    #[tokio::test]
    async fn test_failed_flush_requeues() {
        let dir = TempDir::new().unwrap();
        let drivers = CachedFilesystemDrivers::new(Duration::from_secs(3600));
        let key = dir.path().join("missing").join("k");

        drivers.set(&key, "v").await.unwrap();
        assert!(drivers.flush().await.is_err());
        assert_eq!(drivers.pending_changes(), 1);

        drivers.init(&dir.path().join("missing")).await.unwrap();
        drivers.flush().await.unwrap();
        assert_eq!(std::fs::read_to_string(&key).unwrap(), "v");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flushes_after_interval() {
        let dir = TempDir::new().unwrap();
        let drivers = CachedFilesystemDrivers::new(Duration::from_secs(10));
        let key = dir.path().join("k");

        drivers.set(&key, "v").await.unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;
        // Let the timer task finish its disk writes.
        for _ in 0..100 {
            if drivers.pending_changes() == 0 {
                break;
            }
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(drivers.pending_changes(), 0);
        assert_eq!(std::fs::read_to_string(&key).unwrap(), "v");
    }

    async fn wait_for_file(path: &Path) -> Option<String> {
        for _ in 0..200 {
            if let Ok(text) = std::fs::read_to_string(path) {
                return Some(text);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }

    #[tokio::test]
    async fn test_drop_flushes_pending_writes() {
        let dir = TempDir::new().unwrap();
        let key = dir.path().join("k");
        let gone = dir.path().join("gone");
        std::fs::write(&gone, "old").unwrap();

        {
            let drivers = CachedFilesystemDrivers::new(Duration::from_secs(3600));
            drivers.set(&key, "v").await.unwrap();
            drivers.delete(&gone).await.unwrap();
            assert_eq!(drivers.pending_changes(), 2);
        }

        assert_eq!(wait_for_file(&key).await.as_deref(), Some("v"));
        for _ in 0..200 {
            if !gone.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!gone.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_arming_keeps_one_timer() {
        let dir = TempDir::new().unwrap();
        let drivers = Arc::new(CachedFilesystemDrivers::new(Duration::from_secs(3600)));

        let mut tasks = Vec::new();
        for i in 0..32 {
            let drivers = Arc::clone(&drivers);
            let key = dir.path().join(format!("k{i}"));
            tasks.push(tokio::spawn(async move {
                drivers.set(&key, "v").await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(drivers.pending_changes(), 32);
        assert!(drivers
            .state
            .timer
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|token| !token.is_cancelled()));

        // Only the single sleeping timer task should remain alive.
        let metrics = tokio::runtime::Handle::current().metrics();
        for _ in 0..200 {
            if metrics.num_alive_tasks() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(metrics.num_alive_tasks(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_writes_during_flush_are_kept() {
        let dir = TempDir::new().unwrap();
        let drivers = Arc::new(CachedFilesystemDrivers::new(Duration::from_secs(3600)));

        let writer = {
            let drivers = Arc::clone(&drivers);
            let root = dir.path().to_path_buf();
            tokio::spawn(async move {
                for round in 0..50 {
                    for i in 0..8 {
                        let value = format!("{round}");
                        drivers.set(&root.join(format!("k{i}")), &value).await.unwrap();
                    }
                    tokio::task::yield_now().await;
                }
            })
        };
        let flusher = {
            let drivers = Arc::clone(&drivers);
            tokio::spawn(async move {
                for _ in 0..50 {
                    drivers.flush().await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };
        writer.await.unwrap();
        flusher.await.unwrap();

        drivers.flush().await.unwrap();
        assert_eq!(drivers.pending_changes(), 0);
        for i in 0..8 {
            let stored = std::fs::read_to_string(dir.path().join(format!("k{i}"))).unwrap();
            assert_eq!(stored, "49");
        }
    }
}
