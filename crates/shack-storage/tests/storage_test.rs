//! Storage behavior across drivers, caches and freshness windows.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use shack_storage::{
    CachedFilesystemDrivers, DictionaryCache, Drivers, FilesystemDrivers, MemoryDrivers,
    MemoryStore, Storage, StorageConfig, StorageError,
};
use shack_types::Policies;
use tempfile::TempDir;

fn memory_config(store: &MemoryStore) -> StorageConfig {
    StorageConfig::new(Arc::new(MemoryDrivers::new(store.clone())))
}

#[tokio::test(start_paused = true)]
async fn test_soft_facts_expire_after_window() {
    let store = MemoryStore::new();
    let mut config = memory_config(&store);
    config.soft_cache_window = Duration::from_secs(30);
    let storage = Storage::open("s", "owner/s", config).unwrap();
    storage.set("a", json!(1), None).await.unwrap();
    assert_eq!(storage.list().await.unwrap(), vec!["a"]);

    // A write that bypasses this storage instance.
    let outside = MemoryDrivers::new(store);
    outside
        .set(Path::new("owner/s/data/b"), r#"{"_d":2}"#)
        .await
        .unwrap();
    assert_eq!(storage.list().await.unwrap(), vec!["a"]);

    tokio::time::advance(Duration::from_secs(31)).await;
    assert_eq!(storage.list().await.unwrap(), vec!["a", "b"]);
    assert_eq!(storage.get("b").await.unwrap(), json!(2));
}

#[tokio::test]
async fn test_cache_serves_reads_and_tracks_deletes() {
    let store = MemoryStore::new();
    let mut config = memory_config(&store);
    config.cache = Some(Box::new(DictionaryCache::new(10, 8).unwrap()));
    let storage = Storage::open("s", "owner/s", config).unwrap();

    storage.set("k", json!({"x": 1}), None).await.unwrap();
    assert_eq!(storage.cached_keys().await, 1);
    assert!(storage.exist("k").await.unwrap());

    storage.delete("k").await.unwrap();
    assert_eq!(storage.cached_keys().await, 0);
    assert!(!storage.exist("k").await.unwrap());
    assert!(storage.get("k").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_purge_keeps_access_keys() {
    let store = MemoryStore::new();
    let storage = Storage::open("s", "owner/s", memory_config(&store)).unwrap();
    let metadata = storage.metadata();
    for key in ["a", "b", "c"] {
        storage.set(key, json!(key), None).await.unwrap();
    }

    storage.purge().await.unwrap();
    assert!(storage.list().await.unwrap().is_empty());
    for key in ["a", "b", "c"] {
        assert!(!storage.exist(key).await.unwrap());
    }
    assert_eq!(storage.metadata(), metadata);
}

#[tokio::test]
async fn test_metadata_persists_across_reopen() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("s");
    let drivers: Arc<dyn Drivers> = Arc::new(FilesystemDrivers::new());
    let storage = Storage::open("s", &root, StorageConfig::new(Arc::clone(&drivers))).unwrap();
    storage.save_metadata().await.unwrap();
    let secret = storage.generate_secret_key().await.unwrap();
    drop(storage);

    let reopened = Storage::open("s", &root, StorageConfig::new(drivers)).unwrap();
    assert_eq!(reopened.secret_key(), secret);
    assert_eq!(reopened.metadata_version(), 2);

    let on_disk: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(root.join("metadata.json")).unwrap())
            .unwrap();
    assert_eq!(on_disk["secret"], json!(secret));
    assert_eq!(on_disk["version"], json!(2));
}

#[tokio::test]
async fn test_key_rotation_is_never_batched() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("s");
    let drivers: Arc<dyn Drivers> =
        Arc::new(CachedFilesystemDrivers::new(Duration::from_secs(3600)));
    let storage = Storage::open("s", &root, StorageConfig::new(drivers)).unwrap();

    let readonly = storage.generate_readonly_key().await.unwrap();
    storage.set("k", json!(1), None).await.unwrap();
    assert_eq!(storage.pending_changes(), 1);

    let on_disk = std::fs::read_to_string(root.join("metadata.json")).unwrap();
    assert!(on_disk.contains(&readonly));
    assert!(!root.join("data/k").exists());

    storage.flush().await.unwrap();
    assert_eq!(storage.pending_changes(), 0);
    assert!(root.join("data/k").exists());
}

#[tokio::test]
async fn test_envelope_without_metadata() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("s");
    let mut config = StorageConfig::new(Arc::new(FilesystemDrivers::new()));
    config.keep_metadata = false;
    let storage = Storage::open("s", &root, config).unwrap();

    storage.set("k", json!([1, 2]), Some("tests")).await.unwrap();
    assert_eq!(
        std::fs::read_to_string(root.join("data/k")).unwrap(),
        r#"{"_d":[1,2]}"#
    );
    assert_eq!(storage.get_with_metadata("k").await.unwrap(), json!({"_d": [1, 2]}));
}

#[tokio::test]
async fn test_stats() {
    let store = MemoryStore::new();
    let storage = Storage::open("s", "owner/s", memory_config(&store)).unwrap();
    storage.set("k", json!("v"), None).await.unwrap();

    let stats = storage.stats().await.unwrap();
    assert_eq!(stats.keys, 1);
    assert_eq!(stats.size_bytes, storage.total_size_bytes().await.unwrap());
    assert_eq!(stats.pending_changes, 0);
    assert_eq!(stats.cached_keys, 0);
}

/// Run `count` concurrent writes of `{"_d":1}` under keys `k00`..,
/// returning how many were accepted.
async fn concurrent_sets(storage: &Arc<Storage>, count: usize) -> usize {
    let mut tasks = Vec::new();
    for i in 0..count {
        let storage = Arc::clone(storage);
        tasks.push(tokio::spawn(async move {
            storage.set(&format!("k{i:02}"), json!(1), None).await
        }));
    }
    let mut accepted = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(()) => accepted += 1,
            Err(e) => assert!(matches!(e, StorageError::PolicyViolation(_)), "{e}"),
        }
    }
    accepted
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writes_respect_max_keys() {
    let mut config = memory_config(&MemoryStore::new());
    config.policies = Arc::new(Policies::from_entries([("maxKeys", 5u64)]).unwrap());
    let storage = Arc::new(Storage::open("s", "owner/s", config).unwrap());

    assert_eq!(concurrent_sets(&storage, 32).await, 5);
    assert_eq!(storage.list().await.unwrap().len(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writes_respect_max_size() {
    let dir = TempDir::new().unwrap();
    let mut config = StorageConfig::new(Arc::new(CachedFilesystemDrivers::new(
        Duration::from_secs(3600),
    )));
    config.keep_metadata = false;
    // Each entry is a 3 byte key plus the 8 byte envelope `{"_d":1}`.
    config.policies = Arc::new(Policies::from_entries([("maxSizeBytes", 50u64)]).unwrap());
    let storage = Arc::new(Storage::open("s", dir.path().join("s"), config).unwrap());

    assert_eq!(concurrent_sets(&storage, 32).await, 4);
    assert_eq!(storage.total_size_bytes().await.unwrap(), 44);

    storage.flush().await.unwrap();
    let on_disk = std::fs::read_dir(dir.path().join("s/data")).unwrap().count();
    assert_eq!(on_disk, 4);
}
