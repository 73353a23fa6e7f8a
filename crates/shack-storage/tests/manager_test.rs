//! Manager and catalog scenarios across storage types.

use std::time::Duration;

use serde_json::json;
use shack_storage::{StorageCatalog, StorageError};
use shack_types::{Policies, Settings};
use tempfile::TempDir;

fn catalog() -> StorageCatalog {
    let mut settings = Settings::default();
    settings.policies.insert(
        "tiny".to_string(),
        Policies::from_entries([("maxKeys".to_string(), 2)]).unwrap(),
    );
    if let Some(memory) = settings.storage_types.get_mut("memory") {
        memory.policy = Some("tiny".to_string());
    }
    StorageCatalog::from_settings(&settings).unwrap()
}

#[tokio::test]
async fn test_basic_key_lifecycle() {
    let dir = TempDir::new().unwrap();
    let catalog = catalog();
    let manager = catalog.manager(dir.path(), Some("memory")).unwrap();

    let storage = manager.create("s1").await.unwrap();
    storage.set("k", json!("v1"), None).await.unwrap();
    assert_eq!(storage.get("k").await.unwrap(), json!("v1"));
    storage.set("k", json!("v2"), None).await.unwrap();
    assert_eq!(storage.get("k").await.unwrap(), json!("v2"));
    assert_eq!(storage.list().await.unwrap(), vec!["k"]);
    storage.delete("k").await.unwrap();
    assert!(storage.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_max_keys_policy_from_settings() {
    let dir = TempDir::new().unwrap();
    let catalog = catalog();
    let manager = catalog.manager(dir.path(), Some("memory")).unwrap();
    let storage = manager.create("s").await.unwrap();

    storage.set("a", json!(1), None).await.unwrap();
    storage.set("b", json!(2), None).await.unwrap();
    let err = storage.set("c", json!(3), None).await.unwrap_err();
    assert!(matches!(err, StorageError::PolicyViolation(_)));
    assert_eq!(err.to_string(), "Policy validation error: too many keys are set.");
    assert_eq!(storage.get("a").await.unwrap(), json!(1));
    assert_eq!(storage.get("b").await.unwrap(), json!(2));
}

#[tokio::test]
async fn test_rotated_secret_survives_clear_cache() {
    let dir = TempDir::new().unwrap();
    let catalog = catalog();
    for storage_type in ["memory", "files", "cached_files"] {
        let manager = catalog.manager(dir.path(), Some(storage_type)).unwrap();
        let storage = manager.create("s").await.unwrap();
        let old = storage.secret_key();
        let new = storage.generate_secret_key().await.unwrap();
        assert_ne!(old, new);
        drop(storage);

        manager.clear_cache().await.unwrap();
        assert_eq!(manager.resident_count().await, 0);
        let reloaded = manager.get("s").await.unwrap();
        assert_eq!(reloaded.secret_key(), new, "storage type {storage_type}");
    }
}

#[tokio::test]
async fn test_batched_writes_survive_clear_cache() {
    let dir = TempDir::new().unwrap();
    let catalog = catalog();
    let manager = catalog.manager(dir.path(), Some("cached_files")).unwrap();
    let storage = manager.create("s").await.unwrap();
    storage.set("k", json!({"n": 1}), Some("test")).await.unwrap();
    drop(storage);

    manager.clear_cache().await.unwrap();
    let storage = manager.get("s").await.unwrap();
    assert_eq!(storage.get("k").await.unwrap(), json!({"n": 1}));
}

#[tokio::test]
async fn test_registry_follows_manager() {
    let dir = TempDir::new().unwrap();
    let catalog = catalog();
    let manager = catalog.manager(dir.path(), Some("files")).unwrap();
    let storage = manager.create("s").await.unwrap();
    let api_key = storage.api_key();

    let found = catalog.registry().get(&api_key).unwrap();
    assert_eq!(found.id(), "s");
    drop(found);
    drop(storage);

    manager.delete("s").await.unwrap();
    assert!(catalog.registry().get(&api_key).is_none());
    assert!(!manager.exist("s").await);
    assert!(manager.get("s").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_purge_removes_every_storage() {
    let dir = TempDir::new().unwrap();
    let catalog = catalog();
    let manager = catalog.manager(dir.path(), Some("cached_files")).unwrap();
    let first = manager.create("one").await.unwrap();
    manager.create("two").await.unwrap();
    first.set("pending", json!(true), None).await.unwrap();
    let api_key = first.api_key();
    drop(first);

    manager.purge().await.unwrap();
    assert!(manager.list().await.unwrap().is_empty());
    assert!(catalog.registry().get(&api_key).is_none());
    assert_eq!(manager.pending_changes().await, 0);

    manager.create("one").await.unwrap();
    assert_eq!(manager.list().await.unwrap(), vec!["one"]);
}

#[tokio::test]
async fn test_types_are_separate_namespaces() {
    let dir = TempDir::new().unwrap();
    let catalog = catalog();
    let files = catalog.manager(dir.path(), Some("files")).unwrap();
    let memory = catalog.manager(dir.path(), Some("memory")).unwrap();

    files.create("shared").await.unwrap();
    assert!(!memory.exist("shared").await);
    memory.create("shared").await.unwrap();
    assert_eq!(files.list().await.unwrap(), vec!["shared"]);
    assert_eq!(memory.list().await.unwrap(), vec!["shared"]);
}

#[tokio::test]
async fn test_memory_data_is_shared_within_catalog() {
    let dir = TempDir::new().unwrap();
    let catalog = catalog();
    let first = catalog.manager(dir.path(), Some("memory")).unwrap();
    let storage = first.create("s").await.unwrap();
    storage.set("k", json!(1), None).await.unwrap();
    drop(storage);
    first.clear_cache().await.unwrap();

    let second = catalog.manager(dir.path(), Some("memory")).unwrap();
    let storage = second.get("s").await.unwrap();
    assert_eq!(storage.get("k").await.unwrap(), json!(1));
}

#[tokio::test]
async fn test_dropped_manager_commits_batched_writes() {
    let dir = TempDir::new().unwrap();
    let mut settings = Settings::default();
    if let Some(cached) = settings.storage_types.get_mut("cached_files") {
        cached.flush_interval_secs = 1;
    }
    let file = dir.path().join("cached_files/s/data/k");

    {
        let catalog = StorageCatalog::from_settings(&settings).unwrap();
        let manager = catalog.manager(dir.path(), Some("cached_files")).unwrap();
        let storage = manager.create("s").await.unwrap();
        storage.set("k", json!("kept"), None).await.unwrap();
        assert_eq!(storage.pending_changes(), 1);
        assert!(!file.exists());
    }

    tokio::time::sleep(Duration::from_secs(3)).await;
    let stored = std::fs::read_to_string(&file).unwrap();
    assert!(stored.contains(r#""_d":"kept""#));
}

#[tokio::test]
async fn test_callers_share_resident_storages() {
    let dir = TempDir::new().unwrap();
    let catalog = catalog();
    let writer = catalog.manager(dir.path(), Some("cached_files")).unwrap();
    let reader = catalog.manager(dir.path(), Some("cached_files")).unwrap();

    writer.create("s").await.unwrap().set("k", json!(1), None).await.unwrap();
    let storage = reader.get("s").await.unwrap();
    assert_eq!(storage.get("k").await.unwrap(), json!(1));
    assert_eq!(reader.resident_count().await, 1);

    let api_key = storage.api_key();
    let registered = catalog.registry().get(&api_key).unwrap();
    assert!(std::sync::Arc::ptr_eq(&registered, &storage));
}
