//! In-memory drivers.
//!
//! Data lives in a [`MemoryStore`], a nested map injected at construction.
//! Payloads are kept as strings, the same on-wire form the file drivers
//! write, so switching backends never changes what callers read back.

use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use shack_types::DriverKind;

use super::Drivers;
use crate::error::{StorageError, StorageResult};

#[derive(Debug)]
enum MemoryNode {
    Dir(BTreeMap<String, MemoryNode>),
    Value(String),
}

type Dir = BTreeMap<String, MemoryNode>;

/// Shared tree backing every [`MemoryDrivers`] built from it.
///
/// Cloning is cheap and yields a handle to the same tree.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    root: Arc<RwLock<Dir>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Dir> {
        self.root.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Dir> {
        self.root.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drivers keeping data in process memory only.
#[derive(Debug, Clone)]
pub struct MemoryDrivers {
    store: MemoryStore,
}

impl MemoryDrivers {
    /// Create drivers over `store`.
    pub fn new(store: MemoryStore) -> Self {
        Self { store }
    }

    fn get_value(&self, path: &Path) -> StorageResult<String> {
        let root = self.store.read();
        match find(&root, &segments(path)) {
            Some(MemoryNode::Value(data)) => Ok(data.clone()),
            _ => Err(not_found(path)),
        }
    }

    fn ensure_dir(&self, path: &Path) -> StorageResult<()> {
        let segments = segments(path);
        let mut root = self.store.write();
        dir_mut(&mut root, &segments, true)
            .map(|_| ())
            .ok_or_else(|| not_a_directory(path))
    }
}

fn segments(path: &Path) -> Vec<String> {
    path.components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect()
}

fn find<'a>(root: &'a Dir, segments: &[String]) -> Option<&'a MemoryNode> {
    let (last, parents) = segments.split_last()?;
    let mut dir = root;
    for segment in parents {
        match dir.get(segment) {
            Some(MemoryNode::Dir(children)) => dir = children,
            _ => return None,
        }
    }
    dir.get(last)
}

/// Walk to the directory at `segments`, optionally creating missing levels.
fn dir_mut<'a>(mut dir: &'a mut Dir, segments: &[String], create: bool) -> Option<&'a mut Dir> {
    for segment in segments {
        let next = if create {
            dir.entry(segment.clone())
                .or_insert_with(|| MemoryNode::Dir(Dir::new()))
        } else {
            dir.get_mut(segment)?
        };
        match next {
            MemoryNode::Dir(children) => dir = children,
            MemoryNode::Value(_) => return None,
        }
    }
    Some(dir)
}

fn not_found(path: &Path) -> StorageError {
    StorageError::NotFound(path.display().to_string())
}

fn not_a_directory(path: &Path) -> StorageError {
    StorageError::Io(io::Error::new(
        io::ErrorKind::Other,
        format!("{} crosses a value, not a directory", path.display()),
    ))
}

#[async_trait]
impl Drivers for MemoryDrivers {
    fn kind(&self) -> DriverKind {
        DriverKind::Memory
    }

    fn persistent(&self) -> bool {
        false
    }

    fn pending_changes(&self) -> usize {
        0
    }

    async fn flush(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn get(&self, path: &Path) -> StorageResult<String> {
        self.get_value(path)
    }

    fn get_sync(&self, path: &Path) -> StorageResult<String> {
        self.get_value(path)
    }

    async fn set(&self, path: &Path, data: &str) -> StorageResult<()> {
        let segments = segments(path);
        let (last, parents) = segments.split_last().ok_or_else(|| not_found(path))?;
        let mut root = self.store.write();
        let dir = dir_mut(&mut root, parents, true).ok_or_else(|| not_a_directory(path))?;
        dir.insert(last.clone(), MemoryNode::Value(data.to_string()));
        Ok(())
    }

    async fn set_immediate(&self, path: &Path, data: &str) -> StorageResult<()> {
        self.set(path, data).await
    }

    async fn delete(&self, path: &Path) -> StorageResult<()> {
        let segments = segments(path);
        let (last, parents) = segments.split_last().ok_or_else(|| not_found(path))?;
        let mut root = self.store.write();
        dir_mut(&mut root, parents, false)
            .and_then(|dir| dir.remove(last))
            .map(|_| ())
            .ok_or_else(|| not_found(path))
    }

    async fn exist(&self, path: &Path) -> bool {
        let root = self.store.read();
        find(&root, &segments(path)).is_some()
    }

    async fn list(&self, path: &Path) -> StorageResult<Vec<String>> {
        let root = self.store.read();
        let names = match find(&root, &segments(path)) {
            Some(MemoryNode::Dir(children)) => children.keys().cloned().collect(),
            _ => Vec::new(),
        };
        Ok(names)
    }

    async fn purge(&self, path: &Path) -> StorageResult<()> {
        let segments = segments(path);
        let (last, parents) = segments.split_last().ok_or_else(|| not_found(path))?;
        let mut root = self.store.write();
        let dir = dir_mut(&mut root, parents, true).ok_or_else(|| not_a_directory(path))?;
        dir.insert(last.clone(), MemoryNode::Dir(Dir::new()));
        Ok(())
    }

    async fn init(&self, path: &Path) -> StorageResult<()> {
        self.ensure_dir(path)
    }

    fn init_sync(&self, path: &Path) -> StorageResult<()> {
        self.ensure_dir(path)
    }

    async fn total_size_bytes(&self, path: &Path) -> StorageResult<u64> {
        let root = self.store.read();
        match find(&root, &segments(path)) {
            Some(MemoryNode::Dir(children)) => Ok(children
                .iter()
                .filter_map(|(name, node)| match node {
                    MemoryNode::Value(data) => Some((data.len() + name.len()) as u64),
                    MemoryNode::Dir(_) => None,
                })
                .sum()),
            _ => Err(not_found(path)),
        }
    }
}
