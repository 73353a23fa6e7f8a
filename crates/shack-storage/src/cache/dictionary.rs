use std::collections::HashMap;

use rand::Rng;
use shack_types::{ConfigError, StoredValue};
use tracing::debug;

use super::Cache;
use crate::error::StorageResult;

/// Hash map cache with random eviction.
///
/// When an insert pushes the entry count above `max_keys`, uniformly random
/// entries are evicted until `keys_to_reduce_to` remain. There is no recency
/// tracking, so a hot key can be evicted.
#[derive(Debug)]
pub struct DictionaryCache {
    entries: HashMap<String, StoredValue>,
    max_keys: usize,
    keys_to_reduce_to: usize,
}

impl DictionaryCache {
    /// Create a cache. Fails if `keys_to_reduce_to > max_keys`.
    pub fn new(max_keys: usize, keys_to_reduce_to: usize) -> StorageResult<Self> {
        if keys_to_reduce_to > max_keys {
            return Err(ConfigError::InvalidCache(format!(
                "max_keys ({max_keys}) must be at least keys_to_reduce_to ({keys_to_reduce_to})"
            ))
            .into());
        }
        Ok(Self {
            entries: HashMap::new(),
            max_keys,
            keys_to_reduce_to,
        })
    }

    fn reduce(&mut self) {
        let mut rng = rand::rng();
        let mut keys: Vec<String> = self.entries.keys().cloned().collect();
        let evicted = keys.len().saturating_sub(self.keys_to_reduce_to);
        while self.entries.len() > self.keys_to_reduce_to {
            let victim = keys.swap_remove(rng.random_range(0..keys.len()));
            self.entries.remove(&victim);
        }
        debug!(count = evicted, "Evicted random cache entries");
    }
}

impl Cache for DictionaryCache {
    fn get(&self, key: &str) -> Option<StoredValue> {
        self.entries.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: StoredValue) {
        self.entries.insert(key.to_string(), value);
        if self.entries.len() > self.max_keys {
            self.reduce();
        }
    }

    fn delete(&mut self, key: &str) {
        self.entries.remove(key);
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn keys_count(&self) -> usize {
        self.entries.len()
    }
}
