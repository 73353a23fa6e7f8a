//! Read caches sitting in front of a storage's drivers.
//!
//! A cache only has to reflect the latest set/delete made through the
//! storage that owns it. Storages guard their cache with the per-storage
//! lock, so implementations take `&mut self` and need no locking of their
//! own.

mod dictionary;

use std::fmt;

use shack_types::{CacheConfig, CacheKind, StoredValue};

use crate::error::StorageResult;

pub use dictionary::DictionaryCache;

/// Bounded key to envelope cache.
pub trait Cache: Send + Sync + fmt::Debug {
    /// Cached envelope for `key`, if resident.
    fn get(&self, key: &str) -> Option<StoredValue>;

    /// Insert or replace the envelope for `key`.
    fn set(&mut self, key: &str, value: StoredValue);

    /// Forget `key`.
    fn delete(&mut self, key: &str);

    /// Forget everything.
    fn clear(&mut self);

    /// Number of resident entries.
    fn keys_count(&self) -> usize;
}

/// Builds one fresh cache per storage from a named cache configuration.
#[derive(Debug, Clone)]
pub struct CacheFactory {
    config: CacheConfig,
}

impl CacheFactory {
    /// Validate `config` and wrap it.
    pub fn new(config: CacheConfig) -> StorageResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Configuration this factory builds from.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Build an empty cache.
    pub fn build(&self) -> StorageResult<Box<dyn Cache>> {
        match self.config.kind {
            CacheKind::Dictionary => Ok(Box::new(DictionaryCache::new(
                self.config.max_keys,
                self.config.keys_to_reduce_to,
            )?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_rejects_inverted_bounds() {
        let config = CacheConfig {
            kind: CacheKind::Dictionary,
            max_keys: 10,
            keys_to_reduce_to: 20,
        };
        assert!(CacheFactory::new(config).is_err());
    }

    #[test]
    fn test_factory_builds_empty_caches() {
        let factory = CacheFactory::new(CacheConfig::default()).unwrap();
        let mut first = factory.build().unwrap();
        let second = factory.build().unwrap();

        first.set("k", StoredValue::bare(serde_json::json!(1)));
        assert_eq!(first.keys_count(), 1);
        assert_eq!(second.keys_count(), 0);
    }
}
