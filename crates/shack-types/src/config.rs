//! Configuration loading for ShackDB.
//!
//! Layered config: defaults -> config file -> env vars -> CLI flags.
//! The default config file lives at `~/.config/shackdb/config.toml` (or the
//! platform equivalent).

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use directories::{BaseDirs, ProjectDirs};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::policies::Policies;

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "SHACK";

/// Persistence backend behind a storage type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    /// Process memory; lost on restart
    Memory,
    /// One file per key, written through
    Filesystem,
    /// One file per key, writes batched and flushed on a timer
    CachedFilesystem,
}

impl DriverKind {
    /// Human description of the backend.
    pub fn description(&self) -> &'static str {
        match self {
            DriverKind::Memory => {
                "Storage type that keeps data in memory only. All keys and values are lost every time the server goes down."
            }
            DriverKind::Filesystem => "Persistent storage type that keeps data as files.",
            DriverKind::CachedFilesystem => {
                "Persistent storage type that keeps data as files, but batches changes before flushing them. Faster than the regular files storage, but data may be lost if the server crashes before committing changes."
            }
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DriverKind::Memory => "memory",
            DriverKind::Filesystem => "filesystem",
            DriverKind::CachedFilesystem => "cached_filesystem",
        };
        f.write_str(name)
    }
}

/// A named storage type: which drivers, which policy and which cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageTypeConfig {
    /// Backend kind
    pub drivers: DriverKind,

    /// Seconds a batched write may wait before being flushed (cached drivers only)
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    /// Name of an entry in `policies`; none means unconstrained
    #[serde(default)]
    pub policy: Option<String>,

    /// Name of an entry in `caches`; none means no value cache
    #[serde(default)]
    pub cache: Option<String>,
}

fn default_flush_interval() -> u64 {
    10
}

impl StorageTypeConfig {
    /// Storage type with the given drivers and no policy or cache.
    pub fn new(drivers: DriverKind) -> Self {
        Self {
            drivers,
            flush_interval_secs: default_flush_interval(),
            policy: None,
            cache: None,
        }
    }
}

/// Value cache implementation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CacheKind {
    /// Bounded map with random eviction
    #[default]
    Dictionary,
}

/// Configuration of a named value cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheConfig {
    /// Cache implementation
    #[serde(default)]
    pub kind: CacheKind,

    /// Entry count that triggers eviction
    #[serde(default = "default_cache_max_keys")]
    pub max_keys: usize,

    /// Entry count eviction shrinks the cache to
    #[serde(default = "default_cache_keys_to_reduce_to")]
    pub keys_to_reduce_to: usize,
}

fn default_cache_max_keys() -> usize {
    1000
}

fn default_cache_keys_to_reduce_to() -> usize {
    800
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            kind: CacheKind::default(),
            max_keys: default_cache_max_keys(),
            keys_to_reduce_to: default_cache_keys_to_reduce_to(),
        }
    }
}

impl CacheConfig {
    /// Validate eviction bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keys_to_reduce_to > self.max_keys {
            return Err(ConfigError::InvalidCache(format!(
                "max_keys ({}) must be at least keys_to_reduce_to ({})",
                self.max_keys, self.keys_to_reduce_to
            )));
        }
        Ok(())
    }
}

/// Engine-wide storage preferences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Record `modified` and `source` alongside every stored value
    #[serde(default = "default_keep_metadata")]
    pub keep_metadata: bool,

    /// Freshness window of the per-storage size and key-set memos
    #[serde(default = "default_soft_cache_secs")]
    pub soft_cache_secs: u64,
}

fn default_keep_metadata() -> bool {
    true
}

fn default_soft_cache_secs() -> u64 {
    30
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            keep_metadata: default_keep_metadata(),
            soft_cache_secs: default_soft_cache_secs(),
        }
    }
}

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Root directory for all persistent data
    #[serde(default = "default_data_root")]
    pub data_root: String,

    /// Directory under `data_root` holding per-owner storage roots
    #[serde(default = "default_storages_dir")]
    pub storages_dir: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Storage type used when the caller names none
    #[serde(default = "default_storage_type")]
    pub default_storage_type: String,

    /// Engine-wide storage preferences
    #[serde(default)]
    pub storage: StorageSettings,

    /// Named storage types
    #[serde(default = "default_storage_types")]
    pub storage_types: BTreeMap<String, StorageTypeConfig>,

    /// Named quota policies
    #[serde(default)]
    pub policies: BTreeMap<String, Policies>,

    /// Named value caches
    #[serde(default = "default_caches")]
    pub caches: BTreeMap<String, CacheConfig>,
}

fn default_data_root() -> String {
    ProjectDirs::from("", "", "shackdb")
        .map(|p| p.data_local_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./data"))
        .to_string_lossy()
        .to_string()
}

fn default_storages_dir() -> String {
    "storages".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_storage_type() -> String {
    "files".to_string()
}

fn default_storage_types() -> BTreeMap<String, StorageTypeConfig> {
    let mut types = BTreeMap::new();
    types.insert("memory".to_string(), StorageTypeConfig::new(DriverKind::Memory));
    types.insert("files".to_string(), StorageTypeConfig::new(DriverKind::Filesystem));
    types.insert(
        "cached_files".to_string(),
        StorageTypeConfig {
            cache: Some("dictionary".to_string()),
            ..StorageTypeConfig::new(DriverKind::CachedFilesystem)
        },
    );
    types
}

fn default_caches() -> BTreeMap<String, CacheConfig> {
    let mut caches = BTreeMap::new();
    caches.insert("dictionary".to_string(), CacheConfig::default());
    caches
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            storages_dir: default_storages_dir(),
            log_level: default_log_level(),
            default_storage_type: default_storage_type(),
            storage: StorageSettings::default(),
            storage_types: default_storage_types(),
            policies: BTreeMap::new(),
            caches: default_caches(),
        }
    }
}

impl Settings {
    /// Load settings with layered precedence:
    /// 1. Built-in defaults
    /// 2. Config file (~/.config/shackdb/config.toml)
    /// 3. CLI-specified config file (optional)
    /// 4. Environment variables (SHACK__*)
    ///
    /// CLI flags should be applied by the caller after this returns.
    pub fn load(cli_config_path: Option<&str>) -> Result<Self, ConfigError> {
        let config_dir = ProjectDirs::from("", "", "shackdb")
            .map(|p| p.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        Self::load_layers(Some(&config_dir.join("config")), cli_config_path, Some(ENV_PREFIX))
    }

    /// Load settings from explicit layers only.
    ///
    /// `user_config` is an optional config file (missing is fine),
    /// `cli_config_path` a required one, and `env_prefix` enables
    /// environment overrides such as `SHACK__DATA_ROOT`.
    pub fn load_layers(
        user_config: Option<&Path>,
        cli_config_path: Option<&str>,
        env_prefix: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("data_root", default_data_root())?
            .set_default("storages_dir", default_storages_dir())?
            .set_default("log_level", default_log_level())?
            .set_default("default_storage_type", default_storage_type())?;

        if let Some(path) = user_config {
            builder = builder.add_source(File::with_name(&path.to_string_lossy()).required(false));
        }
        if let Some(path) = cli_config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }
        if let Some(prefix) = env_prefix {
            builder = builder.add_source(
                Environment::with_prefix(prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check cross references between storage types, policies and caches.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.storage_types.contains_key(&self.default_storage_type) {
            return Err(ConfigError::UnknownReference {
                kind: "storage type",
                name: self.default_storage_type.clone(),
            });
        }
        for type_config in self.storage_types.values() {
            if let Some(policy) = &type_config.policy {
                if !self.policies.contains_key(policy) {
                    return Err(ConfigError::UnknownReference {
                        kind: "policy",
                        name: policy.clone(),
                    });
                }
            }
            if let Some(cache) = &type_config.cache {
                if !self.caches.contains_key(cache) {
                    return Err(ConfigError::UnknownReference {
                        kind: "cache",
                        name: cache.clone(),
                    });
                }
            }
        }
        for cache in self.caches.values() {
            cache.validate()?;
        }
        Ok(())
    }

    /// Expand ~ in data_root to the actual home directory
    pub fn expanded_data_root(&self) -> PathBuf {
        if let Some(rest) = self.data_root.strip_prefix("~/") {
            if let Some(dirs) = BaseDirs::new() {
                return dirs.home_dir().join(rest);
            }
        }
        PathBuf::from(&self.data_root)
    }

    /// Root directory holding one owner's storages (all storage types).
    pub fn owner_root(&self, owner: &str) -> PathBuf {
        self.expanded_data_root()
            .join(&self.storages_dir)
            .join(owner)
    }
}
