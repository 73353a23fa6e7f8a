//! Storage quota policies.
//!
//! A `Policies` value is immutable once built. Each dimension is optional;
//! an absent dimension is unconstrained.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Names of the recognized quota dimensions, as they appear in config files.
pub const POLICY_KEYS: [&str; 4] = ["maxSizeBytes", "maxKeys", "maxKeyLength", "maxValueSizeBytes"];

/// Quota descriptor attached to a storage type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, u64>", into = "BTreeMap<String, u64>")]
pub struct Policies {
    max_size_bytes: Option<u64>,
    max_keys: Option<u64>,
    max_key_length: Option<u64>,
    max_value_size_bytes: Option<u64>,
}

impl Policies {
    /// Policies with every dimension unconstrained.
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Build policies from `(name, limit)` pairs.
    ///
    /// Fails if any name is not one of [`POLICY_KEYS`], or if one dimension
    /// is given twice. Names match case-insensitively since some config
    /// sources fold key case, so `maxKeys` and `maxkeys` together are a
    /// duplicate.
    pub fn from_entries<I, K>(entries: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, u64)>,
        K: AsRef<str>,
    {
        let mut policies = Self::default();
        for (key, value) in entries {
            let key = key.as_ref();
            let slot = match key.to_ascii_lowercase().as_str() {
                "maxsizebytes" => &mut policies.max_size_bytes,
                "maxkeys" => &mut policies.max_keys,
                "maxkeylength" => &mut policies.max_key_length,
                "maxvaluesizebytes" => &mut policies.max_value_size_bytes,
                _ => return Err(ConfigError::UnknownPolicyKey(key.to_string())),
            };
            if slot.replace(value).is_some() {
                return Err(ConfigError::DuplicatePolicyKey(key.to_string()));
            }
        }
        Ok(policies)
    }

    /// Max storage size in bytes (keys plus serialized values).
    pub fn max_size_bytes(&self) -> Option<u64> {
        self.max_size_bytes
    }

    /// Max number of keys in a storage.
    pub fn max_keys(&self) -> Option<u64> {
        self.max_keys
    }

    /// Max key length, counted in Unicode scalar values (`str::chars`).
    ///
    /// A character outside the Basic Multilingual Plane counts once, not as
    /// two UTF-16 code units.
    pub fn max_key_length(&self) -> Option<u64> {
        self.max_key_length
    }

    /// Max size of a single serialized value in bytes.
    pub fn max_value_size_bytes(&self) -> Option<u64> {
        self.max_value_size_bytes
    }

    /// True if no dimension is constrained.
    pub fn is_unlimited(&self) -> bool {
        *self == Self::default()
    }
}

impl TryFrom<BTreeMap<String, u64>> for Policies {
    type Error = ConfigError;

    fn try_from(map: BTreeMap<String, u64>) -> Result<Self, Self::Error> {
        Self::from_entries(map)
    }
}

impl From<Policies> for BTreeMap<String, u64> {
    fn from(policies: Policies) -> Self {
        let dimensions = [
            ("maxSizeBytes", policies.max_size_bytes),
            ("maxKeys", policies.max_keys),
            ("maxKeyLength", policies.max_key_length),
            ("maxValueSizeBytes", policies.max_value_size_bytes),
        ];
        dimensions
            .into_iter()
            .filter_map(|(name, value)| value.map(|v| (name.to_string(), v)))
            .collect()
    }
}
