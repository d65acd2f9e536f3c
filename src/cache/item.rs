//! Cache data model: items, scopes and restore key sets

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::store::ObjectInfo;

/// Metadata entry holding the last-access stamp (epoch millis)
pub const LAST_ACCESS_KEY: &str = "last-access";

/// Metadata entry naming the codec an object was packed with
pub const CODEC_KEY: &str = "codec";

/// Bucket/prefix namespace that keys are resolved and listed in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageScope {
    pub bucket: String,
    /// Empty, or ends with '/'
    pub prefix: String,
}

impl StorageScope {
    pub fn new(bucket: &str, prefix: &str) -> Self {
        let trimmed = prefix.trim_matches('/');
        let prefix = if trimmed.is_empty() {
            String::new()
        } else {
            format!("{}/", trimmed)
        };
        Self {
            bucket: bucket.to_string(),
            prefix,
        }
    }

    /// Nested scope `<prefix><segment>/`
    pub fn child(&self, segment: &str) -> Self {
        Self::new(&self.bucket, &format!("{}{}", self.prefix, segment))
    }

    /// Full object name for a key in this scope
    pub fn object_name(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Key for a full object name, if the name lives in this scope
    pub fn key_of<'a>(&self, name: &'a str) -> Option<&'a str> {
        name.strip_prefix(self.prefix.as_str())
            .filter(|key| !key.is_empty())
    }
}

/// One stored cache object, as materialized from a listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheItem {
    /// Key relative to the scope
    pub key: String,
    pub content_length: u64,
    /// Epoch millis of the last restore, 0 if never recorded
    pub last_access: u64,
    /// Epoch millis of the last write, set by the store
    pub last_modified: u64,
}

impl CacheItem {
    pub fn from_object(scope: &StorageScope, object: &ObjectInfo) -> Option<Self> {
        let key = scope.key_of(&object.name)?;
        let last_access = object
            .metadata
            .get(LAST_ACCESS_KEY)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Some(Self {
            key: key.to_string(),
            content_length: object.content_length,
            last_access,
            last_modified: object.last_modified,
        })
    }
}

/// Ordered candidate keys: the primary key, then fallback prefixes.
/// Order is priority. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreKeySet {
    keys: Vec<String>,
}

impl RestoreKeySet {
    /// Build a key set; blank and repeated fallbacks are dropped, order is kept
    pub fn new(primary: &str, fallbacks: &[String]) -> Result<Self> {
        if primary.trim().is_empty() {
            return Err(anyhow!("cache key must not be empty"));
        }
        let mut keys = vec![primary.to_string()];
        for fallback in fallbacks {
            if !fallback.trim().is_empty() && !keys.contains(fallback) {
                keys.push(fallback.clone());
            }
        }
        Ok(Self { keys })
    }

    pub fn primary(&self) -> &str {
        &self.keys[0]
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(String::as_str)
    }
}
