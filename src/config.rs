//! Daemon configuration
//!
//! Read from the environment. Credentials stay on the daemon side; cache requests
//! only ever carry job, path and key data.

use std::env;
use std::fmt;
use std::path::PathBuf;

use anyhow::{anyhow, Result};

use crate::cache::StorageScope;

/// Default Unix socket for cache requests
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/buildcache.sock";

/// Default bucket name
pub const DEFAULT_BUCKET: &str = "buildcache";

/// Which storage backend to use
#[derive(Clone)]
pub enum BackendConfig {
    /// Filesystem store rooted at `root`
    Local { root: PathBuf },
    /// Backblaze B2 with an application key
    B2 { key_id: String, key: String },
}

impl fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendConfig::Local { root } => f.debug_struct("Local").field("root", root).finish(),
            BackendConfig::B2 { key_id, .. } => f
                .debug_struct("B2")
                .field("key_id", key_id)
                .field("key", &"<redacted>")
                .finish(),
        }
    }
}

/// Daemon-wide settings
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub backend: BackendConfig,
    /// Bucket holding every job's caches
    pub bucket: String,
    /// Prefix under which job scopes live (empty or ending in '/')
    pub prefix: String,
    pub socket_path: PathBuf,
}

/// Default root for the local backend
fn default_local_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("buildcache")
}

/// Normalize a scope prefix to "" or "something/"
fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}/", trimmed)
    }
}

impl DaemonConfig {
    /// Load configuration from `BUILDCACHE_*` and `B2_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let backend = match lookup("BUILDCACHE_BACKEND").as_deref().unwrap_or("local") {
            "local" => BackendConfig::Local {
                root: lookup("BUILDCACHE_LOCAL_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or_else(default_local_root),
            },
            "b2" => BackendConfig::B2 {
                key_id: lookup("B2_KEY_ID")
                    .ok_or_else(|| anyhow!("B2_KEY_ID must be set for the b2 backend"))?,
                key: lookup("B2_KEY")
                    .ok_or_else(|| anyhow!("B2_KEY must be set for the b2 backend"))?,
            },
            other => return Err(anyhow!("Unknown BUILDCACHE_BACKEND '{}'", other)),
        };

        Ok(Self {
            backend,
            bucket: lookup("BUILDCACHE_BUCKET").unwrap_or_else(|| DEFAULT_BUCKET.to_string()),
            prefix: normalize_prefix(&lookup("BUILDCACHE_PREFIX").unwrap_or_default()),
            socket_path: lookup("BUILDCACHE_SOCKET")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH)),
        })
    }

    /// Scope under which every job scope lives
    pub fn root_scope(&self) -> StorageScope {
        StorageScope::new(&self.bucket, &self.prefix)
    }
}
