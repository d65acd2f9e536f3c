//! Object store backends
//!
//! The cache engine talks to storage through [`StorageBackend`], a closed set of
//! backends that all offer the same narrow protocol: paginated listing, head,
//! streamed get/put, metadata replacement, batch delete and head-bucket.

pub mod b2;
pub mod errors;
pub mod local;
pub mod metadata;
pub mod types;

use anyhow::Result;
use tokio::io::AsyncWrite;

pub use b2::{B2Store, ErrorEntry};
pub use errors::is_not_found;
pub use local::LocalStore;
pub use types::{ListPage, Metadata, ObjectInfo};

use crate::config::BackendConfig;

/// A configured storage backend
#[derive(Clone)]
pub enum StorageBackend {
    /// Filesystem emulation of an object store
    Local(LocalStore),
    /// Backblaze B2
    B2(B2Store),
}

impl StorageBackend {
    /// Build the backend selected by configuration
    pub async fn from_config(config: &BackendConfig) -> Result<Self> {
        match config {
            BackendConfig::Local { root } => Ok(StorageBackend::Local(LocalStore::new(root))),
            BackendConfig::B2 { key_id, key } => {
                Ok(StorageBackend::B2(B2Store::authorize(key_id, key).await?))
            }
        }
    }

    /// Backend name for logs and status
    pub fn kind(&self) -> &'static str {
        match self {
            StorageBackend::Local(_) => "local",
            StorageBackend::B2(_) => "b2",
        }
    }

    pub async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        start: Option<&str>,
        max: u32,
    ) -> Result<ListPage> {
        match self {
            StorageBackend::Local(s) => s.list_page(bucket, prefix, start, max).await,
            StorageBackend::B2(s) => s.list_page(bucket, prefix, start, max).await,
        }
    }

    pub async fn head_object(&self, bucket: &str, name: &str) -> Result<ObjectInfo> {
        match self {
            StorageBackend::Local(s) => s.head_object(bucket, name).await,
            StorageBackend::B2(s) => s.head_object(bucket, name).await,
        }
    }

    pub async fn get_object<W>(&self, bucket: &str, name: &str, sink: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        match self {
            StorageBackend::Local(s) => s.get_object(bucket, name, sink).await,
            StorageBackend::B2(s) => s.get_object(bucket, name, sink).await,
        }
    }

    pub async fn put_object(
        &self,
        bucket: &str,
        name: &str,
        file: tokio::fs::File,
        metadata: &Metadata,
    ) -> Result<ObjectInfo> {
        match self {
            StorageBackend::Local(s) => s.put_object(bucket, name, file, metadata).await,
            StorageBackend::B2(s) => s.put_object(bucket, name, file, metadata).await,
        }
    }

    pub async fn copy_with_metadata(
        &self,
        bucket: &str,
        name: &str,
        metadata: &Metadata,
    ) -> Result<ObjectInfo> {
        match self {
            StorageBackend::Local(s) => s.copy_with_metadata(bucket, name, metadata).await,
            StorageBackend::B2(s) => s.copy_with_metadata(bucket, name, metadata).await,
        }
    }

    pub async fn delete_objects(&self, bucket: &str, names: &[String]) -> Result<usize> {
        match self {
            StorageBackend::Local(s) => s.delete_objects(bucket, names).await,
            StorageBackend::B2(s) => s.delete_objects(bucket, names).await,
        }
    }

    pub async fn bucket_exists(&self, bucket: &str) -> Result<()> {
        match self {
            StorageBackend::Local(s) => s.bucket_exists(bucket).await,
            StorageBackend::B2(s) => s.bucket_exists(bucket).await,
        }
    }

    /// Connection health, for status reporting
    pub fn health_status(&self) -> &'static str {
        match self {
            StorageBackend::Local(_) => "healthy",
            StorageBackend::B2(s) => s.health_status(),
        }
    }

    /// Recent store errors, for status reporting
    pub fn recent_errors(&self) -> Vec<ErrorEntry> {
        match self {
            StorageBackend::Local(_) => Vec::new(),
            StorageBackend::B2(s) => s.recent_errors(),
        }
    }
}
