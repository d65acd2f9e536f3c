//! Local Object Store
//!
//! Emulates the object store protocol on the local filesystem so a single machine
//! (or a shared mount) can hold caches without a network store.
//!
//! Layout under the root directory:
//! - `<bucket>/objects/<name>` holds object content; its mtime is the object's
//!   last-modified time
//! - `<bucket>/meta/<name>` holds a JSON sidecar with the user metadata
//! - `<bucket>/tmp/` holds spool files of writes in progress

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use super::errors::StoreError;
use super::types::{ListPage, LocalSidecar, Metadata, ObjectInfo};

/// Default listing page size
const DEFAULT_PAGE_SIZE: u32 = 1000;

/// Filesystem-backed object store
#[derive(Debug, Clone)]
pub struct LocalStore {
    /// Directory containing one subdirectory per bucket
    root: PathBuf,
    /// Maximum objects per listing page
    page_size: u32,
}

fn not_found(what: impl Into<String>) -> anyhow::Error {
    anyhow::Error::new(StoreError::NotFound(what.into()))
}

/// Reject names that would escape the bucket directory
fn check_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name.starts_with('/')
        || name.ends_with('/')
        || name.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if bad {
        return Err(anyhow::Error::new(StoreError::Request(format!(
            "invalid object name '{}'",
            name
        ))));
    }
    Ok(())
}

impl LocalStore {
    /// Create a store rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    #[cfg(test)]
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Create a bucket directory
    pub fn create_bucket(&self, bucket: &str) -> Result<()> {
        let dir = self.root.join(bucket);
        fs::create_dir_all(dir.join("objects"))
            .with_context(|| format!("Failed to create bucket directory: {:?}", dir))?;
        fs::create_dir_all(dir.join("meta"))
            .with_context(|| format!("Failed to create bucket directory: {:?}", dir))?;
        fs::create_dir_all(dir.join("tmp"))
            .with_context(|| format!("Failed to create bucket directory: {:?}", dir))?;
        info!(bucket = bucket, root = %self.root.display(), "Created local bucket");
        Ok(())
    }

    fn bucket_dir(&self, bucket: &str) -> Result<PathBuf> {
        let dir = self.root.join(bucket);
        match fs::metadata(&dir) {
            Ok(stat) if stat.is_dir() => Ok(dir),
            Ok(_) => Err(anyhow::Error::new(StoreError::Request(format!(
                "bucket path {:?} is not a directory",
                dir
            )))),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(not_found(format!("bucket '{}'", bucket)))
            }
            Err(e) => Err(e).with_context(|| format!("Failed to stat bucket: {:?}", dir)),
        }
    }

    /// Path of an object's content file
    pub(crate) fn object_path(&self, bucket: &str, name: &str) -> PathBuf {
        self.root.join(bucket).join("objects").join(name)
    }

    fn sidecar_path(&self, bucket: &str, name: &str) -> PathBuf {
        self.root.join(bucket).join("meta").join(name)
    }

    /// Temp file on the bucket's filesystem, outside `objects/` and `meta/`
    fn spool_file(&self, bucket: &str) -> Result<tempfile::NamedTempFile> {
        let dir = self.root.join(bucket).join("tmp");
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create spool directory: {:?}", dir))?;
        tempfile::NamedTempFile::new_in(&dir)
            .with_context(|| format!("Failed to create spool file in {:?}", dir))
    }

    /// Head-bucket: fails with NotFound when the bucket directory is missing
    pub async fn bucket_exists(&self, bucket: &str) -> Result<()> {
        self.bucket_dir(bucket).map(|_| ())
    }

    fn read_info(&self, bucket: &str, name: &str) -> Result<ObjectInfo> {
        let path = self.object_path(bucket, name);
        let stat = match fs::metadata(&path) {
            Ok(stat) if stat.is_file() => stat,
            Ok(_) => return Err(not_found(name)),
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(not_found(name)),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to stat object: {:?}", path))
            }
        };

        let last_modified = stat
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let sidecar = match fs::read(self.sidecar_path(bucket, name)) {
            Ok(bytes) => serde_json::from_slice::<LocalSidecar>(&bytes)
                .with_context(|| format!("Corrupt metadata sidecar for {}", name))?,
            Err(e) if e.kind() == ErrorKind::NotFound => LocalSidecar::default(),
            Err(e) => return Err(e).context("Failed to read metadata sidecar"),
        };

        Ok(ObjectInfo {
            name: name.to_string(),
            content_length: stat.len(),
            last_modified,
            metadata: sidecar.metadata,
            file_id: None,
        })
    }

    fn write_sidecar(&self, bucket: &str, name: &str, metadata: &Metadata) -> Result<()> {
        let path = self.sidecar_path(bucket, name);
        let parent = path.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create metadata directory: {:?}", parent))?;

        let sidecar = LocalSidecar {
            metadata: metadata.clone(),
        };
        let json = serde_json::to_vec(&sidecar).context("Failed to serialize metadata")?;

        let mut tmp = self.spool_file(bucket)?;
        std::io::Write::write_all(&mut tmp, &json).context("Failed to write metadata")?;
        tmp.persist(&path)
            .with_context(|| format!("Failed to persist metadata: {:?}", path))?;
        Ok(())
    }

    /// All object names under `prefix`, sorted
    fn names_with_prefix(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let objects = self.bucket_dir(bucket)?.join("objects");
        if !objects.is_dir() {
            return Ok(Vec::new());
        }

        // Only walk the deepest directory the prefix fully names
        let walk_root = match prefix.rfind('/') {
            Some(idx) => objects.join(&prefix[..idx]),
            None => objects.clone(),
        };
        if !walk_root.is_dir() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in walkdir::WalkDir::new(&walk_root) {
            let entry = entry.context("Failed to walk local bucket")?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&objects) else {
                continue;
            };
            let name = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if name.starts_with(prefix) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// List one page of objects whose names start with `prefix`
    pub async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        start: Option<&str>,
        max: u32,
    ) -> Result<ListPage> {
        let max = max.min(self.page_size).max(1) as usize;
        let names = self.names_with_prefix(bucket, prefix)?;
        let begin = match start {
            Some(start) => names.partition_point(|n| n.as_str() < start),
            None => 0,
        };

        let mut objects = Vec::new();
        let mut next = None;
        for name in &names[begin..] {
            if objects.len() == max {
                next = Some(name.clone());
                break;
            }
            match self.read_info(bucket, name) {
                Ok(info) => objects.push(info),
                // Deleted between the walk and the stat
                Err(e) if super::errors::is_not_found(&e) => {}
                Err(e) => return Err(e),
            }
        }

        let page = ListPage { objects, next };
        debug!(
            prefix = prefix,
            count = page.objects.len(),
            truncated = page.is_truncated(),
            "Listed local objects"
        );
        Ok(page)
    }

    pub async fn head_object(&self, bucket: &str, name: &str) -> Result<ObjectInfo> {
        self.bucket_dir(bucket)?;
        check_name(name)?;
        self.read_info(bucket, name)
    }

    /// Stream an object's content into `sink`
    pub async fn get_object<W>(&self, bucket: &str, name: &str, sink: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        self.bucket_dir(bucket)?;
        check_name(name)?;
        let path = self.object_path(bucket, name);
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(not_found(name)),
            Err(e) => return Err(e).with_context(|| format!("Failed to open object: {:?}", path)),
        };
        let written = tokio::io::copy(&mut file, sink)
            .await
            .with_context(|| format!("Failed to read object: {}", name))?;
        sink.flush().await.context("Failed to flush object content")?;
        debug!(name = name, size = written, "Read local object");
        Ok(written)
    }

    /// Store an object from an open file, replacing any previous content
    pub async fn put_object(
        &self,
        bucket: &str,
        name: &str,
        mut file: tokio::fs::File,
        metadata: &Metadata,
    ) -> Result<ObjectInfo> {
        self.bucket_dir(bucket)?;
        check_name(name)?;
        let path = self.object_path(bucket, name);
        let parent = path.parent().unwrap_or(Path::new(".")).to_path_buf();
        tokio::fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("Failed to create object directory: {:?}", parent))?;

        let (std_file, tmp_path) = self.spool_file(bucket)?.into_parts();
        let mut out = tokio::fs::File::from_std(std_file);
        tokio::io::copy(&mut file, &mut out)
            .await
            .with_context(|| format!("Failed to write object: {}", name))?;
        out.sync_all().await.context("Failed to sync object")?;
        drop(out);

        self.write_sidecar(bucket, name, metadata)?;
        tmp_path
            .persist(&path)
            .with_context(|| format!("Failed to persist object: {:?}", path))?;

        debug!(name = name, "Stored local object");
        self.read_info(bucket, name)
    }

    /// Replace an object's metadata; content and mtime are untouched
    pub async fn copy_with_metadata(
        &self,
        bucket: &str,
        name: &str,
        metadata: &Metadata,
    ) -> Result<ObjectInfo> {
        let current = self.head_object(bucket, name).await?;
        self.write_sidecar(bucket, name, metadata)?;
        Ok(ObjectInfo {
            metadata: metadata.clone(),
            ..current
        })
    }

    /// Delete objects by name, returning how many existed
    pub async fn delete_objects(&self, bucket: &str, names: &[String]) -> Result<usize> {
        self.bucket_dir(bucket)?;
        let mut deleted = 0;
        for name in names {
            check_name(name)?;
            match fs::remove_file(self.object_path(bucket, name)) {
                Ok(()) => deleted += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to delete object: {}", name))
                }
            }
            match fs::remove_file(self.sidecar_path(bucket, name)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to delete metadata: {}", name))
                }
            }
        }
        debug!(requested = names.len(), deleted = deleted, "Deleted local objects");
        Ok(deleted)
    }
}
