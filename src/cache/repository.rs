//! Object Repository
//!
//! Cache-level view of one storage scope: existence checks, lazy paginated
//! listing, size accounting, last-access stamps, write streams and the restore
//! key resolution algorithm.

use std::collections::VecDeque;
use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use tempfile::NamedTempFile;
use tokio::io::AsyncWrite;
use tracing::{debug, info};

use super::item::{CacheItem, RestoreKeySet, StorageScope, LAST_ACCESS_KEY};
use crate::store::{is_not_found, Metadata, StorageBackend};

/// Objects requested per listing page
pub const LIST_PAGE_SIZE: u32 = 1000;

/// Names per bulk-delete request
const DELETE_BATCH: usize = 1000;

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Repository over one storage scope
#[derive(Clone)]
pub struct ObjectRepository {
    store: StorageBackend,
    scope: StorageScope,
}

impl ObjectRepository {
    pub fn new(store: StorageBackend, scope: StorageScope) -> Self {
        Self { store, scope }
    }

    pub fn scope(&self) -> &StorageScope {
        &self.scope
    }

    /// Point lookup, no side effects
    pub async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.stat(key).await?.is_some())
    }

    /// Current description of one key, `None` if absent
    pub async fn stat(&self, key: &str) -> Result<Option<CacheItem>> {
        let name = self.scope.object_name(key);
        match self.store.head_object(&self.scope.bucket, &name).await {
            Ok(object) => Ok(CacheItem::from_object(&self.scope, &object)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to look up cache key '{}'", key)),
        }
    }

    /// Metadata stored with `key`
    pub async fn metadata(&self, key: &str) -> Result<Metadata> {
        let name = self.scope.object_name(key);
        let object = self
            .store
            .head_object(&self.scope.bucket, &name)
            .await
            .with_context(|| format!("Failed to read metadata of '{}'", key))?;
        Ok(object.metadata)
    }

    /// Resolve restore keys to a stored key.
    ///
    /// Exact matches are tried first, in the given order. Only if none exists is
    /// each key used as a prefix, again in the given order; the first key with
    /// any prefix match wins, and among its matches the most recently written
    /// object wins.
    pub async fn find_key(&self, restore_keys: &RestoreKeySet) -> Result<Option<String>> {
        for key in restore_keys.iter() {
            if self.exists(key).await? {
                debug!(key = key, "Exact cache key match");
                return Ok(Some(key.to_string()));
            }
        }

        for prefix in restore_keys.iter() {
            if let Some(item) = self.latest_with_prefix(prefix).await? {
                debug!(prefix = prefix, key = %item.key, "Prefix cache key match");
                return Ok(Some(item.key));
            }
        }

        debug!(primary = restore_keys.primary(), "No cache key matched");
        Ok(None)
    }

    /// Most recently modified item whose key starts with `prefix`.
    /// Equal timestamps go to the lexicographically greatest key.
    pub async fn latest_with_prefix(&self, prefix: &str) -> Result<Option<CacheItem>> {
        let mut listing = self.list_prefix(prefix);
        let mut latest: Option<CacheItem> = None;
        while let Some(item) = listing.next().await? {
            if latest
                .as_ref()
                .map_or(true, |best| item.last_modified >= best.last_modified)
            {
                latest = Some(item);
            }
        }
        Ok(latest)
    }

    /// Every item in the scope
    pub fn list(&self) -> ItemListing {
        self.list_prefix("")
    }

    /// Every item whose key starts with `prefix`
    pub fn list_prefix(&self, prefix: &str) -> ItemListing {
        ItemListing {
            store: self.store.clone(),
            scope: self.scope.clone(),
            prefix: self.scope.object_name(prefix),
            buffer: VecDeque::new(),
            next_start: None,
            done: false,
            pages: 0,
        }
    }

    /// Total bytes stored in the scope, across every listing page
    pub async fn total_size(&self) -> Result<u64> {
        let mut listing = self.list();
        let mut total = 0u64;
        while let Some(item) = listing.next().await? {
            total += item.content_length;
        }
        debug!(scope = %self.scope.prefix, total = total, "Computed scope size");
        Ok(total)
    }

    /// Bulk delete; keys already gone are not an error
    ///
    /// # Returns
    /// How many objects were actually removed
    pub async fn delete(&self, keys: &[String]) -> Result<usize> {
        let names: Vec<String> = keys.iter().map(|k| self.scope.object_name(k)).collect();
        let mut deleted = 0;
        for batch in names.chunks(DELETE_BATCH) {
            deleted += self
                .store
                .delete_objects(&self.scope.bucket, batch)
                .await
                .context("Failed to delete cache objects")?;
        }
        Ok(deleted)
    }

    /// Delete every object in the scope
    pub async fn delete_all(&self) -> Result<usize> {
        let keys: Vec<String> = self
            .list()
            .collect_all()
            .await?
            .into_iter()
            .map(|item| item.key)
            .collect();
        let deleted = self.delete(&keys).await?;
        info!(scope = %self.scope.prefix, deleted = deleted, "Deleted cache scope");
        Ok(deleted)
    }

    /// Stamp an item's last access with the current time.
    ///
    /// Rewrites the object's metadata in place; other metadata entries, the
    /// content and the content length stay as they are.
    pub async fn update_last_access(&self, item: &CacheItem) -> Result<CacheItem> {
        let name = self.scope.object_name(&item.key);
        let current = self
            .store
            .head_object(&self.scope.bucket, &name)
            .await
            .with_context(|| format!("Failed to read metadata of '{}'", item.key))?;

        let mut metadata = current.metadata;
        metadata.insert(LAST_ACCESS_KEY.to_string(), now_millis().to_string());
        let updated = self
            .store
            .copy_with_metadata(&self.scope.bucket, &name, &metadata)
            .await
            .with_context(|| format!("Failed to update last access of '{}'", item.key))?;

        debug!(key = %item.key, "Updated last access");
        CacheItem::from_object(&self.scope, &updated)
            .ok_or_else(|| anyhow!("store renamed '{}' while updating metadata", item.key))
    }

    /// Open a write stream for `key`. Nothing is stored until
    /// [`ObjectWriter::finish`] succeeds.
    pub fn create_write_stream(&self, key: &str, metadata: Metadata) -> Result<ObjectWriter> {
        let spool = NamedTempFile::new().context("Failed to create upload spool file")?;

        Ok(ObjectWriter {
            repo: self.clone(),
            key: key.to_string(),
            metadata,
            spool,
            written: 0,
        })
    }

    /// Upload an open file under `key`
    pub async fn put_file(
        &self,
        key: &str,
        file: tokio::fs::File,
        metadata: &Metadata,
    ) -> Result<CacheItem> {
        let name = self.scope.object_name(key);
        let object = self
            .store
            .put_object(&self.scope.bucket, &name, file, metadata)
            .await
            .with_context(|| format!("Failed to upload '{}'", key))?;
        CacheItem::from_object(&self.scope, &object)
            .ok_or_else(|| anyhow!("store returned a foreign name for '{}'", key))
    }

    /// Stream the content of `key` into `sink`
    pub async fn download<W>(&self, key: &str, sink: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let name = self.scope.object_name(key);
        self.store
            .get_object(&self.scope.bucket, &name, sink)
            .await
            .with_context(|| format!("Failed to download '{}'", key))
    }

    /// Preflight check. A missing bucket is `false`; any other failure is an error.
    pub async fn bucket_reachable(&self) -> Result<bool> {
        match self.store.bucket_exists(&self.scope.bucket).await {
            Ok(()) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e).context("Failed to check bucket"),
        }
    }
}

/// Lazy, forward-only listing. Pages are fetched on demand and the
/// continuation is followed until a page is not truncated.
pub struct ItemListing {
    store: StorageBackend,
    scope: StorageScope,
    prefix: String,
    buffer: VecDeque<CacheItem>,
    next_start: Option<String>,
    done: bool,
    pages: usize,
}

impl ItemListing {
    pub async fn next(&mut self) -> Result<Option<CacheItem>> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Ok(Some(item));
            }
            if self.done {
                return Ok(None);
            }

            let page = self
                .store
                .list_page(
                    &self.scope.bucket,
                    &self.prefix,
                    self.next_start.as_deref(),
                    LIST_PAGE_SIZE,
                )
                .await
                .with_context(|| format!("Failed to list '{}'", self.prefix))?;
            self.pages += 1;

            let stalled = page.objects.is_empty() && page.next == self.next_start;
            self.buffer.extend(
                page.objects
                    .iter()
                    .filter_map(|object| CacheItem::from_object(&self.scope, object)),
            );
            match page.next {
                Some(next) if !stalled => self.next_start = Some(next),
                _ => self.done = true,
            }
        }
    }

    /// Drain the listing into memory
    pub async fn collect_all(mut self) -> Result<Vec<CacheItem>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await? {
            items.push(item);
        }
        Ok(items)
    }

    #[cfg(test)]
    pub fn pages_fetched(&self) -> usize {
        self.pages
    }
}

/// Spooling write stream for one object
pub struct ObjectWriter {
    repo: ObjectRepository,
    key: String,
    metadata: Metadata,
    spool: NamedTempFile,
    written: u64,
}

impl ObjectWriter {
    #[cfg(test)]
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Upload the spooled content; the object becomes visible only now
    pub async fn finish(mut self) -> Result<CacheItem> {
        self.spool.flush().context("Failed to flush upload spool")?;
        let file = tokio::fs::File::from_std(
            self.spool
                .reopen()
                .context("Failed to reopen upload spool")?,
        );
        let item = self.repo.put_file(&self.key, file, &self.metadata).await?;
        info!(key = %self.key, size = item.content_length, "Stored cache object");
        Ok(item)
    }
}

impl Write for ObjectWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.spool.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.spool.flush()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::LocalStore;
    use filetime::{set_file_mtime, FileTime};
    use tempfile::TempDir;

    pub(crate) struct Fixture {
        pub _dir: TempDir,
        pub store: LocalStore,
        pub repo: ObjectRepository,
    }

    pub(crate) fn fixture(page_size: u32) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path().join("store")).with_page_size(page_size);
        store.create_bucket("bucket").unwrap();
        let repo = ObjectRepository::new(
            StorageBackend::Local(store.clone()),
            StorageScope::new("bucket", "jobs/app/maven"),
        );
        Fixture {
            _dir: dir,
            store,
            repo,
        }
    }

    pub(crate) async fn put(fx: &Fixture, key: &str, content: &[u8]) -> CacheItem {
        let mut writer = fx.repo.create_write_stream(key, Metadata::new()).unwrap();
        writer.write_all(content).unwrap();
        writer.finish().await.unwrap()
    }

    /// Pin an object's last-modified time (seconds since epoch)
    pub(crate) fn set_modified(fx: &Fixture, key: &str, secs: i64) {
        let path = fx
            .store
            .object_path("bucket", &fx.repo.scope().object_name(key));
        set_file_mtime(path, FileTime::from_unix_time(secs, 0)).unwrap();
    }

    fn keys(primary: &str, fallbacks: &[&str]) -> RestoreKeySet {
        let fallbacks: Vec<String> = fallbacks.iter().map(|s| s.to_string()).collect();
        RestoreKeySet::new(primary, &fallbacks).unwrap()
    }

    #[tokio::test]
    async fn test_exact_match_wins_over_list_position() {
        let fx = fixture(1000);
        put(&fx, "A", b"a").await;
        put(&fx, "B-old", b"b").await;

        // "B" only prefix-matches, so the exact "A" wins even though it is listed second
        let found = fx.repo.find_key(&keys("B", &["A"])).await.unwrap();
        assert_eq!(found.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn test_first_existing_exact_key_wins() {
        let fx = fixture(1000);
        put(&fx, "b", b"1").await;
        put(&fx, "a", b"2").await;
        put(&fx, "c", b"3").await;

        let found = fx.repo.find_key(&keys("b", &["a", "c"])).await.unwrap();
        assert_eq!(found.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_prefix_pass_prefers_list_order_over_specificity() {
        let fx = fixture(1000);
        put(&fx, "b-1", b"1").await;
        put(&fx, "a-1", b"2").await;
        put(&fx, "c-1", b"3").await;
        // The "a" match is newer, but "b" is listed first
        set_modified(&fx, "b-1", 1_000);
        set_modified(&fx, "a-1", 5_000);

        let found = fx
            .repo
            .find_key(&keys("missing", &["b", "a", "c"]))
            .await
            .unwrap();
        assert_eq!(found.as_deref(), Some("b-1"));
    }

    #[tokio::test]
    async fn test_latest_modified_wins_within_prefix() {
        let fx = fixture(1000);
        for key in ["cache-1", "cache-2", "cache-3"] {
            put(&fx, key, key.as_bytes()).await;
        }
        set_modified(&fx, "cache-1", 1_000);
        set_modified(&fx, "cache-2", 3_000);
        set_modified(&fx, "cache-3", 2_000);

        let found = fx
            .repo
            .find_key(&keys("cache-main", &["cache-"]))
            .await
            .unwrap();
        assert_eq!(found.as_deref(), Some("cache-2"));
    }

    #[tokio::test]
    async fn test_equal_timestamps_pick_greatest_key() {
        let fx = fixture(1000);
        put(&fx, "k-a", b"1").await;
        put(&fx, "k-b", b"2").await;
        set_modified(&fx, "k-a", 1_000);
        set_modified(&fx, "k-b", 1_000);

        let latest = fx.repo.latest_with_prefix("k-").await.unwrap().unwrap();
        assert_eq!(latest.key, "k-b");
    }

    #[tokio::test]
    async fn test_no_match_in_empty_store() {
        let fx = fixture(1000);
        let found = fx.repo.find_key(&keys("x", &["y"])).await.unwrap();
        assert_eq!(found, None);
    }

    #[tokio::test]
    async fn test_listing_follows_truncated_pages() {
        let fx = fixture(2);
        for i in 0..5 {
            put(&fx, &format!("k{}", i), b"abc").await;
        }

        let mut listing = fx.repo.list();
        let mut keys = Vec::new();
        while let Some(item) = listing.next().await.unwrap() {
            keys.push(item.key);
        }
        assert_eq!(keys, vec!["k0", "k1", "k2", "k3", "k4"]);
        assert_eq!(listing.pages_fetched(), 3);

        assert_eq!(fx.repo.total_size().await.unwrap(), 15);
    }

    #[tokio::test]
    async fn test_listing_is_scoped() {
        let fx = fixture(1000);
        put(&fx, "k", b"1").await;
        let sibling = ObjectRepository::new(
            StorageBackend::Local(fx.store.clone()),
            StorageScope::new("bucket", "jobs/app/gradle"),
        );
        let mut writer = sibling.create_write_stream("k", Metadata::new()).unwrap();
        writer.write_all(b"22").unwrap();
        writer.finish().await.unwrap();

        assert_eq!(fx.repo.list().collect_all().await.unwrap().len(), 1);
        assert_eq!(fx.repo.total_size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_reports_actual_removals() {
        let fx = fixture(1000);
        put(&fx, "a", b"1").await;
        put(&fx, "b", b"1").await;

        let deleted = fx
            .repo
            .delete(&["a".to_string(), "gone".to_string()])
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(!fx.repo.exists("a").await.unwrap());
        assert!(fx.repo.exists("b").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_all_empties_scope() {
        let fx = fixture(2);
        for i in 0..5 {
            put(&fx, &format!("k{}", i), b"x").await;
        }
        assert_eq!(fx.repo.delete_all().await.unwrap(), 5);
        assert_eq!(fx.repo.total_size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_update_last_access_keeps_content() {
        let fx = fixture(1000);
        let mut metadata = Metadata::new();
        metadata.insert("codec".to_string(), "tgz".to_string());
        let mut writer = fx.repo.create_write_stream("k", metadata).unwrap();
        writer.write_all(b"payload").unwrap();
        let item = writer.finish().await.unwrap();
        assert_eq!(item.last_access, 0);

        let updated = fx.repo.update_last_access(&item).await.unwrap();
        assert!(updated.last_access > 0);
        assert_eq!(updated.content_length, 7);

        let head = fx
            .store
            .head_object("bucket", "jobs/app/maven/k")
            .await
            .unwrap();
        assert_eq!(head.metadata.get("codec").map(String::as_str), Some("tgz"));

        let mut out = Vec::new();
        fx.repo.download("k", &mut out).await.unwrap();
        assert_eq!(out, b"payload");
    }

    #[tokio::test]
    async fn test_write_stream_not_durable_until_finished() {
        let fx = fixture(1000);
        let mut writer = fx.repo.create_write_stream("k", Metadata::new()).unwrap();
        writer.write_all(b"partial").unwrap();
        assert_eq!(writer.written(), 7);
        assert!(!fx.repo.exists("k").await.unwrap());
        drop(writer);
        assert!(!fx.repo.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_bucket_reachable() {
        let fx = fixture(1000);
        assert!(fx.repo.bucket_reachable().await.unwrap());

        let missing = ObjectRepository::new(
            StorageBackend::Local(fx.store.clone()),
            StorageScope::new("no-such-bucket", ""),
        );
        assert!(!missing.bucket_reachable().await.unwrap());
    }

    #[tokio::test]
    async fn test_broken_store_root_is_a_hard_failure() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("store");
        std::fs::write(&root, b"not a directory").unwrap();
        let repo = ObjectRepository::new(
            StorageBackend::Local(LocalStore::new(&root)),
            StorageScope::new("bucket", ""),
        );
        assert!(repo.bucket_reachable().await.is_err());

        let fx = fixture(1000);
        std::fs::write(fx._dir.path().join("store/bucket/objects/plain"), b"x").unwrap();
        let as_bucket = ObjectRepository::new(
            StorageBackend::Local(LocalStore::new(fx._dir.path().join("store/bucket/objects"))),
            StorageScope::new("plain", ""),
        );
        assert!(as_bucket.bucket_reachable().await.is_err());
    }

    #[tokio::test]
    async fn test_exists_propagates_store_errors() {
        let fx = fixture(1000);
        put(&fx, "k1", b"content").await;
        assert!(fx.repo.exists("k1").await.unwrap());

        let sidecar = fx
            ._dir
            .path()
            .join("store/bucket/meta")
            .join(fx.repo.scope().object_name("k1"));
        std::fs::write(&sidecar, b"{ not json").unwrap();
        assert!(fx.repo.exists("k1").await.is_err());
        assert!(!fx.repo.exists("k2").await.unwrap());
    }
}
