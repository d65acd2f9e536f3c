//! Multi-file transfer tracking
//!
//! Starts many per-file uploads or downloads as tokio tasks, bounds how many are
//! outstanding, and joins them. Each task owns its open file and stream, so a task
//! that is aborted closes them exactly once when its future is dropped.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{anyhow, Context, Result};
use filetime::FileTime;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::item::CacheItem;
use super::repository::ObjectRepository;
use crate::store::Metadata;

/// Outstanding uploads before the batch is drained
pub const UPLOAD_SOFT_CAP: usize = 20;

/// Outstanding downloads before the batch is drained
pub const DOWNLOAD_SOFT_CAP: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("Transfers interrupted with {pending} still in flight")]
    Interrupted { pending: usize },
}

/// Whether an error chain carries an interruption
pub fn is_interrupted(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<TransferError>().is_some())
}

/// Totals over completed transfers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferSummary {
    pub transfers: usize,
    pub bytes: u64,
}

enum Next {
    Cancelled,
    Joined(Option<Result<Result<u64>, JoinError>>),
}

/// Batch of in-flight transfers
pub struct TransferTracker {
    kind: &'static str,
    tasks: JoinSet<Result<u64>>,
    soft_cap: usize,
    cancel: CancellationToken,
    completed: TransferSummary,
}

impl TransferTracker {
    pub fn new(kind: &'static str, soft_cap: usize, cancel: CancellationToken) -> Self {
        Self {
            kind,
            tasks: JoinSet::new(),
            soft_cap: soft_cap.max(1),
            cancel,
            completed: TransferSummary::default(),
        }
    }

    /// Transfers started and not yet joined
    fn outstanding(&self) -> usize {
        self.tasks.len()
    }

    /// Register a transfer. Does not wait for it, unless the soft cap is
    /// reached, in which case the current batch is drained first.
    pub async fn start<F>(&mut self, destination: String, transfer: F) -> Result<()>
    where
        F: Future<Output = Result<u64>> + Send + 'static,
    {
        if self.outstanding() >= self.soft_cap {
            debug!(
                kind = self.kind,
                outstanding = self.outstanding(),
                "Transfer cap reached, draining batch"
            );
            self.drain().await?;
        }

        self.tasks.spawn(async move {
            transfer
                .await
                .with_context(|| format!("Transfer of {} failed", destination))
        });
        Ok(())
    }

    /// Wait for every registered transfer.
    ///
    /// On cancellation every still-running transfer is aborted before
    /// [`TransferError::Interrupted`] is returned; the token stays cancelled.
    /// The first failed transfer also aborts the rest.
    pub async fn await_all(&mut self) -> Result<TransferSummary> {
        self.drain().await?;
        let summary = std::mem::take(&mut self.completed);
        info!(
            kind = self.kind,
            transfers = summary.transfers,
            bytes = summary.bytes,
            "Transfers complete"
        );
        Ok(summary)
    }

    async fn drain(&mut self) -> Result<()> {
        while !self.tasks.is_empty() {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Next::Cancelled,
                joined = self.tasks.join_next() => Next::Joined(joined),
            };

            match next {
                Next::Cancelled => {
                    let pending = self.tasks.len();
                    warn!(kind = self.kind, pending = pending, "Transfers interrupted");
                    self.cleanup().await;
                    return Err(TransferError::Interrupted { pending }.into());
                }
                Next::Joined(None) => break,
                Next::Joined(Some(Ok(Ok(bytes)))) => {
                    self.completed.transfers += 1;
                    self.completed.bytes += bytes;
                }
                Next::Joined(Some(Ok(Err(e)))) => {
                    self.cleanup().await;
                    return Err(e);
                }
                Next::Joined(Some(Err(join_err))) => {
                    self.cleanup().await;
                    return Err(anyhow!("{} task did not complete: {}", self.kind, join_err));
                }
            }
        }
        Ok(())
    }

    /// Abort and join every outstanding transfer. Idempotent; failures are
    /// logged, never returned.
    pub async fn cleanup(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        let pending = self.tasks.len();
        self.tasks.abort_all();
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(kind = self.kind, error = %e, "Transfer failed during cleanup"),
                Err(e) if e.is_cancelled() => {}
                Err(e) => warn!(kind = self.kind, error = %e, "Transfer task panicked"),
            }
        }
        debug!(kind = self.kind, pending = pending, "Cleaned up transfers");
    }
}

/// Concurrent uploads of local files into a repository
pub struct Uploads {
    repo: ObjectRepository,
    tracker: TransferTracker,
}

impl Uploads {
    pub fn new(repo: ObjectRepository, cancel: CancellationToken) -> Self {
        Self {
            repo,
            tracker: TransferTracker::new("upload", UPLOAD_SOFT_CAP, cancel),
        }
    }

    /// Open `file` and start uploading it under `key`
    pub async fn start_uploading(&mut self, file: &Path, key: &str, metadata: Metadata) -> Result<()> {
        let handle = tokio::fs::File::open(file)
            .await
            .with_context(|| format!("Failed to open {} for upload", file.display()))?;
        let repo = self.repo.clone();
        let key = key.to_string();
        self.tracker
            .start(key.clone(), async move {
                let item = repo.put_file(&key, handle, &metadata).await?;
                Ok(item.content_length)
            })
            .await
    }

    pub async fn finish_uploading(&mut self) -> Result<TransferSummary> {
        self.tracker.await_all().await
    }

    pub async fn cleanup(&mut self) {
        self.tracker.cleanup().await
    }
}

/// Epoch millis of a local file's mtime, if it exists
async fn local_modified_millis(path: &Path) -> Option<u64> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    let modified = meta.modified().ok()?;
    Some(modified.duration_since(UNIX_EPOCH).ok()?.as_millis() as u64)
}

fn file_time_from_millis(millis: u64) -> FileTime {
    FileTime::from_unix_time((millis / 1000) as i64, ((millis % 1000) * 1_000_000) as u32)
}

/// Concurrent, incremental downloads from a repository
pub struct Downloads {
    repo: ObjectRepository,
    tracker: TransferTracker,
    skipped: usize,
}

impl Downloads {
    pub fn new(repo: ObjectRepository, cancel: CancellationToken) -> Self {
        Self {
            repo,
            tracker: TransferTracker::new("download", DOWNLOAD_SOFT_CAP, cancel),
            skipped: 0,
        }
    }

    /// Start downloading `item` to `dest`.
    ///
    /// # Returns
    /// `false` when the local copy is not older than the remote object and the
    /// download was skipped
    pub async fn start_downloading(&mut self, item: &CacheItem, dest: PathBuf) -> Result<bool> {
        if let Some(local) = local_modified_millis(&dest).await {
            if local >= item.last_modified {
                debug!(key = %item.key, dest = %dest.display(), "Local copy is current, skipping");
                self.skipped += 1;
                return Ok(false);
            }
        }

        let parent = dest
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        tokio::fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;

        // Download beside the target and rename at the end, so an aborted
        // transfer never leaves a truncated file with a fresh mtime
        let spool = tempfile::Builder::new()
            .prefix(".tmp")
            .tempfile_in(&parent)
            .with_context(|| format!("Failed to create download spool in {}", parent.display()))?;
        let (std_file, spool_path) = spool.into_parts();
        let file = tokio::fs::File::from_std(std_file);

        let repo = self.repo.clone();
        let key = item.key.clone();
        let remote_modified = item.last_modified;
        self.tracker
            .start(dest.display().to_string(), async move {
                let mut file = file;
                let bytes = repo.download(&key, &mut file).await?;
                file.sync_all().await.context("Failed to sync download")?;
                drop(file);

                filetime::set_file_mtime(&spool_path, file_time_from_millis(remote_modified))
                    .context("Failed to set modification time")?;
                spool_path
                    .persist(&dest)
                    .with_context(|| format!("Failed to move download to {}", dest.display()))?;
                Ok(bytes)
            })
            .await?;
        Ok(true)
    }

    pub async fn finish_downloading(&mut self) -> Result<TransferSummary> {
        self.tracker.await_all().await
    }

    /// Downloads skipped because the local copy was current
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub async fn cleanup(&mut self) {
        self.tracker.cleanup().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::repository::tests::fixture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Stands in for an open stream; counts how often it is closed
    struct StreamProbe(Arc<AtomicUsize>);

    impl Drop for StreamProbe {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_interrupted_batch_closes_every_stream_once() {
        let cancel = CancellationToken::new();
        let closed = Arc::new(AtomicUsize::new(0));
        let mut tracker = TransferTracker::new("upload", 100, cancel.clone());

        for i in 0..5 {
            let probe = StreamProbe(closed.clone());
            tracker
                .start(format!("file-{}", i), async move {
                    let _stream = probe;
                    if i >= 3 {
                        std::future::pending::<()>().await;
                    }
                    Ok(1)
                })
                .await
                .unwrap();
        }

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = tracker.await_all().await.unwrap_err();
        assert!(is_interrupted(&err));
        assert!(matches!(
            err.downcast_ref::<TransferError>(),
            Some(TransferError::Interrupted { pending: 2 })
        ));
        assert_eq!(closed.load(Ordering::SeqCst), 5);
        assert_eq!(tracker.outstanding(), 0);
        assert!(cancel.is_cancelled());

        // Cleanup again is a no-op
        tracker.cleanup().await;
        assert_eq!(closed.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_failure_aborts_remaining_transfers() {
        let closed = Arc::new(AtomicUsize::new(0));
        let mut tracker = TransferTracker::new("download", 100, CancellationToken::new());

        let probe = StreamProbe(closed.clone());
        tracker
            .start("slow".to_string(), async move {
                let _stream = probe;
                std::future::pending::<()>().await;
                Ok(0)
            })
            .await
            .unwrap();
        tracker
            .start("broken".to_string(), async { Err(anyhow!("connection reset")) })
            .await
            .unwrap();

        let err = tracker.await_all().await.unwrap_err();
        assert!(format!("{:#}", err).contains("broken"));
        assert!(!is_interrupted(&err));
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_soft_cap_bounds_outstanding() {
        let mut tracker = TransferTracker::new("upload", 2, CancellationToken::new());
        for i in 0..7u64 {
            tracker
                .start(format!("f{}", i), async move { Ok(i) })
                .await
                .unwrap();
            assert!(tracker.outstanding() <= 2);
        }
        let summary = tracker.await_all().await.unwrap();
        assert_eq!(summary.transfers, 7);
        assert_eq!(summary.bytes, (0..7).sum::<u64>());
    }

    #[tokio::test]
    async fn test_upload_then_incremental_download() {
        let fx = fixture(2);
        let src = TempDir::new().unwrap();
        for name in ["a.txt", "b.txt", "c.txt"] {
            std::fs::write(src.path().join(name), name.as_bytes()).unwrap();
        }

        let mut uploads = Uploads::new(fx.repo.clone(), CancellationToken::new());
        for name in ["a.txt", "b.txt", "c.txt"] {
            uploads
                .start_uploading(&src.path().join(name), &format!("k/{}", name), Metadata::new())
                .await
                .unwrap();
        }
        let summary = uploads.finish_uploading().await.unwrap();
        assert_eq!(summary.transfers, 3);
        assert_eq!(summary.bytes, 15);

        let items = fx.repo.list_prefix("k/").collect_all().await.unwrap();
        assert_eq!(items.len(), 3);

        let dest = TempDir::new().unwrap();
        let mut downloads = Downloads::new(fx.repo.clone(), CancellationToken::new());
        for item in &items {
            let rel = item.key.trim_start_matches("k/");
            assert!(downloads
                .start_downloading(item, dest.path().join(rel))
                .await
                .unwrap());
        }
        downloads.finish_downloading().await.unwrap();

        for item in &items {
            let rel = item.key.trim_start_matches("k/");
            let path = dest.path().join(rel);
            assert_eq!(std::fs::read(&path).unwrap(), rel.as_bytes());
            assert_eq!(local_modified_millis(&path).await, Some(item.last_modified));
        }

        // Second pass: everything is current
        let mut again = Downloads::new(fx.repo.clone(), CancellationToken::new());
        for item in &items {
            let rel = item.key.trim_start_matches("k/");
            assert!(!again
                .start_downloading(item, dest.path().join(rel))
                .await
                .unwrap());
        }
        assert_eq!(again.skipped(), 3);
        assert_eq!(again.finish_downloading().await.unwrap().transfers, 0);
    }
}
