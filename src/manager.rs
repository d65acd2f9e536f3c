//! Cache Manager - Executes cache requests against the configured store
//!
//! Shared by the IPC server and the CLI. Every session it creates uses the same
//! job locks and cancellation token.

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cache::session::check_segment;
use crate::cache::{CacheRequest, CacheSession, JobLocks, ObjectRepository, SaveStatus, StorageScope};
use crate::config::DaemonConfig;
use crate::store::StorageBackend;

pub struct CacheManager {
    store: StorageBackend,
    /// Scope under which job scopes live
    root: StorageScope,
    locks: JobLocks,
    cancel: CancellationToken,
}

impl CacheManager {
    pub fn new(store: StorageBackend, root: StorageScope, cancel: CancellationToken) -> Self {
        Self {
            store,
            root,
            locks: JobLocks::new(),
            cancel,
        }
    }

    /// Connect to the configured backend. A local backend gets its bucket
    /// created on first use.
    pub async fn from_config(config: &DaemonConfig, cancel: CancellationToken) -> Result<Self> {
        let store = StorageBackend::from_config(&config.backend).await?;
        if let StorageBackend::Local(local) = &store {
            local.create_bucket(&config.bucket)?;
        }
        info!(backend = store.kind(), bucket = %config.bucket, "Cache store ready");
        Ok(Self::new(store, config.root_scope(), cancel))
    }

    pub fn store(&self) -> &StorageBackend {
        &self.store
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Jobs currently holding or awaiting their lock
    pub fn active_locks(&self) -> usize {
        self.locks.active_jobs()
    }

    pub fn session(&self, request: CacheRequest) -> Result<CacheSession> {
        CacheSession::new(
            request,
            self.store.clone(),
            self.root.clone(),
            self.locks.clone(),
            self.cancel.clone(),
        )
    }

    /// Restore every cache of a request
    ///
    /// # Returns
    /// The session's status lines
    pub async fn restore(&self, request: CacheRequest) -> Result<Vec<String>> {
        let mut session = self.session(request)?;
        session.restore().await?;
        Ok(session.into_report().into_lines())
    }

    /// Save every cache of a request, or record that the build failed
    pub async fn save(
        &self,
        request: CacheRequest,
        body_succeeded: bool,
    ) -> Result<(Vec<String>, SaveStatus)> {
        let mut session = self.session(request)?;
        let status = session.save_after(body_succeeded).await;
        Ok((session.into_report().into_lines(), status))
    }

    fn job_repo(&self, job: &str) -> Result<ObjectRepository> {
        check_segment("job", job)?;
        Ok(ObjectRepository::new(self.store.clone(), self.root.child(job)))
    }

    /// Bytes stored for a job
    pub async fn size(&self, job: &str) -> Result<u64> {
        self.job_repo(job)?.total_size().await
    }

    /// Delete every cache of a job
    pub async fn purge(&self, job: &str) -> Result<usize> {
        let repo = self.job_repo(job)?;
        let deleted = {
            let _guard = self.locks.lock(job).await;
            repo.delete_all()
                .await
                .with_context(|| format!("Failed to purge job '{}'", job))?
        };
        info!(job = job, deleted = deleted, "Purged job caches");
        Ok(deleted)
    }

    /// Whether a deleted job has no sessions left holding its lock
    pub fn forget_job(&self, job: &str) -> bool {
        self.locks.forget(job)
    }

    /// Whether the configured bucket can be reached
    pub async fn preflight(&self) -> Result<bool> {
        ObjectRepository::new(self.store.clone(), self.root.clone())
            .bucket_reachable()
            .await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cache::archive::CompressionMethod;
    use crate::cache::session::CacheDefinition;
    use crate::store::LocalStore;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use tempfile::TempDir;

    pub(crate) fn manager(dir: &Path) -> CacheManager {
        let local = LocalStore::new(dir.join("store"));
        local.create_bucket("ci").unwrap();
        CacheManager::new(
            StorageBackend::Local(local),
            StorageScope::new("ci", ""),
            CancellationToken::new(),
        )
    }

    pub(crate) fn request(job: &str, workspace: &Path) -> CacheRequest {
        CacheRequest {
            job: job.to_string(),
            workspace: workspace.to_path_buf(),
            caches: vec![CacheDefinition {
                name: "deps".to_string(),
                path: PathBuf::from("deps"),
                key: "deps-1".to_string(),
                restore_keys: vec!["deps-".to_string()],
                includes: Vec::new(),
                excludes: Vec::new(),
                compression: CompressionMethod::TarGz,
            }],
            max_cache_size: 0,
            default_branch_job: None,
            skip_restore: false,
            skip_save: false,
        }
    }

    #[tokio::test]
    async fn test_save_size_purge() {
        let dir = TempDir::new().unwrap();
        let manager = manager(dir.path());
        let ws = TempDir::new().unwrap();
        std::fs::create_dir_all(ws.path().join("deps")).unwrap();
        std::fs::write(ws.path().join("deps/lib.a"), vec![7u8; 4096]).unwrap();

        let (lines, status) = manager.save(request("app", ws.path()), true).await.unwrap();
        assert_eq!(status, SaveStatus::Completed);
        assert_eq!(lines[0], "Cache 'deps' saved under key 'deps-1'");
        assert!(manager.size("app").await.unwrap() > 0);
        assert_eq!(manager.size("other").await.unwrap(), 0);

        assert_eq!(manager.purge("app").await.unwrap(), 1);
        assert_eq!(manager.size("app").await.unwrap(), 0);
        assert_eq!(manager.active_locks(), 0);

        let lines = manager.restore(request("app", ws.path())).await.unwrap();
        assert_eq!(lines[0], "Cache 'deps' not restored (no such key found)");
    }

    #[tokio::test]
    async fn test_failed_build_is_reported_without_saving() {
        let dir = TempDir::new().unwrap();
        let manager = manager(dir.path());
        let ws = TempDir::new().unwrap();
        std::fs::create_dir_all(ws.path().join("deps")).unwrap();

        let (lines, status) = manager.save(request("app", ws.path()), false).await.unwrap();
        assert_eq!(status, SaveStatus::SkippedBodyFailed);
        assert_eq!(lines, vec!["Caches not saved (build failed)".to_string()]);
        assert_eq!(manager.size("app").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_purge_leaves_held_job_lock_in_place() {
        let dir = TempDir::new().unwrap();
        let manager = Arc::new(manager(dir.path()));
        let held = manager.locks.lock("app").await;

        let purge = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.purge("app").await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!manager.forget_job("app"));
        drop(held);
        assert_eq!(purge.await.unwrap().unwrap(), 0);

        assert!(manager.forget_job("app"));
        assert_eq!(manager.active_locks(), 0);
    }

    #[tokio::test]
    async fn test_job_names_are_validated() {
        let dir = TempDir::new().unwrap();
        let manager = manager(dir.path());
        assert!(manager.size("../escape").await.is_err());
        assert!(manager.purge("").await.is_err());
        assert!(manager.preflight().await.unwrap());
    }
}
