//! Cache sessions
//!
//! A session runs one restore, build, save cycle for the caches of a job. Each
//! decision produces exactly one status line in the session report, followed by
//! the step's elapsed time and throughput.
//!
//! Storage layout inside the job scope:
//! - `<name>/<key>`: packed archive, or the file manifest of an unpacked cache
//! - `<name>.files/<key>/<relative path>`: file blobs of an unpacked cache

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::io::{BufReader, ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::archive::{matching_files, pack, unpack, CompressionMethod, FileFilter};
use super::eviction::EvictionPolicy;
use super::item::{CacheItem, RestoreKeySet, StorageScope, CODEC_KEY};
use super::locks::JobLocks;
use super::repository::ObjectRepository;
use super::transfer::{Downloads, TransferError, Uploads};
use crate::store::{Metadata, StorageBackend};

/// Suffix of the scope holding an unpacked cache's file blobs
const FILES_SUFFIX: &str = ".files";

/// One cache of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheDefinition {
    pub name: String,
    /// Directory to cache, relative to the workspace unless absolute
    pub path: PathBuf,
    pub key: String,
    #[serde(default)]
    pub restore_keys: Vec<String>,
    #[serde(default)]
    pub includes: Vec<String>,
    #[serde(default)]
    pub excludes: Vec<String>,
    #[serde(default)]
    pub compression: CompressionMethod,
}

/// Everything a session needs, as plain data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRequest {
    pub job: String,
    pub workspace: PathBuf,
    pub caches: Vec<CacheDefinition>,
    /// Job scope size limit in bytes, 0 for none
    #[serde(default)]
    pub max_cache_size: u64,
    /// Job whose caches are restored when this job has no match
    #[serde(default)]
    pub default_branch_job: Option<String>,
    #[serde(default)]
    pub skip_restore: bool,
    #[serde(default)]
    pub skip_save: bool,
}

pub(crate) fn check_segment(kind: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        bail!("{} must not be empty", kind);
    }
    if value.contains('/') || value == "." || value == ".." {
        bail!("{} '{}' must be a single path segment", kind, value);
    }
    Ok(())
}

impl CacheRequest {
    pub fn validate(&self) -> Result<()> {
        check_segment("job", &self.job)?;
        if let Some(default_job) = &self.default_branch_job {
            check_segment("default branch job", default_job)?;
        }

        let mut names = HashSet::new();
        for cache in &self.caches {
            check_segment("cache name", &cache.name)?;
            if cache.name.ends_with(FILES_SUFFIX) {
                bail!("cache name '{}' must not end with '{}'", cache.name, FILES_SUFFIX);
            }
            if !names.insert(cache.name.as_str()) {
                bail!("duplicate cache name '{}'", cache.name);
            }
            check_segment("cache key", &cache.key)?;
            for restore_key in cache.restore_keys.iter().filter(|k| !k.is_empty()) {
                check_segment("restore key", restore_key)?;
            }
            FileFilter::new(&cache.includes, &cache.excludes)?;
        }
        Ok(())
    }
}

/// Stage most recently entered by a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Idle,
    Restoring,
    BodyRunning,
    Saving,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    Restored {
        key: String,
        /// Set when the match came from the default-branch job
        fallback_job: Option<String>,
    },
    NoKeyFound,
    NotADirectory(PathBuf),
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved { key: String },
    AlreadyExists { key: String },
    SourceMissing(PathBuf),
    NotADirectory(PathBuf),
    Skipped,
}

/// Stable one-line description of an outcome
pub trait StatusLine {
    fn status_line(&self, cache: &str) -> String;
}

impl StatusLine for RestoreOutcome {
    fn status_line(&self, cache: &str) -> String {
        match self {
            RestoreOutcome::Restored { key, .. } => {
                format!("Restored cache '{}' from key '{}'", cache, key)
            }
            RestoreOutcome::NoKeyFound => {
                format!("Cache '{}' not restored (no such key found)", cache)
            }
            RestoreOutcome::NotADirectory(path) => format!(
                "Cache '{}' not restored ({} is not a directory)",
                cache,
                path.display()
            ),
            RestoreOutcome::Skipped => format!("Cache '{}' restore skipped", cache),
        }
    }
}

impl StatusLine for SaveOutcome {
    fn status_line(&self, cache: &str) -> String {
        match self {
            SaveOutcome::Saved { key } => format!("Cache '{}' saved under key '{}'", cache, key),
            SaveOutcome::AlreadyExists { key } => {
                format!("Cache '{}' not saved (key '{}' already exists)", cache, key)
            }
            SaveOutcome::SourceMissing(path) => format!(
                "Cache '{}' not saved ({} does not exist)",
                cache,
                path.display()
            ),
            SaveOutcome::NotADirectory(path) => format!(
                "Cache '{}' not saved ({} is not a directory)",
                cache,
                path.display()
            ),
            SaveOutcome::Skipped => format!("Cache '{}' save skipped", cache),
        }
    }
}

/// Outcome of one cache in one step, with transfer figures
#[derive(Debug, Clone)]
pub struct Step<O> {
    pub cache: String,
    pub outcome: O,
    pub bytes: u64,
    pub elapsed: Duration,
}

impl<O: StatusLine> Step<O> {
    fn new(cache: &str, outcome: O, bytes: u64, elapsed: Duration) -> Self {
        Self {
            cache: cache.to_string(),
            outcome,
            bytes,
            elapsed,
        }
    }

    fn status_line(&self) -> String {
        self.outcome.status_line(&self.cache)
    }
}

impl<O> Step<O> {
    /// Bytes per second, 0 for instantaneous steps
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes as f64 / secs
        } else {
            0.0
        }
    }

    fn timing_line(&self) -> String {
        format!(
            "  {} in {:.2}s ({}/s)",
            human_bytes(self.bytes),
            self.elapsed.as_secs_f64(),
            human_bytes(self.throughput() as u64)
        )
    }
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Everything a session decided, in order
#[derive(Debug, Default)]
pub struct SessionReport {
    pub restores: Vec<Step<RestoreOutcome>>,
    pub saves: Vec<Step<SaveOutcome>>,
    lines: Vec<String>,
}

impl SessionReport {
    fn push_lines<O: StatusLine>(&mut self, step: &Step<O>) {
        let status = step.status_line();
        debug!(cache = %step.cache, bytes = step.bytes, "{}", status);
        self.lines.push(status);
        self.lines.push(step.timing_line());
    }

    fn push_restore(&mut self, step: Step<RestoreOutcome>) {
        self.push_lines(&step);
        self.restores.push(step);
    }

    fn push_save(&mut self, step: Step<SaveOutcome>) {
        self.push_lines(&step);
        self.saves.push(step);
    }

    fn note(&mut self, line: String) {
        debug!("{}", line);
        self.lines.push(line);
    }

    /// Status lines in the order they were produced
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines
    }
}

/// What happened to the save step of [`CacheSession::run`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveStatus {
    /// The body failed, so saving was not attempted
    SkippedBodyFailed,
    Completed,
    /// Saving was attempted and failed
    Failed(String),
}

pub struct RunResult<T> {
    /// The body's own result, never replaced by a save failure
    pub body: Result<T>,
    pub save: SaveStatus,
}

/// Manifest stored under the key of an unpacked cache
#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    files: Vec<ManifestEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestEntry {
    path: String,
    size: u64,
}

/// Relative path of a manifest entry, refusing anything that leaves the target
fn safe_relative(path: &str) -> Result<PathBuf> {
    let relative = PathBuf::from(path);
    let normal = relative
        .components()
        .all(|component| matches!(component, Component::Normal(_)));
    if path.is_empty() || !normal {
        bail!("refusing unsafe path '{}' in file manifest", path);
    }
    Ok(relative)
}

pub struct CacheSession {
    request: CacheRequest,
    store: StorageBackend,
    /// Scope the job scopes live under
    root: StorageScope,
    locks: JobLocks,
    cancel: CancellationToken,
    state: SessionState,
    report: SessionReport,
}

impl CacheSession {
    pub fn new(
        request: CacheRequest,
        store: StorageBackend,
        root: StorageScope,
        locks: JobLocks,
        cancel: CancellationToken,
    ) -> Result<Self> {
        request.validate()?;
        Ok(Self {
            request,
            store,
            root,
            locks,
            cancel,
            state: SessionState::Idle,
            report: SessionReport::default(),
        })
    }

    #[cfg(test)]
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn report(&self) -> &SessionReport {
        &self.report
    }

    pub fn into_report(self) -> SessionReport {
        self.report
    }

    pub fn job_scope(&self) -> StorageScope {
        self.root.child(&self.request.job)
    }

    fn cache_repo(&self, job_scope: &StorageScope, cache: &CacheDefinition) -> ObjectRepository {
        ObjectRepository::new(self.store.clone(), job_scope.child(&cache.name))
    }

    fn files_repo(
        &self,
        job_scope: &StorageScope,
        cache: &CacheDefinition,
        key: &str,
    ) -> ObjectRepository {
        let files = job_scope.child(&format!("{}{}", cache.name, FILES_SUFFIX));
        ObjectRepository::new(self.store.clone(), files.child(key))
    }

    fn target(&self, cache: &CacheDefinition) -> PathBuf {
        if cache.path.is_absolute() {
            cache.path.clone()
        } else {
            self.request.workspace.join(&cache.path)
        }
    }

    fn enter(&mut self, next: SessionState) -> Result<()> {
        use SessionState::*;
        let allowed = match next {
            Restoring => self.state == Idle,
            BodyRunning => matches!(self.state, Idle | Restoring),
            Saving => matches!(self.state, Idle | Restoring | BodyRunning),
            Done | Failed => true,
            Idle => false,
        };
        if !allowed {
            bail!("cache session cannot move from {:?} to {:?}", self.state, next);
        }
        debug!(job = %self.request.job, from = ?self.state, to = ?next, "Session state");
        self.state = next;
        Ok(())
    }

    fn fail(&mut self, err: anyhow::Error) -> anyhow::Error {
        warn!(job = %self.request.job, error = %format!("{:#}", err), "Cache session failed");
        self.state = SessionState::Failed;
        err
    }

    /// Restore every cache of the job, holding the job lock throughout
    pub async fn restore(&mut self) -> Result<()> {
        self.enter(SessionState::Restoring)?;
        let caches = self.request.caches.clone();

        if self.request.skip_restore {
            for cache in &caches {
                self.report
                    .push_restore(Step::new(&cache.name, RestoreOutcome::Skipped, 0, Duration::ZERO));
            }
            return Ok(());
        }

        let _guard = self.locks.lock(&self.request.job).await;
        for cache in &caches {
            let started = Instant::now();
            match self.restore_cache(cache).await {
                Ok((outcome, bytes)) => self.report.push_restore(Step::new(
                    &cache.name,
                    outcome,
                    bytes,
                    started.elapsed(),
                )),
                Err(e) => {
                    let e = e.context(format!("Failed to restore cache '{}'", cache.name));
                    return Err(self.fail(e));
                }
            }
        }
        info!(job = %self.request.job, caches = caches.len(), "Restore finished");
        Ok(())
    }

    async fn restore_cache(&self, cache: &CacheDefinition) -> Result<(RestoreOutcome, u64)> {
        let target = self.target(cache);
        match tokio::fs::metadata(&target).await {
            Ok(meta) if !meta.is_dir() => return Ok((RestoreOutcome::NotADirectory(target), 0)),
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => tokio::fs::create_dir_all(&target)
                .await
                .with_context(|| format!("Failed to create {}", target.display()))?,
            Err(e) => return Err(e).with_context(|| format!("Failed to inspect {}", target.display())),
        }

        let keys = RestoreKeySet::new(&cache.key, &cache.restore_keys)?;
        let mut candidates = vec![(self.request.job.clone(), self.job_scope())];
        if let Some(default_job) = &self.request.default_branch_job {
            if default_job != &self.request.job {
                candidates.push((default_job.clone(), self.root.child(default_job)));
            }
        }

        for (job, job_scope) in candidates {
            let repo = self.cache_repo(&job_scope, cache);
            let Some(key) = repo.find_key(&keys).await? else {
                continue;
            };
            debug!(cache = %cache.name, job = %job, key = %key, "Resolved cache key");
            let bytes = self.fetch(&job_scope, &repo, cache, &key, &target).await?;
            let fallback_job = (job != self.request.job).then_some(job);
            return Ok((RestoreOutcome::Restored { key, fallback_job }, bytes));
        }
        Ok((RestoreOutcome::NoKeyFound, 0))
    }

    async fn fetch(
        &self,
        job_scope: &StorageScope,
        repo: &ObjectRepository,
        cache: &CacheDefinition,
        key: &str,
        target: &Path,
    ) -> Result<u64> {
        let item: CacheItem = repo
            .stat(key)
            .await?
            .ok_or_else(|| anyhow!("cache key '{}' disappeared before restore", key))?;
        let method = match repo.metadata(key).await?.get(CODEC_KEY) {
            Some(name) => name.parse::<CompressionMethod>()?,
            None => cache.compression,
        };

        let bytes = if method.is_archive() {
            self.fetch_archive(repo, key, method, target).await?
        } else {
            self.fetch_files(job_scope, repo, cache, key, target).await?
        };
        repo.update_last_access(&item).await?;
        Ok(bytes)
    }

    async fn fetch_archive(
        &self,
        repo: &ObjectRepository,
        key: &str,
        method: CompressionMethod,
        target: &Path,
    ) -> Result<u64> {
        let spool = tempfile::NamedTempFile::new().context("Failed to create download spool")?;
        let mut file =
            tokio::fs::File::from_std(spool.reopen().context("Failed to open download spool")?);

        let bytes = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return Err(TransferError::Interrupted { pending: 1 }.into());
            }
            downloaded = repo.download(key, &mut file) => downloaded?,
        };
        file.flush().await.context("Failed to flush download spool")?;
        drop(file);

        let target = target.to_path_buf();
        let stats = tokio::task::spawn_blocking(move || -> Result<_> {
            let reader = BufReader::new(spool.reopen()?);
            Ok(unpack(method, reader, &target)?)
        })
        .await
        .context("Unpack task failed")??;

        debug!(key = key, files = stats.files, bytes = bytes, "Unpacked archive");
        Ok(bytes)
    }

    async fn fetch_files(
        &self,
        job_scope: &StorageScope,
        repo: &ObjectRepository,
        cache: &CacheDefinition,
        key: &str,
        target: &Path,
    ) -> Result<u64> {
        let mut raw = Vec::new();
        repo.download(key, &mut raw).await?;
        let manifest: Manifest = serde_json::from_slice(&raw)
            .with_context(|| format!("Invalid file manifest for key '{}'", key))?;

        let files_repo = self.files_repo(job_scope, cache, key);
        let stored: HashMap<String, CacheItem> = files_repo
            .list()
            .collect_all()
            .await?
            .into_iter()
            .map(|item| (item.key.clone(), item))
            .collect();

        let mut downloads = Downloads::new(files_repo, self.cancel.clone());
        for entry in &manifest.files {
            let started = match (safe_relative(&entry.path), stored.get(&entry.path)) {
                (Ok(relative), Some(item)) => {
                    downloads.start_downloading(item, target.join(relative)).await
                }
                (Err(e), _) => Err(e),
                (_, None) => Err(anyhow!(
                    "file '{}' of key '{}' is missing from the store",
                    entry.path,
                    key
                )),
            };
            if let Err(e) = started {
                downloads.cleanup().await;
                return Err(e);
            }
        }

        let summary = downloads.finish_downloading().await?;
        debug!(
            key = key,
            files = manifest.files.len(),
            downloaded = summary.transfers,
            skipped = downloads.skipped(),
            "Restored unpacked cache"
        );
        Ok(summary.bytes)
    }

    /// Check the scope size, then save every cache that does not exist yet.
    /// The job lock is held for both.
    pub async fn save(&mut self) -> Result<()> {
        self.enter(SessionState::Saving)?;
        let caches = self.request.caches.clone();

        if self.request.skip_save {
            for cache in &caches {
                self.report
                    .push_save(Step::new(&cache.name, SaveOutcome::Skipped, 0, Duration::ZERO));
            }
            return self.enter(SessionState::Done);
        }

        let _guard = self.locks.lock(&self.request.job).await;

        let job_repo = ObjectRepository::new(self.store.clone(), self.job_scope());
        let policy = EvictionPolicy::new(self.request.max_cache_size);
        let decision = match policy.enforce(&job_repo).await {
            Ok(decision) => decision,
            Err(e) => return Err(self.fail(e.context("Failed to check cache size"))),
        };
        if let Some(line) = decision.status_line() {
            self.report.note(line);
            return self.enter(SessionState::Done);
        }

        for cache in &caches {
            let started = Instant::now();
            match self.save_cache(cache).await {
                Ok((outcome, bytes)) => {
                    self.report
                        .push_save(Step::new(&cache.name, outcome, bytes, started.elapsed()))
                }
                Err(e) => {
                    let e = e.context(format!("Failed to save cache '{}'", cache.name));
                    return Err(self.fail(e));
                }
            }
        }
        info!(job = %self.request.job, caches = caches.len(), "Save finished");
        self.enter(SessionState::Done)
    }

    async fn save_cache(&self, cache: &CacheDefinition) -> Result<(SaveOutcome, u64)> {
        let source = self.target(cache);
        match tokio::fs::metadata(&source).await {
            Ok(meta) if !meta.is_dir() => return Ok((SaveOutcome::NotADirectory(source), 0)),
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok((SaveOutcome::SourceMissing(source), 0))
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to inspect {}", source.display())),
        }

        let job_scope = self.job_scope();
        let repo = self.cache_repo(&job_scope, cache);
        if repo.exists(&cache.key).await? {
            return Ok((
                SaveOutcome::AlreadyExists {
                    key: cache.key.clone(),
                },
                0,
            ));
        }

        let filter = FileFilter::new(&cache.includes, &cache.excludes)?;
        let bytes = if cache.compression.is_archive() {
            self.store_archive(&repo, cache, filter, source).await?
        } else {
            self.store_files(&job_scope, &repo, cache, filter, source).await?
        };
        Ok((
            SaveOutcome::Saved {
                key: cache.key.clone(),
            },
            bytes,
        ))
    }

    async fn store_archive(
        &self,
        repo: &ObjectRepository,
        cache: &CacheDefinition,
        filter: FileFilter,
        source: PathBuf,
    ) -> Result<u64> {
        let method = cache.compression;
        let mut metadata = Metadata::new();
        metadata.insert(CODEC_KEY.to_string(), method.name().to_string());
        let writer = repo.create_write_stream(&cache.key, metadata)?;

        let (writer, stats) = tokio::task::spawn_blocking(move || -> Result<_> {
            let mut writer = writer;
            let stats = pack(&source, &filter, method, &mut writer)?;
            Ok((writer, stats))
        })
        .await
        .context("Pack task failed")??;

        let item = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return Err(TransferError::Interrupted { pending: 1 }.into());
            }
            stored = writer.finish() => stored?,
        };
        debug!(
            key = %cache.key,
            files = stats.files,
            raw_bytes = stats.bytes,
            stored_bytes = item.content_length,
            "Stored archive"
        );
        Ok(item.content_length)
    }

    async fn store_files(
        &self,
        job_scope: &StorageScope,
        repo: &ObjectRepository,
        cache: &CacheDefinition,
        filter: FileFilter,
        source: PathBuf,
    ) -> Result<u64> {
        let files = tokio::task::spawn_blocking(move || matching_files(&source, &filter))
            .await
            .context("File scan task failed")??;

        let mut uploads = Uploads::new(
            self.files_repo(job_scope, cache, &cache.key),
            self.cancel.clone(),
        );
        for file in &files {
            if let Err(e) = uploads
                .start_uploading(&file.path, &file.key(), Metadata::new())
                .await
            {
                uploads.cleanup().await;
                return Err(e);
            }
        }
        let summary = uploads.finish_uploading().await?;

        // The manifest goes last so the key only exists once every blob does
        let manifest = Manifest {
            files: files
                .iter()
                .map(|file| ManifestEntry {
                    path: file.key(),
                    size: file.size,
                })
                .collect(),
        };
        let mut metadata = Metadata::new();
        metadata.insert(
            CODEC_KEY.to_string(),
            CompressionMethod::None.name().to_string(),
        );
        let mut writer = repo.create_write_stream(&cache.key, metadata)?;
        writer
            .write_all(&serde_json::to_vec(&manifest)?)
            .context("Failed to write file manifest")?;
        writer.finish().await?;

        Ok(summary.bytes)
    }

    /// Save after a body ran elsewhere. A failed body skips saving entirely.
    pub async fn save_after(&mut self, body_succeeded: bool) -> SaveStatus {
        if !body_succeeded {
            self.report.note("Caches not saved (build failed)".to_string());
            self.state = SessionState::Done;
            return SaveStatus::SkippedBodyFailed;
        }
        match self.save().await {
            Ok(()) => SaveStatus::Completed,
            Err(e) => SaveStatus::Failed(format!("{:#}", e)),
        }
    }

    /// Restore, run `body`, then save if the body succeeded
    pub async fn run<F, T>(&mut self, body: F) -> Result<RunResult<T>>
    where
        F: Future<Output = Result<T>>,
    {
        self.restore().await?;
        self.enter(SessionState::BodyRunning)?;
        let body = body.await;
        if let Err(e) = &body {
            info!(job = %self.request.job, error = %format!("{:#}", e), "Build body failed");
        }
        let save = self.save_after(body.is_ok()).await;
        Ok(RunResult { body, save })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LocalStore;
    use std::collections::BTreeMap;
    use tempfile::TempDir;
    use walkdir::WalkDir;

    struct Env {
        _dir: TempDir,
        store: StorageBackend,
        root: StorageScope,
        locks: JobLocks,
    }

    fn env() -> Env {
        let dir = TempDir::new().unwrap();
        let local = LocalStore::new(dir.path().join("store"));
        local.create_bucket("ci").unwrap();
        Env {
            _dir: dir,
            store: StorageBackend::Local(local),
            root: StorageScope::new("ci", "caches"),
            locks: JobLocks::new(),
        }
    }

    impl Env {
        fn session(&self, request: CacheRequest) -> CacheSession {
            CacheSession::new(
                request,
                self.store.clone(),
                self.root.clone(),
                self.locks.clone(),
                CancellationToken::new(),
            )
            .unwrap()
        }

        fn repo(&self, job: &str, cache: &str) -> ObjectRepository {
            ObjectRepository::new(self.store.clone(), self.root.child(job).child(cache))
        }
    }

    fn maven(key: &str, restore_keys: &[&str], compression: CompressionMethod) -> CacheDefinition {
        CacheDefinition {
            name: "maven".to_string(),
            path: PathBuf::from(".m2"),
            key: key.to_string(),
            restore_keys: restore_keys.iter().map(|k| k.to_string()).collect(),
            includes: Vec::new(),
            excludes: Vec::new(),
            compression,
        }
    }

    fn request(job: &str, workspace: &Path, cache: CacheDefinition) -> CacheRequest {
        CacheRequest {
            job: job.to_string(),
            workspace: workspace.to_path_buf(),
            caches: vec![cache],
            max_cache_size: 0,
            default_branch_job: None,
            skip_restore: false,
            skip_save: false,
        }
    }

    fn write_tree(root: &Path, files: &[(&str, &str)]) {
        for (rel, content) in files {
            let path = root.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        }
    }

    fn read_tree(root: &Path) -> BTreeMap<String, String> {
        WalkDir::new(root)
            .into_iter()
            .map(|e| e.unwrap())
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                let rel = e.path().strip_prefix(root).unwrap();
                (
                    rel.to_string_lossy().replace('\\', "/"),
                    std::fs::read_to_string(e.path()).unwrap(),
                )
            })
            .collect()
    }

    const TREE: &[(&str, &str)] = &[
        ("repository/org/a.jar", "jar-a"),
        ("repository/org/a.pom", "pom"),
        ("settings.xml", "<settings/>"),
    ];

    #[tokio::test]
    async fn test_save_then_restore_archive() {
        let env = env();
        let ws = TempDir::new().unwrap();
        write_tree(&ws.path().join(".m2"), TREE);

        let mut save = env.session(request("app", ws.path(), maven("deps-1", &[], CompressionMethod::TarGz)));
        save.save().await.unwrap();
        assert_eq!(save.report().lines()[0], "Cache 'maven' saved under key 'deps-1'");
        assert_eq!(save.report().lines().len(), 2);
        assert_eq!(save.state(), SessionState::Done);

        let fresh = TempDir::new().unwrap();
        let mut restore = env.session(request(
            "app",
            fresh.path(),
            maven("deps-2", &["deps-"], CompressionMethod::TarGz),
        ));
        restore.restore().await.unwrap();
        assert_eq!(restore.report().lines()[0], "Restored cache 'maven' from key 'deps-1'");
        assert_eq!(read_tree(&fresh.path().join(".m2")), read_tree(&ws.path().join(".m2")));

        let item = env.repo("app", "maven").stat("deps-1").await.unwrap().unwrap();
        assert!(item.last_access > 0);
    }

    #[tokio::test]
    async fn test_existing_key_is_never_overwritten() {
        let env = env();
        let ws = TempDir::new().unwrap();
        write_tree(&ws.path().join(".m2"), &[("a.txt", "one")]);
        env.session(request("app", ws.path(), maven("k", &[], CompressionMethod::Tar)))
            .save()
            .await
            .unwrap();
        let before = env.repo("app", "maven").stat("k").await.unwrap().unwrap();

        write_tree(&ws.path().join(".m2"), &[("a.txt", "two, and much longer")]);
        let mut again = env.session(request("app", ws.path(), maven("k", &[], CompressionMethod::Tar)));
        again.save().await.unwrap();
        assert_eq!(
            again.report().lines()[0],
            "Cache 'maven' not saved (key 'k' already exists)"
        );
        let after = env.repo("app", "maven").stat("k").await.unwrap().unwrap();
        assert_eq!(after.content_length, before.content_length);

        let fresh = TempDir::new().unwrap();
        env.session(request("app", fresh.path(), maven("k", &[], CompressionMethod::Tar)))
            .restore()
            .await
            .unwrap();
        assert_eq!(read_tree(&fresh.path().join(".m2"))["a.txt"], "one");
    }

    #[tokio::test]
    async fn test_empty_store_reports_miss() {
        let env = env();
        let ws = TempDir::new().unwrap();
        let mut session = env.session(request("app", ws.path(), maven("x", &["y"], CompressionMethod::TarGz)));
        session.restore().await.unwrap();
        assert_eq!(
            session.report().lines()[0],
            "Cache 'maven' not restored (no such key found)"
        );
        assert_eq!(session.report().restores[0].outcome, RestoreOutcome::NoKeyFound);
        assert!(ws.path().join(".m2").is_dir());
    }

    #[tokio::test]
    async fn test_oversized_scope_is_cleared_instead_of_saved() {
        let env = env();
        let ws = TempDir::new().unwrap();
        write_tree(&ws.path().join(".m2"), TREE);

        let mut first = request("app", ws.path(), maven("k1", &[], CompressionMethod::TarZstd));
        first.max_cache_size = 1;
        let mut session = env.session(first.clone());
        session.save().await.unwrap();
        assert_eq!(session.report().lines()[0], "Cache 'maven' saved under key 'k1'");

        let mut second = first.clone();
        second.caches[0].key = "k2".to_string();
        let mut session = env.session(second);
        session.save().await.unwrap();
        let line = &session.report().lines()[0];
        assert!(line.starts_with("Cache size "));
        assert!(line.ends_with("bytes; cache cleared and will be empty on the next build"));
        assert!(session.report().saves.is_empty());
        assert_eq!(session.report().lines().len(), 1);

        let job = ObjectRepository::new(env.store.clone(), env.root.child("app"));
        assert_eq!(job.total_size().await.unwrap(), 0);

        let fresh = TempDir::new().unwrap();
        let mut next = env.session(request("app", fresh.path(), maven("k1", &[], CompressionMethod::TarZstd)));
        next.restore().await.unwrap();
        assert_eq!(
            next.report().lines()[0],
            "Cache 'maven' not restored (no such key found)"
        );
    }

    #[tokio::test]
    async fn test_failed_body_skips_save() {
        let env = env();
        let ws = TempDir::new().unwrap();
        write_tree(&ws.path().join(".m2"), TREE);

        let mut session = env.session(request("app", ws.path(), maven("k", &[], CompressionMethod::TarGz)));
        let result = session
            .run(async { Err::<(), _>(anyhow!("compile error")) })
            .await
            .unwrap();

        assert_eq!(result.save, SaveStatus::SkippedBodyFailed);
        assert_eq!(result.body.unwrap_err().to_string(), "compile error");
        assert!(session
            .report()
            .lines()
            .contains(&"Caches not saved (build failed)".to_string()));
        assert_eq!(session.report().lines().len(), 1);
        assert!(!env.repo("app", "maven").exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_run_saves_what_the_body_produced() {
        let env = env();
        let ws = TempDir::new().unwrap();
        let m2 = ws.path().join(".m2");

        let mut session = env.session(request("app", ws.path(), maven("k", &[], CompressionMethod::TarGz)));
        let result = session
            .run(async {
                write_tree(&m2, &[("built.jar", "bytes")]);
                Ok(42)
            })
            .await
            .unwrap();

        assert_eq!(result.body.unwrap(), 42);
        assert_eq!(result.save, SaveStatus::Completed);
        assert_eq!(session.state(), SessionState::Done);
        let lines = session.report().lines();
        assert_eq!(lines[0], "Cache 'maven' not restored (no such key found)");
        assert_eq!(lines[2], "Cache 'maven' saved under key 'k'");
    }

    #[tokio::test]
    async fn test_unpacked_cache_round_trip() {
        let env = env();
        let ws = TempDir::new().unwrap();
        write_tree(&ws.path().join(".m2"), TREE);

        env.session(request("app", ws.path(), maven("k", &[], CompressionMethod::None)))
            .save()
            .await
            .unwrap();
        let files_scope = env.root.child("app").child("maven.files").child("k");
        let blobs = ObjectRepository::new(env.store.clone(), files_scope)
            .list()
            .collect_all()
            .await
            .unwrap();
        assert_eq!(blobs.len(), TREE.len());

        let fresh = TempDir::new().unwrap();
        for _ in 0..2 {
            let mut restore = env.session(request("app", fresh.path(), maven("k", &[], CompressionMethod::None)));
            restore.restore().await.unwrap();
            assert_eq!(restore.report().lines()[0], "Restored cache 'maven' from key 'k'");
            assert_eq!(read_tree(&fresh.path().join(".m2")), read_tree(&ws.path().join(".m2")));
        }
    }

    #[tokio::test]
    async fn test_unpacked_cache_keeps_dot_tmp_files() {
        let env = env();
        let ws = TempDir::new().unwrap();
        write_tree(&ws.path().join(".m2"), &[(".tmpconfig", "cfg"), ("lib/.tmp", "x")]);

        let mut save = env.session(request("app", ws.path(), maven("k", &[], CompressionMethod::None)));
        save.save().await.unwrap();
        assert_eq!(save.report().lines()[0], "Cache 'maven' saved under key 'k'");

        let fresh = TempDir::new().unwrap();
        let mut restore = env.session(request("app", fresh.path(), maven("k", &[], CompressionMethod::None)));
        restore.restore().await.unwrap();
        assert_eq!(restore.report().lines()[0], "Restored cache 'maven' from key 'k'");
        assert_eq!(
            std::fs::read_to_string(fresh.path().join(".m2/.tmpconfig")).unwrap(),
            "cfg"
        );
        assert_eq!(read_tree(&fresh.path().join(".m2")), read_tree(&ws.path().join(".m2")));
    }

    #[tokio::test]
    async fn test_filters_select_saved_files() {
        let env = env();
        let ws = TempDir::new().unwrap();
        write_tree(&ws.path().join(".m2"), TREE);

        let mut cache = maven("k", &[], CompressionMethod::TarGz);
        cache.includes = vec!["**/*.jar".to_string(), "**/*.pom".to_string()];
        cache.excludes = vec!["**/*.pom".to_string()];
        env.session(request("app", ws.path(), cache.clone())).save().await.unwrap();

        let fresh = TempDir::new().unwrap();
        env.session(request("app", fresh.path(), cache)).restore().await.unwrap();
        let restored = read_tree(&fresh.path().join(".m2"));
        assert_eq!(restored.keys().collect::<Vec<_>>(), vec!["repository/org/a.jar"]);
    }

    #[tokio::test]
    async fn test_path_preconditions_are_outcomes() {
        let env = env();
        let ws = TempDir::new().unwrap();
        let m2 = ws.path().join(".m2");

        let mut save = env.session(request("app", ws.path(), maven("k", &[], CompressionMethod::TarGz)));
        save.save().await.unwrap();
        assert_eq!(
            save.report().lines()[0],
            format!("Cache 'maven' not saved ({} does not exist)", m2.display())
        );

        std::fs::write(&m2, "not a dir").unwrap();
        let mut save = env.session(request("app", ws.path(), maven("k", &[], CompressionMethod::TarGz)));
        save.save().await.unwrap();
        assert_eq!(
            save.report().lines()[0],
            format!("Cache 'maven' not saved ({} is not a directory)", m2.display())
        );

        let mut restore = env.session(request("app", ws.path(), maven("k", &[], CompressionMethod::TarGz)));
        restore.restore().await.unwrap();
        assert_eq!(
            restore.report().lines()[0],
            format!("Cache 'maven' not restored ({} is not a directory)", m2.display())
        );
    }

    #[tokio::test]
    async fn test_restore_falls_back_to_default_branch() {
        let env = env();
        let ws = TempDir::new().unwrap();
        write_tree(&ws.path().join(".m2"), TREE);
        env.session(request("main", ws.path(), maven("deps-1", &[], CompressionMethod::TarGz)))
            .save()
            .await
            .unwrap();

        let fresh = TempDir::new().unwrap();
        let mut feature = request("feature", fresh.path(), maven("deps-2", &["deps-"], CompressionMethod::TarGz));
        feature.default_branch_job = Some("main".to_string());
        let mut session = env.session(feature);
        session.restore().await.unwrap();

        assert_eq!(
            session.report().restores[0].outcome,
            RestoreOutcome::Restored {
                key: "deps-1".to_string(),
                fallback_job: Some("main".to_string()),
            }
        );
        assert_eq!(read_tree(&fresh.path().join(".m2")), read_tree(&ws.path().join(".m2")));
    }

    #[tokio::test]
    async fn test_skip_flags() {
        let env = env();
        let ws = TempDir::new().unwrap();
        write_tree(&ws.path().join(".m2"), TREE);
        let mut req = request("app", ws.path(), maven("k", &[], CompressionMethod::TarGz));
        req.skip_restore = true;
        req.skip_save = true;

        let mut session = env.session(req);
        session.restore().await.unwrap();
        session.save().await.unwrap();
        assert_eq!(session.report().lines()[0], "Cache 'maven' restore skipped");
        assert_eq!(session.report().lines()[2], "Cache 'maven' save skipped");
        assert!(!env.repo("app", "maven").exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_finished_session_cannot_restart() {
        let env = env();
        let ws = TempDir::new().unwrap();
        let mut session = env.session(request("app", ws.path(), maven("k", &[], CompressionMethod::TarGz)));
        session.save().await.unwrap();
        assert!(session.restore().await.is_err());
    }

    #[test]
    fn test_request_validation() {
        let ws = Path::new("/tmp/ws");
        let mut bad_job = request("a/b", ws, maven("k", &[], CompressionMethod::TarGz));
        assert!(bad_job.validate().is_err());
        bad_job.job = "app".to_string();
        assert!(bad_job.validate().is_ok());

        let mut duplicate = bad_job.clone();
        duplicate.caches.push(maven("k2", &[], CompressionMethod::TarGz));
        assert!(duplicate.validate().is_err());

        let mut bad_key = bad_job.clone();
        bad_key.caches[0].key = " ".to_string();
        assert!(bad_key.validate().is_err());
    }

    #[test]
    fn test_request_json_defaults() {
        let request: CacheRequest = serde_json::from_str(
            r#"{"job":"app","workspace":"/ws","caches":[{"name":"maven","path":".m2","key":"k"}]}"#,
        )
        .unwrap();
        assert_eq!(request.max_cache_size, 0);
        assert_eq!(request.caches[0].compression, CompressionMethod::TarGz);
        assert!(request.caches[0].restore_keys.is_empty());
    }

    #[test]
    fn test_manifest_paths_stay_inside_target() {
        assert!(safe_relative("a/b.txt").is_ok());
        assert!(safe_relative("../escape").is_err());
        assert!(safe_relative("/etc/passwd").is_err());
        assert!(safe_relative("").is_err());
    }

    #[test]
    fn test_human_bytes() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(1536), "1.5 KiB");
        assert_eq!(human_bytes(3 * 1024 * 1024), "3.0 MiB");
    }
}
