//! Backblaze B2 Object Store
//!
//! Cache objects map one to one onto B2 files. Listing is paged through
//! `b2_list_file_names`, bodies travel over the download URL and upload URLs,
//! and metadata is replaced with a server-side copy.

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::{HashMap, VecDeque};
use std::io::SeekFrom;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use super::errors::{is_not_found, store_error, StoreError};
use super::metadata::ObjectInfoCache;
use super::types::{FileInfo, ListFilesResponse, ListPage, Metadata, ObjectInfo};

const AUTHORIZE_URL: &str = "https://api.backblazeb2.com/b2api/v3/b2_authorize_account";

/// Limit for JSON API calls
const API_TIMEOUT: Duration = Duration::from_secs(30);

/// Limit for object bodies
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Attempts after the first one
const RETRIES: u32 = 3;

const FIRST_BACKOFF: Duration = Duration::from_millis(500);

/// Errors kept for the status response
const ERROR_LOG_CAPACITY: usize = 10;

const CONTENT_TYPE: &str = "application/octet-stream";

/// Store failure kept for the status response
#[derive(Debug, Clone)]
pub struct ErrorEntry {
    /// Seconds since the Unix epoch
    pub timestamp: u64,
    pub operation: String,
    pub path: String,
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Health {
    Healthy = 0,
    Degraded = 1,
    Unhealthy = 2,
}

impl Health {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Health::Healthy,
            1 => Health::Degraded,
            _ => Health::Unhealthy,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Health::Healthy => "healthy",
            Health::Degraded => "degraded",
            Health::Unhealthy => "unhealthy",
        }
    }

    /// Health after a call gave up with `kind`, if it changes
    fn after_failure(kind: Option<&StoreError>) -> Option<Self> {
        match kind {
            Some(StoreError::Network(_)) | Some(StoreError::Timeout) => Some(Health::Unhealthy),
            Some(StoreError::RateLimited) => Some(Health::Degraded),
            _ => None,
        }
    }
}

/// Bounded log of the most recent failures
#[derive(Default)]
struct ErrorLog {
    entries: RwLock<VecDeque<ErrorEntry>>,
}

impl ErrorLog {
    fn record(&self, operation: &str, path: &str, error: &anyhow::Error) {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        while entries.len() >= ERROR_LOG_CAPACITY {
            entries.pop_front();
        }
        entries.push_back(ErrorEntry {
            timestamp,
            operation: operation.to_string(),
            path: path.to_string(),
            error: format!("{:#}", error),
        });
    }

    fn snapshot(&self) -> Vec<ErrorEntry> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.iter().cloned().collect()
    }
}

/// Application key used to (re)authorize
struct Credentials {
    key_id: String,
    key: String,
}

impl Credentials {
    fn basic_header(&self) -> String {
        let pair = format!("{}:{}", self.key_id, self.key);
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(pair)
        )
    }
}

/// Token and endpoints handed out by `b2_authorize_account`
#[derive(Clone)]
struct Session {
    token: String,
    api_url: String,
    download_url: String,
}

impl From<AuthorizeAccountResponse> for Session {
    fn from(response: AuthorizeAccountResponse) -> Self {
        Self {
            token: response.authorization_token,
            api_url: response.api_info.storage_api.api_url,
            download_url: response.api_info.storage_api.download_url,
        }
    }
}

/// B2 object store client
#[derive(Clone)]
pub struct B2Store {
    http: Client,
    account_id: String,
    credentials: Arc<Credentials>,
    /// Replaced whenever the token expires
    session: Arc<RwLock<Session>>,
    /// Bucket name to bucket id
    bucket_ids: Arc<RwLock<HashMap<String, String>>>,
    health: Arc<AtomicU8>,
    errors: Arc<ErrorLog>,
    /// File ids and metadata seen in recent listings
    infos: Arc<ObjectInfoCache>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizeAccountResponse {
    account_id: String,
    authorization_token: String,
    api_info: ApiInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiInfo {
    storage_api: StorageApiInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StorageApiInfo {
    api_url: String,
    download_url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ListBucketsRequest<'a> {
    account_id: &'a str,
    bucket_name: &'a str,
}

#[derive(Debug, Deserialize)]
struct ListBucketsResponse {
    buckets: Vec<BucketInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BucketInfo {
    bucket_id: String,
    bucket_name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ListFileNamesRequest {
    bucket_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    prefix: Option<String>,
    max_file_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_file_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct CopyFileRequest {
    source_file_id: String,
    file_name: String,
    metadata_directive: &'static str,
    content_type: &'static str,
    file_info: Metadata,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FileVersion<'a> {
    file_name: &'a str,
    file_id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GetUploadUrlRequest<'a> {
    bucket_id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadTarget {
    upload_url: String,
    authorization_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    file_id: String,
    file_name: String,
    content_length: u64,
    upload_timestamp: u64,
    #[serde(default)]
    file_info: Metadata,
}

/// Map a non-2xx response onto a [`StoreError`]
async fn check_status(response: Response, call: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(anyhow::Error::new(StoreError::from_status(status.as_u16(), &body))
        .context(format!("B2 {} returned {}", call, status.as_u16())))
}

fn transport_error(err: reqwest::Error, call: &str) -> anyhow::Error {
    anyhow::Error::new(StoreError::from_reqwest(&err)).context(format!("B2 {} failed", call))
}

async fn authorize_account(http: &Client, credentials: &Credentials) -> Result<AuthorizeAccountResponse> {
    let response = http
        .get(AUTHORIZE_URL)
        .header(AUTHORIZATION, credentials.basic_header())
        .send()
        .await
        .map_err(|e| transport_error(e, "b2_authorize_account"))?;
    check_status(response, "b2_authorize_account")
        .await?
        .json()
        .await
        .context("Unexpected b2_authorize_account response")
}

/// SHA1 and length of a file's content, leaving it rewound
async fn sha1_and_rewind(file: &mut tokio::fs::File) -> Result<(String, u64)> {
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut length = 0u64;
    loop {
        let n = file.read(&mut buf).await.context("Failed to read upload source")?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        length += n as u64;
    }
    file.seek(SeekFrom::Start(0))
        .await
        .context("Failed to rewind upload source")?;
    Ok((format!("{:x}", hasher.finalize()), length))
}

impl B2Store {
    /// Authorize an application key and create a client for its account
    pub async fn authorize(key_id: &str, key: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(API_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;
        let credentials = Credentials {
            key_id: key_id.to_string(),
            key: key.to_string(),
        };

        let response = authorize_account(&http, &credentials).await?;
        let account_id = response.account_id.clone();
        let session = Session::from(response);
        info!(account = %account_id, api_url = %session.api_url, "Authorized with B2");

        Ok(Self {
            http,
            account_id,
            credentials: Arc::new(credentials),
            session: Arc::new(RwLock::new(session)),
            bucket_ids: Arc::new(RwLock::new(HashMap::new())),
            health: Arc::new(AtomicU8::new(Health::Healthy as u8)),
            errors: Arc::new(ErrorLog::default()),
            infos: Arc::new(ObjectInfoCache::new()),
        })
    }

    fn session(&self) -> Session {
        self.session.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Swap in a fresh token after the current one expired
    async fn reauthorize(&self) -> Result<()> {
        let response = authorize_account(&self.http, &self.credentials)
            .await
            .context("Failed to reauthorize with B2")?;
        *self.session.write().unwrap_or_else(|e| e.into_inner()) = Session::from(response);
        info!("B2 authorization token renewed");
        Ok(())
    }

    fn set_health(&self, health: Health) {
        self.health.store(health as u8, Ordering::Relaxed);
    }

    /// Run `f` until it succeeds, fails permanently or runs out of retries
    ///
    /// An expired token is renewed once per call. Backoff doubles from
    /// [`FIRST_BACKOFF`].
    async fn with_retry<F, Fut, T>(&self, operation: &str, path: &str, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        let mut delay = FIRST_BACKOFF;
        let mut renewed = false;

        loop {
            let err = match f().await {
                Ok(value) => {
                    self.set_health(Health::Healthy);
                    return Ok(value);
                }
                Err(err) => err,
            };

            let kind = store_error(&err);
            if attempt >= RETRIES || !kind.is_some_and(StoreError::is_retryable) {
                if let Some(health) = Health::after_failure(kind) {
                    self.set_health(health);
                }
                if !is_not_found(&err) {
                    self.errors.record(operation, path, &err);
                }
                return Err(err);
            }

            if matches!(kind, Some(StoreError::AuthExpired)) && !renewed {
                renewed = true;
                if let Err(e) = self.reauthorize().await {
                    warn!(error = %e, "Token renewal failed");
                }
            }

            attempt += 1;
            warn!(
                operation = operation,
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying B2 call"
            );
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }

    /// POST a JSON body to a `b2api/v2` call with retries
    async fn call<B, T>(&self, call: &str, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.with_retry(call, path, || async {
            let session = self.session();
            let response = self
                .http
                .post(format!("{}/b2api/v2/{}", session.api_url, call))
                .header(AUTHORIZATION, &session.token)
                .json(body)
                .send()
                .await
                .map_err(|e| transport_error(e, call))?;
            check_status(response, call)
                .await?
                .json()
                .await
                .with_context(|| format!("Unexpected {} response", call))
        })
        .await
    }

    pub fn health_status(&self) -> &'static str {
        Health::from_u8(self.health.load(Ordering::Relaxed)).as_str()
    }

    pub fn recent_errors(&self) -> Vec<ErrorEntry> {
        self.errors.snapshot()
    }

    /// Look up bucket ID from bucket name (cached after the first lookup)
    async fn bucket_id(&self, bucket_name: &str) -> Result<String> {
        if let Some(id) = self
            .bucket_ids
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(bucket_name)
        {
            return Ok(id.clone());
        }

        let request = ListBucketsRequest {
            account_id: &self.account_id,
            bucket_name,
        };
        let list_response: ListBucketsResponse =
            self.call("b2_list_buckets", bucket_name, &request).await?;

        let bucket_id = list_response
            .buckets
            .into_iter()
            .find(|b| b.bucket_name == bucket_name)
            .map(|b| b.bucket_id)
            .ok_or_else(|| {
                anyhow::Error::new(StoreError::NotFound(format!("bucket '{}'", bucket_name)))
            })?;

        debug!(bucket_name = bucket_name, bucket_id = %bucket_id, "Resolved B2 bucket");
        self.bucket_ids
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(bucket_name.to_string(), bucket_id.clone());
        Ok(bucket_id)
    }

    /// Head-bucket: fails with NotFound when the bucket does not exist
    pub async fn bucket_exists(&self, bucket: &str) -> Result<()> {
        self.bucket_id(bucket).await.map(|_| ())
    }

    /// List one page of objects whose names start with `prefix`
    ///
    /// # Arguments
    /// * `start` - Inclusive name to start from (the previous page's `next`)
    /// * `max` - Maximum number of names to return (B2 caps this at 10000)
    pub async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        start: Option<&str>,
        max: u32,
    ) -> Result<ListPage> {
        let bucket_id = self.bucket_id(bucket).await?;
        let request = ListFileNamesRequest {
            bucket_id,
            prefix: (!prefix.is_empty()).then(|| prefix.to_string()),
            max_file_count: max.clamp(1, 10_000),
            start_file_name: start.map(String::from),
        };
        let list_response: ListFilesResponse =
            self.call("b2_list_file_names", prefix, &request).await?;

        let objects: Vec<ObjectInfo> = list_response
            .files
            .into_iter()
            .filter(FileInfo::is_object)
            .map(ObjectInfo::from)
            .collect();
        for object in &objects {
            self.infos.insert(object);
        }

        debug!(
            count = objects.len(),
            truncated = list_response.next_file_name.is_some(),
            "Listed files from B2"
        );
        Ok(ListPage {
            objects,
            next: list_response.next_file_name,
        })
    }

    /// Get one object's info by exact name
    ///
    /// B2 has no "head by name" call, so this lists a single name starting at `name`.
    pub async fn head_object(&self, bucket: &str, name: &str) -> Result<ObjectInfo> {
        let page = self.list_page(bucket, name, Some(name), 1).await?;
        page.objects
            .into_iter()
            .find(|o| o.name == name)
            .ok_or_else(|| anyhow::Error::new(StoreError::NotFound(name.to_string())))
    }

    /// File id for an object, from the info cache when possible
    async fn file_id(&self, bucket: &str, name: &str) -> Result<String> {
        let info = match self.infos.get(name) {
            Some(info) => info,
            None => self.head_object(bucket, name).await?,
        };
        info.file_id
            .ok_or_else(|| anyhow!("B2 returned no file id for {}", name))
    }

    /// Stream an object's content into `sink`
    ///
    /// # Returns
    /// Number of bytes written
    pub async fn get_object<W>(&self, bucket: &str, name: &str, sink: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        debug!(file = name, "Downloading object from B2");

        let mut response = self
            .with_retry("download", name, || async {
                let session = self.session();
                let url = format!(
                    "{}/file/{}/{}",
                    session.download_url,
                    bucket,
                    urlencoding::encode(name)
                );
                let response = self
                    .http
                    .get(url)
                    .header(AUTHORIZATION, &session.token)
                    .timeout(TRANSFER_TIMEOUT)
                    .send()
                    .await
                    .map_err(|e| transport_error(e, "download"))?;
                check_status(response, "download").await
            })
            .await?;

        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| transport_error(e, "download"))?
        {
            sink.write_all(&chunk)
                .await
                .context("Failed to write downloaded content")?;
            written += chunk.len() as u64;
        }
        sink.flush().await.context("Failed to flush downloaded content")?;

        debug!(file = name, bytes = written, "Object downloaded");
        Ok(written)
    }

    /// Upload an object, streaming it from an open file
    ///
    /// B2 wants the SHA1 before the body, so the file is read twice. A streamed
    /// body cannot be replayed and the upload itself is not retried.
    pub async fn put_object(
        &self,
        bucket: &str,
        name: &str,
        mut file: tokio::fs::File,
        metadata: &Metadata,
    ) -> Result<ObjectInfo> {
        let bucket_id = self.bucket_id(bucket).await?;
        let (checksum, length) = sha1_and_rewind(&mut file).await?;
        let target: UploadTarget = self
            .call(
                "b2_get_upload_url",
                name,
                &GetUploadUrlRequest {
                    bucket_id: &bucket_id,
                },
            )
            .await?;

        debug!(file = name, bytes = length, "Uploading object to B2");

        let mut request = self
            .http
            .post(&target.upload_url)
            .header(AUTHORIZATION, &target.authorization_token)
            .header("X-Bz-File-Name", urlencoding::encode(name).as_ref())
            .header("X-Bz-Content-Sha1", checksum)
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
            .header(reqwest::header::CONTENT_LENGTH, length)
            .timeout(TRANSFER_TIMEOUT);
        for (key, value) in metadata {
            request = request.header(
                format!("X-Bz-Info-{}", key),
                urlencoding::encode(value).as_ref(),
            );
        }

        let sent = request
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await
            .map_err(|e| transport_error(e, "upload"));
        let upload: UploadResponse = match sent {
            Ok(response) => match check_status(response, "upload").await {
                Ok(response) => response
                    .json()
                    .await
                    .context("Unexpected upload response")?,
                Err(e) => {
                    self.errors.record("upload", name, &e);
                    return Err(e);
                }
            },
            Err(e) => {
                self.errors.record("upload", name, &e);
                return Err(e);
            }
        };

        let info = ObjectInfo {
            name: upload.file_name,
            content_length: upload.content_length,
            last_modified: upload.upload_timestamp,
            metadata: upload.file_info,
            file_id: Some(upload.file_id),
        };
        debug!(file = name, file_id = ?info.file_id, "Object uploaded");
        self.infos.insert(&info);
        Ok(info)
    }

    /// Replace an object's metadata in place
    ///
    /// B2 has no metadata patch: the file is copied server-side onto itself with
    /// the new file info, then the superseded version is deleted.
    pub async fn copy_with_metadata(
        &self,
        bucket: &str,
        name: &str,
        metadata: &Metadata,
    ) -> Result<ObjectInfo> {
        let source_file_id = self.file_id(bucket, name).await?;
        let request = CopyFileRequest {
            source_file_id: source_file_id.clone(),
            file_name: name.to_string(),
            metadata_directive: "REPLACE",
            content_type: CONTENT_TYPE,
            file_info: metadata.clone(),
        };
        let copied: FileInfo = self.call("b2_copy_file", name, &request).await?;

        self.infos.invalidate(name);
        let info = ObjectInfo::from(copied);
        if let Err(e) = self.delete_file_version(name, &source_file_id).await {
            if !is_not_found(&e) {
                warn!(file = name, error = %e, "Superseded version left behind");
            }
        }
        self.infos.insert(&info);
        Ok(info)
    }

    async fn delete_file_version(&self, file_name: &str, file_id: &str) -> Result<()> {
        let _: serde_json::Value = self
            .call(
                "b2_delete_file_version",
                file_name,
                &FileVersion { file_name, file_id },
            )
            .await?;
        debug!(file = file_name, file_id = file_id, "Deleted file version");
        Ok(())
    }

    /// Delete objects by name
    ///
    /// # Returns
    /// How many objects were actually removed; names that are already gone are skipped
    pub async fn delete_objects(&self, bucket: &str, names: &[String]) -> Result<usize> {
        let mut deleted = 0;
        for name in names {
            let file_id = match self.file_id(bucket, name).await {
                Ok(id) => id,
                Err(e) if is_not_found(&e) => continue,
                Err(e) => return Err(e),
            };
            match self.delete_file_version(name, &file_id).await {
                Ok(()) => deleted += 1,
                Err(e) if is_not_found(&e) => {}
                Err(e) => return Err(e),
            }
            self.infos.invalidate(name);
        }

        self.infos.log_metrics();
        info!(requested = names.len(), deleted = deleted, "Deleted objects from B2");
        Ok(deleted)
    }
}
