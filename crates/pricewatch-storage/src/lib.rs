//! HTTP fetch utilities, raw catalog cache and atomic snapshot commits for pricewatch.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use pricewatch_core::Platform;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pricewatch-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write bytes through a temp file in the destination directory and rename into place.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

/// Raw platform payload for one vendor, cached so a failed fetch can fall back to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCatalog {
    pub store_name: String,
    pub platform: Platform,
    pub fetched_at: DateTime<Utc>,
    pub products: Vec<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct StoredCatalog {
    pub path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
    pub unchanged: bool,
}

#[derive(Debug, Clone)]
pub struct CatalogCache {
    root: PathBuf,
}

impl CatalogCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cache_path(&self, store_name: &str) -> PathBuf {
        let slug: String = store_name
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root.join(format!("{slug}.json"))
    }

    pub async fn store(&self, catalog: &RawCatalog) -> anyhow::Result<StoredCatalog> {
        let path = self.cache_path(&catalog.store_name);
        let bytes = serde_json::to_vec(catalog)
            .with_context(|| format!("serializing raw catalog for {}", catalog.store_name))?;
        let content_hash = sha256_hex(&bytes);

        if let Ok(existing) = fs::read(&path).await {
            if sha256_hex(&existing) == content_hash {
                return Ok(StoredCatalog {
                    path,
                    content_hash,
                    byte_size: bytes.len(),
                    unchanged: true,
                });
            }
        }

        write_atomic(&path, &bytes).await?;
        Ok(StoredCatalog {
            path,
            content_hash,
            byte_size: bytes.len(),
            unchanged: false,
        })
    }

    pub async fn load(&self, store_name: &str) -> anyhow::Result<Option<RawCatalog>> {
        let path = self.cache_path(store_name);
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking cache path {}", path.display()))?
        {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let catalog = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(catalog))
    }
}

/// Live data directory whose documents are replaced as one unit per cycle.
///
/// A cycle writes into a sibling staging directory; `commit` swaps it in with
/// two renames (live -> `.previous`, staging -> live).
#[derive(Debug, Clone)]
pub struct SnapshotDir {
    live: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct CommitSummary {
    pub files_written: usize,
    pub files_carried: usize,
    pub bytes_written: u64,
}

impl SnapshotDir {
    pub fn new(live: impl Into<PathBuf>) -> Self {
        Self { live: live.into() }
    }

    pub fn root(&self) -> &Path {
        &self.live
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let name = self
            .live
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "data".to_string());
        self.parent().join(format!(".{name}.{suffix}"))
    }

    fn parent(&self) -> PathBuf {
        self.live
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn previous_path(&self) -> PathBuf {
        self.sibling("previous")
    }

    /// Repair an interrupted swap and drop abandoned staging directories.
    ///
    /// Returns true when the live directory had to be restored.
    pub async fn recover(&self) -> anyhow::Result<bool> {
        let previous = self.previous_path();
        let mut restored = false;
        let live_exists = fs::try_exists(&self.live)
            .await
            .with_context(|| format!("checking {}", self.live.display()))?;
        let previous_exists = fs::try_exists(&previous)
            .await
            .with_context(|| format!("checking {}", previous.display()))?;

        if !live_exists && previous_exists {
            fs::rename(&previous, &self.live).await.with_context(|| {
                format!("restoring {} -> {}", previous.display(), self.live.display())
            })?;
            warn!(live = %self.live.display(), "restored data directory from interrupted commit");
            restored = true;
        } else if previous_exists {
            fs::remove_dir_all(&previous)
                .await
                .with_context(|| format!("removing {}", previous.display()))?;
        }

        let parent = self.parent();
        if fs::try_exists(&parent).await.unwrap_or(false) {
            let staging_prefix = self
                .sibling("staging-")
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let mut entries = fs::read_dir(&parent)
                .await
                .with_context(|| format!("reading {}", parent.display()))?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with(&staging_prefix) {
                    fs::remove_dir_all(entry.path())
                        .await
                        .with_context(|| format!("removing stale staging dir {name}"))?;
                }
            }
        }
        Ok(restored)
    }

    pub async fn read_json<T: DeserializeOwned>(&self, file: &str) -> anyhow::Result<Option<T>> {
        let path = self.live.join(file);
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let value = serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(value))
    }

    pub async fn begin(&self) -> anyhow::Result<SnapshotTxn> {
        let staging = self.sibling(&format!("staging-{}", Uuid::new_v4()));
        fs::create_dir_all(&staging)
            .await
            .with_context(|| format!("creating staging dir {}", staging.display()))?;
        Ok(SnapshotTxn {
            live: self.live.clone(),
            previous: self.previous_path(),
            staging,
            written: Vec::new(),
            bytes_written: 0,
        })
    }
}

/// Documents staged for one cycle. Dropping without `commit` leaves the live directory untouched.
#[derive(Debug)]
pub struct SnapshotTxn {
    live: PathBuf,
    previous: PathBuf,
    staging: PathBuf,
    written: Vec<String>,
    bytes_written: u64,
}

impl SnapshotTxn {
    pub fn staging_dir(&self) -> &Path {
        &self.staging
    }

    pub async fn write_json<T: Serialize>(&mut self, file: &str, value: &T, pretty: bool) -> anyhow::Result<()> {
        let bytes = if pretty {
            serde_json::to_vec_pretty(value)
        } else {
            serde_json::to_vec(value)
        }
        .with_context(|| format!("serializing {file}"))?;
        let path = self.staging.join(file);
        fs::write(&path, &bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        self.bytes_written += bytes.len() as u64;
        self.written.push(file.to_string());
        Ok(())
    }

    pub async fn abort(self) -> anyhow::Result<()> {
        fs::remove_dir_all(&self.staging)
            .await
            .with_context(|| format!("removing {}", self.staging.display()))
    }

    pub async fn commit(self) -> anyhow::Result<CommitSummary> {
        let span = info_span!("snapshot_commit", live = %self.live.display(), files = self.written.len());
        async move {
            let files_carried = self.carry_over_unwritten().await?;

            if fs::try_exists(&self.previous).await.unwrap_or(false) {
                fs::remove_dir_all(&self.previous)
                    .await
                    .with_context(|| format!("removing leftover {}", self.previous.display()))?;
            }

            let had_live = fs::try_exists(&self.live)
                .await
                .with_context(|| format!("checking {}", self.live.display()))?;
            if had_live {
                fs::rename(&self.live, &self.previous).await.with_context(|| {
                    format!("moving {} -> {}", self.live.display(), self.previous.display())
                })?;
            }

            if let Err(err) = fs::rename(&self.staging, &self.live).await {
                if had_live {
                    let _ = fs::rename(&self.previous, &self.live).await;
                }
                return Err(err).with_context(|| {
                    format!("swapping {} -> {}", self.staging.display(), self.live.display())
                });
            }

            if had_live {
                if let Err(err) = fs::remove_dir_all(&self.previous).await {
                    warn!(error = %err, "failed to remove previous snapshot directory");
                }
            }

            Ok(CommitSummary {
                files_written: self.written.len(),
                files_carried,
                bytes_written: self.bytes_written,
            })
        }
        .instrument(span)
        .await
    }

    async fn carry_over_unwritten(&self) -> anyhow::Result<usize> {
        if !fs::try_exists(&self.live).await.unwrap_or(false) {
            return Ok(0);
        }
        let mut carried = 0usize;
        let mut entries = fs::read_dir(&self.live)
            .await
            .with_context(|| format!("reading {}", self.live.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if self.written.contains(&name) || !entry.file_type().await?.is_file() {
                continue;
            }
            fs::copy(entry.path(), self.staging.join(&name))
                .await
                .with_context(|| format!("carrying over {name}"))?;
            carried += 1;
        }
        Ok(carried)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Seconds from a `Retry-After` header; HTTP-date values are ignored.
pub fn retry_after_delay(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_retry_after: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            max_retry_after: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Server-requested wait wins over the exponential schedule, within `max_retry_after`.
    pub fn delay_for_response(&self, attempt_index: usize, retry_after: Option<Duration>) -> Duration {
        match retry_after {
            Some(wait) => wait.min(self.max_retry_after),
            None => self.delay_for_attempt(attempt_index),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_vendor_concurrency: usize,
    pub request_delay: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 5,
            per_vendor_concurrency: 1,
            request_delay: Duration::from_secs(1),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Keeps requests to one vendor at least `interval` apart.
#[derive(Debug)]
pub struct RequestPacer {
    default_interval: Duration,
    overrides: Mutex<HashMap<String, Duration>>,
    next_slot: Mutex<HashMap<String, Instant>>,
}

/// Reserve the next request slot; returns the reserved instant and how long to wait for it.
pub fn reserve_slot(next_free: Option<Instant>, now: Instant, interval: Duration) -> (Instant, Duration) {
    match next_free {
        Some(slot) if slot > now => (slot + interval, slot - now),
        _ => (now + interval, Duration::ZERO),
    }
}

impl RequestPacer {
    pub fn new(default_interval: Duration) -> Self {
        Self {
            default_interval,
            overrides: Mutex::new(HashMap::new()),
            next_slot: Mutex::new(HashMap::new()),
        }
    }

    pub async fn set_interval(&self, vendor: &str, interval: Duration) {
        self.overrides.lock().await.insert(vendor.to_string(), interval);
    }

    pub async fn wait_turn(&self, vendor: &str) {
        let interval = self
            .overrides
            .lock()
            .await
            .get(vendor)
            .copied()
            .unwrap_or(self.default_interval);
        let wait = {
            let mut slots = self.next_slot.lock().await;
            let (next, wait) = reserve_slot(slots.get(vendor).copied(), Instant::now(), interval);
            slots.insert(vendor.to_string(), next);
            wait
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_vendor_limit: usize,
    per_vendor: Mutex<HashMap<String, Arc<Semaphore>>>,
    pacer: RequestPacer,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetch limiter closed")]
    LimiterClosed,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_vendor_limit: config.per_vendor_concurrency.max(1),
            per_vendor: Mutex::new(HashMap::new()),
            pacer: RequestPacer::new(config.request_delay),
            backoff: config.backoff,
        })
    }

    pub fn pacer(&self) -> &RequestPacer {
        &self.pacer
    }

    async fn per_vendor_semaphore(&self, vendor: &str) -> Arc<Semaphore> {
        let mut map = self.per_vendor.lock().await;
        map.entry(vendor.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_vendor_limit)))
            .clone()
    }

    /// Single attempt, no retries; used to probe which endpoint a store exposes.
    pub async fn probe(&self, vendor: &str, url: &str) -> Result<StatusCode, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;
        self.pacer.wait_turn(vendor).await;
        let resp = self.client.get(url).send().await?;
        Ok(resp.status())
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        vendor: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;
        let per_vendor = self.per_vendor_semaphore(vendor).await;
        let _vendor = per_vendor
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;

        let span = info_span!("http_fetch", %run_id, vendor, url);
        self.fetch_with_retries(vendor, url).instrument(span).await
    }

    async fn fetch_with_retries(&self, vendor: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            self.pacer.wait_turn(vendor).await;
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        let wait = self
                            .backoff
                            .delay_for_response(attempt, retry_after_delay(resp.headers()));
                        warn!(status = status.as_u16(), wait_ms = wait.as_millis() as u64, "retrying");
                        tokio::time::sleep(wait).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "request error, retrying");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}
