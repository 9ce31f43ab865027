//! Transport and persistence collaborators for flowlog: a JSON-over-HTTP
//! fetcher and an atomic, key-addressed JSON record store.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub use reqwest::Url;

pub const CRATE_NAME: &str = "flowlog-storage";

pub type RequestHeaders = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid request header {0}")]
    InvalidHeader(String),
    #[error("response from {url} was not valid JSON: {reason}")]
    Decode { url: String, reason: String },
}

impl FetchError {
    /// Status code of the upstream response, when one was received.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Request(err) => err.status().map(|s| s.as_u16()),
            Self::InvalidHeader(_) | Self::Decode { .. } => None,
        }
    }
}

/// GET-and-decode seam between source adapters and the network.
#[async_trait]
pub trait JsonTransport: Send + Sync {
    async fn get_json(&self, url: &str, headers: &RequestHeaders) -> Result<JsonValue, FetchError>;
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
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Transport-level retry policy. Zero retries unless an operator opts in.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32
            .checked_shl(u32::try_from(attempt_index).unwrap_or(u32::MAX))
            .unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
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
            backoff: config.backoff,
        })
    }

    async fn get_json_with_backoff(
        &self,
        url: &str,
        headers: HeaderMap,
    ) -> Result<JsonValue, FetchError> {
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).headers(headers.clone()).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = redact_query(resp.url().as_str());

                    if status.is_success() {
                        let body = resp.bytes().await?;
                        return serde_json::from_slice(&body).map_err(|err| FetchError::Decode {
                            url: final_url,
                            reason: err.to_string(),
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%status, attempt, "retrying upstream status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
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
                        debug!(error = %err, attempt, "retrying request error");
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

#[async_trait]
impl JsonTransport for HttpFetcher {
    async fn get_json(&self, url: &str, headers: &RequestHeaders) -> Result<JsonValue, FetchError> {
        let headers = header_map(headers)?;
        let span = info_span!("http_fetch", url = %redact_query(url));
        self.get_json_with_backoff(url, headers).instrument(span).await
    }
}

fn header_map(headers: &RequestHeaders) -> Result<HeaderMap, FetchError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| FetchError::InvalidHeader(format!("{name}: {err}")))?;
        let mut header_value = HeaderValue::from_str(value)
            .map_err(|err| FetchError::InvalidHeader(format!("{name}: {err}")))?;
        header_value.set_sensitive(header_name == AUTHORIZATION);
        map.insert(header_name, header_value);
    }
    Ok(map)
}

/// Drops the query string so credentials passed as parameters never reach logs.
pub fn redact_query(url: &str) -> String {
    match url.split_once('?') {
        Some((base, _)) => format!("{base}?<redacted>"),
        None => url.to_string(),
    }
}

/// Persistence seam for raw and common-format records.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Upserts `records` into `location` of `destination` and returns them.
    async fn store(
        &self,
        destination: &str,
        location: &str,
        records: Vec<JsonValue>,
    ) -> anyhow::Result<Vec<JsonValue>>;
}

#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub key: String,
    pub content_hash: String,
    pub path: PathBuf,
    pub deduplicated: bool,
}

/// File-backed record store: one pretty-printed JSON document per record key.
#[derive(Debug, Clone)]
pub struct JsonRecordStore {
    root: PathBuf,
}

impl JsonRecordStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn location_dir(&self, destination: &str, location: &str) -> PathBuf {
        self.root
            .join(path_segment(destination))
            .join(path_segment(location))
    }

    pub async fn store_record(
        &self,
        destination: &str,
        location: &str,
        record: &JsonValue,
    ) -> anyhow::Result<StoredRecord> {
        let key = record_key(record).context("record has no `_id` or `id` key")?;
        let bytes = serde_json::to_vec_pretty(record)
            .with_context(|| format!("serializing record {key}"))?;
        let content_hash = Self::sha256_hex(&bytes);
        let dir = self.location_dir(destination, location);
        let path = dir.join(format!("{}.json", path_segment(&key)));

        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating record directory {}", dir.display()))?;

        if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking record path {}", path.display()))?
        {
            let existing = fs::read(&path)
                .await
                .with_context(|| format!("reading existing record {}", path.display()))?;
            if Self::sha256_hex(&existing) == content_hash {
                return Ok(StoredRecord {
                    key,
                    content_hash,
                    path,
                    deduplicated: true,
                });
            }
        }

        let temp_path = dir.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp record file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp record file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp record file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp record {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }

        Ok(StoredRecord {
            key,
            content_hash,
            path,
            deduplicated: false,
        })
    }
}

#[async_trait]
impl RecordSink for JsonRecordStore {
    async fn store(
        &self,
        destination: &str,
        location: &str,
        records: Vec<JsonValue>,
    ) -> anyhow::Result<Vec<JsonValue>> {
        let span = info_span!("record_store", destination, location, count = records.len());
        async {
            let mut written = 0usize;
            for record in &records {
                if !self.store_record(destination, location, record).await?.deduplicated {
                    written += 1;
                }
            }
            debug!(written, unchanged = records.len() - written, "records stored");
            Ok::<_, anyhow::Error>(records)
        }
        .instrument(span)
        .await
    }
}

/// Persistence key of a record: `_id`, falling back to `id`.
pub fn record_key(record: &JsonValue) -> Option<String> {
    ["_id", "id"].iter().find_map(|field| match record.get(*field)? {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn path_segment(input: &str) -> String {
    let segment = input
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect::<String>();
    if segment.is_empty() {
        "_".to_string()
    } else {
        segment
    }
}
