//! HTTP fetch utilities and the in-process TTL cache that fronts dataset ingestion.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "vcat-storage";

/// Default freshness window for cached datasets.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
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

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(3),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_concurrency: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shutting down")]
    Closed,
}

/// A successful download, hashed so callers can tell whether a refresh
/// actually brought new content.
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    pub content_hash: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
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
            limit: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    /// GET `url`, retrying transient failures with exponential backoff.
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        dataset_key: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, dataset_key, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let _permit = self.limit.acquire().await.map_err(|_| FetchError::Closed)?;

        let mut attempt = 0usize;
        loop {
            let can_retry = attempt < self.backoff.max_retries;
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp
                            .bytes()
                            .await
                            .map_err(|source| FetchError::Request {
                                url: final_url.clone(),
                                source,
                            })?
                            .to_vec();
                        let content_hash = sha256_hex(&body);
                        debug!(bytes = body.len(), %content_hash, "fetched");
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                            content_hash,
                            fetched_at: Utc::now(),
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && can_retry {
                        warn!(%status, attempt, "retryable status");
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
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                        warn!(error = %err, attempt, "retryable request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request {
                        url: url.to_string(),
                        source: err,
                    });
                }
            }
        }
    }
}

/// One cached payload. It is either fresh or due for wholesale replacement;
/// there is no partial refresh.
#[derive(Debug)]
pub struct CacheEntry<T> {
    pub key: String,
    pub payload: Arc<T>,
    pub fetched_at: DateTime<Utc>,
    loaded: Instant,
    ttl: Duration,
}

impl<T> CacheEntry<T> {
    pub fn age(&self) -> Duration {
        self.loaded.elapsed()
    }

    pub fn is_fresh(&self) -> bool {
        self.age() < self.ttl
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntryInfo {
    pub key: String,
    pub fetched_at: DateTime<Utc>,
    pub age: Duration,
    pub fresh: bool,
}

/// Keyed time-bounded cache.
///
/// By default two callers that both observe an expired entry will both run
/// their fetch and the last one to finish wins. With `single_flight` enabled
/// a per-key lock makes later callers wait for, and reuse, the first refresh.
#[derive(Debug)]
pub struct TtlCache<T> {
    ttl: Duration,
    single_flight: bool,
    entries: Mutex<HashMap<String, CacheEntry<T>>>,
    refresh_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<T: Send + Sync> TtlCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            single_flight: false,
            entries: Mutex::new(HashMap::new()),
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_single_flight(mut self, enabled: bool) -> Self {
        self.single_flight = enabled;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The cached payload for `key`, if one exists and has not expired.
    pub async fn get_fresh(&self, key: &str) -> Option<Arc<T>> {
        let entries = self.entries.lock().await;
        entries
            .get(key)
            .filter(|entry| entry.is_fresh())
            .map(|entry| Arc::clone(&entry.payload))
    }

    /// Return the fresh payload for `key` or run `fetch` and replace the entry.
    ///
    /// A failed fetch leaves any expired entry in place; it is never served as
    /// fresh and the next call tries again.
    pub async fn get_or_refresh<F, Fut, E>(&self, key: &str, fetch: F) -> Result<Arc<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(payload) = self.get_fresh(key).await {
            debug!(key, "cache hit");
            return Ok(payload);
        }

        let _flight = if self.single_flight {
            let lock = self.refresh_lock(key).await;
            let guard = lock.lock_owned().await;
            if let Some(payload) = self.get_fresh(key).await {
                debug!(key, "cache filled by concurrent refresh");
                return Ok(payload);
            }
            Some(guard)
        } else {
            None
        };

        debug!(key, "cache miss; refreshing");
        let payload = Arc::new(fetch().await?);
        let entry = CacheEntry {
            key: key.to_string(),
            payload: Arc::clone(&payload),
            fetched_at: Utc::now(),
            loaded: Instant::now(),
            ttl: self.ttl,
        };
        self.entries.lock().await.insert(key.to_string(), entry);
        info!(key, ttl_secs = self.ttl.as_secs(), "cache entry replaced");
        Ok(payload)
    }

    pub async fn info(&self, key: &str) -> Option<CacheEntryInfo> {
        let entries = self.entries.lock().await;
        entries.get(key).map(|entry| CacheEntryInfo {
            key: entry.key.clone(),
            fetched_at: entry.fetched_at,
            age: entry.age(),
            fresh: entry.is_fresh(),
        })
    }

    pub async fn invalidate(&self, key: &str) -> bool {
        self.entries.lock().await.remove(key).is_some()
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    async fn refresh_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.refresh_locks.lock().await;
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
