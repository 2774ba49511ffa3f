//! Concurrency-capped, retrying JSON client for external metric registries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

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

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("registry {url} rejected the call: {message}")]
    Api { url: String, message: String },
    #[error("registry {url} returned malformed JSON: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// JSON client shared by every adapter of a process. Concurrency is capped
/// globally and per registry, and transient failures are retried with
/// capped exponential backoff.
#[derive(Debug)]
pub struct RegistryClient {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

impl RegistryClient {
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
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    /// POST `payload` (or GET when `None`) and return the `data` member of
    /// the registry's `{result, data, message}` envelope. Bodies without the
    /// envelope are returned as-is.
    pub async fn request_json(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        payload: Option<&JsonValue>,
    ) -> Result<JsonValue, FetchError> {
        let span = info_span!("registry_call", %run_id, source_id, url);
        async move {
            let body = self.send_with_retries(source_id, url, payload).await?;
            let value: JsonValue = serde_json::from_slice(&body).map_err(|source| {
                FetchError::Decode {
                    url: url.to_string(),
                    source,
                }
            })?;
            unwrap_envelope(url, value)
        }
        .instrument(span)
        .await
    }

    async fn send_with_retries(
        &self,
        source_id: &str,
        url: &str,
        payload: Option<&JsonValue>,
    ) -> Result<Vec<u8>, FetchError> {
        // Semaphores are never closed, so acquisition cannot fail.
        let _global = self.global_limit.acquire().await.ok();
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.ok();

        let mut attempt = 0;
        loop {
            let request = match payload {
                Some(body) => self.client.post(url).json(body),
                None => self.client.get(url),
            };

            let (failure, disposition) = match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    return Ok(resp.bytes().await?.to_vec());
                }
                Ok(resp) => {
                    let status = resp.status();
                    let failure = FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    };
                    (failure, classify_status(status))
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    (FetchError::Request(err), disposition)
                }
            };

            if disposition == RetryDisposition::NonRetryable || attempt >= self.backoff.max_retries
            {
                return Err(failure);
            }
            debug!(error = %failure, attempt, "retrying registry call");
            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}

/// Strip the `{result, data, message}` envelope some registries wrap
/// responses in.
pub fn unwrap_envelope(url: &str, value: JsonValue) -> Result<JsonValue, FetchError> {
    let JsonValue::Object(mut map) = value else {
        return Ok(value);
    };
    match map.get("result").and_then(JsonValue::as_bool) {
        Some(true) => Ok(map.remove("data").unwrap_or(JsonValue::Null)),
        Some(false) => Err(FetchError::Api {
            url: url.to_string(),
            message: map
                .get("message")
                .and_then(JsonValue::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        }),
        None => Ok(JsonValue::Object(map)),
    }
}
