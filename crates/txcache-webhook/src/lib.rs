//! Outbound webhook client used to pull raw transactions for a date range.

use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDate;
use reqwest::StatusCode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};
use txcache_core::DateRange;
use uuid::Uuid;

pub const CRATE_NAME: &str = "txcache-webhook";

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
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct WebhookClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for WebhookClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Body posted to the upstream automation webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookRequest {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl From<DateRange> for WebhookRequest {
    fn from(range: DateRange) -> Self {
        Self {
            start_date: range.start,
            end_date: range.end,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebhookResponse {
    pub status: StatusCode,
    pub body: String,
    pub body_sha256: String,
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("webhook request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("webhook returned http {status} for {url}")]
    HttpStatus { status: u16, url: String, body: String },
}

impl WebhookError {
    /// Raw upstream body, when the upstream answered at all.
    pub fn raw_body(&self) -> Option<&str> {
        match self {
            WebhookError::HttpStatus { body, .. } => Some(body.as_str()),
            WebhookError::Request(_) => None,
        }
    }

    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            WebhookError::HttpStatus { status, .. } => Some(*status),
            WebhookError::Request(err) => err.status().map(|s| s.as_u16()),
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct WebhookClient {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl WebhookClient {
    pub fn new(config: WebhookClientConfig) -> anyhow::Result<Self> {
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

    /// POST the date range to `url` and return the raw body.
    ///
    /// Transport errors, 429 and 5xx responses are retried with backoff. Any
    /// other non-2xx status is returned immediately with the upstream body.
    pub async fn post_range(
        &self,
        request_id: Uuid,
        source: &str,
        url: &str,
        range: DateRange,
    ) -> Result<WebhookResponse, WebhookError> {
        let span = info_span!("webhook_fetch", %request_id, source, url, range = %range);
        self.post_range_inner(url, WebhookRequest::from(range))
            .instrument(span)
            .await
    }

    async fn post_range_inner(
        &self,
        url: &str,
        payload: WebhookRequest,
    ) -> Result<WebhookResponse, WebhookError> {
        let mut attempt = 0usize;
        loop {
            match self.client.post(url).json(&payload).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let body = resp.text().await?;

                    if status.is_success() {
                        let body_sha256 = sha256_hex(body.as_bytes());
                        debug!(%status, bytes = body.len(), %body_sha256, "webhook responded");
                        return Ok(WebhookResponse {
                            status,
                            body,
                            body_sha256,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(%status, attempt, "retrying webhook after upstream status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(WebhookError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                        body,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "retrying webhook after transport error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(WebhookError::Request(err));
                }
            }
        }
    }
}
