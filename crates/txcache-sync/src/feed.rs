use async_trait::async_trait;
use txcache_core::DateRange;
use txcache_webhook::{sha256_hex, WebhookClient, WebhookError};
use uuid::Uuid;

use crate::SourceConfig;

/// Upstream body together with its sha256 content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBody {
    pub body: String,
    pub sha256: String,
}

impl RawBody {
    pub fn new(body: impl Into<String>) -> Self {
        let body = body.into();
        let sha256 = sha256_hex(body.as_bytes());
        Self { body, sha256 }
    }
}

/// Where raw upstream bodies come from.
#[async_trait]
pub trait TransactionFeed: Send + Sync {
    async fn fetch_raw(
        &self,
        request_id: Uuid,
        source: &SourceConfig,
        range: DateRange,
    ) -> Result<RawBody, WebhookError>;
}

/// Posts the range to the source's configured webhook.
#[derive(Debug, Clone)]
pub struct WebhookFeed {
    client: WebhookClient,
}

impl WebhookFeed {
    pub fn new(client: WebhookClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TransactionFeed for WebhookFeed {
    async fn fetch_raw(
        &self,
        request_id: Uuid,
        source: &SourceConfig,
        range: DateRange,
    ) -> Result<RawBody, WebhookError> {
        let response = self
            .client
            .post_range(request_id, source.source.as_str(), &source.webhook_url, range)
            .await?;
        Ok(RawBody {
            body: response.body,
            sha256: response.body_sha256,
        })
    }
}
