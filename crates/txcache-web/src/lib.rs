//! Axum JSON API over the transaction cache.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use txcache_core::{DateRange, Transaction, TransactionSource};
use txcache_sync::{CacheService, FetchRequest, SyncConfig, SyncError};

pub const CRATE_NAME: &str = "txcache-web";

const DEFAULT_METRICS_LIMIT: usize = 50;
const MAX_METRICS_LIMIT: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<CacheService>,
}

impl AppState {
    pub fn new(service: Arc<CacheService>) -> Self {
        Self { service }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionsBody {
    start_date: String,
    end_date: String,
    #[serde(default)]
    force_refresh: bool,
    #[serde(default)]
    source: Option<String>,
}

#[derive(Debug, Serialize)]
struct TransactionsResponse {
    transactions: Vec<Transaction>,
    cached: bool,
    partial: bool,
    source: TransactionSource,
    raw_response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SegmentsQuery {
    source: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MetricsQuery {
    limit: Option<usize>,
}

/// JSON error body with the status it is served under.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: serde_json::Value,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: json!({ "error": message.into() }),
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        match &err {
            SyncError::InvalidRequest(_)
            | SyncError::SourceNotConfigured(_)
            | SyncError::SourceDisabled(_) => Self::bad_request(err.to_string()),
            SyncError::Upstream(upstream) => Self {
                status: StatusCode::BAD_GATEWAY,
                body: json!({
                    "error": err.to_string(),
                    "upstream_status": upstream.upstream_status(),
                    "raw_response": upstream.raw_body(),
                }),
            },
            SyncError::Store(_) => {
                error!(error = %err, "store failure while serving request");
                Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    body: json!({ "error": err.to_string() }),
                }
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/transactions", post(transactions_handler))
        .route("/healthz", get(healthz_handler))
        .route("/cache/segments", get(segments_handler))
        .route("/cache/metrics", get(metrics_handler))
        .with_state(Arc::new(state))
}

/// Builds the service from the environment, starts the refresh scheduler when
/// enabled, and serves until the listener fails.
pub async fn serve_from_env(memory: bool) -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let store = txcache_sync::connect_store(&config, memory).await?;
    let service = Arc::new(txcache_sync::build_service(&config, store).await?);

    let scheduler = txcache_sync::maybe_build_scheduler(&config, Arc::clone(&service)).await?;
    if let Some(sched) = &scheduler {
        sched.start().await?;
        info!(cron = %config.refresh_cron, window_days = config.refresh_window_days, "refresh scheduler started");
    }

    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, memory, "listening");
    axum::serve(listener, app(AppState::new(service))).await?;
    Ok(())
}

fn parse_date(field: &str, value: &str) -> Result<NaiveDate, ApiError> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| ApiError::bad_request(format!("{field} must be YYYY-MM-DD, got {value:?}")))
}

fn parse_source(value: Option<&str>) -> Result<Option<TransactionSource>, ApiError> {
    value
        .filter(|v| !v.trim().is_empty())
        .map(|v| v.parse::<TransactionSource>())
        .transpose()
        .map_err(|err| ApiError::bad_request(err.to_string()))
}

async fn transactions_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<TransactionsBody>, JsonRejection>,
) -> Result<Json<TransactionsResponse>, ApiError> {
    let Json(body) = body.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
    let start = parse_date("startDate", &body.start_date)?;
    let end = parse_date("endDate", &body.end_date)?;
    let range = DateRange::new(start, end).map_err(SyncError::from)?;
    let source = parse_source(body.source.as_deref())?.unwrap_or(TransactionSource::Zoho);

    let outcome = state
        .service
        .fetch_transactions(FetchRequest {
            source,
            range,
            force_refresh: body.force_refresh,
        })
        .await?;
    if let Some(err) = &outcome.error {
        warn!(source = %source, range = %range, error = %err, "serving degraded response");
    }

    Ok(Json(TransactionsResponse {
        transactions: outcome.transactions,
        cached: outcome.cached,
        partial: outcome.partial,
        source,
        raw_response: outcome.raw_response,
        error: outcome.error,
    }))
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn segments_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SegmentsQuery>,
) -> Response {
    let source = match parse_source(query.source.as_deref()) {
        Ok(source) => source,
        Err(err) => return err.into_response(),
    };
    match state.service.store().list_segments(source).await {
        Ok(segments) => Json(segments).into_response(),
        Err(err) => ApiError::from(SyncError::from(err)).into_response(),
    }
}

async fn metrics_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MetricsQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_METRICS_LIMIT)
        .clamp(1, MAX_METRICS_LIMIT);
    match state.service.store().recent_metrics(limit).await {
        Ok(metrics) => Json(metrics).into_response(),
        Err(err) => ApiError::from(SyncError::from(err)).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use std::path::Path;
    use tower::ServiceExt;
    use txcache_sync::{InMemoryStore, RawBody, SourceConfig, SourceRegistry, TransactionFeed};
    use txcache_webhook::WebhookError;
    use uuid::Uuid;

    struct FixedFeed {
        status: Option<u16>,
        body: String,
    }

    #[async_trait]
    impl TransactionFeed for FixedFeed {
        async fn fetch_raw(
            &self,
            _request_id: Uuid,
            source: &SourceConfig,
            _range: DateRange,
        ) -> Result<RawBody, WebhookError> {
            match self.status {
                None => Ok(RawBody::new(self.body.clone())),
                Some(status) => Err(WebhookError::HttpStatus {
                    status,
                    url: source.webhook_url.clone(),
                    body: self.body.clone(),
                }),
            }
        }
    }

    fn fixture(name: &str) -> String {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures").join(name);
        std::fs::read_to_string(&path).unwrap()
    }

    fn test_app(status: Option<u16>, body: String) -> Router {
        let registry = SourceRegistry::from_yaml_str(
            "sources:\n  - source: zoho\n    webhook_url: https://hooks.test/zoho\n  - source: stripe\n    webhook_url: https://hooks.test/stripe\n",
        )
        .unwrap();
        let service = CacheService::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(FixedFeed { status, body }),
            registry,
        );
        app(AppState::new(Arc::new(service)))
    }

    fn post_json(body: serde_json::Value) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri("/transactions")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn march() -> serde_json::Value {
        json!({ "startDate": "2024-03-01", "endDate": "2024-03-31" })
    }

    #[tokio::test]
    async fn transactions_miss_then_hit() {
        let app = test_app(None, fixture("zoho/clean.json"));

        let first = app.clone().oneshot(post_json(march())).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let first = json_body(first).await;
        assert_eq!(first["cached"], false);
        assert_eq!(first["source"], "zoho");
        assert_eq!(first["transactions"].as_array().unwrap().len(), 5);
        assert!(first["raw_response"].is_string());
        assert!(first.get("error").is_none());
        assert!(first["transactions"][0].get("type").is_some());

        let second = json_body(app.clone().oneshot(post_json(march())).await.unwrap()).await;
        assert_eq!(second["cached"], true);
        assert_eq!(second["partial"], false);
        assert!(second["raw_response"].is_null());
        assert_eq!(second["transactions"].as_array().unwrap().len(), 5);

        let metrics = json_body(app.oneshot(get("/cache/metrics?limit=1")).await.unwrap()).await;
        assert_eq!(metrics.as_array().unwrap().len(), 1);
        assert_eq!(metrics[0]["outcome"], "hit");
    }

    #[tokio::test]
    async fn malformed_upstream_is_200_with_error() {
        let raw = fixture("zoho/garbled.txt");
        let app = test_app(None, raw.clone());
        let resp = app.oneshot(post_json(march())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert!(body["error"].is_string());
        assert_eq!(body["raw_response"], raw.as_str());
        assert_eq!(body["transactions"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn upstream_status_maps_to_bad_gateway() {
        let app = test_app(Some(500), "workflow crashed".to_string());
        let resp = app.oneshot(post_json(march())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let body = json_body(resp).await;
        assert_eq!(body["upstream_status"], 500);
        assert_eq!(body["raw_response"], "workflow crashed");
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn invalid_requests_are_bad_request() {
        let app = test_app(None, "{}".to_string());
        for payload in [
            json!({ "startDate": "2024-03-31", "endDate": "2024-03-01" }),
            json!({ "startDate": "03/01/2024", "endDate": "2024-03-31" }),
            json!({ "startDate": "2024-03-01", "endDate": "2024-03-31", "source": "paypal" }),
            json!({ "endDate": "2024-03-31" }),
        ] {
            let resp = app.clone().oneshot(post_json(payload)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
            assert!(json_body(resp).await["error"].is_string());
        }
    }

    #[tokio::test]
    async fn stripe_source_is_selectable() {
        let app = test_app(None, fixture("stripe/balance_transactions.json"));
        let body = json!({
            "startDate": "2024-03-01",
            "endDate": "2024-03-31",
            "source": "Stripe",
            "forceRefresh": true
        });
        let resp = json_body(app.oneshot(post_json(body)).await.unwrap()).await;
        assert_eq!(resp["source"], "stripe");
        assert_eq!(resp["cached"], false);
    }

    #[tokio::test]
    async fn healthz_and_segments() {
        let app = test_app(None, fixture("zoho/clean.json"));
        let health = app.clone().oneshot(get("/healthz")).await.unwrap();
        assert_eq!(health.status(), StatusCode::OK);

        app.clone().oneshot(post_json(march())).await.unwrap();
        let segments = json_body(app.clone().oneshot(get("/cache/segments?source=zoho")).await.unwrap()).await;
        assert_eq!(segments.as_array().unwrap().len(), 1);
        assert_eq!(segments[0]["status"], "complete");
        assert_eq!(segments[0]["transaction_count"], 5);

        let none = json_body(app.clone().oneshot(get("/cache/segments?source=stripe")).await.unwrap()).await;
        assert!(none.as_array().unwrap().is_empty());

        let bad = app.oneshot(get("/cache/segments?source=paypal")).await.unwrap();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
    }
}
