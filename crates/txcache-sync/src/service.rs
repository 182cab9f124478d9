//! Read-through cache over the upstream feeds.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{Days, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use txcache_adapters::{normalizer_for_source, ParseStage, SkipCounts};
use txcache_core::{
    CacheMetric, CacheOutcome, CoreError, DateRange, SegmentStatus, Transaction, TransactionSource,
};
use txcache_webhook::WebhookError;
use uuid::Uuid;

use crate::coverage::{classify, Coverage};
use crate::feed::TransactionFeed;
use crate::store::{StoreError, TransactionStore, DEFAULT_BATCH_SIZE};
use crate::MAX_REFRESH_WINDOW_DAYS;
use crate::{SourceConfig, SourceRegistry};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] CoreError),
    #[error("source {0} is not configured")]
    SourceNotConfigured(TransactionSource),
    #[error("source {0} is disabled")]
    SourceDisabled(TransactionSource),
    #[error(transparent)]
    Upstream(#[from] WebhookError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheCheck {
    pub cached: bool,
    pub partial: bool,
    pub transactions: Vec<Transaction>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreReport {
    pub batches_ok: usize,
    pub batches_failed: usize,
    /// Distinct external ids dated inside the range.
    pub submitted: usize,
    /// Rows found in the range after the write.
    pub stored: usize,
    pub segment_status: SegmentStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRequest {
    pub source: TransactionSource,
    pub range: DateRange,
    pub force_refresh: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchOutcome {
    pub source: TransactionSource,
    pub transactions: Vec<Transaction>,
    pub cached: bool,
    /// The cache covered part of the range before the live fetch.
    pub partial: bool,
    /// Upstream body as received; `None` for cache hits.
    pub raw_response: Option<String>,
    pub raw_sha256: Option<String>,
    pub error: Option<String>,
    pub stage: Option<ParseStage>,
    pub skipped: SkipCounts,
    pub store_report: Option<StoreReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefreshResult {
    pub source: TransactionSource,
    pub range: DateRange,
    pub fetched: usize,
    pub error: Option<String>,
}

pub struct CacheService {
    store: Arc<dyn TransactionStore>,
    feed: Arc<dyn TransactionFeed>,
    registry: SourceRegistry,
    batch_size: usize,
}

impl CacheService {
    pub fn new(
        store: Arc<dyn TransactionStore>,
        feed: Arc<dyn TransactionFeed>,
        registry: SourceRegistry,
    ) -> Self {
        Self {
            store,
            feed,
            registry,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn TransactionStore> {
        &self.store
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    fn source_config(&self, source: TransactionSource) -> Result<&SourceConfig, SyncError> {
        let config = self
            .registry
            .get(source)
            .ok_or(SyncError::SourceNotConfigured(source))?;
        if !config.enabled {
            return Err(SyncError::SourceDisabled(source));
        }
        Ok(config)
    }

    /// Serves `range` from complete segments when they cover every day of it.
    #[instrument(skip_all, fields(source = %source, range = %range))]
    pub async fn check_cache(
        &self,
        source: TransactionSource,
        range: DateRange,
    ) -> Result<CacheCheck, SyncError> {
        let started = Instant::now();
        let segments = self.store.segments_overlapping(source, range).await?;

        match classify(source, range, &segments) {
            Coverage::Full => {
                let transactions = self.store.transactions_in_range(source, range).await?;
                debug!(rows = transactions.len(), "cache hit");
                self.record_metric(source, range, CacheOutcome::Hit, transactions.len(), started)
                    .await;
                Ok(CacheCheck {
                    cached: true,
                    partial: false,
                    transactions,
                })
            }
            Coverage::Partial { covered_days } => {
                debug!(covered_days, days = range.days(), "partial cache coverage");
                self.record_metric(source, range, CacheOutcome::Partial, 0, started)
                    .await;
                Ok(CacheCheck {
                    cached: false,
                    partial: true,
                    transactions: Vec::new(),
                })
            }
            Coverage::None => Ok(CacheCheck {
                cached: false,
                partial: false,
                transactions: Vec::new(),
            }),
        }
    }

    /// Upserts `transactions` under the `(source, range)` segment.
    ///
    /// Rows dated outside `range` are not stored. Duplicate external ids
    /// collapse to the last occurrence. A failed batch is counted, not raised;
    /// it leaves the segment `processing`.
    #[instrument(skip_all, fields(source = %source, range = %range, rows = transactions.len()))]
    pub async fn store_transactions_in_cache(
        &self,
        source: TransactionSource,
        range: DateRange,
        transactions: &[Transaction],
    ) -> Result<StoreReport, SyncError> {
        let mut distinct = dedupe_by_external_id(transactions);
        distinct.retain(|t| range.contains(t.date));
        let submitted = distinct.len();

        let write = self
            .store
            .write_segment(source, range, &distinct, submitted as i64, self.batch_size)
            .await?;
        if write.batches_failed > 0 {
            warn!(
                batches_ok = write.batches_ok,
                batches_failed = write.batches_failed,
                "segment left processing after failed batches"
            );
        }

        let stored = self.store.count_in_range(source, range).await?.max(0) as usize;
        if stored < submitted {
            warn!(submitted, stored, "stored row count below submitted count");
        }

        Ok(StoreReport {
            batches_ok: write.batches_ok,
            batches_failed: write.batches_failed,
            submitted,
            stored,
            segment_status: write.status,
        })
    }

    /// Cache check, then live fetch, normalize and store on anything but a hit.
    #[instrument(skip_all, fields(source = %request.source, range = %request.range, force = request.force_refresh))]
    pub async fn fetch_transactions(&self, request: FetchRequest) -> Result<FetchOutcome, SyncError> {
        let FetchRequest {
            source,
            range,
            force_refresh,
        } = request;
        let config = self.source_config(source)?;

        let mut partial = false;
        if !force_refresh {
            let check = self.check_cache(source, range).await?;
            if check.cached {
                return Ok(FetchOutcome {
                    source,
                    transactions: check.transactions,
                    cached: true,
                    partial: false,
                    raw_response: None,
                    raw_sha256: None,
                    error: None,
                    stage: None,
                    skipped: SkipCounts::default(),
                    store_report: None,
                });
            }
            partial = check.partial;
        }

        let started = Instant::now();
        let request_id = Uuid::new_v4();
        let raw = match self.feed.fetch_raw(request_id, config, range).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!(%request_id, error = %err, "upstream fetch failed");
                self.record_metric(source, range, CacheOutcome::Miss, 0, started)
                    .await;
                return Err(err.into());
            }
        };

        let mut batch = normalizer_for_source(source, config.rules.clone()).normalize(&raw.body);
        if batch.is_degraded() {
            warn!(%request_id, error = batch.error.as_deref().unwrap_or_default(), "upstream body could not be decoded");
            self.record_metric(source, range, CacheOutcome::Miss, 0, started)
                .await;
            return Ok(FetchOutcome {
                source,
                transactions: Vec::new(),
                cached: false,
                partial,
                raw_response: Some(raw.body),
                raw_sha256: Some(raw.sha256),
                error: batch.error,
                stage: Some(batch.stage),
                skipped: batch.skipped,
                store_report: None,
            });
        }

        let normalized = batch.transactions.len();
        batch.transactions.retain(|t| range.contains(t.date));
        batch.skipped.out_of_range += normalized - batch.transactions.len();

        let store_report = match self
            .store_transactions_in_cache(source, range, &batch.transactions)
            .await
        {
            Ok(report) => Some(report),
            Err(err) => {
                warn!(%request_id, error = %err, "caching fetched transactions failed");
                None
            }
        };
        info!(
            %request_id,
            body_sha256 = %raw.sha256,
            rows = batch.transactions.len(),
            skipped = batch.skipped.total(),
            stage = ?batch.stage,
            "live fetch complete"
        );
        self.record_metric(source, range, CacheOutcome::Miss, batch.transactions.len(), started)
            .await;

        Ok(FetchOutcome {
            source,
            transactions: batch.transactions,
            cached: false,
            partial,
            raw_response: Some(raw.body),
            raw_sha256: Some(raw.sha256),
            error: None,
            stage: Some(batch.stage),
            skipped: batch.skipped,
            store_report,
        })
    }

    /// Force-refreshes the `window_days` ending at `today` for every enabled source.
    ///
    /// The window is clamped to `1..=MAX_REFRESH_WINDOW_DAYS`.
    pub async fn refresh_trailing_window(&self, window_days: i64, today: NaiveDate) -> Vec<RefreshResult> {
        let back = window_days.clamp(1, MAX_REFRESH_WINDOW_DAYS) as u64 - 1;
        let start = today.checked_sub_days(Days::new(back)).unwrap_or(NaiveDate::MIN);
        let range = DateRange { start, end: today };
        let sources: Vec<TransactionSource> = self.registry.enabled().map(|s| s.source).collect();

        let mut results = Vec::with_capacity(sources.len());
        for source in sources {
            let request = FetchRequest {
                source,
                range,
                force_refresh: true,
            };
            let result = match self.fetch_transactions(request).await {
                Ok(outcome) => RefreshResult {
                    source,
                    range,
                    fetched: outcome.transactions.len(),
                    error: outcome.error,
                },
                Err(err) => RefreshResult {
                    source,
                    range,
                    fetched: 0,
                    error: Some(err.to_string()),
                },
            };
            info!(source = %source, range = %range, fetched = result.fetched, error = ?result.error, "scheduled refresh");
            results.push(result);
        }
        results
    }

    async fn record_metric(
        &self,
        source: TransactionSource,
        range: DateRange,
        outcome: CacheOutcome,
        transaction_count: usize,
        started: Instant,
    ) {
        let metric = CacheMetric {
            source,
            start_date: range.start,
            end_date: range.end,
            outcome,
            duration_ms: started.elapsed().as_millis() as i64,
            transaction_count: transaction_count as i64,
            recorded_at: Utc::now(),
        };
        if let Err(err) = self.store.record_metric(&metric).await {
            warn!(error = %err, outcome = outcome.as_str(), "failed to record cache metric");
        }
    }
}

fn dedupe_by_external_id(transactions: &[Transaction]) -> Vec<Transaction> {
    let mut position: HashMap<&str, usize> = HashMap::new();
    let mut distinct: Vec<Transaction> = Vec::with_capacity(transactions.len());
    for tx in transactions {
        match position.get(tx.external_id.as_str()) {
            Some(&idx) => distinct[idx] = tx.clone(),
            None => {
                position.insert(tx.external_id.as_str(), distinct.len());
                distinct.push(tx.clone());
            }
        }
    }
    distinct
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::RawBody;
    use crate::memory::InMemoryStore;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use txcache_core::{TransactionDraft, TransactionKind};

    enum Reply {
        Body(String),
        Status(u16, String),
    }

    struct StubFeed {
        reply: Reply,
        calls: AtomicUsize,
    }

    impl StubFeed {
        fn body(body: impl Into<String>) -> Arc<Self> {
            Arc::new(Self {
                reply: Reply::Body(body.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn status(status: u16, body: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Reply::Status(status, body.to_string()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TransactionFeed for StubFeed {
        async fn fetch_raw(
            &self,
            _request_id: Uuid,
            source: &SourceConfig,
            _range: DateRange,
        ) -> Result<RawBody, WebhookError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.reply {
                Reply::Body(body) => Ok(RawBody::new(body.clone())),
                Reply::Status(status, body) => Err(WebhookError::HttpStatus {
                    status: *status,
                    url: source.webhook_url.clone(),
                    body: body.clone(),
                }),
            }
        }
    }

    fn fixture(name: &str) -> String {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures").join(name);
        std::fs::read_to_string(&path).expect("read fixture")
    }

    fn registry(extra_zoho: &str) -> SourceRegistry {
        SourceRegistry::from_yaml_str(&format!(
            "sources:\n  - source: zoho\n    webhook_url: https://hooks.test/zoho\n{extra_zoho}  - source: stripe\n    enabled: false\n    webhook_url: https://hooks.test/stripe\n"
        ))
        .unwrap()
    }

    fn march() -> DateRange {
        DateRange::new(
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
        )
        .unwrap()
    }

    fn request(range: DateRange, force_refresh: bool) -> FetchRequest {
        FetchRequest {
            source: TransactionSource::Zoho,
            range,
            force_refresh,
        }
    }

    fn service(store: Arc<InMemoryStore>, feed: Arc<StubFeed>) -> CacheService {
        CacheService::new(store, feed, registry(""))
    }

    fn tx(day: u32, amount: f64, id: &str) -> Transaction {
        Transaction::from_draft(TransactionDraft {
            source: TransactionSource::Zoho,
            kind: TransactionKind::Income,
            date: NaiveDate::from_ymd_opt(2024, 3, day).unwrap(),
            amount,
            description: format!("payment {id}"),
            category: "Pagos de clientes".into(),
            upstream_id: Some(id.into()),
            counterparty: None,
        })
    }

    #[tokio::test]
    async fn miss_then_hit_serves_segment_count() {
        let store = Arc::new(InMemoryStore::new());
        let feed = StubFeed::body(fixture("zoho/clean.json"));
        let svc = service(store.clone(), feed.clone());

        let first = svc.fetch_transactions(request(march(), false)).await.unwrap();
        assert!(!first.cached);
        assert_eq!(first.transactions.len(), 5);
        assert!(first.raw_response.is_some());
        let report = first.store_report.unwrap();
        assert_eq!(report.segment_status, SegmentStatus::Complete);
        assert_eq!(report.submitted, 5);
        assert_eq!(report.stored, 5);

        let second = svc.fetch_transactions(request(march(), false)).await.unwrap();
        assert!(second.cached);
        assert!(second.raw_response.is_none());
        assert_eq!(feed.calls(), 1);

        let segments = store.list_segments(Some(TransactionSource::Zoho)).await.unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(second.transactions.len() as i64, segments[0].transaction_count);

        let metrics = store.recent_metrics(10).await.unwrap();
        let outcomes: Vec<_> = metrics.iter().map(|m| m.outcome).collect();
        assert_eq!(outcomes, vec![CacheOutcome::Hit, CacheOutcome::Miss]);
    }

    #[tokio::test]
    async fn sub_range_of_complete_segment_is_a_hit() {
        let store = Arc::new(InMemoryStore::new());
        let feed = StubFeed::body(fixture("zoho/clean.json"));
        let svc = service(store, feed.clone());
        svc.fetch_transactions(request(march(), false)).await.unwrap();

        let first_half = DateRange::new(
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
        )
        .unwrap();
        let check = svc.check_cache(TransactionSource::Zoho, first_half).await.unwrap();
        assert!(check.cached);
        // VP-1001, EX-1, CP-9
        assert_eq!(check.transactions.len(), 3);
        assert_eq!(feed.calls(), 1);
    }

    #[tokio::test]
    async fn identical_payload_twice_keeps_row_count() {
        let store = Arc::new(InMemoryStore::new());
        let feed = StubFeed::body(fixture("zoho/clean.json"));
        let svc = service(store.clone(), feed.clone());

        svc.fetch_transactions(request(march(), true)).await.unwrap();
        let before = store.transaction_count().await;
        svc.fetch_transactions(request(march(), true)).await.unwrap();
        assert_eq!(store.transaction_count().await, before);
        assert_eq!(feed.calls(), 2);
    }

    #[tokio::test]
    async fn stored_rows_are_positive_and_skip_excluded_vendor() {
        let store = Arc::new(InMemoryStore::new());
        let feed = StubFeed::body(fixture("zoho/clean.json"));
        let registry = registry("    excluded_vendors: [\"Papelería Central\"]\n");
        let svc = CacheService::new(store.clone(), feed, registry);

        let outcome = svc.fetch_transactions(request(march(), false)).await.unwrap();
        assert_eq!(outcome.skipped.excluded_vendor, 1);

        let rows = store
            .transactions_in_range(TransactionSource::Zoho, march())
            .await
            .unwrap();
        assert_eq!(rows.len(), 4);
        assert!(rows.iter().all(|t| t.amount > 0.0));
        assert!(rows
            .iter()
            .all(|t| !(t.kind == TransactionKind::Expense && t.description.contains("Papelería"))));
    }

    #[tokio::test]
    async fn malformed_body_degrades_without_storing() {
        let store = Arc::new(InMemoryStore::new());
        let raw = fixture("zoho/garbled.txt");
        let feed = StubFeed::body(raw.clone());
        let svc = service(store.clone(), feed);

        let outcome = svc.fetch_transactions(request(march(), false)).await.unwrap();
        assert!(outcome.error.is_some());
        assert!(outcome.transactions.is_empty());
        assert_eq!(outcome.raw_response.as_deref(), Some(raw.as_str()));
        assert_eq!(outcome.stage, Some(ParseStage::Degraded));
        assert!(store.list_segments(None).await.unwrap().is_empty());
        assert_eq!(store.transaction_count().await, 0);
    }

    #[tokio::test]
    async fn upstream_status_is_an_error_with_miss_metric() {
        let store = Arc::new(InMemoryStore::new());
        let feed = StubFeed::status(503, "maintenance");
        let svc = service(store.clone(), feed);

        let err = svc.fetch_transactions(request(march(), false)).await.unwrap_err();
        match err {
            SyncError::Upstream(upstream) => {
                assert_eq!(upstream.upstream_status(), Some(503));
                assert_eq!(upstream.raw_body(), Some("maintenance"));
            }
            other => panic!("unexpected error: {other}"),
        }
        let metrics = store.recent_metrics(10).await.unwrap();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].outcome, CacheOutcome::Miss);
        assert_eq!(metrics[0].transaction_count, 0);
    }

    #[tokio::test]
    async fn failed_batch_leaves_segment_processing() {
        let store = Arc::new(InMemoryStore::new().with_failing_batches([1]));
        let feed = StubFeed::body(fixture("zoho/clean.json"));
        let svc = CacheService::new(store.clone(), feed.clone(), registry("")).with_batch_size(2);

        let outcome = svc.fetch_transactions(request(march(), false)).await.unwrap();
        let report = outcome.store_report.unwrap();
        assert_eq!(report.batches_ok, 2);
        assert_eq!(report.batches_failed, 1);
        assert_eq!(report.segment_status, SegmentStatus::Processing);
        assert_eq!(report.stored, 3);
        // fresh data still returned
        assert_eq!(outcome.transactions.len(), 5);

        // processing segment does not serve reads
        let again = svc.fetch_transactions(request(march(), false)).await.unwrap();
        assert!(!again.cached);
        assert_eq!(feed.calls(), 2);
    }

    #[tokio::test]
    async fn partially_covered_range_fetches_live() {
        let store = Arc::new(InMemoryStore::new());
        let feed = StubFeed::body(fixture("zoho/clean.json"));
        let svc = service(store.clone(), feed.clone());

        let early = DateRange::new(
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 10).unwrap(),
        )
        .unwrap();
        svc.store_transactions_in_cache(TransactionSource::Zoho, early, &[tx(4, 10.0, "a")])
            .await
            .unwrap();

        let check = svc.check_cache(TransactionSource::Zoho, march()).await.unwrap();
        assert!(!check.cached);
        assert!(check.partial);

        let outcome = svc.fetch_transactions(request(march(), false)).await.unwrap();
        assert!(outcome.partial);
        assert!(!outcome.cached);
        assert_eq!(feed.calls(), 1);

        let metrics = store.recent_metrics(10).await.unwrap();
        assert!(metrics.iter().any(|m| m.outcome == CacheOutcome::Partial));
    }

    #[tokio::test]
    async fn duplicates_collapse_before_counting() {
        let store = Arc::new(InMemoryStore::new());
        let svc = service(store.clone(), StubFeed::body("{}"));

        let rows = vec![tx(2, 10.0, "a"), tx(3, 20.0, "b"), tx(2, 15.0, "a")];
        let report = svc
            .store_transactions_in_cache(TransactionSource::Zoho, march(), &rows)
            .await
            .unwrap();
        assert_eq!(report.submitted, 2);
        assert_eq!(report.stored, 2);

        let stored = store
            .transactions_in_range(TransactionSource::Zoho, march())
            .await
            .unwrap();
        assert_eq!(stored[0].amount, 15.0);
    }

    #[tokio::test]
    async fn disabled_and_unknown_sources_are_rejected() {
        let svc = service(Arc::new(InMemoryStore::new()), StubFeed::body("{}"));
        let err = svc
            .fetch_transactions(FetchRequest {
                source: TransactionSource::Stripe,
                range: march(),
                force_refresh: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::SourceDisabled(TransactionSource::Stripe)));

        let only_zoho = SourceRegistry::from_yaml_str(
            "sources:\n  - source: zoho\n    webhook_url: https://hooks.test/zoho\n",
        )
        .unwrap();
        let svc = CacheService::new(Arc::new(InMemoryStore::new()), StubFeed::body("{}"), only_zoho);
        let err = svc
            .fetch_transactions(FetchRequest {
                source: TransactionSource::Stripe,
                range: march(),
                force_refresh: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::SourceNotConfigured(_)));
    }

    #[tokio::test]
    async fn trailing_refresh_covers_enabled_sources() {
        let store = Arc::new(InMemoryStore::new());
        let feed = StubFeed::body(fixture("zoho/clean.json"));
        let svc = service(store.clone(), feed.clone());

        let today = NaiveDate::from_ymd_opt(2024, 3, 31).unwrap();
        let results = svc.refresh_trailing_window(31, today).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source, TransactionSource::Zoho);
        assert_eq!(results[0].range, march());
        assert_eq!(results[0].fetched, 5);
        assert!(results[0].error.is_none());

        let check = svc.check_cache(TransactionSource::Zoho, march()).await.unwrap();
        assert!(check.cached);
    }

    #[tokio::test]
    async fn sub_range_fetch_matches_following_hit() {
        let store = Arc::new(InMemoryStore::new());
        let feed = StubFeed::body(fixture("zoho/clean.json"));
        let svc = service(store.clone(), feed.clone());
        let first_half = DateRange::new(
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
        )
        .unwrap();

        let miss = svc.fetch_transactions(request(first_half, false)).await.unwrap();
        assert!(!miss.cached);
        // EX-3 and CP-10 fall after the 15th
        assert_eq!(miss.skipped.out_of_range, 2);
        assert!(miss.transactions.iter().all(|t| first_half.contains(t.date)));

        let hit = svc.fetch_transactions(request(first_half, false)).await.unwrap();
        assert!(hit.cached);
        assert_eq!(feed.calls(), 1);

        let mut fresh = miss.transactions.clone();
        fresh.sort_by(|a, b| (a.date, &a.external_id).cmp(&(b.date, &b.external_id)));
        assert_eq!(fresh, hit.transactions);
        assert_eq!(store.transaction_count().await, 3);
    }

    #[tokio::test]
    async fn live_fetch_reports_body_hash() {
        let raw = fixture("zoho/clean.json");
        let svc = service(Arc::new(InMemoryStore::new()), StubFeed::body(raw.clone()));

        let outcome = svc.fetch_transactions(request(march(), true)).await.unwrap();
        assert_eq!(outcome.raw_sha256, Some(RawBody::new(raw).sha256));

        let hit = svc.fetch_transactions(request(march(), false)).await.unwrap();
        assert!(hit.cached);
        assert!(hit.raw_sha256.is_none());
    }

    #[tokio::test]
    async fn oversized_refresh_window_is_clamped() {
        let svc = service(Arc::new(InMemoryStore::new()), StubFeed::body(fixture("zoho/clean.json")));
        let today = NaiveDate::from_ymd_opt(2024, 3, 31).unwrap();

        let results = svc.refresh_trailing_window(i64::MAX, today).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].range.end, today);
        assert_eq!(results[0].range.days(), MAX_REFRESH_WINDOW_DAYS);

        let results = svc.refresh_trailing_window(-4, today).await;
        assert_eq!(results[0].range.days(), 1);
    }
}
