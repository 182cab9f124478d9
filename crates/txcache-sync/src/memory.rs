//! In-memory store for tests and database-less development runs.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};
use txcache_core::{
    CacheMetric, CacheSegment, DateRange, SegmentStatus, Transaction, TransactionSource,
};

use crate::store::{SegmentWrite, StoreError, TransactionStore};

#[derive(Debug, Default)]
struct MemoryState {
    transactions: BTreeMap<String, Transaction>,
    segments: Vec<CacheSegment>,
    metrics: Vec<CacheMetric>,
}

/// Data lives in a `RwLock`-protected map and is lost on drop.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<MemoryState>,
    failing_batches: HashSet<usize>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every write reject the batches at these zero-based positions.
    #[must_use]
    pub fn with_failing_batches(mut self, indices: impl IntoIterator<Item = usize>) -> Self {
        self.failing_batches = indices.into_iter().collect();
        self
    }

    pub async fn transaction_count(&self) -> usize {
        self.state.read().await.transactions.len()
    }
}

#[async_trait]
impl TransactionStore for InMemoryStore {
    async fn segments_overlapping(
        &self,
        source: TransactionSource,
        range: DateRange,
    ) -> Result<Vec<CacheSegment>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .segments
            .iter()
            .filter(|s| s.source == source && s.range().overlaps(&range))
            .cloned()
            .collect())
    }

    async fn list_segments(
        &self,
        source: Option<TransactionSource>,
    ) -> Result<Vec<CacheSegment>, StoreError> {
        let state = self.state.read().await;
        let mut out = state
            .segments
            .iter()
            .filter(|s| source.map_or(true, |wanted| s.source == wanted))
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|a, b| (a.source, a.start_date, a.end_date).cmp(&(b.source, b.start_date, b.end_date)));
        Ok(out)
    }

    async fn transactions_in_range(
        &self,
        source: TransactionSource,
        range: DateRange,
    ) -> Result<Vec<Transaction>, StoreError> {
        let state = self.state.read().await;
        let mut out = state
            .transactions
            .values()
            .filter(|t| t.source == source && range.contains(t.date))
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|a, b| (a.date, &a.external_id).cmp(&(b.date, &b.external_id)));
        Ok(out)
    }

    async fn count_in_range(
        &self,
        source: TransactionSource,
        range: DateRange,
    ) -> Result<i64, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .transactions
            .values()
            .filter(|t| t.source == source && range.contains(t.date))
            .count() as i64)
    }

    #[instrument(skip_all, fields(source = %source, range = %range, rows = transactions.len()))]
    async fn write_segment(
        &self,
        source: TransactionSource,
        range: DateRange,
        transactions: &[Transaction],
        claimed_count: i64,
        batch_size: usize,
    ) -> Result<SegmentWrite, StoreError> {
        let mut state = self.state.write().await;
        let existing = state
            .segments
            .iter()
            .position(|s| s.source == source && s.start_date == range.start && s.end_date == range.end);
        let segment_idx = match existing {
            Some(idx) => idx,
            None => {
                state.segments.push(CacheSegment {
                    source,
                    start_date: range.start,
                    end_date: range.end,
                    transaction_count: 0,
                    last_refreshed_at: Utc::now(),
                    status: SegmentStatus::Processing,
                });
                state.segments.len() - 1
            }
        };
        {
            let segment = &mut state.segments[segment_idx];
            segment.status = SegmentStatus::Processing;
            segment.transaction_count = claimed_count;
        }

        let mut batches_ok = 0usize;
        let mut batches_failed = 0usize;
        for (index, chunk) in transactions.chunks(batch_size.max(1)).enumerate() {
            if self.failing_batches.contains(&index) {
                warn!(batch = index, rows = chunk.len(), "batch upsert rejected");
                batches_failed += 1;
                continue;
            }
            for tx in chunk {
                state.transactions.insert(tx.external_id.clone(), tx.clone());
            }
            batches_ok += 1;
        }

        let segment = &mut state.segments[segment_idx];
        if batches_failed == 0 {
            segment.status = SegmentStatus::Complete;
            segment.last_refreshed_at = Utc::now();
        }
        debug!(batches_ok, batches_failed, status = segment.status.as_str(), "segment written");

        Ok(SegmentWrite {
            batches_ok,
            batches_failed,
            status: segment.status,
        })
    }

    async fn record_metric(&self, metric: &CacheMetric) -> Result<(), StoreError> {
        self.state.write().await.metrics.push(metric.clone());
        Ok(())
    }

    async fn recent_metrics(&self, limit: usize) -> Result<Vec<CacheMetric>, StoreError> {
        let state = self.state.read().await;
        Ok(state.metrics.iter().rev().take(limit).cloned().collect())
    }
}
