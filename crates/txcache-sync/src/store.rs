//! Persistence contract for cached transactions, segments and metrics.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use txcache_core::{
    CacheMetric, CacheSegment, CoreError, DateRange, SegmentStatus, Transaction, TransactionSource,
};

pub const DEFAULT_BATCH_SIZE: usize = 50;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("stored row is invalid: {0}")]
    Corrupt(#[from] CoreError),
}

/// What happened while writing one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SegmentWrite {
    pub batches_ok: usize,
    pub batches_failed: usize,
    pub status: SegmentStatus,
}

#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Segments of `source` whose range intersects `range`, any status.
    async fn segments_overlapping(
        &self,
        source: TransactionSource,
        range: DateRange,
    ) -> Result<Vec<CacheSegment>, StoreError>;

    async fn list_segments(
        &self,
        source: Option<TransactionSource>,
    ) -> Result<Vec<CacheSegment>, StoreError>;

    /// Cached rows of `source` dated within `range`, ordered by date.
    async fn transactions_in_range(
        &self,
        source: TransactionSource,
        range: DateRange,
    ) -> Result<Vec<Transaction>, StoreError>;

    async fn count_in_range(
        &self,
        source: TransactionSource,
        range: DateRange,
    ) -> Result<i64, StoreError>;

    /// Marks the segment `processing` with `claimed_count`, upserts
    /// `transactions` by external id in sequential batches of `batch_size`,
    /// and flips the segment to `complete` only when no batch failed.
    async fn write_segment(
        &self,
        source: TransactionSource,
        range: DateRange,
        transactions: &[Transaction],
        claimed_count: i64,
        batch_size: usize,
    ) -> Result<SegmentWrite, StoreError>;

    async fn record_metric(&self, metric: &CacheMetric) -> Result<(), StoreError>;

    /// Newest first.
    async fn recent_metrics(&self, limit: usize) -> Result<Vec<CacheMetric>, StoreError>;
}
