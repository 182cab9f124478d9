//! Postgres-backed store (`cached_transactions`, `cache_segments`, `cache_metrics`).

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Acquire, PgConnection, PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, instrument, warn};
use txcache_core::{
    CacheMetric, CacheSegment, DateRange, SegmentStatus, Transaction, TransactionSource,
};

use crate::store::{SegmentWrite, StoreError, TransactionStore};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn row_to_transaction(row: &PgRow) -> Result<Transaction, StoreError> {
    let source: String = row.try_get("source")?;
    let kind: String = row.try_get("type")?;
    Ok(Transaction {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        date: row.try_get("date")?,
        amount: row.try_get("amount")?,
        description: row.try_get("description")?,
        category: row.try_get("category")?,
        source: source.parse()?,
        kind: kind.parse()?,
    })
}

fn row_to_segment(row: &PgRow) -> Result<CacheSegment, StoreError> {
    let source: String = row.try_get("source")?;
    let status: String = row.try_get("status")?;
    Ok(CacheSegment {
        source: source.parse()?,
        start_date: row.try_get("start_date")?,
        end_date: row.try_get("end_date")?,
        transaction_count: row.try_get("transaction_count")?,
        last_refreshed_at: row.try_get("last_refreshed_at")?,
        status: status.parse()?,
    })
}

fn row_to_metric(row: &PgRow) -> Result<CacheMetric, StoreError> {
    let source: String = row.try_get("source")?;
    let outcome: String = row.try_get("outcome")?;
    let recorded_at: DateTime<Utc> = row.try_get("recorded_at")?;
    Ok(CacheMetric {
        source: source.parse()?,
        start_date: row.try_get::<NaiveDate, _>("start_date")?,
        end_date: row.try_get::<NaiveDate, _>("end_date")?,
        outcome: outcome.parse()?,
        duration_ms: row.try_get("duration_ms")?,
        transaction_count: row.try_get("transaction_count")?,
        recorded_at,
    })
}

async fn upsert_chunk(conn: &mut PgConnection, chunk: &[Transaction]) -> Result<u64, sqlx::Error> {
    let mut builder: QueryBuilder<'_, Postgres> = QueryBuilder::new(
        "INSERT INTO cached_transactions (id, external_id, date, amount, description, category, source, type) ",
    );
    builder.push_values(chunk, |mut row, tx| {
        row.push_bind(tx.id)
            .push_bind(tx.external_id.clone())
            .push_bind(tx.date)
            .push_bind(tx.amount)
            .push_bind(tx.description.clone())
            .push_bind(tx.category.clone())
            .push_bind(tx.source.as_str())
            .push_bind(tx.kind.as_str());
    });
    builder.push(
        r#"
        ON CONFLICT (external_id) DO UPDATE
           SET date = EXCLUDED.date,
               amount = EXCLUDED.amount,
               description = EXCLUDED.description,
               category = EXCLUDED.category,
               cached_at = NOW()
        "#,
    );
    let result = builder.build().execute(conn).await?;
    Ok(result.rows_affected())
}

#[async_trait]
impl TransactionStore for PgStore {
    async fn segments_overlapping(
        &self,
        source: TransactionSource,
        range: DateRange,
    ) -> Result<Vec<CacheSegment>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT source, start_date, end_date, transaction_count, last_refreshed_at, status
              FROM cache_segments
             WHERE source = $1
               AND start_date <= $3
               AND end_date >= $2
             ORDER BY start_date
            "#,
        )
        .bind(source.as_str())
        .bind(range.start)
        .bind(range.end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_segment).collect()
    }

    async fn list_segments(
        &self,
        source: Option<TransactionSource>,
    ) -> Result<Vec<CacheSegment>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT source, start_date, end_date, transaction_count, last_refreshed_at, status
              FROM cache_segments
             WHERE ($1::text IS NULL OR source = $1)
             ORDER BY source, start_date, end_date
            "#,
        )
        .bind(source.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_segment).collect()
    }

    async fn transactions_in_range(
        &self,
        source: TransactionSource,
        range: DateRange,
    ) -> Result<Vec<Transaction>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, external_id, date, amount, description, category, source, type
              FROM cached_transactions
             WHERE source = $1
               AND date BETWEEN $2 AND $3
             ORDER BY date, external_id
            "#,
        )
        .bind(source.as_str())
        .bind(range.start)
        .bind(range.end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_transaction).collect()
    }

    async fn count_in_range(
        &self,
        source: TransactionSource,
        range: DateRange,
    ) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
              FROM cached_transactions
             WHERE source = $1
               AND date BETWEEN $2 AND $3
            "#,
        )
        .bind(source.as_str())
        .bind(range.start)
        .bind(range.end)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Runs in one database transaction with a savepoint per batch, so the
    /// segment flip and its rows become visible together.
    #[instrument(skip_all, fields(source = %source, range = %range, rows = transactions.len()))]
    async fn write_segment(
        &self,
        source: TransactionSource,
        range: DateRange,
        transactions: &[Transaction],
        claimed_count: i64,
        batch_size: usize,
    ) -> Result<SegmentWrite, StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO cache_segments (source, start_date, end_date, transaction_count, last_refreshed_at, status)
            VALUES ($1, $2, $3, $4, NOW(), 'processing')
            ON CONFLICT (source, start_date, end_date) DO UPDATE
               SET transaction_count = EXCLUDED.transaction_count,
                   status = 'processing'
            "#,
        )
        .bind(source.as_str())
        .bind(range.start)
        .bind(range.end)
        .bind(claimed_count)
        .execute(&mut *tx)
        .await?;

        let mut batches_ok = 0usize;
        let mut batches_failed = 0usize;
        for (index, chunk) in transactions.chunks(batch_size.max(1)).enumerate() {
            let mut savepoint = (&mut tx).begin().await?;
            match upsert_chunk(&mut savepoint, chunk).await {
                Ok(affected) => {
                    savepoint.commit().await?;
                    batches_ok += 1;
                    debug!(batch = index, affected, "batch upserted");
                }
                Err(err) => {
                    savepoint.rollback().await?;
                    batches_failed += 1;
                    warn!(batch = index, rows = chunk.len(), error = %err, "batch upsert failed");
                }
            }
        }

        let status = if batches_failed == 0 {
            sqlx::query(
                r#"
                UPDATE cache_segments
                   SET status = 'complete',
                       last_refreshed_at = NOW()
                 WHERE source = $1
                   AND start_date = $2
                   AND end_date = $3
                "#,
            )
            .bind(source.as_str())
            .bind(range.start)
            .bind(range.end)
            .execute(&mut *tx)
            .await?;
            SegmentStatus::Complete
        } else {
            SegmentStatus::Processing
        };

        tx.commit().await?;
        Ok(SegmentWrite {
            batches_ok,
            batches_failed,
            status,
        })
    }

    async fn record_metric(&self, metric: &CacheMetric) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO cache_metrics (source, start_date, end_date, outcome, duration_ms, transaction_count, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(metric.source.as_str())
        .bind(metric.start_date)
        .bind(metric.end_date)
        .bind(metric.outcome.as_str())
        .bind(metric.duration_ms)
        .bind(metric.transaction_count)
        .bind(metric.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_metrics(&self, limit: usize) -> Result<Vec<CacheMetric>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT source, start_date, end_date, outcome, duration_ms, transaction_count, recorded_at
              FROM cache_metrics
             ORDER BY recorded_at DESC, id DESC
             LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_metric).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use txcache_core::{TransactionDraft, TransactionKind};

    /// Connects to `TXCACHE_TEST_DATABASE_URL`; tests skip when it is unset.
    async fn test_store() -> Option<PgStore> {
        let url = std::env::var("TXCACHE_TEST_DATABASE_URL").ok()?;
        let store = PgStore::connect(&url).await.expect("connect test database");
        store.migrate().await.expect("migrate test database");
        Some(store)
    }

    fn range(year: i32) -> DateRange {
        DateRange::new(
            NaiveDate::from_ymd_opt(year, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(year, 1, 31).unwrap(),
        )
        .unwrap()
    }

    fn tx(year: i32, day: u32, amount: f64, id: &str) -> Transaction {
        Transaction::from_draft(TransactionDraft {
            source: TransactionSource::Zoho,
            kind: TransactionKind::Income,
            date: NaiveDate::from_ymd_opt(year, 1, day).unwrap(),
            amount,
            description: format!("pg test {id}"),
            category: "Pagos de clientes".into(),
            upstream_id: Some(id.into()),
            counterparty: None,
        })
    }

    async fn reset(store: &PgStore, range: DateRange) {
        sqlx::query("DELETE FROM cached_transactions WHERE source = 'zoho' AND date BETWEEN $1 AND $2")
            .bind(range.start)
            .bind(range.end)
            .execute(store.pool())
            .await
            .unwrap();
        sqlx::query("DELETE FROM cache_segments WHERE source = 'zoho' AND start_date = $1 AND end_date = $2")
            .bind(range.start)
            .bind(range.end)
            .execute(store.pool())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rejected_batch_rolls_back_alone_and_keeps_segment_processing() {
        let Some(store) = test_store().await else {
            return;
        };
        let range = range(1991);
        reset(&store, range).await;

        // the middle batch violates the amount > 0 check
        let rows = vec![
            tx(1991, 2, 10.0, "pg-a"),
            tx(1991, 3, -5.0, "pg-b"),
            tx(1991, 4, 30.0, "pg-c"),
        ];
        let write = store
            .write_segment(TransactionSource::Zoho, range, &rows, 3, 1)
            .await
            .unwrap();
        assert_eq!(write.batches_ok, 2);
        assert_eq!(write.batches_failed, 1);
        assert_eq!(write.status, SegmentStatus::Processing);

        assert_eq!(store.count_in_range(TransactionSource::Zoho, range).await.unwrap(), 2);
        let segments = store
            .segments_overlapping(TransactionSource::Zoho, range)
            .await
            .unwrap();
        let segment = segments
            .iter()
            .find(|s| s.start_date == range.start && s.end_date == range.end)
            .unwrap();
        assert_eq!(segment.status, SegmentStatus::Processing);
        assert_eq!(segment.transaction_count, 3);
    }

    #[tokio::test]
    async fn clean_write_completes_and_reupserts_in_place() {
        let Some(store) = test_store().await else {
            return;
        };
        let range = range(1992);
        reset(&store, range).await;

        let rows = vec![tx(1992, 5, 10.0, "pg-d"), tx(1992, 6, 20.0, "pg-e")];
        for _ in 0..2 {
            let write = store
                .write_segment(TransactionSource::Zoho, range, &rows, 2, 50)
                .await
                .unwrap();
            assert_eq!(write.status, SegmentStatus::Complete);
        }
        assert_eq!(store.count_in_range(TransactionSource::Zoho, range).await.unwrap(), 2);
        let stored = store
            .transactions_in_range(TransactionSource::Zoho, range)
            .await
            .unwrap();
        assert_eq!(stored, rows);
    }
}
