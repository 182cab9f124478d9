//! Core domain model and identifier derivation for the transaction cache.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "txcache-core";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid date range: start {start} is after end {end}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },
    #[error("unknown transaction source `{0}`")]
    UnknownSource(String),
    #[error("unknown segment status `{0}`")]
    UnknownSegmentStatus(String),
    #[error("unknown transaction type `{0}`")]
    UnknownKind(String),
    #[error("unknown cache outcome `{0}`")]
    UnknownOutcome(String),
}

/// Upstream system a transaction was pulled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionSource {
    Zoho,
    Stripe,
}

impl TransactionSource {
    pub const ALL: [TransactionSource; 2] = [TransactionSource::Zoho, TransactionSource::Stripe];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionSource::Zoho => "zoho",
            TransactionSource::Stripe => "stripe",
        }
    }
}

impl fmt::Display for TransactionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionSource {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "zoho" => Ok(TransactionSource::Zoho),
            "stripe" => Ok(TransactionSource::Stripe),
            other => Err(CoreError::UnknownSource(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Income,
    Expense,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Income => "income",
            TransactionKind::Expense => "expense",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "income" => Ok(TransactionKind::Income),
            "expense" => Ok(TransactionKind::Expense),
            other => Err(CoreError::UnknownKind(other.to_string())),
        }
    }
}

/// Normalized handoff contract from source normalizers into the cache.
///
/// Carries the natural business identifiers the external id is derived from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionDraft {
    pub source: TransactionSource,
    pub kind: TransactionKind,
    pub date: NaiveDate,
    pub amount: f64,
    pub description: String,
    pub category: String,
    pub upstream_id: Option<String>,
    pub counterparty: Option<String>,
}

/// Canonical cached transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub external_id: String,
    pub date: NaiveDate,
    pub amount: f64,
    pub description: String,
    pub category: String,
    pub source: TransactionSource,
    #[serde(rename = "type")]
    pub kind: TransactionKind,
}

impl Transaction {
    pub fn from_draft(draft: TransactionDraft) -> Self {
        let external_id = derive_external_id(
            draft.source,
            draft.kind,
            draft.date,
            draft.upstream_id.as_deref(),
            draft.counterparty.as_deref(),
            draft.amount,
        );
        Self {
            id: transaction_uuid(&external_id),
            external_id,
            date: draft.date,
            amount: draft.amount,
            description: draft.description,
            category: draft.category,
            source: draft.source,
            kind: draft.kind,
        }
    }
}

/// Deterministic row id for an external id, so re-ingesting keeps the same primary key.
pub fn transaction_uuid(external_id: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, external_id.as_bytes())
}

/// Builds the dedup/upsert key for a transaction.
///
/// The key is `source-type-date-identifier`, lowercased. `identifier` is the
/// upstream id when there is one, otherwise the counterparty slug plus the
/// amount. Two distinct payments with the same counterparty, date and amount
/// therefore share a key and merge into one row.
pub fn derive_external_id(
    source: TransactionSource,
    kind: TransactionKind,
    date: NaiveDate,
    upstream_id: Option<&str>,
    counterparty: Option<&str>,
    amount: f64,
) -> String {
    let identifier = match upstream_id.map(str::trim).filter(|id| !id.is_empty()) {
        Some(id) => slugify(id),
        None => {
            let who = counterparty
                .map(slugify)
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "unknown".to_string());
            format!("{who}-{amount:.2}")
        }
    };
    format!(
        "{}-{}-{}-{}",
        source.as_str(),
        kind.as_str(),
        date.format("%Y-%m-%d"),
        identifier
    )
}

pub fn slugify(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '.' || c == '_' { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}

/// Inclusive calendar date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, CoreError> {
        if start > end {
            return Err(CoreError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentStatus {
    Processing,
    Complete,
}

impl SegmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentStatus::Processing => "processing",
            SegmentStatus::Complete => "complete",
        }
    }
}

impl FromStr for SegmentStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(SegmentStatus::Processing),
            "complete" => Ok(SegmentStatus::Complete),
            other => Err(CoreError::UnknownSegmentStatus(other.to_string())),
        }
    }
}

/// Claim that transactions of `source` within `range` are cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSegment {
    pub source: TransactionSource,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub transaction_count: i64,
    pub last_refreshed_at: DateTime<Utc>,
    pub status: SegmentStatus,
}

impl CacheSegment {
    pub fn range(&self) -> DateRange {
        DateRange {
            start: self.start_date,
            end: self.end_date,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == SegmentStatus::Complete
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheOutcome {
    Hit,
    Partial,
    Miss,
}

impl CacheOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheOutcome::Hit => "hit",
            CacheOutcome::Partial => "partial",
            CacheOutcome::Miss => "miss",
        }
    }
}

impl FromStr for CacheOutcome {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hit" => Ok(CacheOutcome::Hit),
            "partial" => Ok(CacheOutcome::Partial),
            "miss" => Ok(CacheOutcome::Miss),
            other => Err(CoreError::UnknownOutcome(other.to_string())),
        }
    }
}

/// Append-only observability row written per cache check or fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMetric {
    pub source: TransactionSource,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub outcome: CacheOutcome,
    pub duration_ms: i64,
    pub transaction_count: i64,
    pub recorded_at: DateTime<Utc>,
}
