//! Source normalizers: turn raw upstream webhook bodies into cached transactions.

use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use txcache_core::{Transaction, TransactionDraft, TransactionKind, TransactionSource};

mod repair;
mod stripe;
mod zoho;

pub use repair::ParseStage;
pub use stripe::StripeNormalizer;
pub use zoho::ZohoNormalizer;

pub const CRATE_NAME: &str = "txcache-adapters";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("upstream body is empty")]
    EmptyBody,
    #[error("upstream body is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("upstream body has unexpected shape: {0}")]
    UnexpectedShape(String),
    #[error("could not recover records from field `{field}`")]
    UnrecoverableField { field: String },
}

/// Filtering rules applied to every normalized record of a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizeRules {
    /// Vendors whose expenses are never cached.
    pub excluded_vendors: Vec<String>,
    /// When non-empty, only collaborator payments to these vendors are cached.
    pub collaborator_allowlist: Vec<String>,
    pub excluded_categories: Vec<String>,
}

impl Default for NormalizeRules {
    fn default() -> Self {
        Self {
            excluded_vendors: Vec::new(),
            collaborator_allowlist: Vec::new(),
            excluded_categories: vec!["Impuestos".to_string()],
        }
    }
}

fn contains_ignore_case(list: &[String], needle: &str) -> bool {
    let needle = needle.trim().to_lowercase();
    list.iter().any(|entry| entry.trim().to_lowercase() == needle)
}

impl NormalizeRules {
    pub fn is_vendor_excluded(&self, vendor: &str) -> bool {
        contains_ignore_case(&self.excluded_vendors, vendor)
    }

    pub fn is_collaborator_allowed(&self, vendor: &str) -> bool {
        self.collaborator_allowlist.is_empty() || contains_ignore_case(&self.collaborator_allowlist, vendor)
    }

    pub fn is_category_excluded(&self, category: &str) -> bool {
        contains_ignore_case(&self.excluded_categories, category)
    }
}

/// Per-reason counts of upstream records that did not become transactions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SkipCounts {
    pub malformed: usize,
    pub non_positive_amount: usize,
    pub excluded_vendor: usize,
    pub not_allowlisted: usize,
    pub excluded_category: usize,
    pub internal_transfer: usize,
    /// Dated outside the requested range.
    pub out_of_range: usize,
}

impl SkipCounts {
    pub fn total(&self) -> usize {
        self.malformed
            + self.non_positive_amount
            + self.excluded_vendor
            + self.not_allowlisted
            + self.excluded_category
            + self.internal_transfer
            + self.out_of_range
    }
}

/// Result of normalizing one upstream body.
///
/// A degraded batch carries no transactions and an `error`; callers surface it
/// to clients instead of failing the request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedBatch {
    pub source: TransactionSource,
    pub transactions: Vec<Transaction>,
    pub stage: ParseStage,
    pub skipped: SkipCounts,
    pub error: Option<String>,
}

impl NormalizedBatch {
    pub fn degraded(source: TransactionSource, error: &NormalizeError) -> Self {
        Self {
            source,
            transactions: Vec::new(),
            stage: ParseStage::Degraded,
            skipped: SkipCounts::default(),
            error: Some(error.to_string()),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.error.is_some()
    }
}

pub trait SourceNormalizer: Send + Sync {
    fn source(&self) -> TransactionSource;

    /// Never fails: unparseable bodies come back as a degraded batch.
    fn normalize(&self, raw: &str) -> NormalizedBatch;
}

pub fn normalizer_for_source(
    source: TransactionSource,
    rules: NormalizeRules,
) -> Box<dyn SourceNormalizer> {
    match source {
        TransactionSource::Zoho => Box::new(ZohoNormalizer::new(rules)),
        TransactionSource::Stripe => Box::new(StripeNormalizer::new(rules)),
    }
}

/// Applies the amount, vendor and category rules shared by every source.
pub(crate) fn admit(
    draft: TransactionDraft,
    rules: &NormalizeRules,
    skipped: &mut SkipCounts,
) -> Option<Transaction> {
    if !draft.amount.is_finite() || draft.amount <= 0.0 {
        skipped.non_positive_amount += 1;
        return None;
    }
    if draft.kind == TransactionKind::Expense {
        if let Some(vendor) = draft.counterparty.as_deref() {
            if rules.is_vendor_excluded(vendor) {
                skipped.excluded_vendor += 1;
                return None;
            }
        }
    }
    if rules.is_category_excluded(&draft.category) {
        skipped.excluded_category += 1;
        return None;
    }
    Some(Transaction::from_draft(draft))
}

/// First non-empty string (or number rendered as string) under any of `keys`.
pub(crate) fn json_str_any(value: &JsonValue, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match value.get(*key)? {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

pub(crate) fn json_amount(value: &JsonValue, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|key| match value.get(*key)? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => parse_amount_text(s),
        _ => None,
    })
}

pub(crate) fn json_i64(value: &JsonValue, keys: &[&str]) -> Option<i64> {
    keys.iter().find_map(|key| match value.get(*key)? {
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

pub(crate) fn json_date(value: &JsonValue, keys: &[&str]) -> Option<NaiveDate> {
    keys.iter().find_map(|key| match value.get(*key)? {
        JsonValue::String(s) => parse_date_text(s),
        _ => None,
    })
}

/// Accepts `1234.5`, `1,234.50`, `$ 1,234.50`, `1.234,50` and `1234,50`.
pub fn parse_amount_text(text: &str) -> Option<f64> {
    let cleaned: String = text
        .trim()
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | '-'))
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    // The separator that appears last is the decimal one.
    let normalized = match (cleaned.rfind('.'), cleaned.rfind(',')) {
        (Some(dot), Some(comma)) if comma > dot => cleaned.replace('.', "").replace(',', "."),
        (Some(_), _) => cleaned.replace(',', ""),
        (None, Some(_))
            if cleaned.matches(',').count() == 1
                && cleaned.rsplit(',').next().is_some_and(|tail| tail.len() != 3) =>
        {
            cleaned.replace(',', ".")
        }
        _ => cleaned.replace(',', ""),
    };
    normalized.parse().ok()
}

/// Accepts ISO dates, RFC 3339 timestamps and `dd/mm/yyyy`.
pub fn parse_date_text(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.date_naive());
    }
    if let Some(prefix) = text.get(..10) {
        if let Ok(date) = NaiveDate::parse_from_str(prefix, "%Y-%m-%d") {
            return Some(date);
        }
    }
    NaiveDate::parse_from_str(text, "%d/%m/%Y").ok()
}
