use chrono::DateTime;
use serde_json::Value as JsonValue;
use txcache_core::{TransactionDraft, TransactionKind, TransactionSource};

use crate::repair::{extract_records, parse_body};
use crate::{
    admit, json_date, json_i64, json_str_any, NormalizeError, NormalizeRules, NormalizedBatch,
    SkipCounts, SourceNormalizer,
};

/// Balance transaction types that move money between our own accounts.
const TRANSFER_TYPES: &[&str] = &["payout", "transfer", "payout_cancel", "payout_failure"];
const FEE_TYPES: &[&str] = &["stripe_fee", "fee", "application_fee", "tax_fee"];

/// Normalizer for payment-processor balance transaction lists (`{"data": [...]}`).
///
/// Amounts arrive in minor units; the sign decides income vs expense.
#[derive(Debug, Clone, Default)]
pub struct StripeNormalizer {
    rules: NormalizeRules,
}

impl StripeNormalizer {
    pub fn new(rules: NormalizeRules) -> Self {
        Self { rules }
    }

    fn try_normalize(&self, raw: &str) -> Result<NormalizedBatch, NormalizeError> {
        let (body, stage) = parse_body(raw)?;
        let Some(data) = body.get("data") else {
            return Err(NormalizeError::UnexpectedShape("missing `data` list".into()));
        };
        let (records, field_stage) = extract_records("data", Some(data))?;

        let mut skipped = SkipCounts::default();
        let mut transactions = Vec::new();
        for record in &records {
            let Some(draft) = record_to_draft(record, &mut skipped) else {
                continue;
            };
            if let Some(tx) = admit(draft, &self.rules, &mut skipped) {
                transactions.push(tx);
            }
        }

        Ok(NormalizedBatch {
            source: TransactionSource::Stripe,
            transactions,
            stage: stage.max(field_stage),
            skipped,
            error: None,
        })
    }
}

fn record_to_draft(record: &JsonValue, skipped: &mut SkipCounts) -> Option<TransactionDraft> {
    let date = json_i64(record, &["created", "available_on"])
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .map(|ts| ts.date_naive())
        .or_else(|| json_date(record, &["date"]));
    let (Some(date), Some(minor_units)) = (date, json_i64(record, &["amount"])) else {
        skipped.malformed += 1;
        return None;
    };

    let kind_hint = json_str_any(record, &["type", "reporting_category"])
        .unwrap_or_default()
        .to_ascii_lowercase();
    if TRANSFER_TYPES.contains(&kind_hint.as_str()) {
        skipped.internal_transfer += 1;
        return None;
    }

    let kind = if minor_units < 0 {
        TransactionKind::Expense
    } else {
        TransactionKind::Income
    };
    let category = if FEE_TYPES.contains(&kind_hint.as_str()) {
        "Comisiones Stripe"
    } else if kind_hint == "refund" {
        "Reembolsos Stripe"
    } else if kind == TransactionKind::Income {
        "Ventas Stripe"
    } else {
        "Stripe"
    };
    let description = json_str_any(record, &["description"]).unwrap_or_else(|| format!("Stripe {kind_hint}"));

    Some(TransactionDraft {
        source: TransactionSource::Stripe,
        kind,
        date,
        amount: minor_units.unsigned_abs() as f64 / 100.0,
        description: description.clone(),
        category: category.to_string(),
        upstream_id: json_str_any(record, &["id"]),
        counterparty: json_str_any(record, &["customer_name", "customer"]).or(Some(description)),
    })
}

impl SourceNormalizer for StripeNormalizer {
    fn source(&self) -> TransactionSource {
        TransactionSource::Stripe
    }

    fn normalize(&self, raw: &str) -> NormalizedBatch {
        match self.try_normalize(raw) {
            Ok(batch) => batch,
            Err(err) => NormalizedBatch::degraded(TransactionSource::Stripe, &err),
        }
    }
}
