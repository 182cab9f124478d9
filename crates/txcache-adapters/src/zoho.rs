use serde_json::Value as JsonValue;
use tracing::debug;
use txcache_core::{TransactionDraft, TransactionKind, TransactionSource};

use crate::repair::{extract_records, parse_body, ParseStage};
use crate::{
    admit, json_amount, json_date, json_str_any, NormalizeError, NormalizeRules, NormalizedBatch,
    SkipCounts, SourceNormalizer,
};

const DATE_KEYS: &[&str] = &["date", "payment_date", "expense_date"];
const AMOUNT_KEYS: &[&str] = &["amount", "total", "bcy_total", "amount_applied"];

/// The three record lists the books webhook returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Collaborators,
    Expenses,
    CustomerPayments,
}

impl Section {
    const ALL: [Section; 3] = [Section::Collaborators, Section::Expenses, Section::CustomerPayments];

    fn field(self) -> &'static str {
        match self {
            Section::Collaborators => "colaboradores",
            Section::Expenses => "expenses",
            Section::CustomerPayments => "payments",
        }
    }

    fn kind(self) -> TransactionKind {
        match self {
            Section::CustomerPayments => TransactionKind::Income,
            Section::Collaborators | Section::Expenses => TransactionKind::Expense,
        }
    }

    fn id_keys(self) -> &'static [&'static str] {
        match self {
            Section::Collaborators => &["payment_id", "vendorpayment_id", "id", "payment_number"],
            Section::Expenses => &["expense_id", "id", "reference_number"],
            Section::CustomerPayments => &["payment_id", "id", "payment_number"],
        }
    }

    fn counterparty_keys(self) -> &'static [&'static str] {
        match self {
            Section::Collaborators | Section::Expenses => &["vendor_name", "contact_name"],
            Section::CustomerPayments => &["customer_name", "contact_name"],
        }
    }

    fn category(self, record: &JsonValue) -> String {
        match self {
            Section::Collaborators => "Colaboradores".to_string(),
            Section::Expenses => json_str_any(record, &["account_name", "category", "expense_account_name"])
                .unwrap_or_else(|| "Gastos".to_string()),
            Section::CustomerPayments => "Pagos de clientes".to_string(),
        }
    }

    fn description(self, record: &JsonValue, counterparty: Option<&str>) -> String {
        let explicit = json_str_any(record, &["description", "notes", "reference_number", "invoice_numbers"]);
        explicit.unwrap_or_else(|| {
            let who = counterparty.unwrap_or("sin nombre");
            match self {
                Section::Collaborators => format!("Pago a {who}"),
                Section::Expenses => format!("Gasto {who}"),
                Section::CustomerPayments => format!("Pago de {who}"),
            }
        })
    }
}

/// Normalizer for the books system webhook (`colaboradores`, `expenses`, `payments`).
#[derive(Debug, Clone, Default)]
pub struct ZohoNormalizer {
    rules: NormalizeRules,
}

impl ZohoNormalizer {
    pub fn new(rules: NormalizeRules) -> Self {
        Self { rules }
    }

    fn try_normalize(&self, raw: &str) -> Result<NormalizedBatch, NormalizeError> {
        let (body, mut stage) = parse_body(raw)?;
        if Section::ALL.iter().all(|section| body.get(section.field()).is_none()) {
            return Err(NormalizeError::UnexpectedShape(
                "none of colaboradores, expenses, payments present".into(),
            ));
        }

        let mut skipped = SkipCounts::default();
        let mut transactions = Vec::new();
        for section in Section::ALL {
            let (records, field_stage) = extract_records(section.field(), body.get(section.field()))?;
            stage = stage.max(field_stage);
            debug!(field = section.field(), records = records.len(), ?field_stage, "decoded section");
            for record in &records {
                let Some(draft) = self.record_to_draft(section, record, &mut skipped) else {
                    continue;
                };
                if let Some(tx) = admit(draft, &self.rules, &mut skipped) {
                    transactions.push(tx);
                }
            }
        }

        Ok(NormalizedBatch {
            source: TransactionSource::Zoho,
            transactions,
            stage,
            skipped,
            error: None,
        })
    }

    fn record_to_draft(
        &self,
        section: Section,
        record: &JsonValue,
        skipped: &mut SkipCounts,
    ) -> Option<TransactionDraft> {
        let (Some(date), Some(amount)) = (json_date(record, DATE_KEYS), json_amount(record, AMOUNT_KEYS)) else {
            skipped.malformed += 1;
            return None;
        };
        let counterparty = json_str_any(record, section.counterparty_keys());

        if section == Section::Collaborators
            && !self.rules.is_collaborator_allowed(counterparty.as_deref().unwrap_or_default())
        {
            skipped.not_allowlisted += 1;
            return None;
        }

        Some(TransactionDraft {
            source: TransactionSource::Zoho,
            kind: section.kind(),
            date,
            amount,
            description: section.description(record, counterparty.as_deref()),
            category: section.category(record),
            upstream_id: json_str_any(record, section.id_keys()),
            counterparty,
        })
    }
}

impl SourceNormalizer for ZohoNormalizer {
    fn source(&self) -> TransactionSource {
        TransactionSource::Zoho
    }

    fn normalize(&self, raw: &str) -> NormalizedBatch {
        match self.try_normalize(raw) {
            Ok(batch) => batch,
            Err(err) => NormalizedBatch::degraded(TransactionSource::Zoho, &err),
        }
    }
}
