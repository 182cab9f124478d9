//! Best-effort decoding of upstream bodies that are not quite JSON.
//!
//! The automation webhook sometimes serializes its arrays as escaped JSON
//! strings, and occasionally as a bare run of `{"key":n,"value":{...}}`
//! records. Decoding is attempted strictly first and each fallback is only
//! used when the stricter stage fails.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::NormalizeError;

/// How much repair was needed to decode a body, from least to most.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseStage {
    Strict,
    TrimmedEnvelope,
    EmbeddedJson,
    Unescaped,
    RegexRecovered,
    Degraded,
}

static KEYED_RECORD_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\{\s*"key"\s*:\s*"?\d+"?\s*,\s*"value"\s*:\s*"#)
        .expect("hardcoded regex should be valid")
});

/// Decodes the top-level body into a JSON object.
pub(crate) fn parse_body(raw: &str) -> Result<(JsonValue, ParseStage), NormalizeError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(NormalizeError::EmptyBody);
    }

    let strict_err = match serde_json::from_str::<JsonValue>(trimmed) {
        Ok(value) => return Ok((unwrap_envelope(value)?, ParseStage::Strict)),
        Err(err) => err,
    };

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            if let Ok(value) = serde_json::from_str::<JsonValue>(&trimmed[start..=end]) {
                return Ok((unwrap_envelope(value)?, ParseStage::TrimmedEnvelope));
            }
        }
    }

    Err(NormalizeError::InvalidJson(strict_err.to_string()))
}

fn unwrap_envelope(value: JsonValue) -> Result<JsonValue, NormalizeError> {
    match value {
        JsonValue::Object(_) => Ok(value),
        JsonValue::Array(items) => items
            .into_iter()
            .find(JsonValue::is_object)
            .ok_or_else(|| NormalizeError::UnexpectedShape("array without an object".into())),
        JsonValue::String(text) => match serde_json::from_str::<JsonValue>(&text) {
            Ok(inner @ JsonValue::Object(_)) => Ok(inner),
            _ => Err(NormalizeError::UnexpectedShape("string body is not an object".into())),
        },
        other => Err(NormalizeError::UnexpectedShape(format!(
            "top-level {} value",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// Pulls the record list out of one named field of the body.
pub(crate) fn extract_records(
    field_name: &str,
    field: Option<&JsonValue>,
) -> Result<(Vec<JsonValue>, ParseStage), NormalizeError> {
    match field {
        None | Some(JsonValue::Null) => Ok((Vec::new(), ParseStage::Strict)),
        Some(JsonValue::Array(items)) => Ok((items.iter().filter_map(unwrap_record).collect(), ParseStage::Strict)),
        Some(value @ JsonValue::Object(_)) => Ok((unwrap_record(value).into_iter().collect(), ParseStage::Strict)),
        Some(JsonValue::String(text)) => records_from_text(text).ok_or_else(|| NormalizeError::UnrecoverableField {
            field: field_name.to_string(),
        }),
        Some(other) => Err(NormalizeError::UnexpectedShape(format!(
            "field `{field_name}` is a {}",
            json_kind(other)
        ))),
    }
}

fn records_from_text(text: &str) -> Option<(Vec<JsonValue>, ParseStage)> {
    let text = text.trim();
    if text.is_empty() || text == "[]" {
        return Some((Vec::new(), ParseStage::EmbeddedJson));
    }
    if let Some(records) = parse_embedded(text) {
        return Some((records, ParseStage::EmbeddedJson));
    }

    let unescaped = text.replace("\\\"", "\"").replace("\\\\", "\\");
    if unescaped != text {
        if let Some(records) = parse_embedded(&unescaped) {
            return Some((records, ParseStage::Unescaped));
        }
    }

    let recovered = recover_keyed_records(&unescaped);
    if recovered.is_empty() {
        None
    } else {
        Some((recovered, ParseStage::RegexRecovered))
    }
}

fn parse_embedded(text: &str) -> Option<Vec<JsonValue>> {
    let parsed = serde_json::from_str::<JsonValue>(text)
        .or_else(|_| serde_json::from_str::<JsonValue>(&format!("[{text}]")))
        .ok()?;
    match parsed {
        JsonValue::Array(items) => Some(items.iter().filter_map(unwrap_record).collect()),
        value @ JsonValue::Object(_) => Some(unwrap_record(&value).into_iter().collect()),
        _ => None,
    }
}

/// Strips the `{"key": n, "value": {...}}` wrapper when present.
fn unwrap_record(value: &JsonValue) -> Option<JsonValue> {
    let object = value.as_object()?;
    if object.contains_key("key") {
        match object.get("value") {
            Some(inner @ JsonValue::Object(_)) => return Some(inner.clone()),
            Some(JsonValue::String(text)) => {
                return serde_json::from_str::<JsonValue>(text)
                    .ok()
                    .filter(JsonValue::is_object);
            }
            _ => {}
        }
    }
    Some(value.clone())
}

/// Scans free text for keyed records and decodes each `value` object on its own.
pub(crate) fn recover_keyed_records(text: &str) -> Vec<JsonValue> {
    let mut out = Vec::new();
    let mut cursor = 0usize;
    for prefix in KEYED_RECORD_PREFIX.find_iter(text) {
        if prefix.start() < cursor {
            continue;
        }
        let value_start = prefix.end();
        let Some(value_end) = balanced_object_end(text, value_start) else {
            continue;
        };
        if let Ok(value @ JsonValue::Object(_)) = serde_json::from_str::<JsonValue>(&text[value_start..value_end]) {
            out.push(value);
        }
        cursor = value_end;
    }
    out
}

/// Byte offset one past the `}` closing the object that opens at `start`.
fn balanced_object_end(text: &str, start: usize) -> Option<usize> {
    let tail = text.get(start..)?;
    if !tail.starts_with('{') {
        return None;
    }
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in tail.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(start + offset + 1);
                }
            }
            _ => {}
        }
    }
    None
}
