//! Rule-driven per-field normalization.
//!
//! A [`DataTransformer`] applies an ordered list of [`TransformRule`]s to a
//! record, or to every element of a sequence. Each field is transformed in
//! isolation: a failure is logged and the field keeps its original value.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use regex::Regex;
use serde_json::{Number, Value};
use std::sync::LazyLock;
use tracing::warn;

use crate::error::TransformError;
use crate::model::{Record, RuleKind, TransformConfig, TransformRule};

/// Leading float literal, as read by a permissive number parser.
static FLOAT_PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[+-]?(?:\d+\.?\d*|\.\d+)(?:[eE][+-]?\d+)?").expect("valid float regex")
});

const TRUTHY: [&str; 4] = ["true", "1", "yes", "oui"];

#[derive(Debug, Clone, Default)]
pub struct DataTransformer {
    rules: Vec<TransformRule>,
}

impl DataTransformer {
    pub fn new(rules: Vec<TransformRule>) -> Self {
        Self { rules }
    }

    /// No rules when the block is absent or disabled.
    pub fn from_config(config: Option<&TransformConfig>) -> Self {
        match config {
            Some(c) if c.enabled => Self::new(c.rules.clone()),
            _ => Self::default(),
        }
    }

    pub fn rules(&self) -> &[TransformRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Transforms an object, or each object in an array. Other values are
    /// returned as is.
    pub fn apply(&self, data: Value) -> Value {
        match data {
            Value::Array(items) => Value::Array(items.into_iter().map(|v| self.apply(v)).collect()),
            Value::Object(mut record) => {
                self.transform_record(&mut record);
                Value::Object(record)
            }
            other => other,
        }
    }

    pub fn transform_records(&self, mut records: Vec<Record>) -> Vec<Record> {
        for record in &mut records {
            self.transform_record(record);
        }
        records
    }

    pub fn transform_record(&self, record: &mut Record) {
        for rule in &self.rules {
            let Some(current) = record.get(&rule.field) else {
                continue;
            };
            if is_falsy(current) {
                continue;
            }
            match apply_rule(&rule.kind, current) {
                Ok(value) => {
                    record.insert(rule.field.clone(), value);
                }
                Err(e) => warn!(
                    field = %rule.field,
                    error = %e,
                    "Transform failed, keeping original value"
                ),
            }
        }
    }
}

fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Applies one rule to one value.
pub fn apply_rule(kind: &RuleKind, value: &Value) -> Result<Value, TransformError> {
    match kind {
        RuleKind::Date { format } => {
            let date = parse_date(value)?;
            format_date(date, format.as_deref())
        }
        RuleKind::Enum { mapping } => Ok(mapping
            .get(&text_of(value))
            .cloned()
            .unwrap_or_else(|| value.clone())),
        RuleKind::Number => Ok(to_number(value).unwrap_or_else(|| value.clone())),
        RuleKind::Boolean => Ok(Value::Bool(to_boolean(value))),
        RuleKind::String => Ok(Value::String(text_of(value))),
        RuleKind::Array => Ok(to_array(value)),
    }
}

/// Text form of a scalar; JSON text for containers.
fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ============================================================================
// Dates
// ============================================================================

fn parse_date(value: &Value) -> Result<DateTime<Utc>, TransformError> {
    let invalid = || TransformError::InvalidDate {
        value: text_of(value),
    };

    match value {
        Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(invalid),
        Value::String(s) => parse_date_str(s.trim()).ok_or_else(invalid),
        _ => Err(invalid()),
    }
}

fn parse_date_str(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for pattern in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, pattern) {
            return Some(naive.and_utc());
        }
    }
    for pattern in ["%Y-%m-%d", "%d/%m/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(s, pattern) {
            return date.and_hms_opt(0, 0, 0).map(|d| d.and_utc());
        }
    }
    if s.chars().all(|c| c.is_ascii_digit()) && s.len() >= 9 {
        return s.parse::<i64>().ok().and_then(DateTime::from_timestamp_millis);
    }
    None
}

fn format_date(date: DateTime<Utc>, format: Option<&str>) -> Result<Value, TransformError> {
    match format {
        Some("YYYY-MM-DD") => Ok(Value::String(date.format("%Y-%m-%d").to_string())),
        Some("DD/MM/YYYY") => Ok(Value::String(date.format("%d/%m/%Y").to_string())),
        Some("timestamp") => Ok(Value::from(date.timestamp_millis())),
        None | Some("ISO") | Some("iso") => Ok(Value::String(
            date.to_rfc3339_opts(SecondsFormat::Millis, true),
        )),
        Some(other) => Err(TransformError::UnsupportedFormat(other.to_string())),
    }
}

// ============================================================================
// Scalars
// ============================================================================

fn to_number(value: &Value) -> Option<Value> {
    match value {
        Value::Number(_) => Some(value.clone()),
        Value::String(s) => {
            let literal = FLOAT_PREFIX_RE.find(s.trim_start())?.as_str();
            let parsed: f64 = literal.parse().ok()?;
            number_value(parsed)
        }
        _ => None,
    }
}

fn number_value(n: f64) -> Option<Value> {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        return Some(Value::from(n as i64));
    }
    Number::from_f64(n).map(Value::Number)
}

fn to_boolean(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(_) | Value::Number(_) => {
            let text = text_of(value);
            TRUTHY.iter().any(|t| t.eq_ignore_ascii_case(text.trim()))
        }
        _ => false,
    }
}

fn to_array(value: &Value) -> Value {
    match value {
        Value::Array(_) => value.clone(),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.starts_with('[') {
                if let Ok(parsed @ Value::Array(_)) = serde_json::from_str::<Value>(trimmed) {
                    return parsed;
                }
            }
            if trimmed.contains(',') {
                return Value::Array(
                    trimmed
                        .split(',')
                        .map(|part| Value::String(part.trim().to_string()))
                        .collect(),
                );
            }
            Value::Array(vec![value.clone()])
        }
        other => Value::Array(vec![other.clone()]),
    }
}
