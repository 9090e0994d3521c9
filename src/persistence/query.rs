//! Minimal document query matcher shared by the strategies.
//!
//! A query is a JSON object. Each key is a field path (dots descend into
//! nested objects) and each value is either a literal (equality) or an
//! operator object: `$eq $ne $gt $gte $lt $lte $in $nin $exists`.

use chrono::{DateTime, FixedOffset};
use serde_json::{Map, Value};
use std::cmp::Ordering;

use crate::model::Record;

/// Query document. The empty query matches everything.
pub type Query = Map<String, Value>;

/// Looks up a dotted field path inside a record.
pub fn get_path<'a>(record: &'a Record, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = record.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

pub fn matches(record: &Record, query: &Query) -> bool {
    query
        .iter()
        .all(|(path, condition)| matches_condition(get_path(record, path), condition))
}

fn matches_condition(actual: Option<&Value>, condition: &Value) -> bool {
    match condition {
        Value::Object(ops) if !ops.is_empty() && ops.keys().all(|k| k.starts_with('$')) => ops
            .iter()
            .all(|(op, operand)| apply_operator(actual, op, operand)),
        literal => actual.is_some_and(|a| loosely_equal(a, literal)),
    }
}

fn apply_operator(actual: Option<&Value>, op: &str, operand: &Value) -> bool {
    match op {
        "$eq" => actual.is_some_and(|a| loosely_equal(a, operand)),
        "$ne" => !actual.is_some_and(|a| loosely_equal(a, operand)),
        "$gt" => compare(actual, operand) == Some(Ordering::Greater),
        "$gte" => matches!(compare(actual, operand), Some(Ordering::Greater | Ordering::Equal)),
        "$lt" => compare(actual, operand) == Some(Ordering::Less),
        "$lte" => matches!(compare(actual, operand), Some(Ordering::Less | Ordering::Equal)),
        "$in" => match (actual, operand) {
            (Some(a), Value::Array(options)) => options.iter().any(|o| loosely_equal(a, o)),
            _ => false,
        },
        "$nin" => match (actual, operand) {
            (Some(a), Value::Array(options)) => !options.iter().any(|o| loosely_equal(a, o)),
            (None, Value::Array(_)) => true,
            _ => false,
        },
        "$exists" => actual.is_some() == operand.as_bool().unwrap_or(true),
        _ => false,
    }
}

/// Equality that treats `1` and `1.0` as the same number.
fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Orders numbers numerically, RFC 3339 timestamps chronologically and other
/// strings lexically. Mixed types do not compare.
pub fn compare(actual: Option<&Value>, operand: &Value) -> Option<Ordering> {
    match (actual?, operand) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => match (parse_timestamp(x), parse_timestamp(y)) {
            (Some(tx), Some(ty)) => Some(tx.cmp(&ty)),
            _ => Some(x.cmp(y)),
        },
        _ => None,
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(s).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn query(value: Value) -> Query {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_equality_and_nested_paths() {
        let r = record(json!({"siret": "123", "adresse": {"codePostal": "75001"}, "effectif": 12}));

        assert!(matches(&r, &Query::new()));
        assert!(matches(&r, &query(json!({"siret": "123"}))));
        assert!(matches(&r, &query(json!({"adresse.codePostal": "75001"}))));
        assert!(matches(&r, &query(json!({"effectif": 12.0}))));
        assert!(!matches(&r, &query(json!({"siret": "999"}))));
        assert!(!matches(&r, &query(json!({"missing": "x"}))));
    }

    #[test]
    fn test_operators() {
        let r = record(json!({"value": 10, "status": "healthy"}));

        assert!(matches(&r, &query(json!({"value": {"$gte": 10, "$lt": 11}}))));
        assert!(!matches(&r, &query(json!({"value": {"$gt": 10}}))));
        assert!(matches(&r, &query(json!({"status": {"$in": ["healthy", "disabled"]}}))));
        assert!(matches(&r, &query(json!({"status": {"$nin": ["error"]}}))));
        assert!(matches(&r, &query(json!({"status": {"$ne": "error"}}))));
        assert!(matches(&r, &query(json!({"other": {"$exists": false}}))));
        assert!(!matches(&r, &query(json!({"value": {"$unknown": 1}}))));
    }

    #[test]
    fn test_timestamps_compare_chronologically() {
        // Lexically "...00Z" sorts after "...00.5Z"
        let r = record(json!({"timestamp": "2024-03-01T10:00:00Z"}));
        assert!(matches(&r, &query(json!({"timestamp": {"$lt": "2024-03-01T10:00:00.5Z"}}))));
        assert!(!matches(&r, &query(json!({"timestamp": {"$gte": "2024-03-02T00:00:00Z"}}))));
    }
}
