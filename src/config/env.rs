//! `${NAME}` placeholder interpolation for configuration documents.

use regex::{Captures, Regex};
use serde_json::Value;
use std::sync::LazyLock;

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid placeholder regex")
    });

/// Replaces placeholders in every string of `value`, recursively, using the
/// process environment.
///
/// Returns the names of variables that could not be resolved; their
/// placeholders are left in place.
pub fn interpolate(value: &mut Value) -> Vec<String> {
    interpolate_with(value, &|name| std::env::var(name).ok())
}

/// Same as [`interpolate`] with a custom variable lookup.
pub fn interpolate_with(value: &mut Value, lookup: &dyn Fn(&str) -> Option<String>) -> Vec<String> {
    let mut unresolved = Vec::new();
    walk(value, lookup, &mut unresolved);
    unresolved.sort();
    unresolved.dedup();
    unresolved
}

fn walk(value: &mut Value, lookup: &dyn Fn(&str) -> Option<String>, unresolved: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            if let Some(replaced) = interpolate_str(s, lookup, unresolved) {
                *s = replaced;
            }
        }
        Value::Array(items) => {
            for item in items {
                walk(item, lookup, unresolved);
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                walk(item, lookup, unresolved);
            }
        }
        _ => {}
    }
}

fn interpolate_str(
    input: &str,
    lookup: &dyn Fn(&str) -> Option<String>,
    unresolved: &mut Vec<String>,
) -> Option<String> {
    if !input.contains("${") {
        return None;
    }

    let replaced = PLACEHOLDER_RE.replace_all(input, |caps: &Captures<'_>| match lookup(&caps[1]) {
        Some(v) => v,
        None => {
            unresolved.push(caps[1].to_string());
            caps[0].to_string()
        }
    });
    Some(replaced.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lookup(name: &str) -> Option<String> {
        match name {
            "INSEE_TOKEN" => Some("secret".to_string()),
            "HOST" => Some("api.insee.fr".to_string()),
            _ => None,
        }
    }

    #[test]
    fn test_interpolates_nested_strings() {
        let mut doc = json!({
            "baseUrl": "https://${HOST}/entreprises/sirene/V3",
            "auth": {"type": "bearer", "credential": "${INSEE_TOKEN}"},
            "headers": ["x-${HOST}", 42]
        });

        let unresolved = interpolate_with(&mut doc, &lookup);

        assert!(unresolved.is_empty());
        assert_eq!(doc["baseUrl"], "https://api.insee.fr/entreprises/sirene/V3");
        assert_eq!(doc["auth"]["credential"], "secret");
        assert_eq!(doc["headers"][0], "x-api.insee.fr");
        assert_eq!(doc["headers"][1], 42);
    }

    #[test]
    fn test_unset_variable_is_left_literal() {
        let mut doc = json!({"credential": "${MISSING_VAR}", "other": "${MISSING_VAR}-${HOST}"});

        let unresolved = interpolate_with(&mut doc, &lookup);

        assert_eq!(unresolved, vec!["MISSING_VAR".to_string()]);
        assert_eq!(doc["credential"], "${MISSING_VAR}");
        assert_eq!(doc["other"], "${MISSING_VAR}-api.insee.fr");
    }

    #[test]
    fn test_reads_process_environment() {
        std::env::set_var("STAT_HARVESTER_ENV_TEST", "from-env");
        let mut doc = json!("${STAT_HARVESTER_ENV_TEST}");
        assert!(interpolate(&mut doc).is_empty());
        assert_eq!(doc, json!("from-env"));
    }
}
