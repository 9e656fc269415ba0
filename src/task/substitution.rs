//! Placeholder substitution for template text
//!
//! Replaces `{name}` tokens with caller-supplied values:
//! - in plain strings via [`substitute`]
//! - in arbitrarily nested JSON maps/sequences via [`substitute_value`]
//!
//! Unmapped placeholders are left untouched. Callers that need every
//! placeholder filled must validate the inputs beforehand.

use regex::{Captures, Regex};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::LazyLock;

static PLACEHOLDER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([^{}\s]+)\}").expect("placeholder regex is valid"));

/// Replace every mapped `{name}` in `input`.
///
/// The replacement is a single pass over the input, so replacement values
/// that themselves look like placeholders are never expanded again.
pub fn substitute(input: &str, values: &HashMap<String, String>) -> String {
    if values.is_empty() || !input.contains('{') {
        return input.to_string();
    }

    PLACEHOLDER_REGEX
        .replace_all(input, |caps: &Captures| match values.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Substitute inside a nested value, rebuilding maps and sequences.
///
/// Object keys are kept as-is; only string leaves are rewritten. Numbers,
/// booleans and nulls are copied through.
pub fn substitute_value(value: &Value, values: &HashMap<String, String>) -> Value {
    match value {
        Value::String(s) => Value::String(substitute(s, values)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| substitute_value(item, values))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_value(v, values)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Names of all placeholders in `input`, in first-seen order, deduplicated.
pub fn placeholders(input: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for cap in PLACEHOLDER_REGEX.captures_iter(input) {
        let name = cap[1].to_string();
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

/// Whether any `{name}` token remains in `input`.
pub fn has_placeholders(input: &str) -> bool {
    PLACEHOLDER_REGEX.is_match(input)
}
