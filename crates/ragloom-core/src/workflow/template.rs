//! Template marker resolution for step inputs and workflow outputs.
//!
//! Step inputs are arbitrary JSON trees whose strings may embed
//! `{{ path.to.value }}` markers. Resolution walks the tree:
//! - a string that is exactly one marker is replaced by the underlying
//!   value with its type intact (arrays stay arrays)
//! - markers inside a larger string are interpolated as display strings
//! - a missing path yields `null` for a whole-marker string and the empty
//!   string under interpolation
//! - a marker that does not parse as a path is left verbatim
//!
//! Resolution never fails and is idempotent: a tree without markers comes
//! back unchanged.

use std::collections::BTreeSet;

use serde_json::Value;

use super::expr::{self, Scope};

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Resolve every marker in a JSON tree against a scope.
///
/// Roots of successfully parsed markers are recorded in `referenced`,
/// whether or not the lookup found a value.
pub fn resolve_value(value: &Value, scope: &dyn Scope, referenced: &mut BTreeSet<String>) -> Value {
    match value {
        Value::String(s) => resolve_str(s, scope, referenced),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_value(item, scope, referenced))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, scope, referenced)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Resolve markers in a single string.
///
/// Returns the underlying value directly when the whole string is one
/// marker; otherwise returns an interpolated string.
pub fn resolve_str(template: &str, scope: &dyn Scope, referenced: &mut BTreeSet<String>) -> Value {
    if let Some(body) = single_marker(template) {
        return match expr::parse_path(body) {
            Ok(path) => {
                referenced.insert(path.root().to_string());
                path.resolve(scope).unwrap_or(Value::Null)
            }
            Err(error) => {
                tracing::debug!(marker = body, %error, "unparseable template marker left verbatim");
                Value::String(template.to_string())
            }
        };
    }

    let mut out = String::new();
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            // Unclosed marker: keep the tail as-is.
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let body = after[..end].trim();
        match expr::parse_path(body) {
            Ok(path) => {
                referenced.insert(path.root().to_string());
                if let Some(value) = path.resolve(scope) {
                    out.push_str(&value_to_string(&value));
                }
            }
            Err(error) => {
                tracing::debug!(marker = body, %error, "unparseable template marker left verbatim");
                out.push_str(&rest[start..start + 2 + end + 2]);
            }
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Value::String(out)
}

/// Collect the path roots of every marker in a string. Unparseable markers
/// contribute nothing.
pub fn marker_roots(text: &str) -> BTreeSet<String> {
    let mut roots = BTreeSet::new();
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else { break };
        if let Ok(path) = expr::parse_path(after[..end].trim()) {
            roots.insert(path.root().to_string());
        }
        rest = &after[end + 2..];
    }
    roots
}

/// Collect marker roots from every string in a JSON tree.
pub fn collect_value_roots(value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => out.extend(marker_roots(s)),
        Value::Array(items) => {
            for item in items {
                collect_value_roots(item, out);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_value_roots(item, out);
            }
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// If the whole trimmed string is exactly one marker, return its body.
fn single_marker(s: &str) -> Option<&str> {
    let body = s.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if body.contains("{{") || body.contains("}}") {
        return None;
    }
    Some(body.trim())
}

/// Convert a JSON value to a display string for interpolation.
pub(crate) fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // For objects/arrays, return compact JSON
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
