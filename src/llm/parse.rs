// =============================================================================
// LLM response parsing — fence stripping, reasoning-block removal, repair
// =============================================================================
//
// Callers always request strict JSON, but models wrap it in markdown fences,
// leak reasoning blocks, or truncate mid-object. Parsing is therefore
// three-stage: strip, parse, bracket-repair. On total failure a sentinel
// object with `parse_failed: true` comes back so callers can treat the
// response as a no-op decision instead of an error.
// =============================================================================

use serde_json::{json, Value};
use tracing::debug;

/// Remove ```json fences and any `<think>...</think>` reasoning block.
pub fn strip_wrappers(text: &str) -> String {
    let mut text = text.trim();

    if let Some(start) = text.find("```json") {
        let rest = &text[start + 7..];
        text = rest.split("```").next().unwrap_or(rest);
    } else if let Some(start) = text.find("```") {
        let rest = &text[start + 3..];
        text = rest.split("```").next().unwrap_or(rest);
    }

    let text = if let Some(end) = text.rfind("</think>") {
        &text[end + 8..]
    } else {
        text
    };

    text.trim().to_string()
}

/// Close unbalanced braces on the longest prefix that still parses.
/// Handles responses truncated by output-token limits.
fn bracket_repair(text: &str) -> Option<Value> {
    for end in (1..=text.len()).rev() {
        if !text.is_char_boundary(end) {
            continue;
        }
        let candidate = &text[..end];
        let opens =
            candidate.matches('{').count() as i64 - candidate.matches('}').count() as i64;
        if opens <= 0 {
            continue;
        }
        let repaired = format!(
            "{}{}",
            candidate.trim_end_matches([',', '\n', ' ', '\t', '"']),
            "}".repeat(opens as usize)
        );
        if let Ok(value) = serde_json::from_str::<Value>(&repaired) {
            debug!(closed_braces = opens, "bracket repair succeeded");
            return Some(value);
        }
    }
    None
}

/// Parse a model response into JSON. Never fails: the fallback is a sentinel
/// `{"parse_failed": true}` the caller treats as a no-op.
pub fn parse_json_response(text: &str) -> Value {
    let cleaned = strip_wrappers(text);

    if let Ok(value) = serde_json::from_str::<Value>(&cleaned) {
        return value;
    }
    if let Some(value) = bracket_repair(&cleaned) {
        return value;
    }

    debug!(head = %cleaned.chars().take(120).collect::<String>(), "JSON parse failed");
    json!({ "parse_failed": true })
}

/// True when `value` is the parse-failure sentinel (or carries its marker).
pub fn parse_failed(value: &Value) -> bool {
    value.get("parse_failed").and_then(Value::as_bool).unwrap_or(false)
}

// --- Field extraction helpers used by every LLM caller -----------------------

pub fn str_field(value: &Value, key: &str) -> String {
    value.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
}

pub fn f64_field(value: &Value, key: &str, default: f64) -> f64 {
    value.get(key).and_then(Value::as_f64).unwrap_or(default)
}

pub fn i64_field(value: &Value, key: &str, default: i64) -> i64 {
    value.get(key).and_then(Value::as_i64).unwrap_or(default)
}

pub fn bool_field(value: &Value, key: &str) -> bool {
    value.get(key).and_then(Value::as_bool).unwrap_or(false)
}

pub fn string_list(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_json_parses() {
        let value = parse_json_response(r#"{"verdict": "confirm", "confidence": 0.8}"#);
        assert_eq!(str_field(&value, "verdict"), "confirm");
        assert!(!parse_failed(&value));
    }

    #[test]
    fn fenced_json_parses() {
        let value = parse_json_response("Here you go:\n```json\n{\"a\": 1}\n```\nDone.");
        assert_eq!(i64_field(&value, "a", 0), 1);
    }

    #[test]
    fn think_block_is_stripped() {
        let value =
            parse_json_response("<think>internal deliberation</think>{\"action\": \"HOLD\"}");
        assert_eq!(str_field(&value, "action"), "HOLD");
    }

    #[test]
    fn truncated_json_repaired() {
        let value = parse_json_response(r#"{"should_enter": true, "nested": {"x": 1,"#);
        assert!(!parse_failed(&value));
        assert!(bool_field(&value, "should_enter"));
    }

    #[test]
    fn garbage_yields_sentinel() {
        let value = parse_json_response("I'm sorry, I cannot answer that.");
        assert!(parse_failed(&value));
    }

    #[test]
    fn list_extraction() {
        let value = parse_json_response(r#"{"risks": ["a", "b"], "other": 1}"#);
        assert_eq!(string_list(&value, "risks"), vec!["a", "b"]);
        assert!(string_list(&value, "missing").is_empty());
    }
}
