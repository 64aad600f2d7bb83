//! Response Reconstruction
//!
//! Turns the accumulated delta buffer of a finished stream into the final
//! result. For free-text sessions the buffer is the result. For structured
//! sessions the provider's output is frequently noisy — prose around the
//! object, smart quotes, trailing commas, truncated tails — so a recovery
//! ladder applies increasingly permissive strategies in order:
//!
//! 1. direct JSON parse;
//! 2. balanced-region scan: extract the first `{...}` whose braces balance,
//!    discarding leading/trailing noise;
//! 3. a normalization pass (smart quotes, control characters, whitespace
//!    runs, trailing commas) followed by re-parse;
//! 4. property salvage: rebuild a minimal object from the complete
//!    `"key": value` pairs that can still be found.
//!
//! The scans are small character state machines tracking nesting depth,
//! string state, and escape state — not regular expressions. If every rung
//! fails the result is a `Reconstruction` error carrying the raw buffer;
//! an empty object is never reported as success.

use serde_json::{Map, Value};

use crate::error::ChorusError;
use crate::frames::FinalResult;
use crate::session::OutputShape;

/// Produce the final result for a finished stream
///
/// # Errors
///
/// For `OutputShape::Structured`, returns `ChorusError::Reconstruction`
/// when the recovery ladder is exhausted. Free-text sessions never fail.
pub fn finalize(shape: OutputShape, buffer: &str) -> Result<FinalResult, ChorusError> {
    match shape {
        OutputShape::Text => Ok(FinalResult::Text(buffer.to_string())),
        OutputShape::Structured => recover_structured(buffer).map(FinalResult::Structured),
    }
}

/// Run the recovery ladder over an accumulated buffer
///
/// # Errors
///
/// Returns `ChorusError::Reconstruction` with the raw buffer when no rung
/// yields a JSON object.
pub fn recover_structured(buffer: &str) -> Result<Value, ChorusError> {
    let trimmed = buffer.trim();
    if trimmed.is_empty() {
        return Err(reconstruction_error("stream produced no content", buffer));
    }

    // Rung 1: the happy path
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }

    // Rung 2: balanced region amid leading/trailing noise
    if let Some(region) = extract_balanced_object(trimmed) {
        if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(region) {
            tracing::debug!("Recovered structured result from balanced region");
            return Ok(value);
        }
    }

    // Rung 3: normalize, then retry both of the above
    let normalized = normalize_jsonish(trimmed);
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(&normalized) {
        tracing::debug!("Recovered structured result after normalization");
        return Ok(value);
    }
    if let Some(region) = extract_balanced_object(&normalized) {
        if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(region) {
            tracing::debug!("Recovered structured result from normalized balanced region");
            return Ok(value);
        }
    }

    // Rung 4: rebuild a minimal object from surviving key/value pairs
    if let Some(value) = salvage_properties(&normalized) {
        tracing::debug!("Recovered structured result by property salvage");
        return Ok(value);
    }

    Err(reconstruction_error(
        "no strategy produced a JSON object",
        buffer,
    ))
}

fn reconstruction_error(reason: &str, raw: &str) -> ChorusError {
    ChorusError::Reconstruction {
        reason: reason.to_string(),
        raw: raw.to_string(),
    }
}

/// Extract the first balanced `{...}` region
///
/// Tracks brace depth, string state, and escape state so braces inside
/// string literals never count. Returns `None` if no opening brace is found
/// or the region never closes (a truncated object stays truncated).
fn extract_balanced_object(text: &str) -> Option<&str> {
    let start = find_object_start(text)?;

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Position of the first `{` outside any string literal
fn find_object_start(text: &str) -> Option<usize> {
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => return Some(i),
            _ => {}
        }
    }
    None
}

/// Clean up near-JSON text so a strict parser will accept it
///
/// Replaces typographic quotes with ASCII ones, strips control characters,
/// collapses whitespace runs outside string literals, and drops commas that
/// directly precede a closing bracket. String contents are left untouched.
fn normalize_jsonish(text: &str) -> String {
    // Typographic quotes first; they may themselves open or close strings.
    let text: String = text
        .chars()
        .map(|c| match c {
            '\u{201C}' | '\u{201D}' => '"',
            '\u{2018}' | '\u{2019}' => '\'',
            c => c,
        })
        .collect();

    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut pending_ws = false;

    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];

        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }

        if c.is_control() || c.is_whitespace() {
            pending_ws = true;
            i += 1;
            continue;
        }

        if c == ',' {
            // Trailing comma: swallow it when the next significant
            // character closes a container.
            let mut j = i + 1;
            while j < chars.len() && (chars[j].is_whitespace() || chars[j].is_control()) {
                j += 1;
            }
            if j < chars.len() && (chars[j] == '}' || chars[j] == ']') {
                i += 1;
                continue;
            }
        }

        if pending_ws && !out.is_empty() {
            out.push(' ');
        }
        pending_ws = false;

        out.push(c);
        if c == '"' {
            in_string = true;
        }
        i += 1;
    }

    out
}

/// Rebuild a minimal object from complete `"key": value` pairs
///
/// A pair only counts when its value is syntactically complete: strings
/// must close, containers must balance, and bare scalars must be followed
/// by a delimiter (`,`, `}`, `]`) — a number cut off by the end of the
/// buffer is indistinguishable from a truncated one and is rejected. This
/// keeps truncated objects like `{"a": 1` reconstruction errors instead of
/// fabricated successes. Returns `None` unless at least one pair survives.
fn salvage_properties(text: &str) -> Option<Value> {
    let chars: Vec<char> = text.chars().collect();
    let mut map = Map::new();
    let mut i = 0;

    while i < chars.len() {
        if chars[i] != '"' {
            i += 1;
            continue;
        }

        let Some((key, after_key)) = scan_string(&chars, i) else {
            i += 1;
            continue;
        };

        let mut j = after_key;
        while j < chars.len() && chars[j].is_whitespace() {
            j += 1;
        }
        if j >= chars.len() || chars[j] != ':' {
            // A plain string, not a key — skip past it
            i = after_key;
            continue;
        }
        j += 1;
        while j < chars.len() && chars[j].is_whitespace() {
            j += 1;
        }

        match scan_value(&chars, j) {
            Some((value, after_value)) => {
                map.entry(key).or_insert(value);
                i = after_value;
            }
            None => {
                i = after_key;
            }
        }
    }

    if map.is_empty() {
        None
    } else {
        Some(Value::Object(map))
    }
}

/// Scan a JSON string literal starting at `start` (which must be `"`)
///
/// Returns the decoded string and the index just past the closing quote.
fn scan_string(chars: &[char], start: usize) -> Option<(String, usize)> {
    debug_assert_eq!(chars[start], '"');
    let mut escaped = false;
    for (offset, &c) in chars[start + 1..].iter().enumerate() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '"' {
            let end = start + 1 + offset;
            let literal: String = chars[start..=end].iter().collect();
            let decoded = serde_json::from_str::<String>(&literal).ok()?;
            return Some((decoded, end + 1));
        }
    }
    None
}

/// Scan one complete JSON value starting at `start`
///
/// Returns the parsed value and the index just past it, or `None` when the
/// value is absent, malformed, or possibly truncated.
fn scan_value(chars: &[char], start: usize) -> Option<(Value, usize)> {
    let c = *chars.get(start)?;

    if c == '"' {
        let (s, end) = scan_string(chars, start)?;
        return Some((Value::String(s), end));
    }

    if c == '{' || c == '[' {
        return scan_container(chars, start);
    }

    // Bare scalar: number / true / false / null
    let mut end = start;
    while end < chars.len() && !chars[end].is_whitespace() && !matches!(chars[end], ',' | '}' | ']')
    {
        end += 1;
    }

    // A scalar running into the end of the buffer may be truncated
    let mut after = end;
    while after < chars.len() && chars[after].is_whitespace() {
        after += 1;
    }
    if after >= chars.len() {
        return None;
    }
    if !matches!(chars[after], ',' | '}' | ']') {
        return None;
    }

    let literal: String = chars[start..end].iter().collect();
    let value = serde_json::from_str::<Value>(&literal).ok()?;
    Some((value, end))
}

/// Scan a balanced `{...}` or `[...]` container
fn scan_container(chars: &[char], start: usize) -> Option<(Value, usize)> {
    let open = chars[start];
    let close = if open == '{' { '}' } else { ']' };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &c) in chars[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    let end = start + offset;
                    let literal: String = chars[start..=end].iter().collect();
                    let value = serde_json::from_str::<Value>(&literal).ok()?;
                    return Some((value, end + 1));
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_text_shape_passes_through() {
        let result = finalize(OutputShape::Text, "any old { text").unwrap();
        assert_eq!(result, FinalResult::Text("any old { text".into()));
    }

    #[test]
    fn test_direct_parse() {
        let value = recover_structured(r#"{"technicalSkills":["A","B"]}"#).unwrap();
        assert_eq!(value, json!({"technicalSkills": ["A", "B"]}));
    }

    #[test]
    fn test_balanced_region_amid_noise() {
        let buffer = r#"Sure! Here is the JSON you asked for:
{"skills": ["Rust", "Go"], "years": 3}
Let me know if you need anything else."#;
        let value = recover_structured(buffer).unwrap();
        assert_eq!(value, json!({"skills": ["Rust", "Go"], "years": 3}));
    }

    #[test]
    fn test_braces_inside_strings_do_not_confuse_the_scan() {
        let buffer = r#"note {"text": "use {braces} carefully", "n": 1} tail"#;
        let value = recover_structured(buffer).unwrap();
        assert_eq!(value, json!({"text": "use {braces} carefully", "n": 1}));
    }

    #[test]
    fn test_normalization_fixes_smart_quotes_and_trailing_commas() {
        let buffer = "{\u{201C}name\u{201D}: \u{201C}Ada\u{201D}, \"tags\": [\"x\", \"y\",], }";
        let value = recover_structured(buffer).unwrap();
        assert_eq!(value, json!({"name": "Ada", "tags": ["x", "y"]}));
    }

    #[test]
    fn test_normalization_strips_control_characters() {
        let buffer = "{\"a\":\u{1} 1,\u{7f} \"b\": 2}";
        let value = recover_structured(buffer).unwrap();
        assert_eq!(value, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn test_property_salvage_from_fragments() {
        let buffer = r#"model chatter "skills": ["Rust", "Go"], more chatter "years": 3} trailing"#;
        let value = recover_structured(buffer).unwrap();
        assert_eq!(value, json!({"skills": ["Rust", "Go"], "years": 3}));
    }

    #[test]
    fn test_truncated_object_is_an_error_not_empty_success() {
        let err = recover_structured(r#"{"a": 1"#).unwrap_err();
        match err {
            ChorusError::Reconstruction { raw, .. } => assert_eq!(raw, r#"{"a": 1"#),
            other => panic!("expected Reconstruction error, got {other}"),
        }
    }

    #[test]
    fn test_value_interrupted_by_junk_is_rejected() {
        // An end-of-stream token spliced into the value leaves no usable pair
        let err = recover_structured(r#"{"a": 1[DONE]"#).unwrap_err();
        assert!(matches!(err, ChorusError::Reconstruction { .. }));
    }

    #[test]
    fn test_empty_buffer_is_an_error() {
        assert!(matches!(
            recover_structured("   "),
            Err(ChorusError::Reconstruction { .. })
        ));
    }

    #[test]
    fn test_non_object_json_is_an_error() {
        // The declared shape promises an object; a bare array is not one
        assert!(matches!(
            recover_structured(r#"[1, 2, 3]"#),
            Err(ChorusError::Reconstruction { .. })
        ));
    }

    #[test]
    fn test_deltas_accumulated_across_chunk_boundaries() {
        // The provider may split the object anywhere, including inside an
        // escape or a string literal; accumulation plus the ladder must
        // always recover the same object.
        let original = json!({
            "technicalSkills": ["A", "B"],
            "summary": "knows {braces} and \"quotes\"",
        });
        let serialized = original.to_string();

        for fragments in [1, 2, 3, 7, serialized.len()] {
            let size = serialized.len().div_ceil(fragments);
            let mut buffer = String::new();
            let mut rest = serialized.as_str();
            while !rest.is_empty() {
                let mut cut = size.min(rest.len());
                while !rest.is_char_boundary(cut) {
                    cut += 1;
                }
                let (delta, tail) = rest.split_at(cut);
                buffer.push_str(delta);
                rest = tail;
            }

            let value = recover_structured(&buffer).unwrap();
            assert_eq!(value, original, "{fragments} fragments");
        }
    }

    #[test]
    fn test_end_to_end_chunk_sequence() {
        // The exact delivery from the start-request scenario: two deltas
        // split inside a string literal, then the end-of-stream marker.
        let mut buffer = String::new();
        buffer.push_str(r#"{"technicalSkills":["A"#);
        buffer.push_str(r#"","B"]}"#);

        let result = finalize(OutputShape::Structured, &buffer).unwrap();
        assert_eq!(
            result,
            FinalResult::Structured(json!({"technicalSkills": ["A", "B"]}))
        );
    }

    #[test]
    fn test_salvage_first_key_wins_on_duplicates() {
        let value = salvage_properties(r#""a": 1, junk "a": 2,"#).unwrap();
        assert_eq!(value, json!({"a": 1}));
    }

    #[test]
    fn test_salvage_rejects_scalar_at_end_of_buffer() {
        assert!(salvage_properties(r#""a": 12"#).is_none());
        assert!(salvage_properties(r#""a": tru"#).is_none());
        // With a delimiter the same pair is complete
        assert_eq!(
            salvage_properties(r#""a": 12,"#).unwrap(),
            json!({"a": 12})
        );
    }

    #[test]
    fn test_extract_balanced_object_basics() {
        assert_eq!(extract_balanced_object("x {\"a\": 1} y"), Some("{\"a\": 1}"));
        assert_eq!(extract_balanced_object("no braces here"), None);
        assert_eq!(extract_balanced_object("{\"a\": {\"b\": 2}"), None);
    }

    #[test]
    fn test_normalize_preserves_string_contents() {
        let normalized = normalize_jsonish("{\"a\":  \"two  spaces,\u{9}tab\"}");
        assert_eq!(normalized, "{\"a\": \"two  spaces,\u{9}tab\"}");
    }
}
