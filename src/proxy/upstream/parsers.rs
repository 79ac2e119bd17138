// Fallback extraction of tool calls the model wrote as plain text instead of
// emitting tool-use events: `[Called func_name with args: {...}]`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;

static CALL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\[Called\s+(\w+)\s+with\s+args:\s*").unwrap());

#[derive(Debug, Clone)]
pub struct TextToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

fn new_tool_call_id() -> String {
    // toolu_ + 24 hex chars, matching the id shape of real tool-use blocks.
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("toolu_{}", &hex[..24])
}

/// Find the closing `}` for the `{` at `start`, honoring strings and escapes.
fn matching_brace(text: &str, start: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    if start >= bytes.len() || bytes[start] != b'{' {
        return None;
    }

    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, &ch) in bytes.iter().enumerate().skip(start) {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            b'\\' if in_string => escape_next = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }

    None
}

/// Parse every bracket-form tool call out of `text`. Entries whose argument
/// JSON is malformed or incomplete are skipped.
pub fn parse_text_tool_calls(text: &str) -> Vec<TextToolCall> {
    if text.is_empty() || !text.contains("[Called") {
        return Vec::new();
    }

    let mut results = Vec::new();

    for caps in CALL_PATTERN.captures_iter(text) {
        let name = caps.get(1).unwrap().as_str().to_string();
        let match_end = caps.get(0).unwrap().end();

        let json_start = match text[match_end..].find('{') {
            Some(offset) => match_end + offset,
            None => continue,
        };
        let json_end = match matching_brace(text, json_start) {
            Some(pos) => pos,
            None => continue,
        };

        if let Ok(arguments) = serde_json::from_str::<Value>(&text[json_start..=json_end]) {
            results.push(TextToolCall {
                id: new_tool_call_id(),
                name,
                arguments,
            });
        }
    }

    results
}

/// Drop repeated calls with identical (name, arguments), keeping the first.
pub fn deduplicate_tool_calls(calls: Vec<TextToolCall>) -> Vec<TextToolCall> {
    let mut seen = HashSet::new();
    calls
        .into_iter()
        .filter(|call| {
            let key = format!(
                "{}-{}",
                call.name,
                serde_json::to_string(&call.arguments).unwrap_or_default()
            );
            seen.insert(key)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_call() {
        let calls = parse_text_tool_calls(r#"[Called get_weather with args: {"city": "Paris"}]"#);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "get_weather");
        assert_eq!(calls[0].arguments["city"], "Paris");
        assert!(calls[0].id.starts_with("toolu_"));
        assert_eq!(calls[0].id.len(), 30);
    }

    #[test]
    fn parses_multiple_calls_with_surrounding_text() {
        let text = r#"ok [Called foo with args: {"a": 1}] and [Called bar with args: {"b": 2}] done"#;
        let calls = parse_text_tool_calls(text);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "foo");
        assert_eq!(calls[1].name, "bar");
        assert_ne!(calls[0].id, calls[1].id);
    }

    #[test]
    fn nested_json_arguments() {
        let calls =
            parse_text_tool_calls(r#"[Called f with args: {"outer": {"inner": [1, 2]}}]"#);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments["outer"]["inner"][0], 1);
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_matching() {
        let calls = parse_text_tool_calls(r#"[Called f with args: {"text": "a } b"}]"#);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments["text"], "a } b");
    }

    #[test]
    fn invalid_json_is_skipped() {
        let text = r#"[Called bad with args: {oops}] [Called good with args: {"ok": true}]"#;
        let calls = parse_text_tool_calls(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "good");
    }

    #[test]
    fn plain_text_yields_nothing() {
        assert!(parse_text_tool_calls("").is_empty());
        assert!(parse_text_tool_calls("no calls here").is_empty());
    }

    #[test]
    fn dedup_keeps_first_occurrence_in_order() {
        let mk = |name: &str, v: i64| TextToolCall {
            id: new_tool_call_id(),
            name: name.to_string(),
            arguments: serde_json::json!({ "v": v }),
        };
        let calls = vec![mk("a", 1), mk("b", 2), mk("a", 1), mk("a", 3)];
        let deduped = deduplicate_tool_calls(calls);
        assert_eq!(deduped.len(), 3);
        assert_eq!(deduped[0].name, "a");
        assert_eq!(deduped[1].name, "b");
        assert_eq!(deduped[2].arguments["v"], 3);
    }

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_roundtrip_single_call(
            name in "[a-zA-Z][a-zA-Z0-9_]{0,20}",
            key in "[a-zA-Z]{1,10}",
            val in "[a-zA-Z0-9 ]{0,30}",
        ) {
            let input = format!(r#"[Called {} with args: {{"{}": "{}"}}]"#, name, key, val);
            let calls = parse_text_tool_calls(&input);
            prop_assert_eq!(calls.len(), 1);
            prop_assert_eq!(&calls[0].name, &name);
            prop_assert_eq!(calls[0].arguments[&key].as_str().unwrap(), val.as_str());
        }

        /// Dedup is idempotent.
        #[test]
        fn prop_dedup_idempotent(n in 1usize..10) {
            let calls: Vec<TextToolCall> = (0..n)
                .map(|i| TextToolCall {
                    id: format!("toolu_{:024x}", i),
                    name: "f".to_string(),
                    arguments: serde_json::json!({ "i": i % 3 }),
                })
                .collect();
            let once = deduplicate_tool_calls(calls);
            let names: Vec<String> = once.iter().map(|c| c.name.clone()).collect();
            let twice = deduplicate_tool_calls(once);
            prop_assert_eq!(names, twice.iter().map(|c| c.name.clone()).collect::<Vec<_>>());
        }
    }
}
