use std::collections::HashSet;

use serde_json::Value;
use tracing::debug;

const CALL_PREFIX: &str = "[Called ";
const ARGS_MARKER: &str = " with args: ";

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RecoveredToolCall {
    pub name: String,
    pub arguments: Value,
}

/// Some answers encode tool calls as bracketed text instead of tool-use
/// frames: `[Called <name> with args: {...}]`. Scan the assembled text and
/// lift them back into structured calls, deduplicated by (name, args).
pub(crate) fn recover_tool_calls(text: &str) -> Vec<RecoveredToolCall> {
    let mut calls = Vec::new();
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut search_from = 0usize;

    while let Some(relative) = text[search_from..].find(CALL_PREFIX) {
        let start = search_from + relative;
        search_from = start + CALL_PREFIX.len();

        let Some(close) = find_bracket_end(text, start) else {
            break;
        };
        let body = &text[start + 1..close];
        let Some(marker) = body.find(ARGS_MARKER) else {
            search_from = close + 1;
            continue;
        };
        let name = body["Called ".len()..marker].trim().to_string();
        if name.is_empty() {
            search_from = close + 1;
            continue;
        }
        let raw_args = body[marker + ARGS_MARKER.len()..].trim();
        let Some(arguments) = parse_lenient_json(raw_args) else {
            debug!(name = %name, "unrepairable tool call arguments, skipping");
            search_from = close + 1;
            continue;
        };
        let key = (name.clone(), arguments.to_string());
        if seen.insert(key) {
            calls.push(RecoveredToolCall { name, arguments });
        }
        search_from = close + 1;
    }
    calls
}

/// Matching `]` for the bracket at `start`, counting nested brackets and
/// skipping string literals and escapes.
fn find_bracket_end(text: &str, start: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, byte) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match byte {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'[' if !in_string => depth += 1,
            b']' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse JSON, repairing the sloppy output models actually produce: trailing
/// commas, unquoted keys, bareword string values.
pub(crate) fn parse_lenient_json(raw: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        return Some(value);
    }
    let repaired = repair_json(raw);
    serde_json::from_str::<Value>(&repaired).ok()
}

fn repair_json(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 16);
    let chars: Vec<char> = raw.chars().collect();
    let mut index = 0usize;
    // Track whether the next token is a key (after '{' or ',' inside an
    // object) or a value (after ':').
    let mut context: Vec<char> = Vec::new();
    let mut expecting_value = false;

    while index < chars.len() {
        let c = chars[index];
        match c {
            '"' => {
                // Copy the whole string literal verbatim.
                out.push(c);
                index += 1;
                let mut escaped = false;
                while index < chars.len() {
                    let c = chars[index];
                    out.push(c);
                    index += 1;
                    if escaped {
                        escaped = false;
                    } else if c == '\\' {
                        escaped = true;
                    } else if c == '"' {
                        break;
                    }
                }
                expecting_value = false;
            }
            '{' | '[' => {
                context.push(c);
                out.push(c);
                index += 1;
                expecting_value = c == '[';
            }
            '}' | ']' => {
                // Strip a trailing comma preceding the closer.
                while out.ends_with(char::is_whitespace) {
                    out.pop();
                }
                if out.ends_with(',') {
                    out.pop();
                }
                context.pop();
                out.push(c);
                index += 1;
                expecting_value = false;
            }
            ':' => {
                out.push(c);
                index += 1;
                expecting_value = true;
            }
            ',' => {
                out.push(c);
                index += 1;
                expecting_value = context.last() == Some(&'[');
            }
            c if c.is_whitespace() => {
                out.push(c);
                index += 1;
            }
            _ => {
                // Bare token: a key or value without quotes, or a number.
                let token_start = index;
                while index < chars.len()
                    && !matches!(chars[index], ':' | ',' | '}' | ']' | '{' | '[')
                    && !chars[index].is_whitespace()
                {
                    index += 1;
                }
                let token: String = chars[token_start..index].iter().collect();
                let is_key = !expecting_value && context.last() == Some(&'{');
                if is_key {
                    out.push('"');
                    out.push_str(&token);
                    out.push('"');
                } else if token == "true"
                    || token == "false"
                    || token == "null"
                    || token.parse::<f64>().is_ok()
                {
                    out.push_str(&token);
                } else {
                    out.push('"');
                    out.push_str(&token);
                    out.push('"');
                }
                expecting_value = false;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn recovers_well_formed_call() {
        let calls =
            recover_tool_calls("before [Called get_weather with args: {\"city\": \"Paris\"}] after");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "get_weather");
        assert_eq!(calls[0].arguments, json!({"city": "Paris"}));
    }

    #[test]
    fn nested_brackets_inside_strings_are_skipped() {
        let calls = recover_tool_calls(
            r#"[Called search with args: {"q": "array[0] and ]bracket["}]"#,
        );
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments["q"], "array[0] and ]bracket[");
    }

    #[test]
    fn repairs_trailing_commas_and_unquoted_keys() {
        let calls = recover_tool_calls("[Called lookup with args: {city: Paris, limit: 3,}]");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments, json!({"city": "Paris", "limit": 3}));
    }

    #[test]
    fn duplicate_calls_are_deduplicated() {
        let text = r#"[Called f with args: {"a": 1}] again [Called f with args: {"a": 1}] and [Called f with args: {"a": 2}]"#;
        let calls = recover_tool_calls(text);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].arguments, json!({"a": 1}));
        assert_eq!(calls[1].arguments, json!({"a": 2}));
    }

    #[test]
    fn unterminated_call_is_ignored() {
        let calls = recover_tool_calls("[Called broken with args: {\"a\": 1}");
        assert!(calls.is_empty());
    }

    #[test]
    fn bareword_values_are_quoted() {
        let value = parse_lenient_json("{mode: fast, level: high}").unwrap();
        assert_eq!(value, json!({"mode": "fast", "level": "high"}));
    }

    #[test]
    fn valid_json_passes_untouched() {
        let value = parse_lenient_json(r#"{"nested": {"list": [1, 2, 3]}, "ok": true}"#).unwrap();
        assert_eq!(value, json!({"nested": {"list": [1, 2, 3]}, "ok": true}));
    }
}
