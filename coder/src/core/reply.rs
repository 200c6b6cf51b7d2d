//! Post-processing of raw model replies.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[A-Za-z0-9_+.#-]*[ \t]*\r?\n(.*?)```").expect("fence regex is valid")
});

/// Strip Markdown code fences from a code reply.
///
/// When the reply contains several fenced blocks the longest one wins. Replies
/// without fences are returned trimmed.
pub fn strip_code_fences(reply: &str) -> String {
    let longest = FENCE_RE
        .captures_iter(reply)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str())
        .max_by_key(|block| block.len());
    match longest {
        Some(block) => block.trim_end().to_string(),
        None => reply.trim().to_string(),
    }
}

/// Parse a JSON reply: the whole text first, then the first fenced block.
///
/// Returns `None` when neither parses. No attempt is made to locate JSON by
/// scanning for braces in free text.
pub fn parse_json_reply(reply: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str(reply.trim()) {
        return Some(value);
    }
    FENCE_RE
        .captures_iter(reply)
        .filter_map(|caps| caps.get(1))
        .find_map(|block| serde_json::from_str(block.as_str().trim()).ok())
}

/// Extract the message from an `{"error": ...}` payload.
pub fn error_payload(value: &Value) -> Option<String> {
    let error = value.as_object()?.get("error")?;
    match error {
        Value::String(message) => Some(message.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strips_longest_fenced_block_and_language_tag() {
        let reply = "Here you go:\n```python\nprint('hi')\nprint('there')\n```\nand\n```\nx\n```";
        assert_eq!(strip_code_fences(reply), "print('hi')\nprint('there')");
        assert_eq!(strip_code_fences("  plain code \n"), "plain code");
    }

    #[test]
    fn parses_direct_and_fenced_json() {
        assert_eq!(parse_json_reply(" {\"a\": 1} "), Some(json!({"a": 1})));
        assert_eq!(
            parse_json_reply("Plan:\n```json\n{\"a\": {\"b\": \"}\"}}\n```"),
            Some(json!({"a": {"b": "}"}}))
        );
        assert_eq!(parse_json_reply("I think {\"a\": 1} works"), None);
    }

    #[test]
    fn detects_error_payloads() {
        assert_eq!(
            error_payload(&json!({"error": "rate limited"})),
            Some("rate limited".to_string())
        );
        assert_eq!(error_payload(&json!({"steps": []})), None);
        assert_eq!(error_payload(&json!({"error": null})), None);
    }
}
