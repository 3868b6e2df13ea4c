//! Tool-id sanitization and thinking-token stripping (§4.7).
//!
//! Both are pure text transforms applied at the gateway boundary: tool ids
//! are rewritten before a request is forwarded upstream; thinking tokens are
//! stripped from upstream-produced assistant content before it reaches the
//! client. Neither touches user-supplied message content.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Rewrite every tool-call id in a chat completions request body to a
/// sanitized id drawn from `[A-Za-z0-9_-]`, keeping a single consistent
/// mapping within the request so a result block still references its
/// matching call. Scans both wire shapes: OpenAI's `tool_calls[].id` /
/// `tool_call_id`, and Anthropic's `content[]` blocks of type `tool_use`
/// (`id`) and `tool_result` (`tool_use_id`).
pub fn sanitize_tool_ids(mut body: Value) -> Value {
    let mut mapping: HashMap<String, String> = HashMap::new();
    let mut used: std::collections::HashSet<String> = std::collections::HashSet::new();

    if let Some(messages) = body.get_mut("messages").and_then(|m| m.as_array_mut()) {
        for msg in messages.iter_mut() {
            if let Some(tool_calls) = msg.get_mut("tool_calls").and_then(|t| t.as_array_mut()) {
                for call in tool_calls.iter_mut() {
                    if let Some(id) = call.get("id").and_then(|v| v.as_str()) {
                        let sanitized = resolve_id(id, &mut mapping, &mut used);
                        call["id"] = Value::String(sanitized);
                    }
                }
            }
            if let Some(id) = msg.get("tool_call_id").and_then(|v| v.as_str()) {
                let sanitized = resolve_id(id, &mut mapping, &mut used);
                msg["tool_call_id"] = Value::String(sanitized);
            }

            if let Some(content) = msg.get_mut("content").and_then(|c| c.as_array_mut()) {
                for block in content.iter_mut() {
                    let block_type = block.get("type").and_then(|t| t.as_str()).map(str::to_string);
                    match block_type.as_deref() {
                        Some("tool_use") => {
                            if let Some(id) = block.get("id").and_then(|v| v.as_str()) {
                                let sanitized = resolve_id(id, &mut mapping, &mut used);
                                block["id"] = Value::String(sanitized);
                            }
                        }
                        Some("tool_result") => {
                            if let Some(id) = block.get("tool_use_id").and_then(|v| v.as_str()) {
                                let sanitized = resolve_id(id, &mut mapping, &mut used);
                                block["tool_use_id"] = Value::String(sanitized);
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    body
}

fn resolve_id(original: &str, mapping: &mut HashMap<String, String>, used: &mut std::collections::HashSet<String>) -> String {
    if let Some(existing) = mapping.get(original) {
        return existing.clone();
    }

    let base = sanitize_one(original);
    let mut candidate = base.clone();
    let mut suffix = 1u32;
    while used.contains(&candidate) {
        candidate = format!("{base}_{suffix}");
        suffix += 1;
    }

    used.insert(candidate.clone());
    mapping.insert(original.to_string(), candidate.clone());
    candidate
}

fn sanitize_one(id: &str) -> String {
    let mut out: String = id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    if out.is_empty() {
        out.push('_');
    }
    out
}

static THINK_BLOCK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(think|thinking|thought|antthinking)>.*?</\1>").expect("thinking-tag block pattern is a compile-time constant")
});
static THINK_STANDALONE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)</?(?:think|thinking|thought|antthinking)>").expect("thinking-tag standalone pattern is a compile-time constant")
});
static FULLWIDTH_BLOCK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<\｜.*?begin.*?\｜>.*?<\｜.*?end.*?\｜>").expect("fullwidth block pattern is a compile-time constant")
});
static FULLWIDTH_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<\｜[^｜<>]*?\｜>").expect("fullwidth token pattern is a compile-time constant"));

/// Remove internal "thinking" markers from upstream-produced assistant
/// content. Case-insensitive, non-greedy.
pub fn strip_thinking_tokens(text: &str) -> String {
    let text = THINK_BLOCK_RE.replace_all(text, "");
    let text = THINK_STANDALONE_RE.replace_all(&text, "");
    let text = FULLWIDTH_BLOCK_RE.replace_all(&text, "");
    let text = FULLWIDTH_TOKEN_RE.replace_all(&text, "");
    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sanitizes_colons_to_underscores() {
        let body = json!({
            "messages": [
                { "role": "assistant", "tool_calls": [{ "id": "call:with:colons" }] },
                { "role": "tool", "tool_call_id": "call:with:colons" },
            ]
        });
        let out = sanitize_tool_ids(body);
        let messages = out["messages"].as_array().unwrap();
        let sanitized_call = messages[0]["tool_calls"][0]["id"].as_str().unwrap();
        let sanitized_result = messages[1]["tool_call_id"].as_str().unwrap();
        assert_eq!(sanitized_call, "call_with_colons");
        assert_eq!(sanitized_call, sanitized_result);
    }

    #[test]
    fn collisions_get_a_deterministic_suffix() {
        let body = json!({
            "messages": [
                { "role": "assistant", "tool_calls": [
                    { "id": "call:a" },
                    { "id": "call.a" },
                ]},
            ]
        });
        let out = sanitize_tool_ids(body);
        let calls = out["messages"][0]["tool_calls"].as_array().unwrap();
        let ids: Vec<&str> = calls.iter().map(|c| c["id"].as_str().unwrap()).collect();
        assert_eq!(ids[0], "call_a");
        assert_eq!(ids[1], "call_a_1");
    }

    #[test]
    fn sanitizes_anthropic_style_content_blocks() {
        let body = json!({
            "messages": [
                { "role": "assistant", "content": [{ "type": "tool_use", "id": "toolu:1", "name": "calc", "input": {} }] },
                { "role": "user", "content": [{ "type": "tool_result", "tool_use_id": "toolu:1", "content": "4" }] },
            ]
        });
        let out = sanitize_tool_ids(body);
        let call_id = out["messages"][0]["content"][0]["id"].as_str().unwrap();
        let result_id = out["messages"][1]["content"][0]["tool_use_id"].as_str().unwrap();
        assert_eq!(call_id, "toolu_1");
        assert_eq!(call_id, result_id);
    }

    #[test]
    fn already_clean_ids_pass_through_unchanged() {
        let body = json!({
            "messages": [{ "role": "assistant", "tool_calls": [{ "id": "already_clean-123" }] }]
        });
        let out = sanitize_tool_ids(body);
        assert_eq!(out["messages"][0]["tool_calls"][0]["id"], "already_clean-123");
    }

    #[test]
    fn strips_think_tags() {
        let input = "<think>internal musing</think>The answer is 4.";
        assert_eq!(strip_thinking_tokens(input), "The answer is 4.");
    }

    #[test]
    fn strips_thinking_tags_case_insensitively() {
        let input = "<THINKING>stuff</THINKING>Done.";
        assert_eq!(strip_thinking_tokens(input), "Done.");
    }

    #[test]
    fn strips_antthinking_tags() {
        let input = "<antthinking>private</antthinking>Result here.";
        assert_eq!(strip_thinking_tokens(input), "Result here.");
    }

    #[test]
    fn strips_standalone_unmatched_tags() {
        let input = "<think>dangling open tag with no close, then text";
        let stripped = strip_thinking_tokens(input);
        assert!(!stripped.contains("<think>"));
    }

    #[test]
    fn strips_fullwidth_token_blocks() {
        let input = "<｜begin▁of▁thinking｜>secret<｜end▁of▁thinking｜>Visible answer.";
        assert_eq!(strip_thinking_tokens(input), "Visible answer.");
    }

    #[test]
    fn leaves_plain_text_untouched() {
        let input = "Just a normal response with no markers.";
        assert_eq!(strip_thinking_tokens(input), input);
    }

    #[test]
    fn non_greedy_matching_preserves_content_between_separate_blocks() {
        let input = "<think>a</think>keep me<think>b</think>";
        assert_eq!(strip_thinking_tokens(input), "keep me");
    }
}
