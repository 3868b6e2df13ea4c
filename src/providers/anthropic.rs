//! Anthropic Messages API adapter.
//!
//! Translates between the OpenAI chat completions schema (used internally)
//! and Anthropic's [`/v1/messages`](https://docs.anthropic.com/en/api/messages)
//! API. Callers route requests as normal OpenAI-format JSON; this adapter
//! handles the schema differences transparently.
//!
//! | Concern | OpenAI | Anthropic |
//! |---|---|---|
//! | System prompt | First message with `role: "system"` | Top-level `system` field |
//! | Max tokens | Optional (`max_tokens`) | **Required** (`max_tokens`) |
//! | Finish reasons | `"stop"`, `"length"` | `"end_turn"`, `"max_tokens"` |
//! | Response shape | `choices[].message.content` | `content[].text` |
//! | Auth header | `Authorization: Bearer …` | `x-api-key: …` |

use std::time::Duration;

use anyhow::Context;
use reqwest::{header, Client};
use serde_json::{json, Value};

use super::ProviderSuccess;

/// Default max_tokens when the caller omits it. Required by Anthropic.
const DEFAULT_MAX_TOKENS: u64 = 8_192;

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicAdapter {
    client: Client,
    base_url: String,
}

impl AnthropicAdapter {
    pub fn new(base_url: String, timeout_ms: u64, api_key: String) -> Self {
        let mut headers = header::HeaderMap::new();

        headers.insert(
            "x-api-key",
            header::HeaderValue::from_str(&api_key).expect("Anthropic API key contains invalid header characters"),
        );
        headers.insert("anthropic-version", header::HeaderValue::from_static(ANTHROPIC_VERSION));

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .expect("failed to build reqwest client");

        Self { client, base_url }
    }

    pub async fn chat_completions(&self, request: Value) -> anyhow::Result<ProviderSuccess> {
        let anthropic_req = to_anthropic(request)?;
        let url = format!("{}/v1/messages", self.base_url);

        let response = self.client.post(&url).json(&anthropic_req).send().await.with_context(|| format!("POST {url}"))?;

        let status = response.status();
        let headers = super::header_pairs(response.headers());
        let text = response.text().await.context("reading Anthropic response body")?;

        if !status.is_success() {
            anyhow::bail!("backend returned HTTP {status}: {text}");
        }

        let body: Value = serde_json::from_str(&text).with_context(|| format!("parsing Anthropic response as JSON: {text}"))?;
        let value = from_anthropic(body)?;

        Ok(ProviderSuccess { status: status.as_u16(), headers, value })
    }

    /// Anthropic has no `/v1/models` endpoint; streaming forwards the same
    /// translated request to `/v1/messages` with `stream: true` set and relies
    /// on the gateway's synthesis path for non-streaming upstream providers
    /// that can't be proxied byte-for-byte as OpenAI SSE — so this adapter
    /// deliberately does not implement native streaming translation and the
    /// gateway always treats Anthropic as non-streaming upstream, synthesizing
    /// SSE from the buffered response.
    pub async fn health_check(&self) -> anyhow::Result<()> {
        let probe = json!({
            "model": "claude-3-5-haiku-20241022",
            "max_tokens": 1,
            "messages": [{ "role": "user", "content": "ping" }],
        });

        let url = format!("{}/v1/messages", self.base_url);
        let response = self.client.post(&url).json(&probe).send().await.with_context(|| format!("health check POST {url}"))?;

        anyhow::ensure!(response.status().is_success(), "Anthropic health check returned HTTP {}", response.status());
        Ok(())
    }
}

/// Flatten an OpenAI `content` field (plain string or multimodal block array)
/// to text. Used for contexts where Anthropic only accepts a plain string
/// (`system`, `tool_result`) — unlike user/assistant turns, which pass their
/// block array through to Anthropic unchanged.
fn content_as_text(content: &Value) -> Option<String> {
    match content {
        Value::String(s) => Some(s.clone()),
        Value::Array(blocks) => {
            let text: String = blocks.iter().filter_map(|b| b["text"].as_str()).collect::<Vec<_>>().join(" ");
            (!text.is_empty()).then_some(text)
        }
        _ => None,
    }
}

/// Convert an OpenAI chat completions request to the Anthropic Messages format.
pub(crate) fn to_anthropic(request: Value) -> anyhow::Result<Value> {
    let model = request["model"].as_str().context("`model` field is required")?.to_string();

    let max_tokens = request["max_tokens"].as_u64().unwrap_or(DEFAULT_MAX_TOKENS);

    let raw_messages = request["messages"].as_array().context("`messages` array is required")?;

    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<Value> = Vec::with_capacity(raw_messages.len());

    for msg in raw_messages {
        let role = msg["role"].as_str();
        if role == Some("system") {
            if let Some(text) = content_as_text(&msg["content"]) {
                system_parts.push(text);
            }
        } else if role == Some("tool") {
            // OpenAI tool-result turn -> Anthropic `tool_result` content block,
            // carried on a `user` message (Anthropic has no `tool` role).
            let tool_use_id = msg["tool_call_id"].as_str().unwrap_or_default();
            let content = content_as_text(&msg["content"]).unwrap_or_default();
            messages.push(json!({
                "role": "user",
                "content": [{ "type": "tool_result", "tool_use_id": tool_use_id, "content": content }],
            }));
        } else if let Some(tool_calls) = msg.get("tool_calls").and_then(Value::as_array).filter(|c| !c.is_empty()) {
            // OpenAI assistant tool-call turn -> Anthropic `tool_use` content blocks.
            let mut blocks: Vec<Value> = Vec::new();
            if let Some(text) = content_as_text(&msg["content"]).filter(|t| !t.is_empty()) {
                blocks.push(json!({ "type": "text", "text": text }));
            }
            for call in tool_calls {
                let input: Value = call["function"]["arguments"]
                    .as_str()
                    .and_then(|s| serde_json::from_str(s).ok())
                    .unwrap_or_else(|| json!({}));
                blocks.push(json!({
                    "type": "tool_use",
                    "id": call["id"].as_str().unwrap_or_default(),
                    "name": call["function"]["name"].as_str().unwrap_or_default(),
                    "input": input,
                }));
            }
            messages.push(json!({ "role": "assistant", "content": blocks }));
        } else {
            messages.push(msg.clone());
        }
    }

    let mut req = json!({
        "model": model,
        "max_tokens": max_tokens,
        "messages": messages,
    });

    if !system_parts.is_empty() {
        req["system"] = Value::String(system_parts.join("\n\n"));
    }

    if let Some(temp) = request["temperature"].as_f64() {
        req["temperature"] = json!(temp);
    }
    if let Some(stop) = request.get("stop") {
        req["stop_sequences"] = stop.clone();
    }
    if let Some(tools) = request.get("tools") {
        req["tools"] = tools.clone();
    }

    Ok(req)
}

/// Convert an Anthropic Messages API response to the OpenAI chat completions schema.
///
/// `content` blocks of type `text` are concatenated into the message body;
/// blocks of type `tool_use` are translated into OpenAI's `tool_calls` array
/// (Anthropic's structured `input` object becomes a JSON-encoded `arguments`
/// string, matching the OpenAI function-calling wire shape). A response can
/// legitimately contain only `tool_use` blocks and no text at all.
pub(crate) fn from_anthropic(resp: Value) -> anyhow::Result<Value> {
    let blocks = resp["content"].as_array().context("Anthropic response `content` is not an array")?;

    let text: String = blocks.iter().filter(|b| b["type"] == "text").filter_map(|b| b["text"].as_str()).collect();

    let tool_calls: Vec<Value> = blocks
        .iter()
        .filter(|b| b["type"] == "tool_use")
        .map(|b| {
            let arguments = serde_json::to_string(&b["input"]).unwrap_or_else(|_| "{}".to_string());
            json!({
                "id": b["id"].as_str().unwrap_or_default(),
                "type": "function",
                "function": { "name": b["name"].as_str().unwrap_or_default(), "arguments": arguments },
            })
        })
        .collect();

    if text.is_empty() && tool_calls.is_empty() {
        anyhow::bail!("no text or tool_use block in Anthropic response `content` array");
    }

    let model = resp["model"].as_str().unwrap_or("unknown");

    let finish_reason = match resp["stop_reason"].as_str().unwrap_or("stop") {
        "end_turn" => "stop",
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        other => other,
    };

    let input_tokens = resp["usage"]["input_tokens"].as_u64().unwrap_or(0);
    let output_tokens = resp["usage"]["output_tokens"].as_u64().unwrap_or(0);

    let mut message = json!({ "role": "assistant" });
    if tool_calls.is_empty() {
        message["content"] = json!(text);
    } else {
        message["content"] = Value::Null;
        message["tool_calls"] = json!(tool_calls);
    }

    Ok(json!({
        "id": resp["id"],
        "object": "chat.completion",
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason,
        }],
        "usage": {
            "prompt_tokens": input_tokens,
            "completion_tokens": output_tokens,
            "total_tokens": input_tokens + output_tokens,
        },
    }))
}
