//! Provider registry and unified dispatch (C6 Registry, C8 Provider).
//!
//! [`ProviderClient`] is an enum wrapping a concrete per-family adapter chosen
//! at construction time from configuration. All routing code interacts with
//! the same handful of methods; wire-protocol differences are fully
//! encapsulated in the adapter modules.

pub mod anthropic;
pub mod auth;
pub mod ollama;
pub mod openai;

pub use anthropic::AnthropicAdapter;
pub use ollama::OllamaAdapter;
pub use openai::OpenAIAdapter;

use std::collections::HashMap;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::Stream;
use serde_json::Value;

use crate::catalog::Family;
use crate::config::ProviderConfig;

/// A `Send`-able, heap-allocated SSE byte stream, already in OpenAI wire format.
pub type SseStream = Pin<Box<dyn Stream<Item = anyhow::Result<Bytes>> + Send>>;

/// Flatten a `reqwest` header map into owned `(name, value)` pairs, dropping
/// any value that isn't valid UTF-8. Adapters call this right after reading
/// `response.status()` so the gateway can copy the upstream headers onto the
/// response it returns instead of synthesizing its own.
pub(crate) fn header_pairs(headers: &reqwest::header::HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string())))
        .collect()
}

/// Error classification surfaced to the fallback loop, per the gateway's
/// error taxonomy: every failure is either retryable (try the next candidate)
/// or terminal (surface to the caller immediately).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Upstream rejected auth — retryable once via [`auth::AuthStrategy::handle_auth_failure`],
    /// terminal after that.
    Auth,
    /// Rate limited (HTTP 429). Retryable against the next candidate.
    RateLimited,
    /// Upstream 5xx or connection failure. Retryable against the next candidate.
    Unavailable,
    /// Malformed request body, unknown model, or other client-side fault. Terminal.
    InvalidRequest,
    /// Anything else unanticipated. Retryable, conservatively.
    Unknown,
}

/// A successful upstream response: the parsed body plus enough of the wire
/// envelope (status, headers) to let the gateway replay it faithfully instead
/// of stamping a synthetic `200` on everything.
pub struct ProviderSuccess {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub value: Value,
}

/// The result of a single provider dispatch attempt.
pub enum ProviderResponse {
    Success(ProviderSuccess),
    Error { kind: ErrorKind, retryable: bool, message: String },
}

impl ProviderResponse {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        let retryable = !matches!(kind, ErrorKind::InvalidRequest);
        Self::Error { kind, retryable, message: message.into() }
    }
}

/// Unified provider client — enum dispatch over concrete family adapters.
pub enum ProviderClient {
    /// OpenAI-wire-compatible passthrough: OpenAI itself, OpenRouter, Google,
    /// and Groq all speak this protocol.
    OpenAI(OpenAIAdapter),
    /// Anthropic Messages API with request/response translation.
    Anthropic(AnthropicAdapter),
    /// Ollama local inference server (OpenAI-compat endpoint, no auth).
    Ollama(OllamaAdapter),
}

impl ProviderClient {
    /// Build a provider client from config, resolving the API key from the
    /// environment variable named in `api_key_env`.
    pub fn new(cfg: &ProviderConfig) -> anyhow::Result<Self> {
        let base_url = cfg.base_url.trim_end_matches('/').to_string();
        let api_key = cfg.api_key();

        Ok(match cfg.family {
            Family::OpenAI | Family::OpenRouter | Family::Google | Family::Groq => {
                Self::OpenAI(OpenAIAdapter::new(base_url, cfg.timeout_ms, api_key, cfg.extra_headers.clone()))
            }
            Family::Ollama => Self::Ollama(OllamaAdapter::new(base_url, cfg.timeout_ms)),
            Family::Anthropic => {
                let key = api_key.ok_or_else(|| {
                    let env_var = cfg.api_key_env.as_deref().unwrap_or("<unset>");
                    anyhow::anyhow!("Anthropic provider requires an API key; set `{env_var}`")
                })?;
                Self::Anthropic(AnthropicAdapter::new(base_url, cfg.timeout_ms, key))
            }
        })
    }

    pub async fn chat_completions(&self, request: Value) -> ProviderResponse {
        let result = match self {
            Self::OpenAI(a) => a.chat_completions(request).await,
            Self::Anthropic(a) => a.chat_completions(request).await,
            Self::Ollama(a) => a.chat_completions(request).await,
        };
        match result {
            Ok(success) => ProviderResponse::Success(success),
            Err(e) => classify_error(&e),
        }
    }

    pub async fn chat_completions_stream(&self, request: Value) -> anyhow::Result<SseStream> {
        match self {
            Self::OpenAI(a) => a.chat_completions_stream(request).await,
            Self::Ollama(a) => a.chat_completions_stream(request).await,
            Self::Anthropic(a) => a.chat_completions_stream(request).await,
        }
    }

    pub async fn health_check(&self) -> anyhow::Result<()> {
        match self {
            Self::OpenAI(a) => a.health_check().await,
            Self::Anthropic(a) => a.health_check().await,
            Self::Ollama(a) => a.health_check().await,
        }
    }

    /// Release any adapter-held resources (currently a no-op — adapters hold
    /// only a cheaply-clonable `reqwest::Client` — kept for contract symmetry
    /// with providers that may need explicit teardown in the future).
    pub async fn cleanup(&self) {}
}

/// Maps an opaque `anyhow::Error` bubbled up from an adapter's HTTP call into
/// the gateway's error taxonomy by inspecting the message text the adapter
/// embeds (`"HTTP {status}: {body}"`). Adapters are kept free of taxonomy
/// knowledge so the same adapter code can be reused if the taxonomy changes.
///
/// Body content is checked before falling back to pure status-code
/// classification: some providers report billing/rate-limit/model-capacity
/// failures on a status code that wouldn't otherwise suggest it (e.g. a
/// generic `400` for an exhausted quota), and those need to be retried
/// against the next candidate rather than treated as a terminal client fault.
fn classify_error(err: &anyhow::Error) -> ProviderResponse {
    let msg = err.to_string();
    let lower = msg.to_lowercase();

    if lower.contains("billing") || lower.contains("insufficient_quota") || lower.contains("insufficient quota") {
        return ProviderResponse::error(ErrorKind::Unavailable, msg);
    }
    if lower.contains("rate limit") || lower.contains("rate_limit") {
        return ProviderResponse::error(ErrorKind::RateLimited, msg);
    }
    if lower.contains("model unavailable") || lower.contains("model_not_available") || lower.contains("overloaded") {
        return ProviderResponse::error(ErrorKind::Unavailable, msg);
    }

    if msg.contains("HTTP 401") || msg.contains("HTTP 403") {
        return ProviderResponse::error(ErrorKind::Auth, msg);
    }
    if msg.contains("HTTP 429") {
        return ProviderResponse::error(ErrorKind::RateLimited, msg);
    }
    if msg.contains("HTTP 4") {
        return ProviderResponse::error(ErrorKind::InvalidRequest, msg);
    }
    if msg.contains("HTTP 5") || lower.contains("connect") || lower.contains("timed out") {
        return ProviderResponse::error(ErrorKind::Unavailable, msg);
    }
    ProviderResponse::error(ErrorKind::Unknown, msg)
}

/// Registry of constructed provider clients, keyed by configured provider id.
///
/// Built once at startup from `[[providers]]` config entries. `register`
/// fails if the id is already present — providers are registered exactly
/// once. `by_priority` returns ids in descending priority order, ties broken
/// by registration order.
pub struct Registry {
    clients: HashMap<String, ProviderClient>,
    /// Registration order paired with configured priority, in insertion order.
    registered: Vec<(String, i64)>,
}

impl Registry {
    pub fn new() -> Self {
        Self { clients: HashMap::new(), registered: Vec::new() }
    }

    /// Register a provider under `id` with the given priority. Returns an
    /// error if `id` is already registered.
    pub fn register(&mut self, id: impl Into<String>, priority: i64, client: ProviderClient) -> anyhow::Result<()> {
        let id = id.into();
        if self.clients.contains_key(&id) {
            anyhow::bail!("provider id `{id}` is already registered");
        }
        self.registered.push((id.clone(), priority));
        self.clients.insert(id, client);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&ProviderClient> {
        self.clients.get(id)
    }

    pub fn all(&self) -> impl Iterator<Item = &String> {
        self.registered.iter().map(|(id, _)| id)
    }

    /// Registered ids sorted by descending priority; ties keep registration order.
    pub fn by_priority(&self) -> Vec<String> {
        let mut entries: Vec<(usize, &(String, i64))> = self.registered.iter().enumerate().collect();
        entries.sort_by(|(ia, a), (ib, b)| b.1.cmp(&a.1).then(ia.cmp(ib)));
        entries.into_iter().map(|(_, (id, _))| id.clone()).collect()
    }

    pub async fn health_check_all(&self) -> HashMap<String, bool> {
        let mut results = HashMap::new();
        for (id, _) in &self.registered {
            let ok = self.clients[id].health_check().await.is_ok();
            results.insert(id.clone(), ok);
        }
        results
    }

    pub async fn cleanup_all(&self) {
        for (id, _) in &self.registered {
            self.clients[id].cleanup().await;
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
