//! Ollama adapter.
//!
//! Ollama ships an OpenAI-compatible `/v1/chat/completions` endpoint, so this
//! adapter is intentionally thin — it delegates to the same HTTP path, but
//! handles the keyless-auth case transparently and uses Ollama's root `/`
//! endpoint for health checks rather than `/v1/models`.

use std::time::Duration;

use anyhow::Context;
use futures_util::StreamExt as _;
use reqwest::Client;
use serde_json::Value;

use super::{ProviderSuccess, SseStream};

/// Adapter for a locally-running Ollama instance.
pub struct OllamaAdapter {
    /// Buffered requests — has the configured request timeout.
    client: Client,
    /// Streaming requests — no request-level timeout.
    stream_client: Client,
    base_url: String,
}

impl OllamaAdapter {
    /// Build an Ollama adapter. No API key is required for typical local deployments.
    pub fn new(base_url: String, timeout_ms: u64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .expect("failed to build reqwest client");

        let stream_client = Client::builder().build().expect("failed to build streaming reqwest client");

        Self { client, stream_client, base_url }
    }

    /// Forward a chat completions request via Ollama's OpenAI-compat endpoint.
    pub async fn chat_completions(&self, body: Value) -> anyhow::Result<ProviderSuccess> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let response = self.client.post(&url).json(&body).send().await.with_context(|| format!("POST {url}"))?;

        let status = response.status();
        let headers = super::header_pairs(response.headers());
        let text = response.text().await.context("reading Ollama response body")?;

        if !status.is_success() {
            anyhow::bail!("backend returned HTTP {status}: {text}");
        }

        let value = serde_json::from_str(&text).with_context(|| format!("parsing Ollama response as JSON: {text}"))?;
        Ok(ProviderSuccess { status: status.as_u16(), headers, value })
    }

    /// Send `POST /v1/chat/completions` and return an [`SseStream`] for proxying.
    pub async fn chat_completions_stream(&self, body: Value) -> anyhow::Result<SseStream> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let response = self
            .stream_client
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {url} (streaming)"))?;
        let stream = response.bytes_stream().map(|r| r.map_err(anyhow::Error::from));
        Ok(Box::pin(stream))
    }

    /// Probe Ollama's root endpoint (`GET /`) — returns `"Ollama is running"` on success.
    pub async fn health_check(&self) -> anyhow::Result<()> {
        let url = format!("{}/", self.base_url);
        let response = self.client.get(&url).send().await.with_context(|| format!("GET {url}"))?;

        anyhow::ensure!(response.status().is_success(), "Ollama health check returned HTTP {}", response.status());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn chat_completions_returns_parsed_json_on_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": [{"message": {"content": "hi"}}]})))
            .mount(&server)
            .await;

        let adapter = OllamaAdapter::new(server.uri(), 5_000);
        let result = adapter.chat_completions(json!({"model": "llama3.1:8b", "messages": []})).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn health_check_probes_root_path() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).and(path("/")).respond_with(ResponseTemplate::new(200).set_body_string("Ollama is running")).mount(&server).await;

        let adapter = OllamaAdapter::new(server.uri(), 5_000);
        assert!(adapter.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn health_check_errors_on_non_2xx() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).and(path("/")).respond_with(ResponseTemplate::new(503)).mount(&server).await;

        let adapter = OllamaAdapter::new(server.uri(), 5_000);
        let err = adapter.health_check().await.unwrap_err();
        assert!(err.to_string().contains("503"));
    }
}
