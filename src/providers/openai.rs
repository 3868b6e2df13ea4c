//! OpenAI-wire-compatible adapter.
//!
//! Handles any provider that speaks the OpenAI `/v1/chat/completions`
//! protocol — OpenAI itself, OpenRouter, Google's OpenAI-compatible endpoint,
//! and Groq. The request body is forwarded verbatim; no schema translation.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use futures_util::StreamExt as _;
use reqwest::Client;
use serde_json::Value;

use super::auth::AuthStrategy;
use super::{ProviderSuccess, SseStream};

pub struct OpenAIAdapter {
    /// Buffered requests — has the configured request timeout.
    client: Client,
    /// Streaming requests — no request-level timeout (body arrives incrementally).
    stream_client: Client,
    base_url: String,
}

impl OpenAIAdapter {
    pub fn new(base_url: String, timeout_ms: u64, api_key: Option<String>, extra_headers: HashMap<String, String>) -> Self {
        let strategy = match api_key {
            Some(key) => AuthStrategy::ApiKey { prefix: "Bearer ", key, extra_headers: extra_headers.into_iter().collect() },
            None => AuthStrategy::None,
        };
        let headers = strategy.prepare_headers();

        let client = Client::builder()
            .default_headers(headers.clone())
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .expect("failed to build reqwest client");

        let stream_client = Client::builder()
            .default_headers(headers)
            .build()
            .expect("failed to build streaming reqwest client");

        Self { client, stream_client, base_url }
    }

    pub async fn chat_completions(&self, body: Value) -> anyhow::Result<ProviderSuccess> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let response = self.client.post(&url).json(&body).send().await.with_context(|| format!("POST {url}"))?;

        let status = response.status();
        let headers = super::header_pairs(response.headers());
        let text = response.text().await.context("reading response body")?;

        if !status.is_success() {
            anyhow::bail!("backend returned HTTP {status}: {text}");
        }

        let value = serde_json::from_str(&text).with_context(|| format!("parsing backend response as JSON: {text}"))?;
        Ok(ProviderSuccess { status: status.as_u16(), headers, value })
    }

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

    pub async fn health_check(&self) -> anyhow::Result<()> {
        let url = format!("{}/v1/models", self.base_url);
        let response = self.client.get(&url).send().await.with_context(|| format!("GET {url}"))?;

        anyhow::ensure!(response.status().is_success(), "health check returned HTTP {}", response.status());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(server: &MockServer) -> OpenAIAdapter {
        OpenAIAdapter::new(server.uri(), 5_000, None, HashMap::new())
    }

    #[tokio::test]
    async fn chat_completions_returns_parsed_json_on_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "content": "hi" } }]
            })))
            .mount(&server)
            .await;

        let result = adapter(&server).chat_completions(json!({"model": "test", "messages": []})).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn chat_completions_errors_on_non_2xx_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let err = adapter(&server).chat_completions(json!({"model": "test", "messages": []})).await.unwrap_err();
        assert!(err.to_string().contains("429"));
    }

    #[tokio::test]
    async fn health_check_returns_ok_on_2xx() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"object": "list", "data": []})))
            .mount(&server)
            .await;

        assert!(adapter(&server).health_check().await.is_ok());
    }

    #[tokio::test]
    async fn health_check_errors_on_non_2xx() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).and(path("/v1/models")).respond_with(ResponseTemplate::new(503)).mount(&server).await;

        let err = adapter(&server).health_check().await.unwrap_err();
        assert!(err.to_string().contains("503"));
    }
}
