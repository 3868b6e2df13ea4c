//! Configuration types for the gateway.
//!
//! Config is loaded once at startup from a TOML file (or built-in defaults if
//! no path is configured) and validated before the server opens its port.
//! Invalid configs are rejected with a clear error rather than silently
//! falling back.
//!
//! # Example
//! ```toml
//! [proxy]
//! port = 8080
//!
//! [routing.tiers.SIMPLE]
//! primary = "ollama/qwen2.5:1.5b"
//! fallbacks = ["openai/gpt-4o-mini"]
//!
//! [[providers]]
//! id = "openai"
//! family = "openai"
//! base_url = "https://api.openai.com"
//! api_key_env = "OPENAI_API_KEY"
//! priority = 10
//! ```

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::catalog::{Catalog, Family, Tier};

/// Top-level gateway configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub usage: UsageConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl Config {
    /// Load and validate config from a TOML file. A missing file is tolerated
    /// and falls back to [`Config::defaults`] — only a file that exists but
    /// fails to parse or validate is treated as an error.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::defaults()),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        let config: Self = toml::from_str(&content).context("parsing config TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Built-in zero-config defaults: a single local Ollama provider and a
    /// SIMPLE-only routing tier pointed at it. Enough to boot without a
    /// config file; production deployments are expected to supply one.
    pub fn defaults() -> Self {
        let mut config = Self::default();
        config.providers.push(ProviderConfig {
            id: "ollama".to_string(),
            family: Family::Ollama,
            base_url: "http://localhost:11434".to_string(),
            api_key_env: None,
            timeout_ms: 30_000,
            priority: 0,
            extra_headers: HashMap::new(),
        });
        config.routing.tiers.insert(
            Tier::Simple,
            TierRouteConfig { primary: "ollama/qwen2.5:1.5b".to_string(), fallbacks: vec![] },
        );
        config
    }

    /// Structural invariants this config can check on its own, without a
    /// catalog: unique provider ids, a sane fallback attempt bound.
    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.fallback.max_attempts >= 1, "`fallback.max_attempts` must be >= 1");

        let mut seen_ids = std::collections::HashSet::new();
        for provider in &self.providers {
            anyhow::ensure!(seen_ids.insert(provider.id.clone()), "duplicate provider id `{}`", provider.id);
        }

        Ok(())
    }

    /// Cross-check against a built catalog: every configured tier id must
    /// exist, and the configured last-resort model (if any) must exist.
    pub fn validate_against_catalog(&self, catalog: &Catalog) -> anyhow::Result<()> {
        for (tier, route) in &self.routing.tiers {
            anyhow::ensure!(
                catalog.contains(&catalog.resolve_alias(&route.primary)),
                "tier `{tier}` primary model `{}` is not in the catalog",
                route.primary
            );
            for fallback in &route.fallbacks {
                anyhow::ensure!(
                    catalog.contains(&catalog.resolve_alias(fallback)),
                    "tier `{tier}` fallback model `{fallback}` is not in the catalog"
                );
            }
        }

        if let Some(last_resort) = &self.fallback.last_resort_model {
            anyhow::ensure!(
                catalog.contains(&catalog.resolve_alias(last_resort)),
                "`fallback.last_resort_model` `{last_resort}` is not in the catalog"
            );
        }

        Ok(())
    }
}

/// Core proxy settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Port the gateway binds to (default: 8080). A single unified port
    /// serves the chat-completions endpoint, the model listing, health, and
    /// stats — there is no separate admin port.
    #[serde(default = "defaults::port")]
    pub port: u16,

    /// Per-request deadline across the entire fallback loop, in milliseconds
    /// (default: 180 000 = 3 minutes).
    #[serde(default = "defaults::request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self { port: defaults::port(), request_timeout_ms: defaults::request_timeout_ms() }
    }
}

/// Routing configuration: tier chains, scorer tuning, and post-assignment overrides.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct RoutingConfig {
    #[serde(default)]
    pub tiers: HashMap<Tier, TierRouteConfig>,
    #[serde(default)]
    pub scoring: ScoringConfig,
    /// Extra aliases merged on top of the built-in catalog alias table.
    #[serde(default)]
    pub aliases: HashMap<String, String>,
}

/// A tier's primary model id plus its ordered fallback list.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TierRouteConfig {
    pub primary: String,
    #[serde(default)]
    pub fallbacks: Vec<String>,
}

/// Scorer weights and thresholds. Every keyword-group field is optional;
/// omitted groups fall back to the reference keyword lists baked into
/// [`crate::scorer`].
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ScoringConfig {
    #[serde(default)]
    pub reasoning: Option<Vec<String>>,
    #[serde(default)]
    pub code: Option<Vec<String>>,
    #[serde(default)]
    pub multi_step: Option<Vec<String>>,
    #[serde(default)]
    pub agentic: Option<Vec<String>>,
    #[serde(default)]
    pub technical: Option<Vec<String>>,
    #[serde(default)]
    pub creative: Option<Vec<String>>,
    #[serde(default)]
    pub output: Option<Vec<String>>,
    #[serde(default)]
    pub simple: Option<Vec<String>>,
    #[serde(default)]
    pub domain: Option<Vec<String>>,

    #[serde(default)]
    pub confidence_threshold: Option<f64>,
    #[serde(default)]
    pub reasoning_confidence: Option<f64>,
    #[serde(default)]
    pub large_context_tokens: Option<u64>,
    #[serde(default)]
    pub structured_output_override: Option<bool>,
    #[serde(default)]
    pub logistic_k: Option<f64>,
    #[serde(default)]
    pub logistic_midpoint: Option<f64>,
}

/// Content-hash request deduplication settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DedupConfig {
    /// TTL for completed-response replay (default: 30 s).
    #[serde(default = "defaults::dedup_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self { ttl_secs: defaults::dedup_ttl_secs() }
    }
}

/// Session pin store settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Inactivity TTL before a pin is evicted (default: 3600 s = 1 hour).
    #[serde(default = "defaults::session_ttl_secs")]
    pub ttl_secs: u64,
    /// Maximum number of pinned sessions held at once (default: 10 000).
    #[serde(default = "defaults::session_capacity")]
    pub capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { ttl_secs: defaults::session_ttl_secs(), capacity: defaults::session_capacity() }
    }
}

/// SSE heartbeat cadence while waiting on an upstream response.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HeartbeatConfig {
    #[serde(default = "defaults::heartbeat_interval_ms")]
    pub interval_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { interval_ms: defaults::heartbeat_interval_ms() }
    }
}

/// Fallback-loop bounds.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FallbackConfig {
    /// Maximum number of upstream attempts per client request (default: 3).
    #[serde(default = "defaults::max_fallback_attempts")]
    pub max_attempts: usize,
    /// Guaranteed-available model tried if every configured candidate is
    /// missing from the catalog or fails the context-window filter.
    #[serde(default)]
    pub last_resort_model: Option<String>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self { max_attempts: defaults::max_fallback_attempts(), last_resort_model: None }
    }
}

/// Usage emitter sink settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UsageConfig {
    #[serde(default = "defaults::usage_dir")]
    pub directory: String,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self { directory: defaults::usage_dir() }
    }
}

/// A configured upstream provider.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    pub id: String,
    pub family: Family,
    /// Base URL, without a trailing `/v1` (adapters add the path).
    pub base_url: String,
    /// Environment variable name whose value is the API key. Leave unset for
    /// keyless local providers (e.g. Ollama).
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,
    /// Higher priority providers are tried first when multiple providers
    /// serve the same model id. Ties break by registration (config file) order.
    #[serde(default)]
    pub priority: i64,
    /// Extra headers attached to every outgoing request (e.g. OpenRouter's
    /// recommended `HTTP-Referer`/`X-Title`).
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
}

impl ProviderConfig {
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env.as_deref().and_then(|var| std::env::var(var).ok())
    }
}

mod defaults {
    pub fn port() -> u16 { 8402 }
    pub fn request_timeout_ms() -> u64 { 180_000 }
    pub fn dedup_ttl_secs() -> u64 { 30 }
    pub fn session_ttl_secs() -> u64 { 3_600 }
    pub fn session_capacity() -> usize { 10_000 }
    pub fn heartbeat_interval_ms() -> u64 { 2_000 }
    pub fn max_fallback_attempts() -> usize { 3 }
    pub fn timeout_ms() -> u64 { 30_000 }
    pub fn usage_dir() -> String { "./usage".to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> Config {
        toml::from_str(
            r#"
            [routing.tiers.SIMPLE]
            primary = "ollama/qwen2.5:1.5b"
            fallbacks = ["openai/gpt-4o-mini"]

            [routing.tiers.REASONING]
            primary = "anthropic/claude-4-opus"

            [[providers]]
            id = "ollama"
            family = "ollama"
            base_url = "http://localhost:11434"

            [[providers]]
            id = "openai"
            family = "openai"
            base_url = "https://api.openai.com"
            api_key_env = "OPENAI_API_KEY"
            priority = 5
            "#,
        )
        .expect("minimal config should parse")
    }

    #[test]
    fn parse_example_config() {
        let content = include_str!("../config.example.toml");
        let config: Config = toml::from_str(content).expect("example config should parse");
        config.validate().expect("example config should be valid");
        let catalog = Catalog::with_defaults();
        config.validate_against_catalog(&catalog).expect("example config should reference real catalog ids");
    }

    #[test]
    fn defaults_config_is_valid_and_catalog_consistent() {
        let config = Config::defaults();
        config.validate().unwrap();
        config.validate_against_catalog(&Catalog::with_defaults()).unwrap();
    }

    #[test]
    fn validation_rejects_zero_fallback_attempts() {
        let mut config = minimal_config();
        config.fallback.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_duplicate_provider_ids() {
        let mut config = minimal_config();
        let dup = config.providers[0].clone();
        config.providers.push(dup);
        assert!(config.validate().is_err());
    }

    #[test]
    fn catalog_validation_rejects_unknown_tier_model() {
        let mut config = minimal_config();
        config.routing.tiers.insert(
            Tier::Medium,
            TierRouteConfig { primary: "nonexistent/model".to_string(), fallbacks: vec![] },
        );
        let catalog = Catalog::with_defaults();
        assert!(config.validate_against_catalog(&catalog).is_err());
    }

    #[test]
    fn catalog_validation_accepts_known_models() {
        let config = minimal_config();
        let catalog = Catalog::with_defaults();
        assert!(config.validate_against_catalog(&catalog).is_ok());
    }

    #[test]
    fn proxy_defaults_apply_when_section_is_absent() {
        let config: Config = toml::from_str(
            r#"
            [[providers]]
            id = "ollama"
            family = "ollama"
            base_url = "http://localhost:11434"
            "#,
        )
        .unwrap();
        assert_eq!(config.proxy.port, 8402);
        assert_eq!(config.proxy.request_timeout_ms, 180_000);
    }

    #[test]
    fn provider_api_key_resolves_from_env_var() {
        let var = "GATEWAY_TEST_PROVIDER_KEY_RESOLVE";
        unsafe { std::env::set_var(var, "sk-test") };
        let provider = ProviderConfig {
            id: "x".into(),
            family: Family::OpenAI,
            base_url: "http://x".into(),
            api_key_env: Some(var.into()),
            timeout_ms: 5_000,
            priority: 0,
            extra_headers: HashMap::new(),
        };
        assert_eq!(provider.api_key().as_deref(), Some("sk-test"));
        unsafe { std::env::remove_var(var) };
    }

    #[test]
    fn load_falls_back_to_defaults_when_file_is_missing() {
        let path = Path::new("/nonexistent/path/that/should/never/exist/gateway.toml");
        let config = Config::load(path).expect("a missing config file should not be an error");
        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.providers[0].id, "ollama");
        assert!(config.routing.tiers.contains_key(&Tier::Simple));
    }

    #[test]
    fn defaults_config_boots_without_any_file() {
        let config = Config::defaults();
        assert_eq!(config.providers.len(), 1);
        assert!(config.routing.tiers.contains_key(&Tier::Simple));
    }
}
