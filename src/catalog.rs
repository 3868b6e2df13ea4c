//! Model catalog (C1) — the static table of model metadata and alias resolution.
//!
//! The catalog is built once at startup and is read-mostly for the lifetime of
//! the process. It owns no network state; it is purely a lookup table plus the
//! small amount of logic needed to resolve a client-supplied model string to a
//! concrete [`Model`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Synthetic model id that means "classify the prompt and pick a concrete model".
///
/// Never forwarded to an upstream provider.
pub const AUTO_MODEL_ID: &str = "auto";

/// Cost/capability bucket assigned by the [`crate::scorer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Tier {
    Simple,
    Medium,
    Complex,
    Reasoning,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Simple => "SIMPLE",
            Self::Medium => "MEDIUM",
            Self::Complex => "COMPLEX",
            Self::Reasoning => "REASONING",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Tier {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SIMPLE" => Ok(Self::Simple),
            "MEDIUM" => Ok(Self::Medium),
            "COMPLEX" => Ok(Self::Complex),
            "REASONING" => Ok(Self::Reasoning),
            other => anyhow::bail!("unknown tier `{other}`"),
        }
    }
}

/// Which provider family serves a given model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    OpenAI,
    Anthropic,
    Google,
    Groq,
    OpenRouter,
    Ollama,
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::OpenAI => "openai",
            Self::Anthropic => "anthropic",
            Self::Google => "google",
            Self::Groq => "groq",
            Self::OpenRouter => "openrouter",
            Self::Ollama => "ollama",
        })
    }
}

/// Capability flags a model may advertise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub reasoning: bool,
    pub vision: bool,
    pub agentic: bool,
    /// Not part of the spec's Model record but needed by the Selector's
    /// tool-use reordering rule (§4.2 step 4).
    pub tool_use: bool,
}

/// An immutable catalog record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub display_name: String,
    pub family: Family,
    pub input_price_per_million: f64,
    pub output_price_per_million: f64,
    pub context_window: u32,
    pub max_output: u32,
    pub capabilities: Capabilities,
}

impl Model {
    fn new(
        id: &str,
        display_name: &str,
        family: Family,
        input_price_per_million: f64,
        output_price_per_million: f64,
        context_window: u32,
        max_output: u32,
        capabilities: Capabilities,
    ) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            family,
            input_price_per_million,
            output_price_per_million,
            context_window,
            max_output,
            capabilities,
        }
    }

    /// The synthetic `auto` entry. Zero price; must never be forwarded upstream.
    fn auto() -> Self {
        Self::new(
            AUTO_MODEL_ID,
            "Automatic routing",
            Family::OpenRouter,
            0.0,
            0.0,
            0,
            0,
            Capabilities::default(),
        )
    }
}

/// Static table of model metadata plus alias resolution.
///
/// Built once at startup via [`Catalog::with_defaults`] (optionally merged with
/// provider-supplied overrides); cheap to clone (wrap in `Arc` at the call site).
#[derive(Debug, Clone)]
pub struct Catalog {
    models: HashMap<String, Model>,
    aliases: HashMap<String, String>,
}

impl Catalog {
    /// Build the built-in catalog: ~30 models across 6 provider families plus
    /// the synthetic `auto` entry, and a small set of human-friendly aliases.
    pub fn with_defaults() -> Self {
        let mut models = HashMap::new();
        for m in builtin_models() {
            models.insert(m.id.clone(), m);
        }

        let aliases = builtin_aliases()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        Self { models, aliases }
    }

    /// Insert or replace a model record. Used when a provider's `listModels()`
    /// reports capability data the built-in table doesn't have.
    pub fn insert(&mut self, model: Model) {
        self.models.insert(model.id.clone(), model);
    }

    pub fn get(&self, id: &str) -> Option<&Model> {
        self.models.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.models.contains_key(id)
    }

    pub fn all(&self) -> impl Iterator<Item = &Model> {
        self.models.values()
    }

    /// All models except the synthetic `auto` entry, for `/v1/models` listing.
    pub fn listable(&self) -> Vec<&Model> {
        let mut v: Vec<&Model> = self.models.values().filter(|m| m.id != AUTO_MODEL_ID).collect();
        v.sort_by(|a, b| a.id.cmp(&b.id));
        v
    }

    /// Resolve a short alias or raw model id to a concrete catalog id.
    ///
    /// Rule: trim, lowercase, look up in the alias table; if absent, accept the
    /// input as-is. Idempotent: `resolve(resolve(x)) == resolve(x)`.
    pub fn resolve_alias(&self, input: &str) -> String {
        let key = input.trim().to_ascii_lowercase();
        self.aliases.get(&key).cloned().unwrap_or(key)
    }

    /// Merge a user-configured alias table on top of the built-in aliases.
    pub fn add_aliases(&mut self, extra: impl IntoIterator<Item = (String, String)>) {
        for (k, v) in extra {
            self.aliases.insert(k.trim().to_ascii_lowercase(), v);
        }
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn cap(reasoning: bool, vision: bool, agentic: bool, tool_use: bool) -> Capabilities {
    Capabilities { reasoning, vision, agentic, tool_use }
}

fn builtin_models() -> Vec<Model> {
    use Family::*;
    vec![
        Model::auto(),
        // ---- OpenAI ----
        Model::new("openai/gpt-4o", "GPT-4o", OpenAI, 2.50, 10.00, 128_000, 16_384, cap(false, true, true, true)),
        Model::new("openai/gpt-4o-mini", "GPT-4o mini", OpenAI, 0.15, 0.60, 128_000, 16_384, cap(false, true, true, true)),
        Model::new("openai/gpt-4.1", "GPT-4.1", OpenAI, 2.00, 8.00, 1_047_576, 32_768, cap(false, true, true, true)),
        Model::new("openai/gpt-4.1-mini", "GPT-4.1 mini", OpenAI, 0.40, 1.60, 1_047_576, 32_768, cap(false, true, true, true)),
        Model::new("openai/o1", "o1", OpenAI, 15.00, 60.00, 200_000, 100_000, cap(true, true, true, false)),
        Model::new("openai/o3-mini", "o3-mini", OpenAI, 1.10, 4.40, 200_000, 100_000, cap(true, false, true, false)),
        // ---- Anthropic ----
        Model::new("anthropic/claude-3-5-haiku", "Claude 3.5 Haiku", Anthropic, 0.80, 4.00, 200_000, 8_192, cap(false, true, true, true)),
        Model::new("anthropic/claude-3-5-sonnet", "Claude 3.5 Sonnet", Anthropic, 3.00, 15.00, 200_000, 8_192, cap(false, true, true, true)),
        Model::new("anthropic/claude-3-opus", "Claude 3 Opus", Anthropic, 15.00, 75.00, 200_000, 4_096, cap(true, true, true, true)),
        Model::new("anthropic/claude-4-sonnet", "Claude 4 Sonnet", Anthropic, 3.00, 15.00, 200_000, 16_384, cap(true, true, true, true)),
        Model::new("anthropic/claude-4-opus", "Claude 4 Opus", Anthropic, 15.00, 75.00, 200_000, 16_384, cap(true, true, true, true)),
        // ---- Google ----
        Model::new("google/gemini-1.5-flash", "Gemini 1.5 Flash", Google, 0.075, 0.30, 1_000_000, 8_192, cap(false, true, true, true)),
        Model::new("google/gemini-1.5-pro", "Gemini 1.5 Pro", Google, 1.25, 5.00, 2_000_000, 8_192, cap(false, true, true, true)),
        Model::new("google/gemini-2.0-flash", "Gemini 2.0 Flash", Google, 0.10, 0.40, 1_000_000, 8_192, cap(false, true, true, true)),
        Model::new("google/gemini-2.0-pro", "Gemini 2.0 Pro", Google, 1.25, 5.00, 2_000_000, 8_192, cap(true, true, true, true)),
        // ---- Groq (fast inference, OpenAI-compatible) ----
        Model::new("groq/llama-3.1-8b-instant", "Llama 3.1 8B Instant", Groq, 0.05, 0.08, 128_000, 8_192, cap(false, false, false, false)),
        Model::new("groq/llama-3.3-70b-versatile", "Llama 3.3 70B Versatile", Groq, 0.59, 0.79, 128_000, 32_768, cap(false, false, true, true)),
        Model::new("groq/mixtral-8x7b", "Mixtral 8x7B", Groq, 0.24, 0.24, 32_768, 32_768, cap(false, false, false, false)),
        Model::new("groq/deepseek-r1-distill-70b", "DeepSeek R1 Distill 70B", Groq, 0.75, 0.99, 128_000, 16_384, cap(true, false, true, false)),
        // ---- OpenRouter (mixed passthrough catalog) ----
        Model::new("openrouter/meta-llama/llama-3.1-405b", "Llama 3.1 405B (OpenRouter)", OpenRouter, 2.70, 2.70, 128_000, 8_192, cap(false, false, true, true)),
        Model::new("openrouter/mistralai/mistral-large", "Mistral Large (OpenRouter)", OpenRouter, 2.00, 6.00, 128_000, 8_192, cap(false, false, true, true)),
        Model::new("openrouter/qwen/qwen-2.5-72b", "Qwen 2.5 72B (OpenRouter)", OpenRouter, 0.35, 0.40, 32_768, 8_192, cap(false, false, false, false)),
        Model::new("openrouter/deepseek/deepseek-chat", "DeepSeek Chat (OpenRouter)", OpenRouter, 0.14, 0.28, 64_000, 8_192, cap(false, false, true, false)),
        // ---- Ollama (local inference, effectively free) ----
        Model::new("ollama/llama3.1:8b", "Llama 3.1 8B (local)", Ollama, 0.0, 0.0, 128_000, 4_096, cap(false, false, false, false)),
        Model::new("ollama/qwen2.5:7b", "Qwen 2.5 7B (local)", Ollama, 0.0, 0.0, 32_768, 4_096, cap(false, false, false, false)),
        Model::new("ollama/qwen2.5:1.5b", "Qwen 2.5 1.5B (local)", Ollama, 0.0, 0.0, 32_768, 2_048, cap(false, false, false, false)),
        Model::new("ollama/deepseek-r1:14b", "DeepSeek R1 14B (local)", Ollama, 0.0, 0.0, 64_000, 8_192, cap(true, false, false, false)),
        Model::new("ollama/llava:13b", "LLaVA 13B (local)", Ollama, 0.0, 0.0, 4_096, 2_048, cap(false, true, false, false)),
        Model::new("ollama/llama3.2:3b", "Llama 3.2 3B (local)", Ollama, 0.0, 0.0, 128_000, 4_096, cap(false, false, false, false)),
        Model::new("ollama/codellama:13b", "Code Llama 13B (local)", Ollama, 0.0, 0.0, 16_384, 4_096, cap(false, false, false, false)),
    ]
}

fn builtin_aliases() -> Vec<(&'static str, &'static str)> {
    vec![
        ("sonnet", "anthropic/claude-3-5-sonnet"),
        ("haiku", "anthropic/claude-3-5-haiku"),
        ("opus", "anthropic/claude-3-opus"),
        ("gpt-4o", "openai/gpt-4o"),
        ("gpt-4o-mini", "openai/gpt-4o-mini"),
        ("gemini-flash", "google/gemini-2.0-flash"),
        ("gemini-pro", "google/gemini-2.0-pro"),
        ("local", "ollama/qwen2.5:7b"),
        ("local-fast", "ollama/qwen2.5:1.5b"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_contains_synthetic_auto_entry() {
        let catalog = Catalog::with_defaults();
        assert!(catalog.contains(AUTO_MODEL_ID));
    }

    #[test]
    fn auto_entry_has_zero_price() {
        let catalog = Catalog::with_defaults();
        let auto = catalog.get(AUTO_MODEL_ID).unwrap();
        assert_eq!(auto.input_price_per_million, 0.0);
        assert_eq!(auto.output_price_per_million, 0.0);
    }

    #[test]
    fn catalog_ids_are_unique() {
        let models = builtin_models();
        let mut seen = std::collections::HashSet::new();
        for m in &models {
            assert!(seen.insert(m.id.clone()), "duplicate catalog id: {}", m.id);
        }
    }

    #[test]
    fn catalog_has_at_least_six_families() {
        let models = builtin_models();
        let families: std::collections::HashSet<_> =
            models.iter().map(|m| m.family.to_string()).collect();
        assert!(families.len() >= 6, "expected >= 6 provider families, got {families:?}");
    }

    #[test]
    fn catalog_has_around_thirty_models() {
        let count = builtin_models().len();
        assert!(count >= 25 && count <= 40, "expected ~30 models, got {count}");
    }

    #[test]
    fn resolve_alias_is_case_and_whitespace_insensitive() {
        let catalog = Catalog::with_defaults();
        assert_eq!(catalog.resolve_alias(" Sonnet "), "anthropic/claude-3-5-sonnet");
        assert_eq!(catalog.resolve_alias("SONNET"), "anthropic/claude-3-5-sonnet");
    }

    #[test]
    fn resolve_alias_is_idempotent() {
        let catalog = Catalog::with_defaults();
        for input in ["sonnet", "openai/gpt-4o", "unknown/model-id"] {
            let once = catalog.resolve_alias(input);
            let twice = catalog.resolve_alias(&once);
            assert_eq!(once, twice, "resolve_alias not idempotent for {input}");
        }
    }

    #[test]
    fn resolve_alias_passes_through_unknown_ids() {
        let catalog = Catalog::with_defaults();
        assert_eq!(catalog.resolve_alias("totally-unknown-model"), "totally-unknown-model");
    }

    #[test]
    fn listable_excludes_auto() {
        let catalog = Catalog::with_defaults();
        assert!(catalog.listable().iter().all(|m| m.id != AUTO_MODEL_ID));
    }

    #[test]
    fn tier_from_str_round_trips() {
        for t in [Tier::Simple, Tier::Medium, Tier::Complex, Tier::Reasoning] {
            assert_eq!(t.as_str().parse::<Tier>().unwrap(), t);
        }
    }

    #[test]
    fn tier_ordering_matches_cost_ladder() {
        assert!(Tier::Simple < Tier::Medium);
        assert!(Tier::Medium < Tier::Complex);
        assert!(Tier::Complex < Tier::Reasoning);
    }
}
