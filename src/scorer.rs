//! The routing classifier (C2).
//!
//! Pure, I/O-free, sub-millisecond: maps `(prompt, system_prompt, approx_tokens)`
//! to a weighted score, a set of fired signal names, and a [`Tier`] (or `None`
//! when the score lands in the ambiguous band). No network calls, no shared
//! state — every call with the same inputs and config produces the same output.

use std::collections::HashSet;

use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::catalog::Tier;
use crate::config::ScoringConfig;

/// Per-dimension match cap — avoids runaway scores from keyword-stuffed prompts.
const MAX_MATCHES_PER_DIMENSION: usize = 5;

/// Prompt length above which keyword counting is truncated (token estimation
/// still uses the full character length).
const MAX_SCORED_CHARS: usize = 20_000;

/// Output of the scorer: a score, a calibrated confidence, an optional tier,
/// the signal names that fired, and a short human-readable explanation.
#[derive(Debug, Clone, Serialize)]
pub struct ScoringResult {
    pub score: f64,
    pub confidence: f64,
    pub tier: Option<Tier>,
    pub signals: HashSet<String>,
    pub reasoning: String,
}

impl ScoringResult {
    fn fallback() -> Self {
        Self {
            score: 0.5,
            confidence: 0.0,
            tier: Some(Tier::Medium),
            signals: HashSet::new(),
            reasoning: "scorer failure — defaulted to MEDIUM at confidence 0".to_string(),
        }
    }
}

/// A single weighted dimension: a name, a keyword group, and a weight.
struct Dimension {
    name: &'static str,
    weight: f64,
    keywords: Vec<String>,
}

/// Pure classifier. Holds compiled keyword regexes; build once, reuse across
/// requests (no per-request allocation beyond the match counting itself).
pub struct Scorer {
    dimensions: Vec<Dimension>,
    structured_output_re: Regex,
    confidence_threshold: f64,
    reasoning_confidence: f64,
    large_context_tokens: u64,
    structured_output_override: bool,
    logistic_k: f64,
    logistic_midpoint: f64,
    boundaries: [f64; 3],
}

impl Scorer {
    /// Build a scorer from config, falling back to the reference keyword groups
    /// for any group the config does not override.
    pub fn new(cfg: &ScoringConfig) -> Self {
        let dims = vec![
            Dimension { name: "reasoning", weight: 0.18, keywords: cfg.reasoning.clone().unwrap_or_else(default_reasoning) },
            Dimension { name: "code", weight: 0.15, keywords: cfg.code.clone().unwrap_or_else(default_code) },
            Dimension { name: "multi_step", weight: 0.12, keywords: cfg.multi_step.clone().unwrap_or_else(default_multi_step) },
            Dimension { name: "agentic", weight: 0.10, keywords: cfg.agentic.clone().unwrap_or_else(default_agentic) },
            Dimension { name: "technical", weight: 0.10, keywords: cfg.technical.clone().unwrap_or_else(default_technical) },
            Dimension { name: "creative", weight: 0.05, keywords: cfg.creative.clone().unwrap_or_else(default_creative) },
            Dimension { name: "constraint", weight: 0.04, keywords: default_constraint() },
            Dimension { name: "imperative", weight: 0.03, keywords: default_imperative() },
            Dimension { name: "output", weight: 0.03, keywords: cfg.output.clone().unwrap_or_else(default_output) },
            Dimension { name: "simple", weight: 0.02, keywords: cfg.simple.clone().unwrap_or_else(default_simple) },
            Dimension { name: "domain", weight: 0.02, keywords: cfg.domain.clone().unwrap_or_else(default_domain) },
            Dimension { name: "reference", weight: 0.02, keywords: default_reference() },
            Dimension { name: "negation", weight: 0.01, keywords: default_negation() },
        ];

        Self {
            dimensions: dims,
            structured_output_re: Regex::new(r"(?i)\b(json|yaml|schema|xml)\b")
                .expect("structured-output pattern is a compile-time constant"),
            confidence_threshold: cfg.confidence_threshold.unwrap_or(0.7),
            reasoning_confidence: cfg.reasoning_confidence.unwrap_or(0.97),
            large_context_tokens: cfg.large_context_tokens.unwrap_or(100_000),
            structured_output_override: cfg.structured_output_override.unwrap_or(true),
            logistic_k: cfg.logistic_k.unwrap_or(8.0),
            logistic_midpoint: cfg.logistic_midpoint.unwrap_or(0.5),
            boundaries: [0.30, 0.60, 0.80],
        }
    }

    /// Classify a prompt. Never fails — any internal inconsistency degrades to
    /// the `MEDIUM` fallback per the spec's failure semantics.
    pub fn score(&self, prompt: &str, system_prompt: Option<&str>, approx_tokens: u64) -> ScoringResult {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.score_inner(prompt, system_prompt, approx_tokens)
        }))
        .unwrap_or_else(|_| ScoringResult::fallback());

        debug!(
            tier = ?result.tier,
            confidence = result.confidence,
            signals = ?result.signals,
            reasoning = %result.reasoning,
            "scored prompt"
        );
        result
    }

    fn score_inner(&self, prompt: &str, system_prompt: Option<&str>, approx_tokens: u64) -> ScoringResult {
        if prompt.trim().is_empty() {
            return ScoringResult {
                score: 0.0,
                confidence: 1.0,
                tier: Some(Tier::Simple),
                signals: HashSet::new(),
                reasoning: "empty prompt".to_string(),
            };
        }

        let truncated: &str = if prompt.len() > MAX_SCORED_CHARS {
            &prompt[..MAX_SCORED_CHARS]
        } else {
            prompt
        };

        let mut score = 0.0;
        let mut signals = HashSet::new();
        let mut reasoning_matches = 0usize;
        let mut agentic_matches = 0usize;

        for dim in &self.dimensions {
            let matches = count_matches(truncated, &dim.keywords).min(MAX_MATCHES_PER_DIMENSION);
            if matches == 0 {
                continue;
            }
            signals.insert(dim.name.to_string());
            let magnitude = matches as f64 / MAX_MATCHES_PER_DIMENSION as f64;
            score += dim.weight * magnitude;
            if dim.name == "reasoning" {
                reasoning_matches = matches;
            }
            if dim.name == "agentic" {
                agentic_matches = matches;
            }
        }

        // Creative and simple dimensions lower technical pressure rather than raise it.
        if signals.contains("creative") {
            score -= 0.05;
        }
        if signals.contains("simple") {
            score -= 0.02;
        }

        // Token-count dimension (#6): short prompts lower, long prompts raise.
        if approx_tokens < 50 {
            score -= 0.08;
        } else if approx_tokens > 500 {
            score += 0.08;
            signals.insert("long_context".to_string());
        }

        // Question-complexity dimension (#8): count of `?`.
        let question_marks = truncated.matches('?').count().min(MAX_MATCHES_PER_DIMENSION);
        if question_marks > 0 {
            score += 0.05 * (question_marks as f64 / MAX_MATCHES_PER_DIMENSION as f64);
            signals.insert("question_complexity".to_string());
        }

        let score = score.clamp(0.0, 1.5);
        let confidence = logistic(score, self.logistic_k, self.logistic_midpoint);

        let mut reasoning = format!("score={score:.3} signals={signals:?}");

        // Reasoning-override: >=2 reasoning matches forces REASONING at a floor confidence.
        if reasoning_matches >= 2 {
            reasoning.push_str(" override=reasoning_markers");
            return ScoringResult {
                score,
                confidence: confidence.max(self.reasoning_confidence),
                tier: Some(Tier::Reasoning),
                signals,
                reasoning,
            };
        }

        if confidence < self.confidence_threshold {
            reasoning.push_str(" ambiguous=true");
            return ScoringResult { score, confidence, tier: None, signals, reasoning };
        }

        let mut tier = self.tier_from_score(score);

        // Overrides, applied in order.
        if approx_tokens > self.large_context_tokens {
            tier = Tier::Complex.max(tier);
            reasoning.push_str(" override=large_context");
        }
        if self.structured_output_override {
            if let Some(sys) = system_prompt {
                if self.structured_output_re.is_match(sys) {
                    tier = tier.max(Tier::Medium);
                    reasoning.push_str(" override=structured_output");
                }
            }
        }
        if agentic_matches >= 2 {
            signals.insert("prefers_agentic".to_string());
            reasoning.push_str(" override=agentic_preference");
        }

        ScoringResult { score, confidence, tier: Some(tier), signals, reasoning }
    }

    fn tier_from_score(&self, score: f64) -> Tier {
        let [b0, b1, b2] = self.boundaries;
        if score < b0 {
            Tier::Simple
        } else if score < b1 {
            Tier::Medium
        } else if score < b2 {
            Tier::Complex
        } else {
            Tier::Reasoning
        }
    }
}

fn logistic(score: f64, k: f64, midpoint: f64) -> f64 {
    1.0 / (1.0 + (-k * (score - midpoint)).exp())
}

/// Case-insensitive, word-boundary-where-possible substring counting.
fn count_matches(text: &str, keywords: &[String]) -> usize {
    let lower = text.to_ascii_lowercase();
    keywords.iter().filter(|kw| lower.contains(kw.to_ascii_lowercase().as_str())).count()
}

fn default_reasoning() -> Vec<String> {
    ["prove", "theorem", "step by step", "step-by-step", "derive", "why does", "reasoning", "logically"]
        .iter().map(|s| s.to_string()).collect()
}
fn default_code() -> Vec<String> {
    ["```", "function ", "def ", "class ", "fn ", "import ", "const ", "implement"]
        .iter().map(|s| s.to_string()).collect()
}
fn default_multi_step() -> Vec<String> {
    ["first,", "then,", "finally,", "step 1", "1.", "2.", "afterwards"]
        .iter().map(|s| s.to_string()).collect()
}
fn default_agentic() -> Vec<String> {
    ["run ", "deploy", "fix ", "install", "execute", "create a file", "delete ", "commit"]
        .iter().map(|s| s.to_string()).collect()
}
fn default_technical() -> Vec<String> {
    ["server", "database", "api", "infrastructure", "kubernetes", "latency", "throughput"]
        .iter().map(|s| s.to_string()).collect()
}
fn default_creative() -> Vec<String> {
    ["story", "poem", "write a song", "fictional", "imagine"]
        .iter().map(|s| s.to_string()).collect()
}
fn default_constraint() -> Vec<String> {
    ["at most", "at least", "o(n)", "no more than", "within"]
        .iter().map(|s| s.to_string()).collect()
}
fn default_imperative() -> Vec<String> {
    ["write", "generate", "list", "explain", "summarize"]
        .iter().map(|s| s.to_string()).collect()
}
fn default_output() -> Vec<String> {
    ["json", "yaml", "schema", "csv", "xml"]
        .iter().map(|s| s.to_string()).collect()
}
fn default_simple() -> Vec<String> {
    ["what is", "define", "who is", "when did"]
        .iter().map(|s| s.to_string()).collect()
}
fn default_domain() -> Vec<String> {
    ["quantum", "cryptographic", "thermodynamics", "topology"]
        .iter().map(|s| s.to_string()).collect()
}
fn default_reference() -> Vec<String> {
    ["the docs", "above", "previous message", "as mentioned"]
        .iter().map(|s| s.to_string()).collect()
}
fn default_negation() -> Vec<String> {
    ["not", "never", "without", "except"]
        .iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scorer() -> Scorer {
        Scorer::new(&ScoringConfig::default())
    }

    #[test]
    fn empty_prompt_is_simple_at_full_confidence() {
        let result = scorer().score("", None, 0);
        assert_eq!(result.tier, Some(Tier::Simple));
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn whitespace_only_prompt_is_treated_as_empty() {
        let result = scorer().score("   \n\t  ", None, 0);
        assert_eq!(result.tier, Some(Tier::Simple));
    }

    #[test]
    fn reasoning_markers_force_reasoning_tier() {
        let result = scorer().score(
            "Please prove this theorem step by step, showing each derivation.",
            None,
            100,
        );
        assert_eq!(result.tier, Some(Tier::Reasoning));
        assert!(result.confidence >= 0.97);
    }

    #[test]
    fn simple_question_scores_low() {
        let result = scorer().score("What is 2+2?", None, 10);
        assert!(matches!(result.tier, Some(Tier::Simple) | None));
    }

    #[test]
    fn code_heavy_prompt_raises_score() {
        let with_code = scorer().score(
            "```rust\nfn main() { implement this function please }\n```",
            None,
            200,
        );
        let without_code = scorer().score("Hello there, how are you today?", None, 200);
        assert!(with_code.score > without_code.score);
    }

    #[test]
    fn large_context_forces_complex_or_higher() {
        let result = scorer().score("Summarize this.", None, 200_000);
        let tier = result.tier.expect("large-context override should always yield a tier");
        assert!(tier >= Tier::Complex);
    }

    #[test]
    fn structured_output_system_prompt_raises_floor_to_medium() {
        let result = scorer().score(
            "Give me the answer.",
            Some("Always respond with valid JSON matching the schema."),
            50,
        );
        if let Some(tier) = result.tier {
            assert!(tier >= Tier::Medium);
        }
    }

    #[test]
    fn scorer_is_pure_and_deterministic() {
        let s = scorer();
        let a = s.score("Explain quantum entanglement in detail.", None, 300);
        let b = s.score("Explain quantum entanglement in detail.", None, 300);
        assert_eq!(a.score, b.score);
        assert_eq!(a.tier, b.tier);
        assert_eq!(a.confidence, b.confidence);
    }

    #[test]
    fn matches_are_capped_per_dimension() {
        let spammy = "run deploy fix install execute commit delete run deploy fix install execute commit delete"
            .repeat(5);
        let result = scorer().score(&spammy, None, 100);
        // Score should not blow past the clamp ceiling regardless of repetition.
        assert!(result.score <= 1.5);
    }

    #[test]
    fn case_insensitive_matching() {
        let lower = scorer().score("please PROVE this THEOREM step by STEP", None, 100);
        assert_eq!(lower.tier, Some(Tier::Reasoning));
    }
}
