//! Candidate chain construction (C3 Selector).
//!
//! Turns a tier decision plus routing state into an ordered, deduplicated,
//! non-empty list of candidate model ids: pinned session model first (if
//! still valid), then the tier's configured primary and fallbacks, filtered
//! by context window and reordered to prefer tool-capable models when the
//! request needs tools. Pure with respect to the catalog snapshot passed in —
//! no network calls, no mutation.

use crate::catalog::{Catalog, Tier};

/// Inputs the selector needs beyond the tier decision itself.
pub struct SelectionRequest<'a> {
    pub tier: Tier,
    pub pinned_model: Option<&'a str>,
    pub requires_tools: bool,
    pub min_context_tokens: u64,
    pub max_fallback_attempts: usize,
}

/// Build the ordered candidate chain for a tier, given the catalog and the
/// configured primary/fallback model ids for that tier.
///
/// `tier_chain` is the configured `[primary, fallback1, fallback2, ...]` list
/// for the request's tier, already resolved through alias lookup by the
/// caller. Unknown catalog ids are dropped (with the caller expected to log a
/// warning — this function returns the dropped ids alongside the chain so the
/// caller can do so without re-deriving them).
pub struct SelectionResult {
    pub chain: Vec<String>,
    pub dropped_unknown: Vec<String>,
}

pub fn select(catalog: &Catalog, tier_chain: &[String], req: &SelectionRequest) -> SelectionResult {
    let mut chain: Vec<String> = Vec::new();
    let mut dropped_unknown = Vec::new();

    // Pinned model goes first if it exists and meets the context requirement.
    if let Some(pinned) = req.pinned_model {
        let resolved = catalog.resolve_alias(pinned);
        if let Some(model) = catalog.get(&resolved) {
            if model.context_window as u64 >= req.min_context_tokens {
                chain.push(resolved);
            }
        }
    }

    for id in tier_chain {
        let resolved = catalog.resolve_alias(id);
        match catalog.get(&resolved) {
            Some(model) => {
                if model.context_window as u64 >= req.min_context_tokens && !chain.contains(&resolved) {
                    chain.push(resolved);
                }
            }
            None => dropped_unknown.push(resolved),
        }
    }

    if req.requires_tools {
        reorder_tool_capable_first(catalog, &mut chain);
    }

    chain.truncate(req.max_fallback_attempts.max(1));

    if chain.is_empty() {
        if let Some(fallback) = last_resort(catalog) {
            chain.push(fallback);
        }
    }

    SelectionResult { chain, dropped_unknown }
}

/// Stable partition: tool-capable candidates move ahead of non-capable ones,
/// preserving relative order within each group.
fn reorder_tool_capable_first(catalog: &Catalog, chain: &mut [String]) {
    let mut capable = Vec::new();
    let mut rest = Vec::new();
    for id in chain.iter() {
        match catalog.get(id) {
            Some(m) if m.capabilities.tool_use => capable.push(id.clone()),
            _ => rest.push(id.clone()),
        }
    }
    capable.extend(rest);
    chain.clone_from_slice(&capable);
}

/// Lowest-cost model in the catalog, used as the guaranteed non-empty fallback
/// when every configured candidate is missing from the catalog or fails the
/// context-window filter.
fn last_resort(catalog: &Catalog) -> Option<String> {
    catalog
        .listable()
        .into_iter()
        .min_by(|a, b| {
            let ca = a.input_price_per_million + a.output_price_per_million;
            let cb = b.input_price_per_million + b.output_price_per_million;
            ca.partial_cmp(&cb).unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|m| m.id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(tier: Tier) -> SelectionRequest<'static> {
        SelectionRequest {
            tier,
            pinned_model: None,
            requires_tools: false,
            min_context_tokens: 0,
            max_fallback_attempts: 3,
        }
    }

    #[test]
    fn chain_is_never_empty_even_with_all_unknown_ids() {
        let catalog = Catalog::with_defaults();
        let chain = vec!["nonexistent/model-a".to_string(), "nonexistent/model-b".to_string()];
        let result = select(&catalog, &chain, &req(Tier::Simple));
        assert!(!result.chain.is_empty());
        assert_eq!(result.dropped_unknown.len(), 2);
    }

    #[test]
    fn pinned_model_goes_first() {
        let catalog = Catalog::with_defaults();
        let tier_chain = vec!["openai/gpt-4o".to_string()];
        let mut r = req(Tier::Medium);
        r.pinned_model = Some("anthropic/claude-3-5-sonnet");
        let result = select(&catalog, &tier_chain, &r);
        assert_eq!(result.chain[0], "anthropic/claude-3-5-sonnet");
    }

    #[test]
    fn context_window_filter_drops_too_small_models() {
        let catalog = Catalog::with_defaults();
        let tier_chain = vec!["ollama/llava:13b".to_string(), "openai/gpt-4o".to_string()];
        let mut r = req(Tier::Medium);
        r.min_context_tokens = 100_000;
        let result = select(&catalog, &tier_chain, &r);
        assert!(!result.chain.iter().any(|id| id == "ollama/llava:13b"));
    }

    #[test]
    fn tool_use_preference_reorders_capable_models_first() {
        let catalog = Catalog::with_defaults();
        let tier_chain = vec!["groq/mixtral-8x7b".to_string(), "openai/gpt-4o".to_string()];
        let mut r = req(Tier::Medium);
        r.requires_tools = true;
        let result = select(&catalog, &tier_chain, &r);
        assert_eq!(result.chain[0], "openai/gpt-4o");
    }

    #[test]
    fn truncates_to_max_fallback_attempts() {
        let catalog = Catalog::with_defaults();
        let tier_chain = vec![
            "openai/gpt-4o".to_string(),
            "anthropic/claude-3-5-sonnet".to_string(),
            "google/gemini-2.0-pro".to_string(),
            "groq/llama-3.3-70b-versatile".to_string(),
        ];
        let mut r = req(Tier::Medium);
        r.max_fallback_attempts = 2;
        let result = select(&catalog, &tier_chain, &r);
        assert_eq!(result.chain.len(), 2);
    }

    #[test]
    fn deduplicates_repeated_ids() {
        let catalog = Catalog::with_defaults();
        let tier_chain = vec!["openai/gpt-4o".to_string(), "openai/gpt-4o".to_string()];
        let result = select(&catalog, &tier_chain, &req(Tier::Medium));
        assert_eq!(result.chain.iter().filter(|id| *id == "openai/gpt-4o").count(), 1);
    }

    #[test]
    fn selection_is_deterministic() {
        let catalog = Catalog::with_defaults();
        let tier_chain = vec!["openai/gpt-4o".to_string(), "anthropic/claude-3-5-sonnet".to_string()];
        let a = select(&catalog, &tier_chain, &req(Tier::Medium)).chain;
        let b = select(&catalog, &tier_chain, &req(Tier::Medium)).chain;
        assert_eq!(a, b);
    }
}
