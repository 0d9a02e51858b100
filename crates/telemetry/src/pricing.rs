//! Built-in pricing table for common models.
//!
//! Prices are in USD per 1 million tokens. Each model has an input and
//! output price. Custom pricing can be added at runtime from TOML config.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Per-million-token pricing for a model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Price per 1M input tokens in USD.
    pub input_per_m: f64,
    /// Price per 1M output tokens in USD.
    pub output_per_m: f64,
}

impl ModelPricing {
    pub fn new(input_per_m: f64, output_per_m: f64) -> Self {
        Self {
            input_per_m,
            output_per_m,
        }
    }

    /// Compute cost for the given token counts.
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 * self.input_per_m + output_tokens as f64 * self.output_per_m)
            / 1_000_000.0
    }
}

/// Thread-safe pricing table with built-in defaults and custom overrides.
pub struct PricingTable {
    prices: RwLock<HashMap<String, ModelPricing>>,
}

impl PricingTable {
    /// Create a pricing table with built-in model prices.
    pub fn with_defaults() -> Self {
        let mut prices = HashMap::new();

        // ── OpenAI ─────────────────────────────────────────────────
        prices.insert("openai/gpt-4o".into(), ModelPricing::new(2.5, 10.0));
        prices.insert("openai/gpt-4o-mini".into(), ModelPricing::new(0.15, 0.6));
        prices.insert("openai/gpt-4.1".into(), ModelPricing::new(2.0, 8.0));
        prices.insert("openai/gpt-4.1-mini".into(), ModelPricing::new(0.4, 1.6));
        prices.insert("openai/o3-mini".into(), ModelPricing::new(1.1, 4.4));

        // ── Anthropic (via OpenRouter) ─────────────────────────────
        prices.insert(
            "anthropic/claude-sonnet-4".into(),
            ModelPricing::new(3.0, 15.0),
        );
        prices.insert(
            "anthropic/claude-3.5-haiku".into(),
            ModelPricing::new(0.8, 4.0),
        );

        // ── Google ─────────────────────────────────────────────────
        prices.insert(
            "google/gemini-2.0-flash".into(),
            ModelPricing::new(0.1, 0.4),
        );

        // ── DeepSeek ───────────────────────────────────────────────
        prices.insert("deepseek/deepseek-v3".into(), ModelPricing::new(0.27, 1.1));
        prices.insert("deepseek/deepseek-r1".into(), ModelPricing::new(0.55, 2.19));

        // ── Mistral ────────────────────────────────────────────────
        prices.insert("mistral/codestral".into(), ModelPricing::new(0.3, 0.9));

        Self {
            prices: RwLock::new(prices),
        }
    }

    /// Create an empty pricing table.
    pub fn empty() -> Self {
        Self {
            prices: RwLock::new(HashMap::new()),
        }
    }

    /// Add or update pricing for a model.
    pub fn set(&self, model: impl Into<String>, pricing: ModelPricing) {
        let mut prices = self.prices.write().unwrap_or_else(PoisonError::into_inner);
        prices.insert(model.into(), pricing);
    }

    /// Look up pricing for a model.
    ///
    /// Tries an exact match, then the bare name against each entry's bare
    /// name (`gpt-4o` matches `openai/gpt-4o`), then the longest entry whose
    /// bare name prefixes the model (`gpt-4o-mini-2024-07-18` matches
    /// `gpt-4o-mini`).
    pub fn lookup(&self, model: &str) -> Option<ModelPricing> {
        let prices = self.prices.read().unwrap_or_else(PoisonError::into_inner);

        if let Some(p) = prices.get(model) {
            return Some(*p);
        }

        let bare_model = bare(model).to_lowercase();
        let mut best: Option<(usize, ModelPricing)> = None;
        for (key, pricing) in prices.iter() {
            let bare_key = bare(key).to_lowercase();
            if bare_model == bare_key {
                return Some(*pricing);
            }
            if bare_model.starts_with(&bare_key)
                && best.is_none_or(|(len, _)| bare_key.len() > len)
            {
                best = Some((bare_key.len(), *pricing));
            }
        }
        best.map(|(_, p)| p)
    }

    /// Compute cost for a model call, returning 0.0 if the model is unknown.
    pub fn compute_cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        self.lookup(model)
            .map(|p| p.cost(input_tokens, output_tokens))
            .unwrap_or(0.0)
    }

    /// List all known model names, sorted.
    pub fn models(&self) -> Vec<String> {
        let prices = self.prices.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = prices.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.prices.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn bare(model: &str) -> &str {
    model.rsplit('/').next().unwrap_or(model)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_model_cost() {
        let table = PricingTable::with_defaults();

        // Claude Sonnet 4: $3/M input, $15/M output
        let cost = table.compute_cost("anthropic/claude-sonnet-4", 1000, 500);
        // (1000 * 3.0 + 500 * 15.0) / 1M = 0.0105
        assert!((cost - 0.0105).abs() < 1e-10);
    }

    #[test]
    fn bare_name_matches_prefixed_entry() {
        let table = PricingTable::with_defaults();
        let cost = table.compute_cost("gpt-4o", 1_000_000, 0);
        assert!((cost - 2.5).abs() < 1e-10);
    }

    #[test]
    fn versioned_name_prefers_longest_prefix() {
        let table = PricingTable::with_defaults();
        let pricing = table.lookup("gpt-4o-mini-2024-07-18").unwrap();
        assert_eq!(pricing, ModelPricing::new(0.15, 0.6));
    }

    #[test]
    fn unknown_model_returns_zero() {
        let table = PricingTable::with_defaults();
        let cost = table.compute_cost("unknown/model-xyz", 1000, 500);
        assert!(cost.abs() < 1e-10);
    }

    #[test]
    fn custom_pricing() {
        let table = PricingTable::empty();
        assert!(table.is_empty());

        table.set("custom/model", ModelPricing::new(1.0, 2.0));
        assert_eq!(table.len(), 1);

        let cost = table.compute_cost("custom/model", 1_000_000, 1_000_000);
        assert!((cost - 3.0).abs() < 1e-10);
    }

    #[test]
    fn list_models_sorted() {
        let table = PricingTable::with_defaults();
        let models = table.models();
        assert!(models.contains(&"openai/gpt-4o".to_string()));
        assert!(models.windows(2).all(|w| w[0] <= w[1]));
    }
}
