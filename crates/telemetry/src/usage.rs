//! Session usage accounting.

use crate::pricing::{ModelPricing, PricingTable};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Point-in-time usage totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    /// Prompt tokens reported by the provider.
    pub input_tokens: u64,
    /// Completion tokens reported by the provider.
    pub output_tokens: u64,
    /// Model requests made (streamed or not).
    pub llm_calls: u64,
    /// Tool executions (including failures).
    pub tool_executions: u64,
    /// Estimated cost in USD.
    pub cost_usd: f64,
}

impl UsageSnapshot {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Difference between two snapshots of the same tracker.
    pub fn since(&self, earlier: &UsageSnapshot) -> UsageSnapshot {
        UsageSnapshot {
            input_tokens: self.input_tokens.saturating_sub(earlier.input_tokens),
            output_tokens: self.output_tokens.saturating_sub(earlier.output_tokens),
            llm_calls: self.llm_calls.saturating_sub(earlier.llm_calls),
            tool_executions: self.tool_executions.saturating_sub(earlier.tool_executions),
            cost_usd: (self.cost_usd - earlier.cost_usd).max(0.0),
        }
    }
}

/// Accumulates usage for one session and prices it.
pub struct UsageTracker {
    model: String,
    pricing: PricingTable,
    started_at: DateTime<Utc>,
    totals: Mutex<UsageSnapshot>,
}

impl UsageTracker {
    pub fn new(model: impl Into<String>, pricing: PricingTable) -> Self {
        Self {
            model: model.into(),
            pricing,
            started_at: Utc::now(),
            totals: Mutex::new(UsageSnapshot::default()),
        }
    }

    /// Register custom pricing (from config).
    pub fn set_pricing(&self, model: impl Into<String>, pricing: ModelPricing) {
        self.pricing.set(model, pricing);
    }

    /// Record one model call. `model` is the name the provider reported,
    /// falling back to the configured one when empty.
    pub fn record_llm_call(&self, model: &str, input_tokens: u32, output_tokens: u32) {
        let model = if model.is_empty() { &self.model } else { model };
        let cost = self
            .pricing
            .compute_cost(model, u64::from(input_tokens), u64::from(output_tokens));

        let mut totals = self.totals.lock().unwrap_or_else(PoisonError::into_inner);
        totals.llm_calls += 1;
        totals.input_tokens += u64::from(input_tokens);
        totals.output_tokens += u64::from(output_tokens);
        totals.cost_usd += cost;
        debug!(model = %model, input_tokens, output_tokens, cost, "Recorded model usage");
    }

    /// Record a model call for which the provider reported no usage.
    pub fn record_unmetered_call(&self) {
        let mut totals = self.totals.lock().unwrap_or_else(PoisonError::into_inner);
        totals.llm_calls += 1;
    }

    pub fn record_tool_execution(&self) {
        let mut totals = self.totals.lock().unwrap_or_else(PoisonError::into_inner);
        totals.tool_executions += 1;
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        *self.totals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// One-line summary for the end of a turn.
    pub fn status_line(&self, turn: &UsageSnapshot, context_percent: f64) -> String {
        let session = self.snapshot();
        format!(
            "tokens: {} in / {} out | context: {:.1}% | cost: ${:.4} (session ${:.4}) | tools: {}",
            turn.input_tokens,
            turn.output_tokens,
            context_percent,
            turn.cost_usd,
            session.cost_usd,
            turn.tool_executions,
        )
    }
}
