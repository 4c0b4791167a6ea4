//! Per-token pricing for LLM models.
//!
//! The table is static configuration. A lookup that misses returns `None`; the
//! estimation engine decides what to do about it.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::TokenCounts;

/// One million, the unit pricing rates are quoted in.
const PER_MILLION: Decimal = dec!(1000000);

/// Key for looking up LLM model pricing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelKey {
    /// Provider name (e.g., "anthropic", "openai").
    pub provider: String,
    /// Model name (e.g., "claude-3-5-sonnet", "gpt-4o").
    pub model: String,
}

impl ModelKey {
    /// Create a new model key. Provider names are case-insensitive.
    #[must_use]
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into().to_ascii_lowercase(),
            model: model.into(),
        }
    }
}

/// Vendor pricing for an LLM model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPricing {
    /// USD per 1 million input tokens.
    pub input_usd_per_million: Decimal,
    /// USD per 1 million output tokens.
    pub output_usd_per_million: Decimal,
    /// Model-specific margin multiplier, overriding the configured default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub margin_multiplier: Option<Decimal>,
}

impl ModelPricing {
    /// Pricing with the default margin.
    #[must_use]
    pub const fn new(input_usd_per_million: Decimal, output_usd_per_million: Decimal) -> Self {
        Self {
            input_usd_per_million,
            output_usd_per_million,
            margin_multiplier: None,
        }
    }

    /// Vendor cost in USD for the given token counts.
    ///
    /// Cached tokens are billed at the input rate; they are a subset of the input
    /// count for every provider in the default table, so they add nothing here.
    ///
    /// Returns `None` if the cost does not fit in a decimal.
    #[must_use]
    pub fn vendor_cost(&self, tokens: TokenCounts) -> Option<Decimal> {
        let cost = |count: u64, rate: Decimal| {
            Decimal::from(count)
                .checked_mul(rate)
                .and_then(|usd| usd.checked_div(PER_MILLION))
        };
        cost(tokens.input, self.input_usd_per_million)?
            .checked_add(cost(tokens.output, self.output_usd_per_million)?)
    }
}

/// Pricing lookup table keyed by provider and model.
#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    models: HashMap<ModelKey, ModelPricing>,
}

impl PricingTable {
    /// An empty table. Every lookup misses.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// The built-in catalogue of common models.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut table = Self::empty();

        // Anthropic models
        table.insert("anthropic", "claude-3-5-sonnet", ModelPricing::new(dec!(3.00), dec!(15.00)));
        table.insert(
            "anthropic",
            "claude-3-5-sonnet-20241022",
            ModelPricing::new(dec!(3.00), dec!(15.00)),
        );
        table.insert("anthropic", "claude-3-haiku", ModelPricing::new(dec!(0.25), dec!(1.25)));
        table.insert("anthropic", "claude-3-opus", ModelPricing::new(dec!(15.00), dec!(75.00)));

        // OpenAI models
        table.insert("openai", "gpt-4-turbo", ModelPricing::new(dec!(10.00), dec!(30.00)));
        table.insert("openai", "gpt-4o", ModelPricing::new(dec!(2.50), dec!(10.00)));
        table.insert("openai", "gpt-4o-mini", ModelPricing::new(dec!(0.15), dec!(0.60)));

        // Google models
        table.insert("google", "gemini-1.5-pro", ModelPricing::new(dec!(1.25), dec!(5.00)));
        table.insert("google", "gemini-1.5-flash", ModelPricing::new(dec!(0.075), dec!(0.30)));

        table
    }

    /// Add or replace the pricing for a model.
    pub fn insert(&mut self, provider: &str, model: &str, pricing: ModelPricing) {
        self.models.insert(ModelKey::new(provider, model), pricing);
    }

    /// Look up pricing for a model.
    #[must_use]
    pub fn get(&self, provider: &str, model: &str) -> Option<&ModelPricing> {
        self.models.get(&ModelKey::new(provider, model))
    }

    /// Number of priced models.
    #[must_use]
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Check if the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_contains_known_models() {
        let table = PricingTable::with_defaults();
        assert!(table.get("anthropic", "claude-3-5-sonnet").is_some());
        assert!(table.get("Anthropic", "claude-3-5-sonnet").is_some());
        assert!(table.get("unknown", "mystery-model").is_none());
    }

    #[test]
    fn vendor_cost_claude() {
        let table = PricingTable::with_defaults();
        let pricing = table.get("anthropic", "claude-3-5-sonnet").unwrap();

        // 10,000 input at $3/M = $0.03; 5,000 output at $15/M = $0.075
        let cost = pricing.vendor_cost(TokenCounts::new(10_000, 5_000));
        assert_eq!(cost, Some(dec!(0.105)));
    }

    #[test]
    fn vendor_cost_zero_tokens() {
        let pricing = ModelPricing::new(dec!(3), dec!(15));
        assert_eq!(pricing.vendor_cost(TokenCounts::default()), Some(Decimal::ZERO));
    }

    #[test]
    fn vendor_cost_overflow_is_none() {
        let pricing = ModelPricing::new(Decimal::MAX, dec!(15));
        assert_eq!(pricing.vendor_cost(TokenCounts::new(u64::MAX, 0)), None);
    }
}
