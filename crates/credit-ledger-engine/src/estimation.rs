//! Pre-flight cost estimation.
//!
//! Estimates are advisory and never touch a balance. They may gate a
//! sufficiency check before billable work starts, so every path here errs
//! high: an unknown model, a failing pricing source, or a slow one all fall
//! back to a fixed per-1000-token rate instead of returning an error.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use credit_ledger_core::{
    LedgerError, ModelPricing, PricingTable, RoundingIncrement, TokenCounts, UserId,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;

/// Tokens per fallback pricing unit.
const FALLBACK_TOKEN_UNIT: Decimal = dec!(1000);

/// Estimation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EstimationConfig {
    /// Margin applied when the model has no override (default: 1.5).
    pub default_margin: Decimal,
    /// Extra fraction added on top of the margin (default: 0.10).
    pub safety_margin: Decimal,
    /// USD per 1000 tokens, input and output alike, for unpriced models (default: 0.10).
    pub fallback_usd_per_1k_tokens: Decimal,
    /// Upper bound on one pricing lookup (default: 500ms).
    pub pricing_timeout: Duration,
}

impl Default for EstimationConfig {
    fn default() -> Self {
        Self {
            default_margin: dec!(1.5),
            safety_margin: dec!(0.10),
            fallback_usd_per_1k_tokens: dec!(0.10),
            pricing_timeout: Duration::from_millis(500),
        }
    }
}

/// Errors a pricing source may report.
#[derive(Debug, thiserror::Error)]
pub enum PricingError {
    /// The source could not be reached or answered with garbage.
    #[error("pricing source unavailable: {0}")]
    Unavailable(String),
}

/// Where per-token prices come from.
#[async_trait]
pub trait PricingSource: Send + Sync {
    /// Pricing for a model, or `None` if the source does not know it.
    ///
    /// # Errors
    ///
    /// Returns `PricingError` if the source itself failed.
    async fn lookup(
        &self,
        provider: &str,
        model_id: &str,
    ) -> Result<Option<ModelPricing>, PricingError>;
}

#[async_trait]
impl PricingSource for PricingTable {
    async fn lookup(
        &self,
        provider: &str,
        model_id: &str,
    ) -> Result<Option<ModelPricing>, PricingError> {
        Ok(self.get(provider, model_id).copied())
    }
}

/// Result of one estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Estimate {
    /// Whole credits to reserve.
    pub credits: u64,
    /// Quantized credit amount before rounding to a whole credit.
    pub amount: Decimal,
    /// Vendor cost in USD the estimate was built from.
    pub vendor_cost: Decimal,
    /// Margin multiplier applied.
    pub margin_multiplier: Decimal,
    /// Whether the fallback rate was used.
    pub used_fallback: bool,
}

/// Conservative pre-flight cost estimator.
#[derive(Clone)]
pub struct EstimationEngine {
    pricing: Arc<dyn PricingSource>,
    config: EstimationConfig,
    credit_value_usd: Decimal,
}

impl EstimationEngine {
    /// Create an estimator over a pricing source.
    #[must_use]
    pub fn new(
        pricing: Arc<dyn PricingSource>,
        config: EstimationConfig,
        credit_value_usd: Decimal,
    ) -> Self {
        Self {
            pricing,
            config,
            credit_value_usd,
        }
    }

    /// Estimate the credits a request will cost.
    ///
    /// `vendor_cost × margin × (1 + safety_margin)` is converted to credits,
    /// quantized up to `increment`, then rounded up to a whole credit.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Configuration` if the credit value is not positive,
    /// or `LedgerError::InvalidInput` if the estimate exceeds the largest
    /// chargeable amount. Pricing failures never surface as errors.
    pub async fn estimate(
        &self,
        user_id: &UserId,
        provider: &str,
        model_id: &str,
        tokens: TokenCounts,
        increment: RoundingIncrement,
    ) -> Result<Estimate, LedgerError> {
        let pricing = self.resolve_pricing(user_id, provider, model_id).await;

        let (vendor_cost, margin_multiplier) = match pricing {
            Some(p) => (
                p.vendor_cost(tokens),
                p.margin_multiplier.unwrap_or(self.config.default_margin),
            ),
            None => (self.fallback_cost(tokens), self.config.default_margin),
        };

        let out_of_range = || {
            LedgerError::InvalidInput(format!(
                "estimate for {} tokens is out of range",
                tokens.total()
            ))
        };
        let vendor_cost = vendor_cost.ok_or_else(out_of_range)?;
        let usd = vendor_cost
            .checked_mul(margin_multiplier)
            .zip(Decimal::ONE.checked_add(self.config.safety_margin))
            .and_then(|(usd, safety)| usd.checked_mul(safety))
            .ok_or_else(out_of_range)?;
        let amount = increment.quantize_usd(usd, self.credit_value_usd)?;
        let credits = amount.ceil().to_u64().unwrap_or(u64::MAX);

        tracing::debug!(
            user_id = %user_id,
            provider,
            model_id,
            input_tokens = tokens.input,
            output_tokens = tokens.output,
            vendor_cost = %vendor_cost,
            amount = %amount,
            credits,
            used_fallback = pricing.is_none(),
            "Estimated request cost"
        );

        Ok(Estimate {
            credits,
            amount,
            vendor_cost,
            margin_multiplier,
            used_fallback: pricing.is_none(),
        })
    }

    /// Fallback vendor cost: every token at the fixed high rate.
    fn fallback_cost(&self, tokens: TokenCounts) -> Option<Decimal> {
        (Decimal::from(tokens.total()) / FALLBACK_TOKEN_UNIT)
            .checked_mul(self.config.fallback_usd_per_1k_tokens)
    }

    async fn resolve_pricing(
        &self,
        user_id: &UserId,
        provider: &str,
        model_id: &str,
    ) -> Option<ModelPricing> {
        let lookup = self.pricing.lookup(provider, model_id);
        match tokio::time::timeout(self.config.pricing_timeout, lookup).await {
            Ok(Ok(Some(pricing))) => Some(pricing),
            Ok(Ok(None)) => {
                tracing::warn!(
                    user_id = %user_id,
                    provider,
                    model_id,
                    "No pricing for model, using fallback rate"
                );
                None
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    user_id = %user_id,
                    provider,
                    model_id,
                    error = %e,
                    "Pricing lookup failed, using fallback rate"
                );
                None
            }
            Err(_) => {
                tracing::warn!(
                    user_id = %user_id,
                    provider,
                    model_id,
                    timeout = ?self.config.pricing_timeout,
                    "Pricing lookup timed out, using fallback rate"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(table: PricingTable) -> EstimationEngine {
        EstimationEngine::new(Arc::new(table), EstimationConfig::default(), dec!(0.01))
    }

    #[tokio::test]
    async fn priced_model_applies_margin_and_safety() {
        let engine = engine(PricingTable::with_defaults());
        let estimate = engine
            .estimate(
                &UserId::generate(),
                "anthropic",
                "claude-3-5-sonnet",
                TokenCounts::new(1000, 500),
                RoundingIncrement::Hundredth,
            )
            .await
            .unwrap();

        // $0.0105 * 1.5 * 1.1 = $0.017325 -> 1.7325 credits -> 1.74 -> 2
        assert_eq!(estimate.vendor_cost, dec!(0.0105));
        assert_eq!(estimate.amount, dec!(1.74));
        assert_eq!(estimate.credits, 2);
        assert!(!estimate.used_fallback);
    }

    #[tokio::test]
    async fn model_margin_override_wins() {
        let mut table = PricingTable::empty();
        table.insert(
            "openai",
            "gpt-4o",
            ModelPricing {
                margin_multiplier: Some(dec!(2)),
                ..ModelPricing::new(dec!(2.50), dec!(10.00))
            },
        );
        let estimate = engine(table)
            .estimate(
                &UserId::generate(),
                "openai",
                "gpt-4o",
                TokenCounts::new(1_000_000, 0),
                RoundingIncrement::Whole,
            )
            .await
            .unwrap();

        // $2.50 * 2 * 1.1 = $5.50 -> 550 credits
        assert_eq!(estimate.margin_multiplier, dec!(2));
        assert_eq!(estimate.credits, 550);
    }

    #[tokio::test]
    async fn unknown_model_uses_fallback() {
        let estimate = engine(PricingTable::with_defaults())
            .estimate(
                &UserId::generate(),
                "mystery",
                "model-x",
                TokenCounts::new(1000, 500),
                RoundingIncrement::Hundredth,
            )
            .await
            .unwrap();

        // 1.5k tokens * $0.10 = $0.15 * 1.5 * 1.1 = $0.2475 -> 24.75 -> 25
        assert!(estimate.used_fallback);
        assert_eq!(estimate.vendor_cost, dec!(0.15));
        assert_eq!(estimate.credits, 25);
    }

    #[tokio::test]
    async fn zero_tokens_cost_nothing() {
        let estimate = engine(PricingTable::with_defaults())
            .estimate(
                &UserId::generate(),
                "anthropic",
                "claude-3-haiku",
                TokenCounts::default(),
                RoundingIncrement::Tenth,
            )
            .await
            .unwrap();
        assert_eq!(estimate.credits, 0);
    }

    #[tokio::test]
    async fn absurd_token_counts_are_rejected() {
        let engine = engine(PricingTable::with_defaults());
        for (provider, model_id) in [("anthropic", "claude-3-opus"), ("mystery", "model-x")] {
            let result = engine
                .estimate(
                    &UserId::generate(),
                    provider,
                    model_id,
                    TokenCounts::new(u64::MAX, u64::MAX),
                    RoundingIncrement::Hundredth,
                )
                .await;
            assert!(
                matches!(result, Err(LedgerError::InvalidInput(_))),
                "{provider}/{model_id}: {result:?}"
            );
        }
    }
}
