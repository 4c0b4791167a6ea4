//! The credit ledger facade.
//!
//! `CreditLedger` wires the rounding cache, estimator, coordinator, and
//! reversal handler over one store. It is the in-process contract the serving
//! and admin layers call.

use std::sync::Arc;

use chrono::NaiveDate;
use credit_ledger_core::{
    DailyUsageRollup, DateRange, DeductionId, DeductionLedgerEntry, LedgerError, RequestId,
    RoundingIncrement, TokenCounts, UsageFacts, UsageRecord, UserId,
};
use credit_ledger_store::LedgerStore;
use rust_decimal::Decimal;
use tokio::task::JoinHandle;

use crate::config::LedgerConfig;
use crate::coordinator::{DeductionCoordinator, DeductionOutcome, DeductionRequest};
use crate::estimation::{Estimate, EstimationEngine, PricingSource};
use crate::reversal::{ReversalHandler, ReversalReceipt};
use crate::rounding::RoundingPolicyCache;

/// History page size when the caller gives none.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Largest history page served.
pub const MAX_HISTORY_LIMIT: usize = 500;

/// Credit ledger and deduction engine.
#[derive(Clone)]
pub struct CreditLedger {
    store: Arc<dyn LedgerStore>,
    config: LedgerConfig,
    rounding: Arc<RoundingPolicyCache>,
    estimation: EstimationEngine,
    coordinator: DeductionCoordinator,
    reversals: ReversalHandler,
}

impl CreditLedger {
    /// Build a ledger and load the persisted rounding increment once.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Configuration` if `config` is invalid.
    pub async fn new(
        store: Arc<dyn LedgerStore>,
        pricing: Arc<dyn PricingSource>,
        config: LedgerConfig,
    ) -> Result<Self, LedgerError> {
        config.validate()?;

        let rounding = Arc::new(RoundingPolicyCache::new(
            Arc::clone(&store),
            config.default_rounding_increment,
        ));
        let increment = rounding.reload().await;

        let estimation =
            EstimationEngine::new(pricing, config.estimation, config.credit_value_usd);
        let coordinator = DeductionCoordinator::new(
            Arc::clone(&store),
            config.tx_options(),
            config.transaction_timeout,
            config.credit_value_usd,
        );
        let reversals = ReversalHandler::new(
            Arc::clone(&store),
            config.tx_options(),
            config.transaction_timeout,
        );

        tracing::info!(
            %increment,
            credit_value_usd = %config.credit_value_usd,
            lock_timeout = ?config.lock_timeout,
            transaction_timeout = ?config.transaction_timeout,
            "Credit ledger ready"
        );

        Ok(Self {
            store,
            config,
            rounding,
            estimation,
            coordinator,
            reversals,
        })
    }

    /// The configuration in effect.
    #[must_use]
    pub const fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// The shared rounding cache.
    #[must_use]
    pub const fn rounding(&self) -> &Arc<RoundingPolicyCache> {
        &self.rounding
    }

    /// Start reloading the rounding increment on the configured interval.
    #[must_use]
    pub fn spawn_rounding_reload(&self) -> JoinHandle<()> {
        self.rounding
            .spawn_periodic_reload(self.config.rounding_reload_interval)
    }

    // =========================================================================
    // Estimation
    // =========================================================================

    /// Conservative whole-credit estimate for a request not yet served.
    ///
    /// # Errors
    ///
    /// Only configuration errors; pricing failures degrade to the fallback rate.
    pub async fn estimate(
        &self,
        user_id: &UserId,
        model_id: &str,
        provider: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Result<u64, LedgerError> {
        let tokens = TokenCounts::new(input_tokens, output_tokens);
        self.estimate_detailed(user_id, model_id, provider, tokens)
            .await
            .map(|estimate| estimate.credits)
    }

    /// Like [`Self::estimate`], with the intermediate figures.
    ///
    /// # Errors
    ///
    /// Only configuration errors; pricing failures degrade to the fallback rate.
    pub async fn estimate_detailed(
        &self,
        user_id: &UserId,
        model_id: &str,
        provider: &str,
        tokens: TokenCounts,
    ) -> Result<Estimate, LedgerError> {
        self.estimation
            .estimate(user_id, provider, model_id, tokens, self.current_increment())
            .await
    }

    // =========================================================================
    // Deduction
    // =========================================================================

    /// Charge `amount` credits (quantized up) for one completed request.
    ///
    /// # Errors
    ///
    /// See [`DeductionCoordinator::deduct`]. Insufficient credit is returned as
    /// [`DeductionOutcome::InsufficientCredits`], not as an error.
    pub async fn deduct(
        &self,
        user_id: UserId,
        amount: Decimal,
        request_id: RequestId,
        facts: UsageFacts,
    ) -> Result<DeductionOutcome, LedgerError> {
        self.submit(&DeductionRequest::new(user_id, amount, request_id, facts))
            .await
    }

    /// Charge a prepared request.
    ///
    /// # Errors
    ///
    /// See [`DeductionCoordinator::deduct`].
    pub async fn submit(
        &self,
        request: &DeductionRequest,
    ) -> Result<DeductionOutcome, LedgerError> {
        self.coordinator
            .deduct(request, self.current_increment())
            .await
    }

    /// Charge the cost implied by `facts`: `vendor_cost × margin`, converted
    /// at the configured credit value.
    ///
    /// # Errors
    ///
    /// See [`DeductionCoordinator::deduct`].
    pub async fn deduct_usage(
        &self,
        user_id: UserId,
        request_id: RequestId,
        facts: UsageFacts,
    ) -> Result<DeductionOutcome, LedgerError> {
        facts.validate()?;
        let amount = facts.raw_credits(self.config.credit_value_usd)?;
        self.deduct(user_id, amount, request_id, facts).await
    }

    // =========================================================================
    // Reversal
    // =========================================================================

    /// Reverse a completed deduction.
    ///
    /// # Errors
    ///
    /// See [`ReversalHandler::reverse`].
    pub async fn reverse(
        &self,
        deduction_id: &DeductionId,
        reason: &str,
        admin: UserId,
    ) -> Result<ReversalReceipt, LedgerError> {
        self.reversals.reverse(deduction_id, reason, admin).await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Committed balance for display. Zero if the user was never charged.
    ///
    /// Never use this value to decide whether a deduction may proceed; only
    /// the locked check inside a deduction is authoritative.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub async fn get_current_balance(&self, user_id: &UserId) -> Result<Decimal, LedgerError> {
        Ok(self
            .store
            .get_balance(user_id)
            .await?
            .map_or(Decimal::ZERO, |b| b.amount))
    }

    /// Ledger entries for a user inside `range`, newest first.
    ///
    /// `limit` defaults to [`DEFAULT_HISTORY_LIMIT`] and is capped at
    /// [`MAX_HISTORY_LIMIT`].
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub async fn get_deduction_history(
        &self,
        user_id: &UserId,
        range: &DateRange,
        limit: Option<usize>,
    ) -> Result<Vec<DeductionLedgerEntry>, LedgerError> {
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT).min(MAX_HISTORY_LIMIT);
        Ok(self.store.list_deductions(user_id, range, limit).await?)
    }

    /// One ledger entry.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::NotFound` if it does not exist.
    pub async fn get_deduction(
        &self,
        deduction_id: &DeductionId,
    ) -> Result<DeductionLedgerEntry, LedgerError> {
        self.store
            .get_deduction(deduction_id)
            .await?
            .ok_or(LedgerError::NotFound {
                deduction_id: *deduction_id,
            })
    }

    /// The usage record a ledger entry paid for.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::NotFound` if the entry does not exist, or
    /// `LedgerError::DeductionFailed` if its usage record is missing.
    pub async fn get_usage_for(
        &self,
        deduction_id: &DeductionId,
    ) -> Result<UsageRecord, LedgerError> {
        let entry = self.get_deduction(deduction_id).await?;
        self.store
            .get_usage_record(&entry.usage_record_id)
            .await?
            .ok_or_else(|| {
                LedgerError::DeductionFailed(format!(
                    "usage record {} for deduction {deduction_id} is missing",
                    entry.usage_record_id
                ))
            })
    }

    /// Daily usage rollups with `from <= date <= to`.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::InvalidInput` if `to` is before `from`.
    pub async fn get_daily_usage(
        &self,
        user_id: &UserId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyUsageRollup>, LedgerError> {
        if to < from {
            return Err(LedgerError::InvalidInput(format!(
                "usage range ends ({to}) before it starts ({from})"
            )));
        }
        Ok(self.store.list_daily_usage(user_id, from, to).await?)
    }

    // =========================================================================
    // Rounding
    // =========================================================================

    /// The rounding increment in effect. No I/O.
    #[must_use]
    pub fn current_increment(&self) -> RoundingIncrement {
        self.rounding.current_increment()
    }

    /// Change the rounding increment.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Configuration` for a value outside 0.01, 0.1, 1.
    pub async fn update_rounding_increment(
        &self,
        increment: Decimal,
        admin: Option<UserId>,
    ) -> Result<RoundingIncrement, LedgerError> {
        self.rounding.update(increment, admin).await
    }

    /// Re-read the persisted rounding increment now.
    pub async fn reload_rounding(&self) -> RoundingIncrement {
        self.rounding.reload().await
    }
}
