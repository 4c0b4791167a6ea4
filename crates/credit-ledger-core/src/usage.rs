//! Usage types for the credit ledger.
//!
//! The serving layer hands over [`UsageFacts`] for one completed unit of work;
//! the deduction engine persists them as a [`UsageRecord`] linked one-to-one
//! with the ledger entry it paid for.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::{DeductionId, DeductionLedgerEntry, RequestId, UsageRecordId, UserId};

/// Largest vendor cost accepted for one unit of work.
const MAX_VENDOR_COST_USD: Decimal = dec!(1000000000000);

/// Margin multipliers must stay below this.
const MARGIN_MULTIPLIER_LIMIT: Decimal = dec!(1000000);

/// Token counts for one LLM request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounts {
    /// Prompt tokens.
    pub input: u64,
    /// Completion tokens.
    pub output: u64,
    /// Prompt tokens served from the provider cache.
    pub cached: u64,
}

impl TokenCounts {
    /// Create counts without cached tokens.
    #[must_use]
    pub const fn new(input: u64, output: u64) -> Self {
        Self {
            input,
            output,
            cached: 0,
        }
    }

    /// Input plus output tokens.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.input.saturating_add(self.output)
    }
}

/// Outcome of the metered request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageStatus {
    /// The request succeeded.
    Success,
    /// The request failed but still consumed billable resources.
    Failure,
}

impl UsageStatus {
    /// Storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }

    /// Parse the storage representation.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::DeductionFailed` for unknown values.
    pub fn parse(value: &str) -> Result<Self, LedgerError> {
        match value {
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            other => Err(LedgerError::DeductionFailed(format!(
                "unknown usage status {other:?}"
            ))),
        }
    }
}

/// Consumption facts for one completed unit of work, supplied by the caller.
///
/// Pricing has already happened: `vendor_cost` is what the provider charges in USD
/// and `margin_multiplier` is the markup to apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageFacts {
    /// Model identifier (e.g., "claude-3-5-sonnet").
    pub model_id: String,
    /// Provider name (e.g., "anthropic").
    pub provider: String,
    /// Token counts.
    pub tokens: TokenCounts,
    /// Vendor cost in USD.
    pub vendor_cost: Decimal,
    /// Markup applied on top of the vendor cost.
    pub margin_multiplier: Decimal,
    /// When the request started.
    pub started_at: DateTime<Utc>,
    /// When the request finished.
    pub completed_at: DateTime<Utc>,
    /// Request outcome.
    pub status: UsageStatus,
}

impl UsageFacts {
    /// Create facts for a successful LLM request that finished now.
    #[must_use]
    pub fn llm(
        provider: impl Into<String>,
        model_id: impl Into<String>,
        tokens: TokenCounts,
        vendor_cost: Decimal,
        margin_multiplier: Decimal,
    ) -> Self {
        let now = Utc::now();
        Self {
            model_id: model_id.into(),
            provider: provider.into(),
            tokens,
            vendor_cost,
            margin_multiplier,
            started_at: now,
            completed_at: now,
            status: UsageStatus::Success,
        }
    }

    /// Set the request timing.
    #[must_use]
    pub fn with_timing(mut self, started_at: DateTime<Utc>, completed_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self.completed_at = completed_at;
        self
    }

    /// Set the request outcome.
    #[must_use]
    pub fn with_status(mut self, status: UsageStatus) -> Self {
        self.status = status;
        self
    }

    /// Validate the facts before any transaction opens.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::InvalidInput` for negative costs, a margin below zero,
    /// empty identifiers, or a completion time before the start time.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.model_id.trim().is_empty() || self.provider.trim().is_empty() {
            return Err(LedgerError::InvalidInput(
                "model id and provider must not be empty".into(),
            ));
        }
        if self.vendor_cost < Decimal::ZERO || self.vendor_cost > MAX_VENDOR_COST_USD {
            return Err(LedgerError::InvalidInput(format!(
                "vendor cost must be between 0 and {MAX_VENDOR_COST_USD}, got {}",
                self.vendor_cost
            )));
        }
        if self.margin_multiplier < Decimal::ZERO
            || self.margin_multiplier >= MARGIN_MULTIPLIER_LIMIT
        {
            return Err(LedgerError::InvalidInput(format!(
                "margin multiplier must be between 0 and {MARGIN_MULTIPLIER_LIMIT}, got {}",
                self.margin_multiplier
            )));
        }
        if self.completed_at < self.started_at {
            return Err(LedgerError::InvalidInput(
                "usage completed before it started".into(),
            ));
        }
        Ok(())
    }

    /// Unquantized credits for these facts: `vendor_cost * margin / credit_value_usd`.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Configuration` if `credit_value_usd` is not positive,
    /// or `LedgerError::InvalidInput` if the result does not fit in a decimal.
    pub fn raw_credits(&self, credit_value_usd: Decimal) -> Result<Decimal, LedgerError> {
        if credit_value_usd <= Decimal::ZERO {
            return Err(LedgerError::Configuration(format!(
                "credit value must be positive, got {credit_value_usd}"
            )));
        }
        self.vendor_cost
            .checked_mul(self.margin_multiplier)
            .and_then(|usd| usd.checked_div(credit_value_usd))
            .ok_or_else(|| {
                LedgerError::InvalidInput(format!(
                    "vendor cost {} at margin {} is out of range",
                    self.vendor_cost, self.margin_multiplier
                ))
            })
    }

    /// Request duration in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        (self.completed_at - self.started_at).num_milliseconds().max(0)
    }
}

/// A persisted usage record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Unique record ID.
    pub id: UsageRecordId,
    /// The user charged.
    pub user_id: UserId,
    /// Caller idempotency key of the request that produced the usage.
    pub request_id: RequestId,
    /// Model identifier.
    pub model_id: String,
    /// Provider name.
    pub provider: String,
    /// Token counts.
    pub tokens: TokenCounts,
    /// Vendor cost in USD.
    pub vendor_cost: Decimal,
    /// Margin multiplier.
    pub margin_multiplier: Decimal,
    /// When the request started.
    pub started_at: DateTime<Utc>,
    /// When the request finished.
    pub completed_at: DateTime<Utc>,
    /// Request duration in milliseconds.
    pub duration_ms: i64,
    /// Request outcome.
    pub status: UsageStatus,
    /// The ledger entry that paid for this usage. Set by the link step.
    pub deduction_id: Option<DeductionId>,
    /// When the record was written.
    pub created_at: DateTime<Utc>,
}

impl UsageRecord {
    /// Create an unlinked record from caller facts.
    #[must_use]
    pub fn from_facts(
        id: UsageRecordId,
        user_id: UserId,
        request_id: RequestId,
        facts: &UsageFacts,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            user_id,
            request_id,
            model_id: facts.model_id.clone(),
            provider: facts.provider.clone(),
            tokens: facts.tokens,
            vendor_cost: facts.vendor_cost,
            margin_multiplier: facts.margin_multiplier,
            started_at: facts.started_at,
            completed_at: facts.completed_at,
            duration_ms: facts.duration_ms(),
            status: facts.status,
            deduction_id: None,
            created_at,
        }
    }
}

/// Per-day usage totals for one user, model, and provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyUsageRollup {
    /// The user.
    pub user_id: UserId,
    /// UTC calendar day.
    pub usage_date: NaiveDate,
    /// Model identifier.
    pub model_id: String,
    /// Provider name.
    pub provider: String,
    /// Number of billed requests.
    pub request_count: i64,
    /// Sum of input tokens.
    pub input_tokens: i64,
    /// Sum of output tokens.
    pub output_tokens: i64,
    /// Sum of cached tokens.
    pub cached_tokens: i64,
    /// Sum of credits charged.
    pub credits_charged: Decimal,
    /// Sum of vendor cost in USD.
    pub vendor_cost: Decimal,
}

impl DailyUsageRollup {
    /// The single-request increment contributed by one deduction.
    #[must_use]
    pub fn increment(entry: &DeductionLedgerEntry, record: &UsageRecord) -> Self {
        Self {
            user_id: entry.user_id,
            usage_date: entry.processed_at.date_naive(),
            model_id: record.model_id.clone(),
            provider: record.provider.clone(),
            request_count: 1,
            input_tokens: saturating_i64(record.tokens.input),
            output_tokens: saturating_i64(record.tokens.output),
            cached_tokens: saturating_i64(record.tokens.cached),
            credits_charged: entry.amount,
            vendor_cost: entry.vendor_cost,
        }
    }

    /// Whether two rollups aggregate into the same row.
    #[must_use]
    pub fn same_bucket(&self, other: &Self) -> bool {
        self.user_id == other.user_id
            && self.usage_date == other.usage_date
            && self.model_id == other.model_id
            && self.provider == other.provider
    }

    /// Add another rollup of the same bucket into this one.
    pub fn absorb(&mut self, other: &Self) {
        self.request_count = self.request_count.saturating_add(other.request_count);
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.cached_tokens = self.cached_tokens.saturating_add(other.cached_tokens);
        self.credits_charged += other.credits_charged;
        self.vendor_cost += other.vendor_cost;
    }
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn facts() -> UsageFacts {
        UsageFacts::llm(
            "anthropic",
            "claude-3-5-sonnet",
            TokenCounts::new(1000, 500),
            dec!(0.0105),
            dec!(1.5),
        )
    }

    #[test]
    fn raw_credits_applies_margin_and_credit_value() {
        // $0.0105 * 1.5 = $0.01575 = 1.575 credits at $0.01.
        assert_eq!(facts().raw_credits(dec!(0.01)).unwrap(), dec!(1.575));
        assert!(facts().raw_credits(Decimal::ZERO).is_err());
    }

    #[test]
    fn raw_credits_reports_overflow() {
        let mut huge = facts();
        huge.vendor_cost = Decimal::from(u64::MAX) * dec!(1000000000);
        huge.margin_multiplier = dec!(1000);
        assert!(matches!(huge.raw_credits(dec!(0.01)), Err(LedgerError::InvalidInput(_))));
        assert!(matches!(huge.validate(), Err(LedgerError::InvalidInput(_))));
    }

    #[test]
    fn validation_rejects_bad_facts() {
        assert!(facts().validate().is_ok());

        let mut negative = facts();
        negative.vendor_cost = dec!(-1);
        assert!(matches!(negative.validate(), Err(LedgerError::InvalidInput(_))));

        let mut steep = facts();
        steep.margin_multiplier = MARGIN_MULTIPLIER_LIMIT;
        assert!(matches!(steep.validate(), Err(LedgerError::InvalidInput(_))));

        let now = Utc::now();
        let backwards = facts().with_timing(now, now - Duration::seconds(1));
        assert!(backwards.validate().is_err());

        let mut blank = facts();
        blank.provider = " ".into();
        assert!(blank.validate().is_err());
    }

    #[test]
    fn record_copies_facts_and_timing() {
        let start = Utc::now();
        let facts = facts().with_timing(start, start + Duration::milliseconds(1250));
        let record = UsageRecord::from_facts(
            UsageRecordId::generate(),
            UserId::generate(),
            RequestId::new("req-9").unwrap(),
            &facts,
            Utc::now(),
        );

        assert_eq!(record.duration_ms, 1250);
        assert_eq!(record.tokens.total(), 1500);
        assert!(record.deduction_id.is_none());
    }

    #[test]
    fn usage_status_roundtrip() {
        for status in [UsageStatus::Success, UsageStatus::Failure] {
            assert_eq!(UsageStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(UsageStatus::parse("timeout").is_err());
    }
}
